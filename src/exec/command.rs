// src/exec/command.rs

//! Turning a command template and a trigger payload into something spawnable.

use std::path::Path;

/// Token replaced by the trigger payload in command templates.
pub const PLACEHOLDER: &str = "{{fileName}}";

/// A task's command line with `{{fileName}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_placeholder(&self) -> bool {
        self.0.contains(PLACEHOLDER)
    }

    /// Replace every placeholder with `payload`.
    pub fn render(&self, payload: &str) -> String {
        self.0.replace(PLACEHOLDER, payload)
    }

    /// Render and split into program + args.
    ///
    /// `None` substitutes nothing: placeholders are removed, which is what a
    /// persistent task's start-up command gets.
    pub fn resolve(
        &self,
        payload: Option<&str>,
        interpreters: &InterpreterTable,
    ) -> Option<ResolvedCommand> {
        let rendered = self.render(payload.unwrap_or(""));
        resolve(&rendered, interpreters)
    }
}

/// Program and arguments, ready for `tokio::process::Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Maps a file extension to the interpreter argv that runs such files.
///
/// Consulted for the first token of a command: `main.go` becomes
/// `go run main.go`, `server.js` becomes `node server.js`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterTable {
    entries: Vec<(String, Vec<String>)>,
}

impl Default for InterpreterTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert(".go", ["go", "run"]);
        table.insert(".js", ["node"]);
        table
    }
}

impl InterpreterTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add or replace the prefix for `ext` (with or without the leading dot).
    pub fn insert<I, S>(&mut self, ext: &str, prefix: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ext = normalize_ext(ext);
        let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
        match self.entries.iter_mut().find(|(e, _)| *e == ext) {
            Some(entry) => entry.1 = prefix,
            None => self.entries.push((ext, prefix)),
        }
    }

    pub fn lookup(&self, ext: &str) -> Option<&[String]> {
        let ext = normalize_ext(ext);
        self.entries
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, prefix)| prefix.as_slice())
            .filter(|prefix| !prefix.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim();
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

/// Split a rendered command on whitespace and apply the interpreter table to
/// its first token. `None` for a blank command.
///
/// There is no shell involved: quotes are not interpreted and no
/// expansion happens.
pub fn resolve(rendered: &str, interpreters: &InterpreterTable) -> Option<ResolvedCommand> {
    let mut tokens: Vec<String> = rendered.split_whitespace().map(str::to_string).collect();
    let first = tokens.first()?;

    let prefix = Path::new(first)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| interpreters.lookup(ext));

    if let Some(prefix) = prefix {
        let mut argv = prefix.to_vec();
        argv.append(&mut tokens);
        tokens = argv;
    }

    let program = tokens.remove(0);
    Some(ResolvedCommand {
        program,
        args: tokens,
    })
}
