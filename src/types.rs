use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Kind of filesystem operation carried by a [`crate::watch::WatchEvent`].
///
/// Raw `notify` kinds are folded into these five; anything else (access
/// notifications, "any"/"other") never enters the filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Write,
    Remove,
    Rename,
    /// Permission / metadata-only change.
    Chmod,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Write => "write",
            OpKind::Remove => "remove",
            OpKind::Rename => "rename",
            OpKind::Chmod => "chmod",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(OpKind::Create),
            "write" => Ok(OpKind::Write),
            "remove" => Ok(OpKind::Remove),
            "rename" => Ok(OpKind::Rename),
            "chmod" | "permission" => Ok(OpKind::Chmod),
            other => Err(format!(
                "invalid operation kind: {other} (expected create, write, remove, rename or chmod)"
            )),
        }
    }
}

/// Where a task's stdout/stderr go.
///
/// - `Console`: inherit the parent's stdout/stderr (default).
/// - `Captured`: pipe both streams and hand the text back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Console,
    Captured,
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
