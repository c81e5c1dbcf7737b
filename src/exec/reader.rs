// src/exec/reader.rs

//! Response framing for the output streams of a persistent process.
//!
//! All partial state (bytes not yet framed, lines already collected) lives in
//! [`StreamReader`] itself, so `read_response` can be used in `select!` and
//! dropped mid-read without losing data.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// How a stream is cut into responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Collect non-blank lines until the stream has nothing more to give
    /// right now.
    DrainUntilIdle { idle_grace: Duration },
    /// Everything before the first occurrence of the delimiter.
    Delimited(String),
}

#[derive(Debug)]
pub struct StreamReader<R> {
    inner: BufReader<R>,
    framing: Framing,
    pending: Vec<u8>,
    lines: Vec<String>,
    eof: bool,
}

impl<R> StreamReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner: BufReader::new(inner),
            framing,
            pending: Vec::new(),
            lines: Vec::new(),
            eof: false,
        }
    }

    /// True once the underlying stream reported end-of-file and nothing is
    /// left to frame.
    pub fn is_closed(&self) -> bool {
        self.eof && self.pending.is_empty() && self.lines.is_empty()
    }

    /// Next response, or `None` once the stream is closed.
    pub async fn read_response(&mut self) -> io::Result<Option<String>> {
        match self.framing.clone() {
            Framing::DrainUntilIdle { idle_grace } => self.drain_until_idle(idle_grace).await,
            Framing::Delimited(delim) => self.delimited(&delim).await,
        }
    }

    async fn drain_until_idle(&mut self, idle_grace: Duration) -> io::Result<Option<String>> {
        loop {
            self.take_complete_lines();

            if !self.lines.is_empty() {
                if self.eof || !self.poll_more(idle_grace).await? {
                    return Ok(Some(self.lines.drain(..).collect::<Vec<_>>().join("\n")));
                }
                continue;
            }

            if self.eof {
                let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok(if rest.is_empty() { None } else { Some(rest) });
            }

            self.fill().await?;
        }
    }

    async fn delimited(&mut self, delim: &str) -> io::Result<Option<String>> {
        let needle = delim.as_bytes();
        loop {
            if let Some(idx) = find(&self.pending, needle) {
                let frame = String::from_utf8_lossy(&self.pending[..idx]).into_owned();
                let mut rest = idx + needle.len();
                // The delimiter usually ends its line; that line break
                // belongs to it, not to the next response.
                if self.pending[rest..].starts_with(b"\r\n") {
                    rest += 2;
                } else if self.pending[rest..].starts_with(b"\n") {
                    rest += 1;
                }
                self.pending.drain(..rest);
                return Ok(Some(frame));
            }

            if self.eof {
                // An unterminated tail can never become a response.
                self.pending.clear();
                return Ok(None);
            }

            self.fill().await?;
        }
    }

    /// Move every complete, non-blank line out of `pending`.
    fn take_complete_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                self.lines.push(line);
            }
        }
    }

    /// Block until the stream yields data or reaches end-of-file.
    async fn fill(&mut self) -> io::Result<()> {
        let buf = self.inner.fill_buf().await?;
        if buf.is_empty() {
            self.eof = true;
            return Ok(());
        }
        self.pending.extend_from_slice(buf);
        let n = buf.len();
        self.inner.consume(n);
        Ok(())
    }

    /// Like [`Self::fill`], but gives up after `grace`. Returns whether new
    /// data arrived.
    async fn poll_more(&mut self, grace: Duration) -> io::Result<bool> {
        match tokio::time::timeout(grace, self.fill()).await {
            Err(_elapsed) => Ok(false),
            Ok(res) => {
                res?;
                Ok(!self.eof)
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
