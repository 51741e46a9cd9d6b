//! Reading `--status-fd` output.
//!
//! gpg prefixes every machine-readable line with `[GNUPG:] `, followed by
//! a keyword and its arguments. Human-readable diagnostics may be mixed in
//! on the same descriptor.

use std::fmt;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

use crate::error::{Error, Result};

pub const STATUS_PREFIX: &str = "[GNUPG:] ";

/// A status line that matched a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub keyword: String,
    pub args: Vec<String>,
}

impl StatusLine {
    fn from_line(line: &str) -> Self {
        let mut words = line
            .strip_prefix(STATUS_PREFIX)
            .unwrap_or(line)
            .split_whitespace()
            .map(str::to_string);
        Self {
            keyword: words.next().unwrap_or_default(),
            args: words.collect(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{STATUS_PREFIX}{}", self.keyword)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Pulls status lines from a reader, either skipping to a wanted line
/// ([`seek`](Self::seek)) or insisting on it ([`expect`](Self::expect)).
pub struct StatusScanner<R> {
    reader: R,
    transcript: Vec<String>,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> StatusScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            transcript: Vec::new(),
            eof: false,
        }
    }

    /// Reads lines until one matches `pattern` after the status prefix.
    ///
    /// Lines that do not match are dropped. Reaching the end of the stream
    /// first is a protocol error.
    pub async fn seek(&mut self, pattern: &str) -> Result<StatusLine> {
        let re = anchored(pattern)?;
        while let Some(line) = self.next_line().await? {
            if re.is_match(&line) {
                trace!(%line, "found");
                return Ok(StatusLine::from_line(&line));
            }
            trace!(%line, "skipped");
        }
        Err(Error::Protocol {
            expected: pattern.to_string(),
            actual: None,
        })
    }

    /// Reads exactly one line, which must match `pattern`.
    pub async fn expect(&mut self, pattern: &str) -> Result<StatusLine> {
        let re = anchored(pattern)?;
        match self.next_line().await? {
            Some(line) if re.is_match(&line) => {
                trace!(%line, "found");
                Ok(StatusLine::from_line(&line))
            }
            actual => Err(Error::Protocol {
                expected: pattern.to_string(),
                actual,
            }),
        }
    }

    /// Reads the next raw line, `None` at end of stream.
    ///
    /// Diagnostics may quote user ids in any encoding, so invalid UTF-8 is
    /// replaced rather than rejected.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        if self.eof {
            return Ok(None);
        }
        let mut buf = Vec::new();
        if self.reader.read_until(b'\n', &mut buf).await? == 0 {
            self.eof = true;
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        self.transcript.push(line.clone());
        Ok(Some(line))
    }

    /// Reads and records whatever is left on the stream.
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_line().await?.is_some() {}
        Ok(())
    }

    /// Every line read so far, status or not.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// The lines that were not status lines: gpg's diagnostics.
    pub fn diagnostics(&self) -> String {
        self.transcript
            .iter()
            .filter(|l| !l.starts_with(STATUS_PREFIX))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!(
        "^{}(?:{pattern})",
        regex::escape(STATUS_PREFIX)
    ))?)
}
