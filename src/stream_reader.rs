//! Edge stream input: whitespace separated `src dst label timestamp` records.

use crate::error::{Result, RpqError};
use crate::{Label, Timestamp, VertexId};
use regex::Regex;
use std::io::BufRead;
use std::sync::LazyLock;

static RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\d+)\s+(\d+)\s+(-?\d+)\s*$").expect("record pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRecord {
    pub src: VertexId,
    pub dst: VertexId,
    pub label: Label,
    /// Wall-clock time as written in the input.
    pub timestamp: Timestamp,
}

impl EdgeRecord {
    pub fn parse(line: &str, line_number: usize) -> Result<Self> {
        let malformed = || RpqError::MalformedRecord {
            line: line_number,
            text: line.to_string(),
        };
        let caps = RECORD.captures(line).ok_or_else(malformed)?;
        let field = |i: usize| caps.get(i).map(|m| m.as_str()).ok_or_else(malformed);
        Ok(Self {
            src: field(1)?.parse().map_err(|_| malformed())?,
            dst: field(2)?.parse().map_err(|_| malformed())?,
            label: field(3)?.parse().map_err(|_| malformed())?,
            timestamp: field(4)?.parse().map_err(|_| malformed())?,
        })
    }
}

/// Iterator over the records of a stream. Blank lines and `#` comments are
/// skipped; the first malformed line ends the stream with an error.
pub struct EdgeReader<R> {
    input: R,
    line_number: usize,
    buffer: String,
}

impl<R: BufRead> EdgeReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line_number: 0,
            buffer: String::new(),
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }
}

impl<R: BufRead> Iterator for EdgeReader<R> {
    type Item = Result<EdgeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.input.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line_number += 1;
            let line = self.buffer.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Some(EdgeRecord::parse(line, self.line_number));
        }
    }
}

/// Maps wall-clock time to logical time, `wall - t0`, where `t0` is the
/// timestamp of the first record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeOrigin {
    t0: Option<Timestamp>,
}

impl TimeOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(t0: Timestamp) -> Self {
        Self { t0: Some(t0) }
    }

    pub fn logical(&mut self, wall: Timestamp) -> Timestamp {
        let t0 = *self.t0.get_or_insert(wall);
        wall - t0
    }

    pub fn origin(&self) -> Option<Timestamp> {
        self.t0
    }
}
