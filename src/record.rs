//! Keyed records and the line parsers producing them.
//!
//! Every input format is turned into a `(key, value)` [`Record`] by a [`RecordParser`]. A parser never fails:
//! a line that carries no data (a structural marker, a blank line, a malformed line) is reported as
//! [`Parsed::Skip`] with the reason, and the caller decides whether to log it.
//!
//! Username keys are lower-cased here and only here. Files produced by the engine are read back with
//! [`LineParser`], which takes keys verbatim.

use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;

use log;
use serde::{Deserialize, Serialize};

/// Tweet text the twitter7 archive uses for tweets without content.
pub const NO_CONTENT: &str = "No Post Title";

const USER_URL_PREFIXES: [&str; 2] = ["http://twitter.com/", "https://twitter.com/"];

/// A keyed record. Keys are compared byte-wise; values are opaque payloads and may be empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a record without a payload, as found in key list files.
    pub fn key_only(key: impl Into<String>) -> Self {
        Record::new(key, String::new())
    }

    /// Parses a `<key> <payload...>` line. Returns [`None`] for blank lines.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
        let line = line.trim_start();
        if line.trim_end().is_empty() {
            return None;
        }

        return Some(match line.split_once(|c: char| c == ' ' || c == '\t') {
            Some((key, value)) => Record::new(key, value.trim_start()),
            None => Record::key_only(line),
        });
    }

    /// Writes the record as a newline terminated line.
    pub fn write_line<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.key.as_bytes())?;
        if !self.value.is_empty() {
            writer.write_all(b" ")?;
            writer.write_all(self.value.as_bytes())?;
        }
        writer.write_all(b"\n")
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{} {}", self.key, self.value)
        }
    }
}

/// Reason a line produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Empty or whitespace-only line.
    Blank,
    /// Structural line carrying no payload (e.g. a timestamp or user line of the archive).
    Marker,
    /// A tweet line holding the archive's "no content" placeholder.
    NoContent,
    /// A line that does not have the expected shape.
    Malformed,
}

/// Parsing outcome of a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Record(Record),
    Skip(SkipReason),
}

/// Turns lines of one format into keyed records.
pub trait RecordParser {
    /// Parses a single line (without its line terminator).
    fn parse(&mut self, line: &str) -> Parsed;
}

/// Parser of the twitter7 archive.
///
/// The archive is a sequence of `T\t<timestamp>`, `U\t<profile url>` and `W\t<tweet text>` lines, where only the
/// first two characters of a line determine its type. Tweet lines are attributed to the most recent user line.
#[derive(Debug, Default)]
pub struct ArchiveParser {
    current_user: Option<String>,
}

impl ArchiveParser {
    pub fn new() -> Self {
        ArchiveParser::default()
    }

    /// User the next tweet line will be attributed to.
    pub fn current_user(&self) -> Option<&str> {
        self.current_user.as_deref()
    }

    fn parse_user(&mut self, content: &str) -> Parsed {
        let mut name = content.trim();
        for prefix in USER_URL_PREFIXES {
            if let Some(stripped) = name.strip_prefix(prefix) {
                name = stripped;
                break;
            }
        }
        let name = name.trim_end_matches('/');

        if name.is_empty() || name.contains(char::is_whitespace) {
            self.current_user = None;
            return Parsed::Skip(SkipReason::Malformed);
        }

        self.current_user = Some(name.to_lowercase());
        return Parsed::Skip(SkipReason::Marker);
    }

    fn parse_tweet(&self, content: &str) -> Parsed {
        let text = content.trim();
        if text.is_empty() || text == NO_CONTENT {
            return Parsed::Skip(SkipReason::NoContent);
        }

        match &self.current_user {
            Some(user) => Parsed::Record(Record::new(user.clone(), text)),
            None => Parsed::Skip(SkipReason::Malformed),
        }
    }
}

impl RecordParser for ArchiveParser {
    fn parse(&mut self, line: &str) -> Parsed {
        if line.trim().is_empty() {
            return Parsed::Skip(SkipReason::Blank);
        }

        let bytes = line.as_bytes();
        if bytes.len() < 2 || bytes[1] != b'\t' {
            return Parsed::Skip(SkipReason::Malformed);
        }
        // the second byte is an ASCII tab so the first one is a complete character
        let content = &line[2..];

        match bytes[0] {
            b'T' => Parsed::Skip(SkipReason::Marker),
            b'U' => self.parse_user(content),
            b'W' => self.parse_tweet(content),
            _ => Parsed::Skip(SkipReason::Malformed),
        }
    }
}

/// Parser of space-delimited `key value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueParser {
    swap: bool,
    lowercase_key: bool,
}

impl KeyValueParser {
    pub fn new() -> Self {
        KeyValueParser::default()
    }

    /// Uses the second field as the key and the first one as the value.
    /// The second field must then be a single token.
    pub fn swapped(mut self) -> Self {
        self.swap = true;
        return self;
    }

    /// Lower-cases the key.
    pub fn lowercase_key(mut self) -> Self {
        self.lowercase_key = true;
        return self;
    }
}

impl RecordParser for KeyValueParser {
    fn parse(&mut self, line: &str) -> Parsed {
        let line = line.trim();
        if line.is_empty() {
            return Parsed::Skip(SkipReason::Blank);
        }

        let (first, rest) = match line.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, rest.trim_start()),
            None => return Parsed::Skip(SkipReason::Malformed),
        };

        let (key, value) = if self.swap {
            if rest.contains(char::is_whitespace) {
                return Parsed::Skip(SkipReason::Malformed);
            }
            (rest, first)
        } else {
            (first, rest)
        };

        let key = if self.lowercase_key {
            key.to_lowercase()
        } else {
            key.to_string()
        };

        return Parsed::Record(Record::new(key, value));
    }
}

/// Parser of `<uid1>\t<uid2>` or `<uid1> <uid2>` edge lines. Produces `uid1` as the key and `uid2` as the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeParser;

impl RecordParser for EdgeParser {
    fn parse(&mut self, line: &str) -> Parsed {
        let mut fields = line.split_whitespace();
        let (source, target) = match (fields.next(), fields.next(), fields.next()) {
            (None, _, _) => return Parsed::Skip(SkipReason::Blank),
            (Some(source), Some(target), None) => (source, target),
            _ => return Parsed::Skip(SkipReason::Malformed),
        };

        let is_uid = |field: &str| field.bytes().all(|b| b.is_ascii_digit());
        if !is_uid(source) || !is_uid(target) {
            return Parsed::Skip(SkipReason::Malformed);
        }

        return Parsed::Record(Record::new(source, target));
    }
}

/// Parser of files written by the engine itself (`<key>` or `<key> <payload...>` lines). Keys are taken verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineParser;

impl RecordParser for LineParser {
    fn parse(&mut self, line: &str) -> Parsed {
        match Record::from_line(line) {
            Some(record) => Parsed::Record(record),
            None => Parsed::Skip(SkipReason::Blank),
        }
    }
}

/// Counters of a [`RecordReader`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub lines: u64,
    pub records: u64,
    pub blank: u64,
    pub markers: u64,
    pub no_content: u64,
    pub malformed: u64,
    /// The most recent malformed line, kept for diagnostics.
    pub last_malformed: Option<String>,
}

impl ReadStats {
    pub fn skipped(&self) -> u64 {
        self.blank + self.markers + self.no_content + self.malformed
    }
}

/// Adapts a line source and a parser into an iterator of records.
///
/// Lines that are not valid UTF-8 are counted as malformed and skipped.
pub struct RecordReader<R: BufRead, P: RecordParser> {
    reader: R,
    parser: P,
    buf: Vec<u8>,
    stats: ReadStats,
}

impl<R: BufRead, P: RecordParser> RecordReader<R, P> {
    pub fn new(reader: R, parser: P) -> Self {
        RecordReader {
            reader,
            parser,
            buf: Vec::new(),
            stats: ReadStats::default(),
        }
    }

    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    pub fn into_stats(self) -> ReadStats {
        self.stats
    }

    fn skip(&mut self, reason: SkipReason, line: &str) {
        match reason {
            SkipReason::Blank => self.stats.blank += 1,
            SkipReason::Marker => self.stats.markers += 1,
            SkipReason::NoContent => self.stats.no_content += 1,
            SkipReason::Malformed => {
                log::trace!("skipping malformed line {}: {:?}", self.stats.lines, line);
                self.stats.malformed += 1;
                self.stats.last_malformed = Some(line.to_string());
            }
        }
    }
}

impl<R: BufRead, P: RecordParser> Iterator for RecordReader<R, P> {
    type Item = Result<Record, io::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }
            self.stats.lines += 1;

            while matches!(self.buf.last(), Some(b'\n') | Some(b'\r')) {
                self.buf.pop();
            }

            let buf = std::mem::take(&mut self.buf);
            let parsed = match std::str::from_utf8(&buf) {
                Ok(line) => match self.parser.parse(line) {
                    Parsed::Record(record) => Some(record),
                    Parsed::Skip(reason) => {
                        self.skip(reason, line);
                        None
                    }
                },
                Err(_) => {
                    self.skip(SkipReason::Malformed, &String::from_utf8_lossy(&buf));
                    None
                }
            };
            self.buf = buf;

            if let Some(record) = parsed {
                self.stats.records += 1;
                return Some(Ok(record));
            }
        }
    }
}
