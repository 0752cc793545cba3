//! Sorted stream cursor.

use std::cmp::Ordering;

use crate::partition::ChunkError;
use crate::record::Record;

/// Current position of a [`SortedStream`].
///
/// `Exhausted` orders after every item, so minimum selection across streams needs no special case for
/// finished inputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Head<T> {
    Item(T),
    Exhausted,
}

impl<T> Head<T> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Head::Exhausted)
    }
}

/// Key of a head, keeping `Exhausted` as the greatest value.
pub fn head_key(head: &Head<Record>) -> Head<&str> {
    match head {
        Head::Item(record) => Head::Item(record.key.as_str()),
        Head::Exhausted => Head::Exhausted,
    }
}

/// Stream error.
#[derive(Debug)]
pub enum StreamError {
    /// The underlying source failed.
    Source(ChunkError),
    /// A key smaller than its predecessor was read.
    OutOfOrder { previous: String, current: String },
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            StreamError::Source(err) => Some(err),
            StreamError::OutOfOrder { .. } => None,
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            StreamError::Source(err) => write!(f, "stream source error: {}", err),
            StreamError::OutOfOrder { previous, current } => {
                write!(f, "stream is not sorted: key {:?} follows {:?}", current, previous)
            }
        }
    }
}

/// Cursor over a key-sorted record source exposing the current record and an explicit advance.
///
/// Keys are verified to be non-decreasing while reading; a violation is reported as
/// [`StreamError::OutOfOrder`] instead of being merged silently.
pub struct SortedStream<I> {
    source: I,
    head: Head<Record>,
    advanced: u64,
}

impl<I, E> SortedStream<I>
where
    I: Iterator<Item = Result<Record, E>>,
    E: Into<ChunkError>,
{
    /// Creates a cursor positioned on the first record of `source`.
    pub fn new(source: impl IntoIterator<IntoIter = I>) -> Result<Self, StreamError> {
        let mut source = source.into_iter();
        let head = Self::pull(&mut source)?;

        return Ok(SortedStream {
            source,
            head,
            advanced: 0,
        });
    }

    fn pull(source: &mut I) -> Result<Head<Record>, StreamError> {
        match source.next() {
            Some(Ok(record)) => Ok(Head::Item(record)),
            Some(Err(err)) => Err(StreamError::Source(err.into())),
            None => Ok(Head::Exhausted),
        }
    }

    /// Current record.
    pub fn head(&self) -> &Head<Record> {
        &self.head
    }

    /// Current key, [`None`] once exhausted.
    pub fn key(&self) -> Option<&str> {
        match &self.head {
            Head::Item(record) => Some(record.key.as_str()),
            Head::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.head.is_exhausted()
    }

    /// Number of records consumed so far.
    pub fn advanced(&self) -> u64 {
        self.advanced
    }

    /// Compares the heads of two streams by key. Exhausted streams compare greater than any record.
    pub fn cmp_keys<J, F>(&self, other: &SortedStream<J>) -> Ordering
    where
        J: Iterator<Item = Result<Record, F>>,
        F: Into<ChunkError>,
    {
        head_key(&self.head).cmp(&head_key(other.head()))
    }

    /// Moves to the next record and returns the previous one.
    pub fn advance(&mut self) -> Result<Head<Record>, StreamError> {
        if self.head.is_exhausted() {
            return Ok(Head::Exhausted);
        }

        let next = Self::pull(&mut self.source)?;
        if let (Head::Item(previous), Head::Item(current)) = (&self.head, &next) {
            if current.key < previous.key {
                return Err(StreamError::OutOfOrder {
                    previous: previous.key.clone(),
                    current: current.key.clone(),
                });
            }
        }

        self.advanced += 1;
        return Ok(std::mem::replace(&mut self.head, next));
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use rstest::*;

    use super::{Head, SortedStream, StreamError};
    use crate::record::Record;

    fn source(keys: &[&str]) -> Vec<Result<Record, io::Error>> {
        keys.iter().map(|key| Ok(Record::key_only(*key))).collect()
    }

    #[rstest]
    #[case(Head::Item("zzz"), Head::Exhausted)]
    #[case(Head::Item("a"), Head::Item("b"))]
    #[case(Head::Item("\u{10ffff}"), Head::Exhausted)]
    fn test_head_ordering(#[case] smaller: Head<&str>, #[case] greater: Head<&str>) {
        assert!(smaller < greater);
    }

    #[test]
    fn test_stream_cursor() {
        let mut stream = SortedStream::new(source(&["amy", "bob"])).unwrap();
        assert_eq!(stream.key(), Some("amy"));

        assert_eq!(stream.advance().unwrap(), Head::Item(Record::key_only("amy")));
        assert_eq!(stream.key(), Some("bob"));
        stream.advance().unwrap();
        assert!(stream.is_exhausted());
        assert_eq!(stream.advance().unwrap(), Head::Exhausted);
        assert_eq!(stream.advanced(), 2);
    }

    #[test]
    fn test_empty_stream_is_exhausted() {
        let stream = SortedStream::new(source(&[])).unwrap();
        assert!(stream.is_exhausted());
        assert_eq!(stream.key(), None);
    }

    #[test]
    fn test_out_of_order_detected() {
        let mut stream = SortedStream::new(source(&["bob", "amy"])).unwrap();
        match stream.advance() {
            Err(StreamError::OutOfOrder { previous, current }) => {
                assert_eq!(previous, "bob");
                assert_eq!(current, "amy");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_cmp_keys_exhausted_is_greatest() {
        let left = SortedStream::new(source(&["zzz"])).unwrap();
        let right = SortedStream::new(source(&[])).unwrap();
        assert_eq!(left.cmp_keys(&right), std::cmp::Ordering::Less);
    }
}
