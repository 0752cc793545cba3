//! Sorted merge-joins.
//!
//! Both joins walk key-sorted streams forward exactly once. Only streams holding the smallest current key are
//! ever advanced, so total work is linear in the number of records read.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;

use crate::lines::RecordSink;
use crate::partition::ChunkError;
use crate::record::Record;
use crate::stream::{Head, SortedStream, StreamError};

/// Error returned by a join transform.
pub type TransformError = Box<dyn Error + Send + Sync>;

/// Join error.
#[derive(Debug)]
pub enum JoinError {
    /// An input stream failed or was found unsorted.
    Input { stream: usize, source: StreamError },
    /// The enrichment transform failed.
    Transform(TransformError),
    /// The output sink failed.
    IO(io::Error),
}

impl Error for JoinError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            JoinError::Input { source, .. } => Some(source),
            JoinError::Transform(err) => Some(err.as_ref()),
            JoinError::IO(err) => Some(err),
        }
    }
}

impl Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            JoinError::Input { stream, source } => write!(f, "join input {} failed: {}", stream, source),
            JoinError::Transform(err) => write!(f, "join transform failed: {}", err),
            JoinError::IO(err) => write!(f, "join output failed: {}", err),
        }
    }
}

impl From<io::Error> for JoinError {
    fn from(err: io::Error) -> Self {
        JoinError::IO(err)
    }
}

/// Join counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Records consumed per input stream.
    pub read: Vec<u64>,
    /// Keys found in every input.
    pub matched: u64,
    /// Records written to the sink.
    pub emitted: u64,
    /// Driving records without a reference match (enrichment only).
    pub unmatched: u64,
}

fn advance<I, E>(stream: &mut SortedStream<I>, idx: usize) -> Result<Head<Record>, JoinError>
where
    I: Iterator<Item = Result<Record, E>>,
    E: Into<ChunkError>,
{
    stream.advance().map_err(|source| JoinError::Input { stream: idx, source })
}

/// Emits every key present in all `streams`, once, in ascending order.
///
/// Streams holding the smallest current key are advanced until all heads agree; the join ends as soon as any
/// stream is exhausted since its remaining keys cannot match.
pub fn intersect<I, E, S>(streams: &mut [SortedStream<I>], sink: &mut S) -> Result<JoinStats, JoinError>
where
    I: Iterator<Item = Result<Record, E>>,
    E: Into<ChunkError>,
    S: RecordSink + ?Sized,
{
    let mut stats = JoinStats::default();

    while !streams.is_empty() {
        let mut min: Option<&str> = None;
        let mut all_equal = true;
        let mut any_exhausted = false;

        for stream in streams.iter() {
            match (stream.key(), min) {
                (None, _) => any_exhausted = true,
                (Some(key), None) => min = Some(key),
                (Some(key), Some(current)) => {
                    if key != current {
                        all_equal = false;
                    }
                    if key < current {
                        min = Some(key);
                    }
                }
            }
        }

        let min = match min {
            Some(min) if !any_exhausted => min.to_string(),
            _ => break,
        };

        if all_equal {
            sink.push(Record::key_only(min))?;
            stats.matched += 1;
            stats.emitted += 1;
            for (idx, stream) in streams.iter_mut().enumerate() {
                advance(stream, idx)?;
            }
        } else {
            for (idx, stream) in streams.iter_mut().enumerate() {
                if stream.key() == Some(min.as_str()) {
                    advance(stream, idx)?;
                }
            }
        }
    }

    stats.read = streams.iter().map(|stream| stream.advanced()).collect();

    return Ok(stats);
}

/// Decorates driving records with their reference match.
///
/// For every key present in both streams `transform(driving, reference)` is called and its result, if any, is
/// emitted; both streams then advance. Driving records without a reference record are dropped and counted as
/// unmatched. Reference records without a driving record are skipped.
pub fn enrich<I, E, J, F, S, T>(
    driving: &mut SortedStream<I>,
    reference: &mut SortedStream<J>,
    mut transform: T,
    sink: &mut S,
) -> Result<JoinStats, JoinError>
where
    I: Iterator<Item = Result<Record, E>>,
    E: Into<ChunkError>,
    J: Iterator<Item = Result<Record, F>>,
    F: Into<ChunkError>,
    S: RecordSink + ?Sized,
    T: FnMut(&Record, &Record) -> Result<Option<Record>, TransformError>,
{
    let mut stats = JoinStats::default();

    while !driving.is_exhausted() && !reference.is_exhausted() {
        match driving.cmp_keys(reference) {
            Ordering::Less => {
                advance(driving, 0)?;
                stats.unmatched += 1;
            }
            Ordering::Greater => {
                advance(reference, 1)?;
            }
            Ordering::Equal => {
                let output = match (driving.head(), reference.head()) {
                    (Head::Item(left), Head::Item(right)) => transform(left, right).map_err(JoinError::Transform)?,
                    _ => break,
                };
                stats.matched += 1;
                if let Some(record) = output {
                    sink.push(record)?;
                    stats.emitted += 1;
                }
                advance(driving, 0)?;
                advance(reference, 1)?;
            }
        }
    }

    while !driving.is_exhausted() {
        advance(driving, 0)?;
        stats.unmatched += 1;
    }

    stats.read = vec![driving.advanced(), reference.advanced()];

    return Ok(stats);
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::io;

    use rand::Rng;
    use rstest::*;

    use super::{enrich, intersect, JoinError, TransformError};
    use crate::record::{KeyValueParser, LineParser, Record, RecordReader};
    use crate::stream::{SortedStream, StreamError};

    type TestStream = SortedStream<std::vec::IntoIter<Result<Record, io::Error>>>;

    fn keys(keys: &[&str]) -> TestStream {
        SortedStream::new(Vec::from_iter(keys.iter().map(|key| Ok(Record::key_only(*key))))).unwrap()
    }

    fn records(records: &[(&str, &str)]) -> TestStream {
        SortedStream::new(Vec::from_iter(
            records.iter().map(|(key, value)| Ok(Record::new(*key, *value))),
        ))
        .unwrap()
    }

    fn emitted_keys(records: &[Record]) -> Vec<&str> {
        records.iter().map(|record| record.key.as_str()).collect()
    }

    #[rstest]
    #[case(vec![&["alice", "bob", "cara"][..], &["bob", "cara", "dan"][..]], vec!["bob", "cara"])]
    #[case(vec![&["a", "b"][..], &[][..]], vec![])]
    #[case(vec![&["a", "c", "e"][..], &["b", "d", "f"][..]], vec![])]
    #[case(vec![&["a", "b", "c", "d"][..], &["b", "c", "d"][..], &["a", "c", "d", "z"][..]], vec!["c", "d"])]
    #[case(vec![&["a", "b"][..]], vec!["a", "b"])]
    fn test_intersect(#[case] inputs: Vec<&[&str]>, #[case] expected: Vec<&str>) {
        let mut streams: Vec<TestStream> = inputs.into_iter().map(keys).collect();
        let mut out = Vec::new();

        let stats = intersect(&mut streams, &mut out).unwrap();

        assert_eq!(emitted_keys(&out), expected);
        assert_eq!(stats.emitted as usize, expected.len());
    }

    #[test]
    fn test_intersect_matches_set_intersection() {
        let mut rng = rand::thread_rng();
        let left: BTreeSet<String> = (0..300).map(|_| format!("{}", rng.gen_range(0..500))).collect();
        let right: BTreeSet<String> = (0..300).map(|_| format!("{}", rng.gen_range(0..500))).collect();

        let to_stream = |set: &BTreeSet<String>| -> TestStream {
            SortedStream::new(Vec::from_iter(set.iter().map(|key| Ok(Record::key_only(key.clone()))))).unwrap()
        };
        let mut streams = vec![to_stream(&left), to_stream(&right)];
        let mut out = Vec::new();
        intersect(&mut streams, &mut out).unwrap();

        let expected: Vec<String> = left.intersection(&right).cloned().collect();
        let actual: Vec<String> = out.into_iter().map(|record| record.key).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_enrich_with_classifier() {
        let mut driving = keys(&["bob", "cara"]);
        let mut reference = records(&[("bob", "tweet text")]);
        let mut out = Vec::new();

        let stats = enrich(
            &mut driving,
            &mut reference,
            |left, _right| Ok(Some(Record::new(left.key.clone(), "1"))),
            &mut out,
        )
        .unwrap();

        assert_eq!(out, vec![Record::new("bob", "1")]);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.unmatched, 1);
    }

    #[test]
    fn test_enrich_drops_unmatched_driving_records() {
        let mut driving = records(&[("amy", "0"), ("bob", "1"), ("cal", "0"), ("dan", "1")]);
        let mut reference = records(&[("aaron", "5"), ("bob", "12"), ("dan", "14"), ("zed", "99")]);
        let mut out = Vec::new();

        let stats = enrich(
            &mut driving,
            &mut reference,
            |left, right| Ok(Some(Record::new(right.value.clone(), left.value.clone()))),
            &mut out,
        )
        .unwrap();

        assert_eq!(out, vec![Record::new("12", "1"), Record::new("14", "1")]);
        assert_eq!(stats.unmatched, 2);
        assert_eq!(stats.read, vec![4, 3]);
    }

    #[test]
    fn test_enrich_transform_may_filter() {
        let mut driving = keys(&["a", "b", "c"]);
        let mut reference = keys(&["a", "b", "c"]);
        let mut out = Vec::new();

        let stats = enrich(
            &mut driving,
            &mut reference,
            |left, _| Ok(if left.key == "b" { None } else { Some(left.clone()) }),
            &mut out,
        )
        .unwrap();

        assert_eq!(emitted_keys(&out), vec!["a", "c"]);
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.emitted, 2);
    }

    #[test]
    fn test_enrich_transform_error() {
        let mut driving = keys(&["a"]);
        let mut reference = keys(&["a"]);
        let mut out: Vec<Record> = Vec::new();

        let result = enrich(
            &mut driving,
            &mut reference,
            |_, _| Err(TransformError::from("classifier unavailable")),
            &mut out,
        );

        assert!(matches!(result, Err(JoinError::Transform(_))));
    }

    #[test]
    fn test_skipped_lines_do_not_disturb_comparison() {
        let driving_text: &[u8] = b"amy 0\n\nbob 1\nnot-a-pair\n\ncal 0\n";
        let reference_text: &[u8] = b"\namy 10\n   \nbob 11\ncal 12\n\n";

        let mut driving = SortedStream::new(RecordReader::new(driving_text, KeyValueParser::new())).unwrap();
        let mut reference = SortedStream::new(RecordReader::new(reference_text, LineParser)).unwrap();
        let mut out = Vec::new();

        enrich(
            &mut driving,
            &mut reference,
            |left, right| Ok(Some(Record::new(right.value.clone(), left.value.clone()))),
            &mut out,
        )
        .unwrap();

        assert_eq!(
            out,
            vec![Record::new("10", "0"), Record::new("11", "1"), Record::new("12", "0")]
        );
    }

    #[test]
    fn test_unsorted_input_is_reported() {
        let mut streams = vec![keys(&["b", "a"]), keys(&["c"])];
        let mut out = Vec::new();

        match intersect(&mut streams, &mut out) {
            Err(JoinError::Input {
                stream: 0,
                source: StreamError::OutOfOrder { .. },
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
