//! Line sources and sinks.
//!
//! Compression is a transport detail: a path ending in `.gz` is transparently read or written through gzip,
//! anything else is plain text.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log;

use crate::record::{ArchiveParser, Parsed, Record, RecordParser, RecordReader, SkipReason};

/// Default number of records a [`LineSink`] buffers before writing them out.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Readable line stream.
pub type LineSource = Box<dyn BufRead + Send>;

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

/// Opens a file as a line source.
pub fn open_source(path: &Path, buf_size: Option<usize>) -> io::Result<LineSource> {
    let file = fs::File::open(path)?;
    let capacity = buf_size.unwrap_or(64 * 1024);

    return Ok(if is_gzip(path) {
        Box::new(io::BufReader::with_capacity(capacity, MultiGzDecoder::new(file)))
    } else {
        Box::new(io::BufReader::with_capacity(capacity, file))
    });
}

/// Opens a file and parses it into records.
pub fn read_records<P: RecordParser>(
    path: &Path,
    parser: P,
    buf_size: Option<usize>,
) -> io::Result<RecordReader<LineSource, P>> {
    Ok(RecordReader::new(open_source(path, buf_size)?, parser))
}

/// File name prefix of the monthly twitter7 archive files.
pub const ARCHIVE_PREFIX: &str = "tweets2009-";
/// Accepted file name endings of the monthly twitter7 archive files.
pub const ARCHIVE_SUFFIXES: [&str; 2] = [".txt", ".txt.gz"];

/// Monthly archive files of a twitter7 directory in name order.
pub fn archive_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|name| name.to_string_lossy().to_string()).unwrap_or_default();
        if path.is_file()
            && name.starts_with(ARCHIVE_PREFIX)
            && ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        {
            files.push(path);
        }
    }
    files.sort();

    return Ok(files);
}

/// Counters of an archive sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    /// Complete tweets copied.
    pub tweets: u64,
    /// Lines read from the source.
    pub lines_read: u64,
}

/// Copies the first `size` complete tweets of a twitter7 archive file into `target`.
///
/// A tweet is the run of `T`/`U` lines closed by a `W` line attributable to a user. Copied tweets keep their
/// original lines and are separated by a blank line as in the archive. Runs broken by a blank, malformed or
/// non UTF-8 line are dropped.
pub fn sample_archive_file(source: &Path, target: &Path, size: u64) -> io::Result<SampleStats> {
    let mut reader = open_source(source, None)?;
    let mut sink = LineSink::create(target)?;
    let mut parser = ArchiveParser::new();
    let mut pending: Vec<String> = Vec::with_capacity(3);
    let mut buf = Vec::new();
    let mut stats = SampleStats::default();

    while stats.tweets < size {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        stats.lines_read += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end_matches(|c: char| c == '\n' || c == '\r'),
            Err(_) => {
                pending.clear();
                continue;
            }
        };

        let complete = match parser.parse(line) {
            Parsed::Record(_) => true,
            Parsed::Skip(SkipReason::NoContent) => parser.current_user().is_some(),
            Parsed::Skip(SkipReason::Marker) => {
                pending.push(line.to_string());
                continue;
            }
            Parsed::Skip(SkipReason::Blank) | Parsed::Skip(SkipReason::Malformed) => false,
        };
        if !complete {
            pending.clear();
            continue;
        }

        for tweet_line in pending.drain(..) {
            sink.push(Record::key_only(tweet_line))?;
        }
        sink.push(Record::key_only(line))?;
        sink.push(Record::key_only(""))?;
        stats.tweets += 1;
    }
    sink.finish()?;

    if stats.tweets < size {
        log::warn!("{} holds only {} complete tweets", source.display(), stats.tweets);
    }
    return Ok(stats);
}

/// Default sample directory of a twitter7 directory.
pub fn default_sample_dir(source_dir: &Path, size: u64) -> PathBuf {
    source_dir.join(format!("sample_{}", size))
}

/// Samples every archive file of `source_dir` into a file of the same name in `target_dir`.
pub fn sample_archive_dir(
    source_dir: &Path,
    target_dir: &Path,
    size: u64,
) -> io::Result<Vec<(PathBuf, SampleStats)>> {
    let files = archive_files(source_dir)?;
    fs::create_dir_all(target_dir)?;

    let mut sampled = Vec::with_capacity(files.len());
    for file in files {
        let target = match file.file_name() {
            Some(name) => target_dir.join(name),
            None => continue,
        };
        let stats = sample_archive_file(&file, &target, size)?;
        log::info!("{} tweets of {} written to {}", stats.tweets, file.display(), target.display());
        sampled.push((target, stats));
    }

    return Ok(sampled);
}

/// Destination of emitted records.
pub trait RecordSink {
    fn push(&mut self, record: Record) -> io::Result<()>;
}

impl RecordSink for Vec<Record> {
    fn push(&mut self, record: Record) -> io::Result<()> {
        Vec::push(self, record);
        Ok(())
    }
}

enum SinkWriter {
    Plain(io::BufWriter<fs::File>),
    Gzip(GzEncoder<io::BufWriter<fs::File>>),
}

impl SinkWriter {
    fn finish(self) -> io::Result<()> {
        match self {
            SinkWriter::Plain(mut writer) => writer.flush(),
            SinkWriter::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Plain(writer) => writer.write(buf),
            SinkWriter::Gzip(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Plain(writer) => writer.flush(),
            SinkWriter::Gzip(writer) => writer.flush(),
        }
    }
}

/// Writable record stream with bounded output buffering and atomic commit.
///
/// Records are buffered and written out every `batch_size` records. Data goes to a `<name>.tmp` sibling of the
/// target path which is renamed onto the target by [`LineSink::finish`], so an interrupted write never leaves a
/// truncated file under the final name.
pub struct LineSink {
    writer: Option<SinkWriter>,
    path: PathBuf,
    tmp_path: PathBuf,
    batch: Vec<Record>,
    batch_size: usize,
    written: u64,
}

impl LineSink {
    /// Creates a sink with the default batch size.
    pub fn create(path: &Path) -> io::Result<Self> {
        Self::with_batch_size(path, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(path: &Path, batch_size: usize) -> io::Result<Self> {
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let file = fs::File::create(&tmp_path)?;
        let writer = if is_gzip(path) {
            SinkWriter::Gzip(GzEncoder::new(io::BufWriter::new(file), Compression::default()))
        } else {
            SinkWriter::Plain(io::BufWriter::new(file))
        };

        let batch_size = batch_size.max(1);

        return Ok(LineSink {
            writer: Some(writer),
            path: path.to_path_buf(),
            tmp_path,
            batch: Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE)),
            batch_size,
            written: 0,
        });
    }

    /// Target path of the sink.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records pushed so far.
    pub fn count(&self) -> u64 {
        self.written + self.batch.len() as u64
    }

    fn flush_batch(&mut self) -> io::Result<()> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Err(io::Error::new(io::ErrorKind::Other, "line sink already finished")),
        };

        for record in self.batch.drain(..) {
            record.write_line(writer)?;
            self.written += 1;
        }
        return Ok(());
    }

    /// Writes out buffered records, flushes and moves the file to its final path.
    /// Returns the number of records written.
    pub fn finish(mut self) -> io::Result<u64> {
        self.flush_batch()?;
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        fs::rename(&self.tmp_path, &self.path)?;

        return Ok(self.written);
    }
}

impl RecordSink for LineSink {
    fn push(&mut self, record: Record) -> io::Result<()> {
        self.batch.push(record);
        if self.batch.len() >= self.batch_size {
            self.flush_batch()?;
        }
        return Ok(());
    }
}

impl Drop for LineSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            // not finished: drop the partial output
            self.writer = None;
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;

    use rstest::*;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::{
        archive_files, default_sample_dir, open_source, read_records, sample_archive_dir, sample_archive_file,
        LineSink, RecordSink, SampleStats,
    };
    use crate::record::{LineParser, Record};

    const ARCHIVE: &str = "\
total number:5
T\t2009-06-11 00:00:03
U\thttp://twitter.com/Amy
W\tshe sells sea shells

T\t2009-06-11 00:00:04
U\thttp://twitter.com/bob
W\tNo Post Title

T\t2009-06-11 00:00:05
U\thttp://twitter.com/has space
W\tdropped

T\t2009-06-11 00:00:06
U\thttp://twitter.com/carl
W\thello world
";

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    #[case("plain.txt")]
    #[case("compressed.txt.gz")]
    fn test_sink_round_trip(tmp_dir: tempfile::TempDir, #[case] name: &str) {
        let path = tmp_dir.path().join(name);
        let mut sink = LineSink::with_batch_size(&path, 2).unwrap();
        for record in [Record::new("amy", "yo"), Record::key_only("bob"), Record::new("cal", "4")] {
            sink.push(record).unwrap();
        }
        assert_eq!(sink.count(), 3);
        assert_eq!(sink.finish().unwrap(), 3);

        let records: Vec<Record> = read_records(&path, LineParser, None)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            records,
            vec![Record::new("amy", "yo"), Record::key_only("bob"), Record::new("cal", "4")]
        );
    }

    #[rstest]
    fn test_unfinished_sink_leaves_no_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("out.txt");
        {
            let mut sink = LineSink::create(&path).unwrap();
            sink.push(Record::key_only("amy")).unwrap();
        }
        assert!(!path.exists());
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_open_plain_source(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("in.txt");
        fs::write(&path, "a\nb\n").unwrap();
        let lines: Vec<String> = open_source(&path, None).unwrap().lines().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[rstest]
    #[case(2, "T\t2009-06-11 00:00:03\nU\thttp://twitter.com/Amy\nW\tshe sells sea shells\n\nT\t2009-06-11 00:00:04\nU\thttp://twitter.com/bob\nW\tNo Post Title\n\n", 2)]
    #[case(3, "T\t2009-06-11 00:00:03\nU\thttp://twitter.com/Amy\nW\tshe sells sea shells\n\nT\t2009-06-11 00:00:04\nU\thttp://twitter.com/bob\nW\tNo Post Title\n\nT\t2009-06-11 00:00:06\nU\thttp://twitter.com/carl\nW\thello world\n\n", 3)]
    #[case(0, "", 0)]
    fn test_sample_archive_file(
        tmp_dir: tempfile::TempDir,
        #[case] size: u64,
        #[case] expected: &str,
        #[case] expected_tweets: u64,
    ) {
        let source = tmp_dir.path().join("tweets2009-06.txt");
        fs::write(&source, ARCHIVE).unwrap();
        let target = tmp_dir.path().join("sample.txt");

        let stats = sample_archive_file(&source, &target, size).unwrap();
        assert_eq!(stats.tweets, expected_tweets);
        assert_eq!(fs::read_to_string(&target).unwrap(), expected);
    }

    #[rstest]
    fn test_sample_archive_dir(tmp_dir: tempfile::TempDir) {
        let source = tmp_dir.path().join("twitter7");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("tweets2009-06.txt"), ARCHIVE).unwrap();
        let mut encoder = GzEncoder::new(fs::File::create(source.join("tweets2009-07.txt.gz")).unwrap(), Compression::default());
        encoder.write_all(ARCHIVE.as_bytes()).unwrap();
        encoder.finish().unwrap();
        fs::write(source.join("README"), "not an archive").unwrap();

        let target = default_sample_dir(&source, 1);
        let sampled = sample_archive_dir(&source, &target, 1).unwrap();

        assert_eq!(sampled.len(), 2);
        assert!(sampled.iter().all(|(_, stats)| stats.tweets == 1));
        assert_eq!(archive_files(&target).unwrap(), sampled.iter().map(|(path, _)| path.clone()).collect::<Vec<_>>());

        let expected = "T\t2009-06-11 00:00:03\nU\thttp://twitter.com/Amy\nW\tshe sells sea shells\n\n";
        assert_eq!(fs::read_to_string(target.join("tweets2009-06.txt")).unwrap(), expected);
        let mut compressed = String::new();
        open_source(&target.join("tweets2009-07.txt.gz"), None)
            .unwrap()
            .read_to_string(&mut compressed)
            .unwrap();
        assert_eq!(compressed, expected);
        assert_eq!(sampled[0].1, SampleStats { tweets: 1, lines_read: 4 });
    }
}
