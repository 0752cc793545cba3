//! Sorted partition files.
//!
//! A partition is an immutable, key-sorted run of records written once by the accumulator and consumed once by
//! the merge that follows it. The on-disk encoding is pluggable through [`PartitionFile`].

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use log;
use serde::{Deserialize, Serialize};

use crate::record::{LineParser, Record, RecordReader};

/// Partition file error.
#[derive(Debug)]
pub enum ChunkError {
    /// Common I/O error.
    IO(io::Error),
    /// Record serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Record deserialization error.
    DeserializationError(rmp_serde::decode::Error),
}

impl Error for ChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ChunkError::IO(err) => err,
            ChunkError::SerializationError(err) => err,
            ChunkError::DeserializationError(err) => err,
        })
    }
}

impl Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ChunkError::IO(err) => write!(f, "partition I/O operation failed: {}", err),
            ChunkError::SerializationError(err) => write!(f, "record serialization error: {}", err),
            ChunkError::DeserializationError(err) => write!(f, "record deserialization error: {}", err),
        }
    }
}

impl From<io::Error> for ChunkError {
    fn from(err: io::Error) -> Self {
        ChunkError::IO(err)
    }
}

/// Identity of a partition: the input it was produced from and its sequence number within that input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    pub source: String,
    pub seq: usize,
}

impl PartitionId {
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}_{:05}.{}", self.source, self.seq, extension)
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.seq)
    }
}

/// Partition file interface. Provides methods for writing a sorted partition to the file system and reading
/// records back from it.
pub trait PartitionFile: Sized + Iterator<Item = Result<Record, ChunkError>> {
    /// File extension of the encoding.
    const EXTENSION: &'static str;

    /// Writes records to `path`. Records must already be sorted by key. Returns the number of records written.
    fn build(
        path: &Path,
        records: impl IntoIterator<Item = Record>,
        buf_size: Option<usize>,
    ) -> Result<u64, ChunkError> {
        let file = fs::File::create(path)?;
        let mut writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        let count = Self::dump(&mut writer, records)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        return Ok(count);
    }

    /// Opens a partition for reading.
    fn open(path: &Path, buf_size: Option<usize>) -> Result<Self, ChunkError> {
        let file = fs::File::open(path)?;
        let file_len = file.metadata()?.len();
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(Self::new(reader.take(file_len)));
    }

    /// Creates an instance of a partition reader.
    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self;

    /// Dumps records to a partition file.
    fn dump(writer: &mut io::BufWriter<fs::File>, records: impl IntoIterator<Item = Record>) -> Result<u64, ChunkError>;
}

/// Text partition: one `<key> <payload>` line per record, the same format as merged output files.
pub struct LineChunk {
    reader: RecordReader<io::Take<io::BufReader<fs::File>>, LineParser>,
}

impl PartitionFile for LineChunk {
    const EXTENSION: &'static str = "txt";

    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self {
        LineChunk {
            reader: RecordReader::new(reader, LineParser),
        }
    }

    fn dump(writer: &mut io::BufWriter<fs::File>, records: impl IntoIterator<Item = Record>) -> Result<u64, ChunkError> {
        let mut count = 0;
        for record in records.into_iter() {
            record.write_line(writer)?;
            count += 1;
        }

        return Ok(count);
    }
}

impl Iterator for LineChunk {
    type Item = Result<Record, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next().map(|item| item.map_err(ChunkError::IO))
    }
}

/// RMP (Rust MessagePack) partition.
/// It uses MessagePack as a record serialization format, which keeps payloads containing newlines intact.
/// For more information see https://msgpack.org/.
pub struct RmpChunk {
    reader: io::Take<io::BufReader<fs::File>>,
}

impl PartitionFile for RmpChunk {
    const EXTENSION: &'static str = "rmp";

    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self {
        RmpChunk { reader }
    }

    fn dump(
        mut writer: &mut io::BufWriter<fs::File>,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<u64, ChunkError> {
        let mut count = 0;
        for record in records.into_iter() {
            rmp_serde::encode::write(&mut writer, &record).map_err(ChunkError::SerializationError)?;
            count += 1;
        }

        return Ok(count);
    }
}

impl Iterator for RmpChunk {
    type Item = Result<Record, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.limit() == 0 {
            None
        } else {
            match rmp_serde::decode::from_read(&mut self.reader) {
                Ok(record) => Some(Ok(record)),
                Err(err) => Some(Err(ChunkError::DeserializationError(err))),
            }
        }
    }
}

/// Writes partitions of one source into a directory, numbering them sequentially.
///
/// Each worker owns its own writer, so partition names never collide as long as sources are distinct.
pub struct PartitionWriter {
    dir: PathBuf,
    source: String,
    next_seq: usize,
    buf_size: Option<usize>,
}

impl PartitionWriter {
    pub fn new(dir: &Path, source: impl Into<String>, buf_size: Option<usize>) -> Self {
        PartitionWriter {
            dir: dir.to_path_buf(),
            source: source.into(),
            next_seq: 0,
            buf_size,
        }
    }

    /// Number of partitions written so far.
    pub fn written(&self) -> usize {
        self.next_seq
    }

    /// Path of a partition written by this writer.
    pub fn path_of<C: PartitionFile>(&self, id: &PartitionId) -> PathBuf {
        self.dir.join(id.file_name(C::EXTENSION))
    }

    /// Writes sorted records as the next partition.
    pub fn write<C: PartitionFile>(
        &mut self,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<(PartitionId, PathBuf), ChunkError> {
        let id = PartitionId {
            source: self.source.clone(),
            seq: self.next_seq,
        };
        let path = self.path_of::<C>(&id);

        let count = C::build(&path, records, self.buf_size)?;
        self.next_seq += 1;
        log::debug!("partition {} written to {} ({} records)", id, path.display(), count);

        return Ok((id, path));
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{ChunkError, LineChunk, PartitionFile, PartitionWriter, RmpChunk};
    use crate::record::Record;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn records() -> Vec<Record> {
        vec![
            Record::new("amy", "yo"),
            Record::key_only("bob"),
            Record::new("cal", "multi word payload"),
        ]
    }

    #[rstest]
    fn test_line_chunk(tmp_dir: tempfile::TempDir) {
        let mut writer = PartitionWriter::new(tmp_dir.path(), "tweets", None);
        let (id, path) = writer.write::<LineChunk>(records()).unwrap();
        assert_eq!(id.seq, 0);
        assert_eq!(path.file_name().unwrap(), "tweets_00000.txt");

        let restored: Result<Vec<Record>, ChunkError> = LineChunk::open(&path, None).unwrap().collect();
        assert_eq!(restored.unwrap(), records());
    }

    #[rstest]
    fn test_rmp_chunk(tmp_dir: tempfile::TempDir) {
        let mut writer = PartitionWriter::new(tmp_dir.path(), "tweets", Some(4096));
        writer.write::<RmpChunk>(vec![Record::key_only("zed")]).unwrap();
        let (id, path) = writer.write::<RmpChunk>(records()).unwrap();
        assert_eq!(id.seq, 1);
        assert_eq!(writer.written(), 2);

        let restored: Result<Vec<Record>, ChunkError> = RmpChunk::open(&path, None).unwrap().collect();
        assert_eq!(restored.unwrap(), records());
    }
}
