//! Sorting backends.
//!
//! [`NativeSorter`] accumulates records into spilled partitions and k-way merges them. [`ExternalSortFacility`]
//! delegates whole-file sorting to the system `sort` utility under the C locale. Both implement [`Sorter`], so
//! callers can swap one for the other through configuration.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::thread;

use bytesize::ByteSize;
use log;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::buffer::{MemoryProbe, SpillPolicy, SpillingAccumulator, SystemMemory};
use crate::context::RunContext;
use crate::lines::{self, LineSink, RecordSink};
use crate::merger::KWayMerger;
use crate::partition::{ChunkError, LineChunk, PartitionFile, PartitionWriter, RmpChunk};
use crate::record::{LineParser, ReadStats, Record, RecordParser, RecordReader};

/// Default maximum number of partitions merged in one pass.
pub const DEFAULT_MAX_FAN_IN: usize = 256;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Partition encoding or decoding error.
    Chunk(ChunkError),
    /// The external sort command failed.
    Subprocess {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Chunk(err) => Some(err),
            SortError::Subprocess { .. } => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Chunk(err) => write!(f, "partition error: {}", err),
            SortError::Subprocess {
                command,
                status,
                stderr,
            } => write!(
                f,
                "command `{}` failed (exit status: {}): {}",
                command,
                status.map_or_else(|| "killed".to_string(), |code| code.to_string()),
                stderr.trim()
            ),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}

impl From<ChunkError> for SortError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::IO(err) => SortError::IO(err),
            err => SortError::Chunk(err),
        }
    }
}

/// Sorting backend.
pub trait Sorter: Send + Sync {
    /// Backend name used in reports.
    fn name(&self) -> &'static str;

    /// Sorts a `<key> <payload>` line file by key into `output`, keeping each distinct key once.
    /// Returns the number of records written.
    fn sort_file(&self, ctx: &RunContext, input: &Path, output: &Path) -> Result<u64, SortError>;
}

/// Selectable sorting backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SorterKind {
    Native,
    External,
}

impl Default for SorterKind {
    fn default() -> Self {
        SorterKind::Native
    }
}

impl FromStr for SorterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(SorterKind::Native),
            "external" => Ok(SorterKind::External),
            other => Err(format!("unknown sorter '{}', expected 'native' or 'external'", other)),
        }
    }
}

/// On-disk encoding of spilled partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionFormat {
    Text,
    MsgPack,
}

impl Default for PartitionFormat {
    fn default() -> Self {
        PartitionFormat::Text
    }
}

impl FromStr for PartitionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(PartitionFormat::Text),
            "msgpack" => Ok(PartitionFormat::MsgPack),
            other => Err(format!("unknown partition format '{}', expected 'text' or 'msgpack'", other)),
        }
    }
}

/// Outcome of accumulating one or more inputs into partitions.
#[derive(Debug, Clone, Default)]
pub struct Accumulated {
    /// Partition files in production order.
    pub partitions: Vec<PathBuf>,
    /// Records inserted into accumulators.
    pub records: u64,
    /// Line statistics of the inputs.
    pub read: ReadStats,
}

impl Accumulated {
    fn absorb(&mut self, other: Accumulated) {
        self.partitions.extend(other.partitions);
        self.records += other.records;
        self.read.lines += other.read.lines;
        self.read.records += other.read.records;
        self.read.blank += other.read.blank;
        self.read.markers += other.read.markers;
        self.read.no_content += other.read.no_content;
        self.read.malformed += other.read.malformed;
        if other.read.last_malformed.is_some() {
            self.read.last_malformed = other.read.last_malformed;
        }
    }
}

/// Native sorter builder. Provides methods for [`NativeSorter`] initialization.
#[derive(Clone, Default)]
pub struct NativeSorterBuilder {
    /// Number of threads to be used to accumulate inputs in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Partition file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Spill triggers.
    policy: SpillPolicy,
    /// Output batch size.
    batch_size: Option<usize>,
    /// Maximum number of partitions merged in one pass.
    max_fan_in: Option<usize>,
    /// Partition encoding.
    format: PartitionFormat,
}

impl NativeSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        NativeSorterBuilder::default()
    }

    /// Builds a [`NativeSorter`] instance using provided configuration.
    pub fn build(self) -> Result<NativeSorter, SortError> {
        NativeSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.policy,
            self.rw_buf_size,
            self.batch_size.unwrap_or(lines::DEFAULT_BATCH_SIZE),
            self.max_fan_in.unwrap_or(DEFAULT_MAX_FAN_IN),
            self.format,
        )
    }

    /// Sets number of threads to be used to accumulate inputs in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> NativeSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> NativeSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets spill triggers.
    pub fn with_policy(mut self, policy: SpillPolicy) -> NativeSorterBuilder {
        self.policy = policy;
        return self;
    }

    /// Sets partition read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> NativeSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets the number of records buffered before output is written.
    pub fn with_batch_size(mut self, batch_size: usize) -> NativeSorterBuilder {
        self.batch_size = Some(batch_size);
        return self;
    }

    /// Sets the maximum number of partitions merged in one pass.
    pub fn with_max_fan_in(mut self, max_fan_in: usize) -> NativeSorterBuilder {
        self.max_fan_in = Some(max_fan_in.max(2));
        return self;
    }

    /// Sets partition encoding.
    pub fn with_format(mut self, format: PartitionFormat) -> NativeSorterBuilder {
        self.format = format;
        return self;
    }
}

/// Native external sorter: accumulate and spill, then k-way merge.
pub struct NativeSorter {
    /// Accumulation thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<PathBuf>,
    /// Spill triggers.
    policy: SpillPolicy,
    /// Partition file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Output batch size.
    batch_size: usize,
    /// Maximum number of partitions merged in one pass.
    max_fan_in: usize,
    /// Partition encoding.
    format: PartitionFormat,
}

impl NativeSorter {
    /// Creates a new native sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads used to accumulate independent inputs in parallel. If the parameter
    ///   is [`None`] threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If parameter is [`None`] default OS temporary
    ///   directory will be used.
    /// * `policy` - Spill triggers of every accumulator.
    /// * `rw_buf_size` - Partition file read/write buffer size.
    /// * `batch_size` - Number of records buffered before output is written.
    /// * `max_fan_in` - Maximum number of partitions merged in one pass.
    /// * `format` - Partition encoding.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        policy: SpillPolicy,
        rw_buf_size: Option<usize>,
        batch_size: usize,
        max_fan_in: usize,
        format: PartitionFormat,
    ) -> Result<Self, SortError> {
        return Ok(NativeSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Path::to_path_buf),
            policy,
            rw_buf_size,
            batch_size,
            max_fan_in: max_fan_in.max(2),
            format,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(&self) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = &self.tmp_dir {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::debug!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    pub fn format(&self) -> PartitionFormat {
        self.format
    }

    /// Accumulates records into partitions written by `writer`. The residual table is always spilled at the end.
    pub fn accumulate<I, E>(
        &self,
        ctx: &RunContext,
        records: I,
        writer: &mut PartitionWriter,
    ) -> Result<Accumulated, SortError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: Into<SortError>,
    {
        let acc = SpillingAccumulator::new(self.policy);
        match self.format {
            PartitionFormat::Text => self.accumulate_with::<LineChunk, _, _, _>(ctx, records, acc, writer),
            PartitionFormat::MsgPack => self.accumulate_with::<RmpChunk, _, _, _>(ctx, records, acc, writer),
        }
    }

    fn accumulate_with<C, I, E, M>(
        &self,
        ctx: &RunContext,
        records: I,
        mut acc: SpillingAccumulator<M>,
        writer: &mut PartitionWriter,
    ) -> Result<Accumulated, SortError>
    where
        C: PartitionFile,
        I: IntoIterator<Item = Result<Record, E>>,
        E: Into<SortError>,
        M: MemoryProbe,
    {
        let mut accumulated = Accumulated::default();
        let mut meter = ctx.progress("records accumulated");

        for record in records.into_iter() {
            acc.insert_record(record.map_err(Into::into)?);
            meter.tick()?;

            if acc.should_spill() {
                if let Some((_, path)) = acc.spill::<C>(writer)? {
                    accumulated.partitions.push(path);
                }
            }
        }

        if let Some((_, path)) = acc.spill::<C>(writer)? {
            accumulated.partitions.push(path);
        }
        accumulated.records = meter.count();

        return Ok(accumulated);
    }

    /// Accumulates several line files in parallel, one accumulator and one partition namespace per file.
    ///
    /// # Arguments
    /// * `inputs` - Files to read
    /// * `parser` - Creates a fresh parser for every file
    /// * `partitions_dir` - Directory receiving the partitions
    pub fn accumulate_files<P, F>(
        &self,
        ctx: &RunContext,
        inputs: &[PathBuf],
        parser: F,
        partitions_dir: &Path,
    ) -> Result<Accumulated, SortError>
    where
        P: RecordParser,
        F: Fn() -> P + Sync,
    {
        let per_file: Result<Vec<Accumulated>, SortError> = self.thread_pool.install(|| {
            inputs
                .par_iter()
                .enumerate()
                .map(|(idx, input)| -> Result<Accumulated, SortError> {
                    let source = format!("{:03}_{}", idx, partition_source_name(input));
                    let mut writer = PartitionWriter::new(partitions_dir, source, self.rw_buf_size);
                    ctx.report(format!("accumulating {}", input.display()))?;

                    let mut reader = lines::read_records(input, parser(), self.rw_buf_size)?;
                    let mut accumulated = self.accumulate(ctx, &mut reader, &mut writer)?;
                    accumulated.read = reader.into_stats();

                    ctx.report(format!(
                        "{}: {} lines read, {} records, {} malformed lines, {} partitions",
                        input.display(),
                        accumulated.read.lines,
                        accumulated.records,
                        accumulated.read.malformed,
                        accumulated.partitions.len()
                    ))?;
                    Ok(accumulated)
                })
                .collect()
        });

        let mut total = Accumulated::default();
        for accumulated in per_file? {
            total.absorb(accumulated);
        }

        return Ok(total);
    }

    /// Merges partitions into `output`, combining records with equal keys.
    /// Returns the number of records written.
    pub fn merge(&self, ctx: &RunContext, partitions: &[PathBuf], output: &Path) -> Result<u64, SortError> {
        match self.format {
            PartitionFormat::Text => self.merge_with::<LineChunk>(ctx, partitions, output),
            PartitionFormat::MsgPack => self.merge_with::<RmpChunk>(ctx, partitions, output),
        }
    }

    fn merge_with<C: PartitionFile>(
        &self,
        ctx: &RunContext,
        partitions: &[PathBuf],
        output: &Path,
    ) -> Result<u64, SortError> {
        let tmp_dir = self.init_tmp_directory()?;
        let mut round = 0;
        let mut current: Vec<PathBuf> = partitions.to_vec();

        // narrow the partition count down to the fan-in limit; groups stay contiguous so values keep input order
        while current.len() > self.max_fan_in {
            let mut writer = PartitionWriter::new(tmp_dir.path(), format!("merge{:02}", round), self.rw_buf_size);
            let mut next = Vec::new();
            for group in current.chunks(self.max_fan_in) {
                let merger = KWayMerger::new(self.open_all::<C>(group)?);
                let mut failure = None;
                let records = merger.map_while(|item| match item {
                    Ok(record) => Some(record),
                    Err(err) => {
                        failure = Some(err);
                        None
                    }
                });
                let (_, path) = writer.write::<C>(records)?;
                if let Some(err) = failure {
                    return Err(err.into());
                }
                next.push(path);
            }
            ctx.report(format!(
                "merge round {}: {} partitions merged into {}",
                round,
                current.len(),
                next.len()
            ))?;
            current = next;
            round += 1;
        }

        let mut merger = KWayMerger::new(self.open_all::<C>(&current)?);
        let mut sink = LineSink::with_batch_size(output, self.batch_size)?;
        let mut meter = ctx.progress(format!("records merged into {}", output.display()));
        for record in &mut merger {
            sink.push(record?)?;
            meter.tick()?;
        }
        meter.finish()?;
        ctx.report(format!(
            "{} partition records combined into {} records",
            merger.merged(),
            sink.count()
        ))?;

        return Ok(sink.finish()?);
    }

    fn open_all<C: PartitionFile>(&self, paths: &[PathBuf]) -> Result<Vec<C>, SortError> {
        let mut chunks = Vec::with_capacity(paths.len());
        for path in paths {
            chunks.push(C::open(path, self.rw_buf_size)?);
        }
        return Ok(chunks);
    }
}

impl Sorter for NativeSorter {
    fn name(&self) -> &'static str {
        "native"
    }

    fn sort_file(&self, ctx: &RunContext, input: &Path, output: &Path) -> Result<u64, SortError> {
        let tmp_dir = self.init_tmp_directory()?;
        let mut writer = PartitionWriter::new(tmp_dir.path(), partition_source_name(input), self.rw_buf_size);

        let mut reader = lines::read_records(input, LineParser, self.rw_buf_size)?;
        let accumulated = self.accumulate(ctx, &mut reader, &mut writer)?;
        ctx.report(format!(
            "{}: {} records in {} partitions",
            input.display(),
            accumulated.records,
            accumulated.partitions.len()
        ))?;

        return self.merge(ctx, &accumulated.partitions, output);
    }
}

/// File stem usable as a partition source name.
fn partition_source_name(path: &Path) -> String {
    let name = path.file_name().map(|name| name.to_string_lossy()).unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Sorting backend delegating to the system `sort` utility (`sort -u` under `LC_ALL=C`).
///
/// The input is streamed to the child's stdin and its stdout is written through a [`LineSink`], so compressed
/// inputs and outputs are handled on this side of the pipe. The utility compares whole lines; since keys never
/// contain whitespace, whole-line byte order equals key order.
pub struct ExternalSortFacility {
    program: String,
    tmp_dir: Option<PathBuf>,
    threads_number: Option<usize>,
    min_available_bytes: u64,
    batch_size: usize,
}

impl ExternalSortFacility {
    pub fn new(program: impl Into<String>) -> Self {
        ExternalSortFacility {
            program: program.into(),
            tmp_dir: None,
            threads_number: None,
            min_available_bytes: SpillPolicy::default().min_available_bytes,
            batch_size: lines::DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets directory the utility uses for its temporary files.
    pub fn with_tmp_dir(mut self, path: &Path) -> Self {
        self.tmp_dir = Some(path.to_path_buf());
        return self;
    }

    /// Sets the number of sorting threads of the utility.
    pub fn with_threads_number(mut self, threads_number: usize) -> Self {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets the amount of memory left untouched when sizing the utility's buffer.
    pub fn with_min_available_bytes(mut self, min_available_bytes: u64) -> Self {
        self.min_available_bytes = min_available_bytes;
        return self;
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        return self;
    }

    fn args(&self, buffer_bytes: u64) -> Vec<String> {
        let threads = self
            .threads_number
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()));

        let mut args = vec![
            "-u".to_string(),
            format!("--buffer-size={}b", buffer_bytes),
            format!("--parallel={}", threads),
        ];
        if let Some(tmp_dir) = &self.tmp_dir {
            args.push(format!("--temporary-directory={}", tmp_dir.display()));
        }
        args
    }
}

impl Sorter for ExternalSortFacility {
    fn name(&self) -> &'static str {
        "external"
    }

    fn sort_file(&self, ctx: &RunContext, input: &Path, output: &Path) -> Result<u64, SortError> {
        let available = SystemMemory::new().available_bytes();
        // never ask for less than 64 MB even when the floor is already crossed
        let buffer_bytes = available
            .saturating_sub(self.min_available_bytes)
            .max(64 * bytesize::MB);
        let args = self.args(buffer_bytes);
        let command = format!("LC_ALL=C {} {}", self.program, args.join(" "));

        ctx.report(format!("sorting {} into {}", input.display(), output.display()))?;
        ctx.report(format!(
            "memory to use: {}, running: {}",
            ByteSize(buffer_bytes),
            command
        ))?;

        let source = lines::open_source(input, None)?;
        let mut child = process::Command::new(&self.program)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(process::Stdio::piped())
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            .spawn()
            .map_err(|err| SortError::Subprocess {
                command: command.clone(),
                status: None,
                stderr: err.to_string(),
            })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(SortError::IO(io::Error::new(io::ErrorKind::Other, "child pipes unavailable"))),
        };

        let feeder = thread::spawn(move || -> io::Result<u64> {
            let mut source = source;
            let mut stdin = io::BufWriter::new(stdin);
            let copied = io::copy(&mut source, &mut stdin)?;
            stdin.flush()?;
            Ok(copied)
        });
        let errors = thread::spawn(move || -> String {
            let mut captured = Vec::new();
            if let Err(err) = io::BufReader::new(stderr).read_to_end(&mut captured) {
                log::warn!("failed to read the sort command stderr: {}", err);
            }
            String::from_utf8_lossy(&captured).into_owned()
        });

        let mut sink = LineSink::with_batch_size(output, self.batch_size)?;
        let mut meter = ctx.progress(format!("sorted records written to {}", output.display()));
        let mut reader = RecordReader::new(io::BufReader::new(stdout), LineParser);
        let mut read_failure = None;
        for record in &mut reader {
            match record {
                Ok(record) => {
                    if let Err(err) = sink.push(record).and_then(|_| meter.tick()) {
                        read_failure = Some(err);
                        break;
                    }
                }
                Err(err) => {
                    read_failure = Some(err);
                    break;
                }
            }
        }
        drop(reader);

        let status = child.wait()?;
        let stderr = errors.join().unwrap_or_default();
        let fed = feeder.join();

        if !status.success() {
            return Err(SortError::Subprocess {
                command,
                status: status.code(),
                stderr,
            });
        }
        match fed {
            Ok(Ok(bytes)) => log::debug!("{} bytes fed to `{}`", bytes, self.program),
            Ok(Err(err)) => return Err(SortError::IO(err)),
            Err(_) => return Err(SortError::IO(io::Error::new(io::ErrorKind::Other, "input feeder panicked"))),
        }
        if let Some(err) = read_failure {
            return Err(SortError::IO(err));
        }
        if !stderr.trim().is_empty() {
            ctx.report(format!("sort stderr: {}", stderr.trim()))?;
        }

        meter.finish()?;
        let written = sink.finish()?;

        return Ok(written);
    }
}

/// Removes a partition directory left behind by an earlier attempt and recreates it empty.
pub fn reset_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{
        ExternalSortFacility, NativeSorter, NativeSorterBuilder, PartitionFormat, SortError, Sorter,
    };
    use crate::buffer::SpillPolicy;
    use crate::context::RunContext;
    use crate::lines;
    use crate::partition::PartitionWriter;
    use crate::record::{KeyValueParser, LineParser, Record};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn sorter(tmp: &Path, record_limit: usize, format: PartitionFormat) -> NativeSorter {
        NativeSorterBuilder::new()
            .with_threads_number(2)
            .with_tmp_dir(tmp)
            .with_policy(SpillPolicy::new(0).with_record_limit(record_limit))
            .with_batch_size(3)
            .with_max_fan_in(3)
            .with_format(format)
            .build()
            .unwrap()
    }

    fn read(path: &Path) -> Vec<Record> {
        lines::read_records(path, LineParser, None)
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    fn write_lines(path: &Path, lines: &[String]) {
        fs::write(path, lines.iter().map(|line| format!("{}\n", line)).collect::<String>()).unwrap();
    }

    #[rstest]
    #[case(PartitionFormat::Text)]
    #[case(PartitionFormat::MsgPack)]
    fn test_merge_scenario(tmp_dir: tempfile::TempDir, #[case] format: PartitionFormat) {
        let sorter = sorter(tmp_dir.path(), 100, format);
        let ctx = RunContext::new(true);
        let parts = tmp_dir.path().join("parts");
        fs::create_dir(&parts).unwrap();

        let mut writer = PartitionWriter::new(&parts, "input", None);
        let first = vec![Ok::<_, io::Error>(Record::new("amy", "1")), Ok(Record::new("bob", "2"))];
        let second = vec![Ok::<_, io::Error>(Record::new("amy", "3")), Ok(Record::new("cal", "4"))];
        let mut partitions = sorter.accumulate(&ctx, first, &mut writer).unwrap().partitions;
        partitions.extend(sorter.accumulate(&ctx, second, &mut writer).unwrap().partitions);
        assert_eq!(partitions.len(), 2);

        let output = tmp_dir.path().join("merged.txt");
        assert_eq!(sorter.merge(&ctx, &partitions, &output).unwrap(), 3);
        assert_eq!(
            read(&output),
            vec![Record::new("amy", "1 3"), Record::new("bob", "2"), Record::new("cal", "4")]
        );
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    #[case(1000)]
    fn test_spill_threshold_does_not_change_output(tmp_dir: tempfile::TempDir, #[case] record_limit: usize) {
        let mut keys = Vec::from_iter((0..60).map(|i| format!("user{:02}", i % 23)));
        keys.shuffle(&mut rand::thread_rng());
        let input = tmp_dir.path().join("input.txt");
        write_lines(&input, &keys);

        let output = tmp_dir.path().join("sorted.txt");
        let sorter = sorter(tmp_dir.path(), record_limit, PartitionFormat::Text);
        let written = sorter.sort_file(&RunContext::new(true), &input, &output).unwrap();

        let mut expected: Vec<String> = keys.clone();
        expected.sort();
        expected.dedup();
        let actual: Vec<String> = read(&output).into_iter().map(|record| record.key).collect();
        assert_eq!(written as usize, expected.len());
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_accumulate_files_in_parallel(tmp_dir: tempfile::TempDir) {
        let mut inputs: Vec<PathBuf> = Vec::new();
        let mut expected: BTreeMap<String, usize> = BTreeMap::new();
        for file in 0..4 {
            let lines: Vec<String> = (0..25).map(|i| format!("{} User{}", file * 100 + i, i % 9)).collect();
            for i in 0..25 {
                *expected.entry(format!("user{}", i % 9)).or_default() += 1;
            }
            let path = tmp_dir.path().join(format!("names.{}.txt", file));
            write_lines(&path, &lines);
            inputs.push(path);
        }

        let parts = tmp_dir.path().join("parts");
        fs::create_dir(&parts).unwrap();
        let sorter = sorter(tmp_dir.path(), 4, PartitionFormat::Text);
        let ctx = RunContext::new(true);

        let accumulated = sorter
            .accumulate_files(&ctx, &inputs, || KeyValueParser::new().swapped().lowercase_key(), &parts)
            .unwrap();
        assert_eq!(accumulated.records, 100);
        assert_eq!(accumulated.read.lines, 100);

        let output = tmp_dir.path().join("merged.txt");
        sorter.merge(&ctx, &accumulated.partitions, &output).unwrap();
        let merged: BTreeMap<String, usize> = read(&output)
            .into_iter()
            .map(|record| (record.key, record.value.split(' ').count()))
            .collect();
        assert_eq!(merged, expected);
    }

    #[rstest]
    fn test_external_sort_facility(tmp_dir: tempfile::TempDir) {
        if std::process::Command::new("sort").arg("--version").output().is_err() {
            return;
        }
        let input = tmp_dir.path().join("input.txt");
        write_lines(&input, &["bob".into(), "Amy".into(), "amy".into(), "bob".into(), "_x".into()]);
        let output = tmp_dir.path().join("sorted.txt.gz");

        let facility = ExternalSortFacility::new("sort")
            .with_tmp_dir(tmp_dir.path())
            .with_threads_number(1)
            .with_min_available_bytes(0);
        let written = facility.sort_file(&RunContext::new(true), &input, &output).unwrap();

        let keys: Vec<String> = read(&output).into_iter().map(|record| record.key).collect();
        assert_eq!(keys, vec!["Amy", "_x", "amy", "bob"]);
        assert_eq!(written, 4);
    }

    #[rstest]
    fn test_external_sort_failure_is_reported(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        write_lines(&input, &["a".into()]);
        let output = tmp_dir.path().join("sorted.txt");

        let facility = ExternalSortFacility::new("/nonexistent/sort-program");
        match facility.sort_file(&RunContext::new(true), &input, &output) {
            Err(SortError::Subprocess { command, .. }) => assert!(command.contains("/nonexistent/sort-program")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!output.exists());
    }

    #[rstest]
    #[cfg(unix)]
    fn test_external_sort_failure_keeps_stderr(tmp_dir: tempfile::TempDir) {
        use std::os::unix::fs::PermissionsExt;

        // a sort stand-in that rejects its input with a partly non UTF-8 message
        let program = tmp_dir.path().join("failing-sort");
        fs::write(&program, "#!/bin/sh\nprintf 'sort: bad \\377 input\\n' >&2\nexit 2\n").unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let input = tmp_dir.path().join("input.txt");
        write_lines(&input, &["b".into(), "a".into()]);
        let output = tmp_dir.path().join("sorted.txt");

        let facility = ExternalSortFacility::new(program.to_string_lossy().to_string());
        match facility.sort_file(&RunContext::new(true), &input, &output) {
            Err(SortError::Subprocess { status, stderr, .. }) => {
                assert_eq!(status, Some(2));
                assert!(stderr.starts_with("sort: bad "));
                assert!(stderr.trim_end().ends_with(" input"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!output.exists());
    }
}
