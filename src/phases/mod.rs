//! Pipeline orchestration.
//!
//! The pipeline is a fixed sequence of units (phases and subphases). Each phase writes into its own
//! `phase_<n>_output` directory and reads only the directories of earlier phases. After every completed unit the
//! session watermark is advanced and persisted, so a restarted run skips completed units. A unit interrupted
//! before the session was saved is simply run again: every unit rebuilds its outputs from scratch.
//!
//! The orchestrator does not check that the outputs of earlier phases exist when a subset of units is selected;
//! a missing input surfaces as an I/O error of the unit reading it.

mod phase1;
mod phase2;
mod phase3;
mod phase4;
mod phase5;
mod phase6;

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log;

use crate::classifier::{ClassifierError, CommandClassifier, GenderClassifier};
use crate::config::{ConfigError, Settings};
use crate::context::{format_duration, RunContext};
use crate::join::JoinError;
use crate::lines::{self, LineSource};
use crate::partition::{ChunkError, LineChunk, PartitionFile, RmpChunk};
use crate::record::{LineParser, RecordReader};
use crate::session::{PhaseId, SessionError, SessionState, SESSION_FILE_NAME};
use crate::sort::{ExternalSortFacility, NativeSorter, NativeSorterBuilder, PartitionFormat, SortError, Sorter, SorterKind};
use crate::stream::SortedStream;

pub use phase1::{TWEETS_BY_USER_FILE_NAME, T7_USER_LIST_FILE_NAME};
pub use phase2::{K10_UNAME2ID_FILE_NAME, K10_USER_LIST_FILE_NAME};
pub use phase3::UNAME_INTERSECTION_FILE_NAME;
pub use phase4::UNAME2GENDER_FILE_NAME;
pub use phase5::UID2GENDER_FILE_NAME;
pub use phase6::SOCIAL_GRAPH_FILE_NAME;

/// Every unit of the pipeline in execution order.
pub const PLAN: [PhaseId; 11] = [
    PhaseId::sub(1, 1),
    PhaseId::sub(1, 2),
    PhaseId::sub(1, 3),
    PhaseId::sub(2, 1),
    PhaseId::sub(2, 2),
    PhaseId::phase(3),
    PhaseId::phase(4),
    PhaseId::sub(5, 1),
    PhaseId::sub(5, 2),
    PhaseId::sub(6, 1),
    PhaseId::sub(6, 2),
];

/// Pipeline error.
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Session(SessionError),
    Sort(SortError),
    Join(JoinError),
    Classifier(ClassifierError),
    /// Common I/O error.
    IO(io::Error),
    /// A selected identifier names no unit of the pipeline.
    UnknownPhase(PhaseId),
    /// A dataset directory holds none of the expected input files.
    MissingInput { dir: PathBuf, expected: String },
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            PipelineError::Config(err) => Some(err),
            PipelineError::Session(err) => Some(err),
            PipelineError::Sort(err) => Some(err),
            PipelineError::Join(err) => Some(err),
            PipelineError::Classifier(err) => Some(err),
            PipelineError::IO(err) => Some(err),
            PipelineError::UnknownPhase(_) => None,
            PipelineError::MissingInput { .. } => None,
        }
    }
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            PipelineError::Config(err) => write!(f, "{}", err),
            PipelineError::Session(err) => write!(f, "{}", err),
            PipelineError::Sort(err) => write!(f, "sorting failed: {}", err),
            PipelineError::Join(err) => write!(f, "{}", err),
            PipelineError::Classifier(err) => write!(f, "{}", err),
            PipelineError::IO(err) => write!(f, "I/O operation failed: {}", err),
            PipelineError::UnknownPhase(id) => write!(f, "unknown phase {}", id),
            PipelineError::MissingInput { dir, expected } => {
                write!(f, "no input file matching {} found in {}", expected, dir.display())
            }
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}

impl From<SessionError> for PipelineError {
    fn from(err: SessionError) -> Self {
        PipelineError::Session(err)
    }
}

impl From<SortError> for PipelineError {
    fn from(err: SortError) -> Self {
        PipelineError::Sort(err)
    }
}

impl From<ChunkError> for PipelineError {
    fn from(err: ChunkError) -> Self {
        PipelineError::Sort(err.into())
    }
}

impl From<JoinError> for PipelineError {
    fn from(err: JoinError) -> Self {
        PipelineError::Join(err)
    }
}

impl From<ClassifierError> for PipelineError {
    fn from(err: ClassifierError) -> Self {
        PipelineError::Classifier(err)
    }
}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        PipelineError::IO(err)
    }
}

/// Sorted stream over an engine output file.
pub(crate) type FileStream = SortedStream<RecordReader<LineSource, LineParser>>;

/// Opens an engine output file as the `idx`-th input of a join.
pub(crate) fn open_sorted(path: &Path, idx: usize) -> Result<FileStream, PipelineError> {
    let reader = lines::read_records(path, LineParser, None)?;
    SortedStream::new(reader).map_err(|source| PipelineError::Join(JoinError::Input { stream: idx, source }))
}

/// Output directory of a phase.
pub fn phase_dir(output: &Path, phase: u8) -> PathBuf {
    output.join(format!("phase_{}_output", phase))
}

/// Creates the output directory of a phase if needed and returns it.
pub(crate) fn ensure_phase_dir(output: &Path, phase: u8) -> io::Result<PathBuf> {
    let dir = phase_dir(output, phase);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Partition files of a directory in name order, which is production order.
pub(crate) fn list_partitions(dir: &Path, format: PartitionFormat) -> io::Result<Vec<PathBuf>> {
    let extension = match format {
        PartitionFormat::Text => LineChunk::EXTENSION,
        PartitionFormat::MsgPack => RmpChunk::EXTENSION,
    };

    let mut partitions = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == extension) {
            partitions.push(path);
        }
    }
    partitions.sort();

    return Ok(partitions);
}

/// First existing file among `names` in `dir`.
pub(crate) fn find_input(dir: &Path, names: &[&str]) -> Result<PathBuf, PipelineError> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| PipelineError::MissingInput {
            dir: dir.to_path_buf(),
            expected: names.join(" or "),
        })
}

/// Everything a unit needs besides the classifier.
pub(crate) struct Workspace<'a> {
    pub ctx: &'a RunContext,
    pub settings: &'a Settings,
    /// Accumulate and merge engine.
    pub native: &'a NativeSorter,
    /// Configured backend for whole-file sorts.
    pub sorter: &'a dyn Sorter,
}

impl<'a> Workspace<'a> {
    pub fn output(&self) -> &Path {
        &self.settings.output_dpath
    }

    pub fn phase_dir(&self, phase: u8) -> io::Result<PathBuf> {
        ensure_phase_dir(self.output(), phase)
    }
}

/// Expands a selection into units in execution order. A bare phase selects all of its subphases.
pub fn expand_selection(selection: &[PhaseId]) -> Result<Vec<PhaseId>, PipelineError> {
    let mut units = Vec::new();
    for id in selection {
        let matching: Vec<PhaseId> = PLAN
            .iter()
            .copied()
            .filter(|unit| *unit == *id || (id.subphase.is_none() && unit.phase == id.phase))
            .collect();
        if matching.is_empty() {
            return Err(PipelineError::UnknownPhase(*id));
        }
        units.extend(matching);
    }
    units.sort();
    units.dedup();

    return Ok(units);
}

/// Sequences the pipeline units under a session.
pub struct Pipeline {
    settings: Settings,
    native: NativeSorter,
    external: Option<ExternalSortFacility>,
    classifier: Option<Box<dyn GenderClassifier>>,
    session: SessionState,
    session_path: PathBuf,
    ctx: RunContext,
}

impl Pipeline {
    /// Creates a pipeline persisting `session` to `<output>/session.json`.
    pub fn new(settings: Settings, session: SessionState) -> Result<Self, PipelineError> {
        let session_path = settings.output_dpath.join(SESSION_FILE_NAME);
        Self::with_session_path(settings, session, session_path)
    }

    /// Creates a pipeline persisting `session` to `session_path`.
    pub fn with_session_path(
        settings: Settings,
        session: SessionState,
        session_path: PathBuf,
    ) -> Result<Self, PipelineError> {
        let mut builder = NativeSorterBuilder::new()
            .with_policy(settings.spill_policy())
            .with_batch_size(settings.write_batch_size)
            .with_format(settings.partition_format);
        if let Some(threads) = settings.threads {
            builder = builder.with_threads_number(threads);
        }
        if let Some(tmp_dir) = &settings.tmp_dpath {
            builder = builder.with_tmp_dir(tmp_dir);
        }
        let native = builder.build()?;

        let external = match settings.sorter {
            SorterKind::Native => None,
            SorterKind::External => {
                let mut facility = ExternalSortFacility::new(settings.sort_program.clone())
                    .with_min_available_bytes(settings.min_available_bytes)
                    .with_batch_size(settings.write_batch_size);
                if let Some(threads) = settings.threads {
                    facility = facility.with_threads_number(threads);
                }
                if let Some(tmp_dir) = &settings.tmp_dpath {
                    facility = facility.with_tmp_dir(tmp_dir);
                }
                Some(facility)
            }
        };

        let ctx = RunContext::new(settings.quiet).with_monitor_freq(settings.monitor_line_freq);

        return Ok(Pipeline {
            settings,
            native,
            external,
            classifier: None,
            session,
            session_path,
            ctx,
        });
    }

    /// Uses `classifier` in phase 4 instead of spawning the configured classifier command.
    pub fn with_classifier(mut self, classifier: Box<dyn GenderClassifier>) -> Self {
        self.classifier = Some(classifier);
        return self;
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    /// Runs every unit of the pipeline. Returns the units executed.
    pub fn run_all(&mut self) -> Result<Vec<PhaseId>, PipelineError> {
        self.run(&PLAN)
    }

    /// Runs the selected units in pipeline order, skipping units the session records as completed.
    /// Returns the units executed.
    pub fn run(&mut self, selection: &[PhaseId]) -> Result<Vec<PhaseId>, PipelineError> {
        let units = expand_selection(selection)?;
        let pending: Vec<PhaseId> = units
            .iter()
            .copied()
            .filter(|unit| !self.session.is_completed(*unit))
            .collect();
        self.check_requirements(&pending)?;

        fs::create_dir_all(&self.settings.output_dpath)?;
        if let Some(watermark) = self.session.watermark() {
            log::info!("resuming session: units up to {} are completed", watermark);
        }

        let mut executed = Vec::new();
        let mut idx = 0;
        while idx < units.len() {
            let phase = units[idx].phase;
            let end = units[idx..]
                .iter()
                .position(|unit| unit.phase != phase)
                .map_or(units.len(), |offset| idx + offset);

            executed.extend(self.run_phase(phase, &units[idx..end])?);
            idx = end;
        }

        return Ok(executed);
    }

    /// Fails before any I/O when a pending unit needs a value the settings lack.
    fn check_requirements(&self, pending: &[PhaseId]) -> Result<(), PipelineError> {
        for unit in pending {
            match unit.phase {
                1 => {
                    self.settings.twitter7_dpath()?;
                }
                2 | 6 => {
                    self.settings.kwak10_dpath()?;
                }
                4 if self.classifier.is_none() => {
                    self.settings.classifier_command()?;
                }
                _ => {}
            }
        }
        return Ok(());
    }

    fn run_phase(&mut self, phase: u8, units: &[PhaseId]) -> Result<Vec<PhaseId>, PipelineError> {
        let pending: Vec<PhaseId> = units
            .iter()
            .copied()
            .filter(|unit| !self.session.is_completed(*unit))
            .collect();
        if pending.is_empty() {
            for unit in units {
                self.ctx.report(format!("skipping {}: already completed", unit))?;
            }
            return Ok(Vec::new());
        }

        let dir = ensure_phase_dir(&self.settings.output_dpath, phase)?;
        let report_path = dir.join(format!("phase_{}_report.txt", phase));
        let ctx = self.ctx.for_report(&report_path)?;
        let started = Instant::now();
        ctx.report(format!("====== PHASE {} ======", phase))?;

        let mut executed = Vec::new();
        for unit in units {
            if self.session.is_completed(*unit) {
                ctx.report(format!("skipping {}: already completed", unit))?;
                continue;
            }

            ctx.report(format!("--- starting {} ---", unit))?;
            let unit_started = Instant::now();
            self.run_unit(&ctx, *unit)?;
            ctx.report(format!(
                "--- {} done in {} ---",
                unit,
                format_duration(unit_started.elapsed().as_secs())
            ))?;

            self.session.mark_completed(*unit);
            self.session.save(&self.session_path)?;
            executed.push(*unit);
        }

        ctx.report(format!(
            "Finished running phase {} of the twikwak pipeline. Run duration: {}",
            phase,
            format_duration(started.elapsed().as_secs())
        ))?;
        if let Some(report_path) = ctx.close()? {
            let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
            let copy = dir.join(format!("phase_{}_report_{}.txt", phase, stamp));
            fs::copy(&report_path, &copy)?;
        }

        return Ok(executed);
    }

    fn run_unit(&mut self, ctx: &RunContext, unit: PhaseId) -> Result<(), PipelineError> {
        let Pipeline {
            settings,
            native,
            external,
            classifier,
            ..
        } = self;
        let settings: &Settings = settings;
        let native: &NativeSorter = native;
        let sorter: &dyn Sorter = match external.as_ref() {
            Some(external) => external,
            None => native,
        };
        let ws = Workspace {
            ctx,
            settings,
            native,
            sorter,
        };

        match (unit.phase, unit.subphase) {
            (1, Some(1)) => phase1::accumulate_tweets(&ws),
            (1, Some(2)) => phase1::merge_tweets(&ws),
            (1, Some(3)) => phase1::list_users(&ws),
            (2, Some(1)) => phase2::build_uname2id(&ws),
            (2, Some(2)) => phase2::list_users(&ws),
            (3, None) => phase3::intersect_users(&ws),
            (4, None) => {
                if classifier.is_none() {
                    let command = settings.classifier_command()?;
                    *classifier = Some(Box::new(CommandClassifier::spawn(command)?));
                }
                match classifier.as_deref_mut() {
                    Some(classifier) => phase4::classify_users(&ws, classifier),
                    None => Err(PipelineError::Config(ConfigError::Missing {
                        key: "classifier_command",
                        config_path: settings.config_path.clone(),
                    })),
                }
            }
            (5, Some(1)) => phase5::translate_keys(&ws),
            (5, Some(2)) => phase5::sort_uid2gender(&ws),
            (6, Some(1)) => phase6::keep_known_sources(&ws),
            (6, Some(2)) => phase6::keep_known_targets(&ws),
            _ => Err(PipelineError::UnknownPhase(unit)),
        }
    }
}
