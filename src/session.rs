//! Resumable session state.
//!
//! A session records when a run started, how it was invoked and the last unit of work that completed. It is
//! persisted after every completed unit, so a restarted run skips everything up to that watermark.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use log;
use serde::{Deserialize, Serialize};

/// Session file name inside the output directory.
pub const SESSION_FILE_NAME: &str = "session.json";

/// Session error.
#[derive(Debug)]
pub enum SessionError {
    /// Common I/O error.
    IO(io::Error),
    /// The session file exists but cannot be understood.
    Corrupt { path: PathBuf, source: serde_json::Error },
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SessionError::IO(err) => err,
            SessionError::Corrupt { source, .. } => source,
        })
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SessionError::IO(err) => write!(f, "session I/O operation failed: {}", err),
            SessionError::Corrupt { path, source } => {
                write!(f, "session file {} is corrupt: {}", path.display(), source)
            }
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::IO(err)
    }
}

/// Identifier of a phase or of one of its subphases, e.g. `3` or `1.2`.
///
/// Identifiers order by phase, then subphase; a bare phase orders before its subphases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhaseId {
    pub phase: u8,
    pub subphase: Option<u8>,
}

impl PhaseId {
    pub const fn phase(phase: u8) -> Self {
        PhaseId { phase, subphase: None }
    }

    pub const fn sub(phase: u8, subphase: u8) -> Self {
        PhaseId {
            phase,
            subphase: Some(subphase),
        }
    }
}

impl Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subphase {
            Some(subphase) => write!(f, "{}.{}", self.phase, subphase),
            None => write!(f, "{}", self.phase),
        }
    }
}

impl FromStr for PhaseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid phase identifier '{}', expected e.g. '3' or '1.2'", s);
        let number = |part: &str| part.trim().parse::<u8>().map_err(|_| invalid());

        match s.split_once('.') {
            Some((phase, subphase)) => Ok(PhaseId::sub(number(phase)?, number(subphase)?)),
            None => Ok(PhaseId::phase(number(s)?)),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Checkpoint of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Unix time the session was created.
    pub start_time: u64,
    /// Command line the session was created with.
    pub original_arguments: Vec<String>,
    pub completed_phase: Option<u8>,
    pub completed_subphase: Option<u8>,
    /// Unix time of the most recent save.
    pub save_time: Option<u64>,
}

impl SessionState {
    pub fn new(original_arguments: Vec<String>) -> Self {
        SessionState {
            start_time: unix_now(),
            original_arguments,
            completed_phase: None,
            completed_subphase: None,
            save_time: None,
        }
    }

    /// Last completed unit.
    pub fn watermark(&self) -> Option<PhaseId> {
        self.completed_phase.map(|phase| PhaseId {
            phase,
            subphase: self.completed_subphase,
        })
    }

    /// Whether `unit` is at or before the watermark.
    pub fn is_completed(&self, unit: PhaseId) -> bool {
        self.watermark().map_or(false, |watermark| unit <= watermark)
    }

    /// Moves the watermark to `unit` unless it is already further. Returns whether it moved.
    pub fn mark_completed(&mut self, unit: PhaseId) -> bool {
        if self.is_completed(unit) {
            return false;
        }
        self.completed_phase = Some(unit.phase);
        self.completed_subphase = unit.subphase;
        return true;
    }

    /// Writes the session to `path` atomically.
    pub fn save(&mut self, path: &Path) -> Result<(), SessionError> {
        self.save_time = Some(unix_now());
        let content = serde_json::to_string_pretty(self).map_err(io::Error::from)?;

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        log::debug!("session saved to {} (completed: {:?})", path.display(), self.watermark());

        return Ok(());
    }

    /// Reads a session written by [`SessionState::save`].
    pub fn load(path: &Path) -> Result<SessionState, SessionError> {
        let content = fs::read_to_string(path)?;
        let state = serde_json::from_str(&content).map_err(|source| SessionError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        return Ok(state);
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{PhaseId, SessionError, SessionState};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    #[case("3", PhaseId::phase(3))]
    #[case("1.2", PhaseId::sub(1, 2))]
    #[case(" 6.1", PhaseId::sub(6, 1))]
    fn test_phase_id_parse(#[case] input: &str, #[case] expected: PhaseId) {
        let parsed: PhaseId = input.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), input.trim());
    }

    #[rstest]
    #[case("")]
    #[case("a")]
    #[case("1.")]
    #[case("1.2.3")]
    #[case("300")]
    fn test_phase_id_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<PhaseId>().is_err());
    }

    #[test]
    fn test_phase_id_order() {
        let mut ids = vec![PhaseId::sub(2, 1), PhaseId::phase(3), PhaseId::sub(1, 3), PhaseId::sub(1, 1)];
        ids.sort();
        assert_eq!(
            ids,
            vec![PhaseId::sub(1, 1), PhaseId::sub(1, 3), PhaseId::sub(2, 1), PhaseId::phase(3)]
        );
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let mut state = SessionState::new(vec!["twikwak".into(), "run".into()]);
        assert!(!state.is_completed(PhaseId::sub(1, 1)));

        assert!(state.mark_completed(PhaseId::phase(3)));
        assert!(!state.mark_completed(PhaseId::sub(2, 2)));
        assert_eq!(state.watermark(), Some(PhaseId::phase(3)));

        assert!(state.is_completed(PhaseId::sub(1, 1)));
        assert!(state.is_completed(PhaseId::phase(3)));
        assert!(!state.is_completed(PhaseId::phase(4)));
    }

    #[rstest]
    fn test_save_and_load(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("session.json");
        let mut state = SessionState::new(vec!["twikwak".into(), "phases".into(), "1".into()]);
        state.mark_completed(PhaseId::sub(1, 2));
        state.save(&path).unwrap();

        let loaded = SessionState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.save_time.is_some());
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
    }

    #[rstest]
    fn test_corrupt_session_is_an_error(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("session.json");
        fs::write(&path, "{\"start_time\": ").unwrap();
        assert!(matches!(SessionState::load(&path), Err(SessionError::Corrupt { .. })));

        let missing = tmp_dir.path().join("missing.json");
        assert!(matches!(SessionState::load(&missing), Err(SessionError::IO(_))));
    }
}
