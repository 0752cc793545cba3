//! Phase 4: gender classification of the intersection users.

use std::path::{Path, PathBuf};

use super::{open_sorted, phase1, phase3, PipelineError, Workspace};
use crate::classifier::GenderClassifier;
use crate::join::{self, TransformError};
use crate::lines::LineSink;
use crate::record::Record;

pub const UNAME2GENDER_FILE_NAME: &str = "uname2gender.txt";

pub(crate) fn uname2gender_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 4).join(UNAME2GENDER_FILE_NAME)
}

/// Labels every intersection user by classifying the user's tweets.
pub(crate) fn classify_users(ws: &Workspace, classifier: &mut dyn GenderClassifier) -> Result<(), PipelineError> {
    ws.phase_dir(4)?;
    let output = uname2gender_path(ws.output());

    let mut users = open_sorted(&phase3::intersection_path(ws.output()), 0)?;
    let mut tweets = open_sorted(&phase1::tweets_by_user_path(ws.output()), 1)?;
    let mut sink = LineSink::with_batch_size(&output, ws.settings.write_batch_size)?;
    let mut meter = ws.ctx.progress("users classified");

    let stats = join::enrich(
        &mut users,
        &mut tweets,
        |user, tweets| {
            let label = classifier.predict(&tweets.value).map_err(TransformError::from)?;
            meter.tick()?;
            Ok(Some(Record::new(user.key.clone(), label)))
        },
        &mut sink,
    )?;
    meter.finish()?;
    let written = sink.finish()?;

    ws.ctx.report(format!(
        "{} users classified, {} users not found in the tweet archive. Labels written to {}",
        written,
        stats.unmatched,
        output.display()
    ))?;

    return Ok(());
}
