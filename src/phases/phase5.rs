//! Phase 5: user id to gender table.

use std::path::{Path, PathBuf};

use super::{open_sorted, phase2, phase4, PipelineError, Workspace};
use crate::join;
use crate::lines::LineSink;
use crate::record::Record;

pub const UID2GENDER_FILE_NAME: &str = "uid2gender.txt";
const UID2GENDER_UNSORTED_FILE_NAME: &str = "uid2gender_unsorted.txt";

pub(crate) fn uid2gender_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 5).join(UID2GENDER_FILE_NAME)
}

fn unsorted_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 5).join(UID2GENDER_UNSORTED_FILE_NAME)
}

/// 5.1: replaces every username of the gender table by its user id.
///
/// A username mapped to several ids keeps the last one in numeric2screen order.
pub(crate) fn translate_keys(ws: &Workspace) -> Result<(), PipelineError> {
    ws.phase_dir(5)?;
    let output = unsorted_path(ws.output());

    let mut genders = open_sorted(&phase4::uname2gender_path(ws.output()), 0)?;
    let mut ids = open_sorted(&phase2::uname2id_path(ws.output()), 1)?;
    let mut sink = LineSink::with_batch_size(&output, ws.settings.write_batch_size)?;
    let mut ambiguous = 0u64;

    let stats = join::enrich(
        &mut genders,
        &mut ids,
        |gender, ids| {
            let uids: Vec<&str> = ids.value.split(' ').filter(|uid| !uid.is_empty()).collect();
            let uid = match uids.last() {
                Some(uid) => *uid,
                None => return Ok(None),
            };
            if uids.len() > 1 {
                ambiguous += 1;
            }
            Ok(Some(Record::new(uid, gender.value.clone())))
        },
        &mut sink,
    )?;
    let written = sink.finish()?;

    ws.ctx.report(format!(
        "{} user ids written to {}; {} usernames without an id, {} usernames with several ids",
        written,
        output.display(),
        stats.unmatched + (stats.matched - stats.emitted),
        ambiguous
    ))?;

    return Ok(());
}

/// 5.2: sorts the translated table by user id.
pub(crate) fn sort_uid2gender(ws: &Workspace) -> Result<(), PipelineError> {
    let input = unsorted_path(ws.output());
    let output = uid2gender_path(ws.output());

    ws.ctx.report(format!("Sorting {} with the {} sorter", input.display(), ws.sorter.name()))?;
    let written = ws.sorter.sort_file(ws.ctx, &input, &output)?;
    ws.ctx.report(format!("{} user ids written to {}", written, output.display()))?;

    return Ok(());
}
