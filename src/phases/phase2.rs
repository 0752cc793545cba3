//! Phase 2: kwak10 username to user id table.

use std::path::{Path, PathBuf};

use super::{find_input, PipelineError, Workspace};
use crate::lines::{self, LineSink, RecordSink};
use crate::record::{KeyValueParser, LineParser, Record};
use crate::sort::reset_dir;

pub const K10_UNAME2ID_FILE_NAME: &str = "k10_uname2id.txt";
pub const K10_USER_LIST_FILE_NAME: &str = "k10_user_list.txt";

const NUMERIC2SCREEN_NAMES: [&str; 2] = ["numeric2screen", "numeric2screen.gz"];

pub(crate) fn uname2id_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 2).join(K10_UNAME2ID_FILE_NAME)
}

pub(crate) fn user_list_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 2).join(K10_USER_LIST_FILE_NAME)
}

/// 2.1: re-keys `<uid> <screen name>` lines by lower-cased screen name and sorts them.
pub(crate) fn build_uname2id(ws: &Workspace) -> Result<(), PipelineError> {
    let input = find_input(ws.settings.kwak10_dpath()?, &NUMERIC2SCREEN_NAMES)?;
    let partitions = ws.phase_dir(2)?.join("partitions");
    reset_dir(&partitions)?;

    ws.ctx.report(format!("Reading {}", input.display()))?;
    let accumulated = ws.native.accumulate_files(
        ws.ctx,
        &[input],
        || KeyValueParser::new().swapped().lowercase_key(),
        &partitions,
    )?;
    ws.ctx.report(format!(
        "{} lines read, {} id mappings, {} malformed lines",
        accumulated.read.lines, accumulated.records, accumulated.read.malformed
    ))?;

    let output = uname2id_path(ws.output());
    let users = ws.native.merge(ws.ctx, &accumulated.partitions, &output)?;
    ws.ctx.report(format!("{} usernames written to {}", users, output.display()))?;

    return Ok(());
}

/// 2.2: projects the username table onto its keys.
pub(crate) fn list_users(ws: &Workspace) -> Result<(), PipelineError> {
    let input = uname2id_path(ws.output());
    let output = user_list_path(ws.output());

    let mut sink = LineSink::with_batch_size(&output, ws.settings.write_batch_size)?;
    for record in lines::read_records(&input, LineParser, None)? {
        sink.push(Record::key_only(record?.key))?;
    }
    let users = sink.finish()?;
    ws.ctx.report(format!("{} users written to {}", users, output.display()))?;

    return Ok(());
}
