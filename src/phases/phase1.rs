//! Phase 1: twitter7 tweets grouped by user.

use std::path::{Path, PathBuf};

use super::{list_partitions, PipelineError, Workspace};
use crate::lines::{self, LineSink, RecordSink};
use crate::record::{ArchiveParser, LineParser, Record};
use crate::sort::reset_dir;

pub const TWEETS_BY_USER_FILE_NAME: &str = "t7_tweets_by_user.txt";
pub const T7_USER_LIST_FILE_NAME: &str = "t7_user_list.txt";

pub(crate) fn tweets_by_user_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 1).join(TWEETS_BY_USER_FILE_NAME)
}

pub(crate) fn user_list_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 1).join(T7_USER_LIST_FILE_NAME)
}

fn partitions_dir(output: &Path) -> PathBuf {
    super::phase_dir(output, 1).join("partitions")
}

/// Monthly archive files of a twitter7 directory, failing when there are none.
fn archive_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let files = lines::archive_files(dir)?;
    if files.is_empty() {
        return Err(PipelineError::MissingInput {
            dir: dir.to_path_buf(),
            expected: format!("{}*{}", lines::ARCHIVE_PREFIX, lines::ARCHIVE_SUFFIXES.join("|")),
        });
    }
    return Ok(files);
}

/// 1.1: parses every archive file into sorted partitions, one accumulator per file.
pub(crate) fn accumulate_tweets(ws: &Workspace) -> Result<(), PipelineError> {
    let files = archive_files(ws.settings.twitter7_dpath()?)?;
    let partitions = partitions_dir(ws.output());
    ws.phase_dir(1)?;
    reset_dir(&partitions)?;

    ws.ctx.report(format!("Reading {} twitter7 archive files", files.len()))?;
    let accumulated = ws.native.accumulate_files(ws.ctx, &files, ArchiveParser::new, &partitions)?;

    ws.ctx.report(format!(
        "{} lines read: {} tweets, {} empty tweets, {} blank lines, {} malformed lines. {} partitions written to {}",
        accumulated.read.lines,
        accumulated.records,
        accumulated.read.no_content,
        accumulated.read.blank,
        accumulated.read.malformed,
        accumulated.partitions.len(),
        partitions.display()
    ))?;
    ws.ctx.report(format!("{} lines skipped in total", accumulated.read.skipped()))?;
    if let Some(line) = &accumulated.read.last_malformed {
        ws.ctx.report(format!("last malformed line: {:?}", line))?;
    }

    return Ok(());
}

/// 1.2: merges the partitions into one tweets-by-user file.
pub(crate) fn merge_tweets(ws: &Workspace) -> Result<(), PipelineError> {
    let partitions = list_partitions(&partitions_dir(ws.output()), ws.native.format())?;
    let output = tweets_by_user_path(ws.output());

    ws.ctx.report(format!("Merging {} partitions into {}", partitions.len(), output.display()))?;
    let users = ws.native.merge(ws.ctx, &partitions, &output)?;
    ws.ctx.report(format!("{} users with tweets found", users))?;

    return Ok(());
}

/// 1.3: projects the tweets-by-user file onto its keys.
pub(crate) fn list_users(ws: &Workspace) -> Result<(), PipelineError> {
    let input = tweets_by_user_path(ws.output());
    let output = user_list_path(ws.output());

    let mut sink = LineSink::with_batch_size(&output, ws.settings.write_batch_size)?;
    let mut meter = ws.ctx.progress("users listed");
    for record in lines::read_records(&input, LineParser, None)? {
        sink.push(Record::key_only(record?.key))?;
        meter.tick()?;
    }
    meter.finish()?;
    let users = sink.finish()?;
    ws.ctx.report(format!("{} users written to {}", users, output.display()))?;

    return Ok(());
}
