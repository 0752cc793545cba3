//! Phase 6: kwak10 social graph restricted to users with a known gender.
//!
//! Edges are kept when both ends are present in the user id to gender table. Sources are checked first on the
//! graph keyed by source, then the surviving edges are re-keyed by target and checked again.

use std::io;
use std::path::Path;

use super::{find_input, open_sorted, phase5, PipelineError, Workspace};
use crate::join;
use crate::lines::{self, LineSink, RecordSink};
use crate::partition::PartitionWriter;
use crate::record::{EdgeParser, LineParser, Record};
use crate::sort::reset_dir;

pub const SOCIAL_GRAPH_FILE_NAME: &str = "social_graph.txt";

const TWITTER_RV_NAMES: [&str; 2] = ["twitter_rv.net", "twitter_rv.net.gz"];
const EDGES_BY_SOURCE_FILE_NAME: &str = "edges_by_source.txt";
const EDGES_SOURCE_KEPT_FILE_NAME: &str = "edges_source_kept.txt";
const EDGES_BY_TARGET_FILE_NAME: &str = "edges_by_target.txt";
const EDGES_TARGET_KEPT_FILE_NAME: &str = "edges_target_kept.txt";

/// Number of edges of a `<uid> <uid...>` adjacency record.
fn edge_count(record: &Record) -> u64 {
    record.value.split(' ').filter(|uid| !uid.is_empty()).count() as u64
}

/// Keeps the adjacency records of `input` whose key has a gender. Returns the edges read and kept.
fn keep_known(ws: &Workspace, input: &Path, output: &Path) -> Result<(u64, u64), PipelineError> {
    let mut adjacency = open_sorted(input, 0)?;
    let mut genders = open_sorted(&phase5::uid2gender_path(ws.output()), 1)?;
    let mut sink = LineSink::with_batch_size(output, ws.settings.write_batch_size)?;
    let mut kept = 0;

    join::enrich(
        &mut adjacency,
        &mut genders,
        |edges, _| {
            kept += edge_count(edges);
            Ok(Some(edges.clone()))
        },
        &mut sink,
    )?;
    sink.finish()?;

    let mut total = 0;
    for record in lines::read_records(input, LineParser, None)? {
        total += edge_count(&record?);
    }

    return Ok((total, kept));
}

/// 6.1: groups edges by source and drops sources without a gender.
pub(crate) fn keep_known_sources(ws: &Workspace) -> Result<(), PipelineError> {
    let input = find_input(ws.settings.kwak10_dpath()?, &TWITTER_RV_NAMES)?;
    let dir = ws.phase_dir(6)?;
    let partitions = dir.join("partitions_by_source");
    reset_dir(&partitions)?;

    ws.ctx.report(format!("Reading {}", input.display()))?;
    let accumulated = ws.native.accumulate_files(ws.ctx, &[input], || EdgeParser, &partitions)?;
    ws.ctx.report(format!(
        "{} lines read, {} edges, {} malformed lines",
        accumulated.read.lines, accumulated.records, accumulated.read.malformed
    ))?;

    let by_source = dir.join(EDGES_BY_SOURCE_FILE_NAME);
    let sources = ws.native.merge(ws.ctx, &accumulated.partitions, &by_source)?;
    ws.ctx.report(format!("{} source users written to {}", sources, by_source.display()))?;

    let (total, kept) = keep_known(ws, &by_source, &dir.join(EDGES_SOURCE_KEPT_FILE_NAME))?;
    ws.ctx.report(format!(
        "Removed {} edges with an unknown source; {} remain.",
        total - kept,
        kept
    ))?;

    return Ok(());
}

/// 6.2: re-keys the remaining edges by target, drops targets without a gender and writes the final graph.
pub(crate) fn keep_known_targets(ws: &Workspace) -> Result<(), PipelineError> {
    let dir = ws.phase_dir(6)?;
    let partitions = dir.join("partitions_by_target");
    reset_dir(&partitions)?;

    let source_kept = lines::read_records(&dir.join(EDGES_SOURCE_KEPT_FILE_NAME), LineParser, None)?;
    let reversed = source_kept.flat_map(|item| -> Vec<Result<Record, io::Error>> {
        match item {
            Ok(record) => record
                .value
                .split(' ')
                .filter(|target| !target.is_empty())
                .map(|target| Ok(Record::new(target, record.key.clone())))
                .collect(),
            Err(err) => vec![Err(err)],
        }
    });
    let mut writer = PartitionWriter::new(&partitions, "by_target", None);
    let accumulated = ws.native.accumulate(ws.ctx, reversed, &mut writer)?;

    let by_target = dir.join(EDGES_BY_TARGET_FILE_NAME);
    let targets = ws.native.merge(ws.ctx, &accumulated.partitions, &by_target)?;
    ws.ctx.report(format!("{} target users written to {}", targets, by_target.display()))?;

    let target_kept = dir.join(EDGES_TARGET_KEPT_FILE_NAME);
    let (total, kept) = keep_known(ws, &by_target, &target_kept)?;
    ws.ctx.report(format!(
        "Removed {} edges with an unknown target; {} remain.",
        total - kept,
        kept
    ))?;

    let output = dir.join(SOCIAL_GRAPH_FILE_NAME);
    let mut sink = LineSink::with_batch_size(&output, ws.settings.write_batch_size)?;
    for record in lines::read_records(&target_kept, LineParser, None)? {
        let record = record?;
        for source in record.value.split(' ').filter(|source| !source.is_empty()) {
            // edge lines are tab separated
            sink.push(Record::key_only(format!("{}\t{}", source, record.key)))?;
        }
    }
    let edges = sink.finish()?;
    ws.ctx.report(format!("Social graph of {} edges dumped to {}", edges, output.display()))?;

    return Ok(());
}
