//! Phase 3: users present in both datasets.

use std::path::{Path, PathBuf};

use super::{open_sorted, phase1, phase2, PipelineError, Workspace};
use crate::join;
use crate::lines::LineSink;

pub const UNAME_INTERSECTION_FILE_NAME: &str = "uname_intersection.txt";

pub(crate) fn intersection_path(output: &Path) -> PathBuf {
    super::phase_dir(output, 3).join(UNAME_INTERSECTION_FILE_NAME)
}

/// Sorts both user lists with the configured sorter and intersects them.
pub(crate) fn intersect_users(ws: &Workspace) -> Result<(), PipelineError> {
    let dir = ws.phase_dir(3)?;
    let t7_sorted = dir.join("t7_users_sorted.txt");
    let k10_sorted = dir.join("k10_users_sorted.txt");

    ws.ctx.report(format!("Sorting user lists with the {} sorter", ws.sorter.name()))?;
    let t7_users = ws.sorter.sort_file(ws.ctx, &phase1::user_list_path(ws.output()), &t7_sorted)?;
    let k10_users = ws.sorter.sort_file(ws.ctx, &phase2::user_list_path(ws.output()), &k10_sorted)?;
    ws.ctx.report(format!("{} twitter7 users, {} kwak10 users", t7_users, k10_users))?;

    let output = intersection_path(ws.output());
    let mut streams = vec![open_sorted(&t7_sorted, 0)?, open_sorted(&k10_sorted, 1)?];
    let mut sink = LineSink::with_batch_size(&output, ws.settings.write_batch_size)?;
    let stats = join::intersect(&mut streams, &mut sink)?;
    let written = sink.finish()?;

    ws.ctx.report(format!(
        "{} users found in both datasets ({} and {} users read), written to {}",
        written,
        stats.read.get(0).copied().unwrap_or_default(),
        stats.read.get(1).copied().unwrap_or_default(),
        output.display()
    ))?;

    return Ok(());
}
