//! Run context: verbosity, the active phase report and progress reporting.
//!
//! A [`RunContext`] is passed explicitly to every component that reports progress. Each phase gets its own
//! context bound to its report file, so nested or concurrent runs never share a report handle.

use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use bytesize::ByteSize;
use log;

use crate::buffer::{MemoryProbe, SystemMemory};

/// Default number of processed lines between two progress reports.
pub const DEFAULT_MONITOR_FREQ: u64 = 1_000_000;

/// Verbosity and report sink shared by the components of one phase.
pub struct RunContext {
    quiet: bool,
    monitor_freq: u64,
    report: Option<Mutex<io::BufWriter<fs::File>>>,
    report_path: Option<PathBuf>,
}

impl RunContext {
    /// Creates a context without a report file.
    pub fn new(quiet: bool) -> Self {
        RunContext {
            quiet,
            monitor_freq: DEFAULT_MONITOR_FREQ,
            report: None,
            report_path: None,
        }
    }

    /// Sets the number of processed items between two progress reports.
    pub fn with_monitor_freq(mut self, monitor_freq: u64) -> Self {
        self.monitor_freq = monitor_freq.max(1);
        return self;
    }

    /// Creates a context with the same settings appending to the report file at `path`.
    pub fn for_report(&self, path: &Path) -> io::Result<RunContext> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;

        return Ok(RunContext {
            quiet: self.quiet,
            monitor_freq: self.monitor_freq,
            report: Some(Mutex::new(io::BufWriter::new(file))),
            report_path: Some(path.to_path_buf()),
        });
    }

    pub fn monitor_freq(&self) -> u64 {
        self.monitor_freq
    }

    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    /// Records a progress message in the report file and, unless quiet, in the log.
    pub fn report(&self, message: impl Display) -> io::Result<()> {
        let message = message.to_string();
        if !self.quiet {
            log::info!("{}", message);
        }

        if let Some(report) = &self.report {
            let mut writer = report
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "report writer poisoned"))?;
            writeln!(writer, "{}", message)?;
            writer.flush()?;
        }
        return Ok(());
    }

    /// Starts a progress meter reporting every `monitor_freq` ticks.
    pub fn progress(&self, label: impl Into<String>) -> ProgressMeter<'_> {
        ProgressMeter::new(self, label.into(), self.monitor_freq)
    }

    /// Flushes and closes the report file, returning its path.
    pub fn close(self) -> io::Result<Option<PathBuf>> {
        if let Some(report) = self.report {
            let mut writer = report
                .into_inner()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "report writer poisoned"))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        return Ok(self.report_path);
    }
}

/// Human readable duration, e.g. `1h 02m 03s`.
pub fn format_duration(seconds: u64) -> String {
    let (hours, minutes, seconds) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Periodic progress reporter: item count, throughput and available memory.
pub struct ProgressMeter<'a> {
    ctx: &'a RunContext,
    label: String,
    every: u64,
    count: u64,
    started: Instant,
    memory: SystemMemory,
}

impl<'a> ProgressMeter<'a> {
    fn new(ctx: &'a RunContext, label: String, every: u64) -> Self {
        ProgressMeter {
            ctx,
            label,
            every,
            count: 0,
            started: Instant::now(),
            memory: SystemMemory::new(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Counts one processed item, reporting every `every` items.
    pub fn tick(&mut self) -> io::Result<()> {
        self.count += 1;
        if self.count % self.every == 0 {
            let available = self.memory.available_bytes();
            self.ctx.report(self.line(Some(available)))?;
        }
        Ok(())
    }

    fn line(&self, available: Option<u64>) -> String {
        let minutes = self.started.elapsed().as_secs_f64() / 60.0;
        let rate = if minutes > 0.0 { self.count as f64 / minutes } else { 0.0 };
        let mut line = format!(
            "{}: {:.2} min running | {} processed | {:.0} per minute",
            self.label, minutes, self.count, rate
        );
        if let Some(available) = available {
            line.push_str(&format!(" | {} available memory", ByteSize(available)));
        }
        line
    }

    /// Reports the final count and returns it.
    pub fn finish(self) -> io::Result<u64> {
        self.ctx.report(format!(
            "{}: done, {} processed in {}",
            self.label,
            self.count,
            format_duration(self.started.elapsed().as_secs())
        ))?;
        Ok(self.count)
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use rstest::*;

    use super::{format_duration, RunContext};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    #[case(5, "5s")]
    #[case(65, "1m 05s")]
    #[case(3723, "1h 02m 03s")]
    fn test_format_duration(#[case] seconds: u64, #[case] expected: &str) {
        assert_eq!(format_duration(seconds), expected);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_report_file_written_regardless_of_quiet(tmp_dir: tempfile::TempDir, #[case] quiet: bool) {
        let path = tmp_dir.path().join("report.txt");
        let ctx = RunContext::new(quiet).with_monitor_freq(2).for_report(&path).unwrap();
        assert_eq!(ctx.report_path(), Some(path.as_path()));

        ctx.report("phase started").unwrap();
        let mut meter = ctx.progress("lines");
        for _ in 0..5 {
            meter.tick().unwrap();
        }
        assert_eq!(meter.finish().unwrap(), 5);
        assert_eq!(ctx.close().unwrap(), Some(path.clone()));

        let report = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "phase started");
        // two periodic reports and the final one
        assert_eq!(lines.len(), 4);
        assert!(lines[3].starts_with("lines: done, 5 processed"));
    }

    #[rstest]
    fn test_report_appends(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("report.txt");
        let base = RunContext::new(true);

        base.for_report(&path).unwrap().report("first").unwrap();
        base.for_report(&path).unwrap().report("second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[rstest]
    #[cfg(target_os = "linux")]
    fn test_report_write_failure_is_returned() {
        let ctx = RunContext::new(true).with_monitor_freq(1).for_report(Path::new("/dev/full")).unwrap();

        assert!(ctx.report("phase started").is_err());
        let mut meter = ctx.progress("lines");
        assert!(meter.tick().is_err());
        assert!(meter.finish().is_err());
    }
}
