//! Progress tracking for the external backup tool.
//!
//! The tool only reports a progress bar for the file currently being
//! received, redrawn with carriage returns, e.g.
//! `[=====     ] 50% (10.0 MB/20.0 MB)`. There is no backup-wide total, so
//! overall progress is estimated from elapsed time and the number of files
//! seen to complete.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Percent reported while transferring never exceeds this until the tool
/// reports completion.
pub const MAX_TRANSFER_PERCENT: f64 = 94.0;
/// Percent reported once transferring has begun never drops below this.
pub const MIN_TRANSFER_PERCENT: f64 = 1.0;
/// Milestone for the "Received N files" summary.
pub const FINISHING_PERCENT: f64 = 95.0;

/// A short backup is assumed to take about this long; the assumed total
/// grows with the elapsed time.
const ASSUMED_BASE_SECS: f64 = 180.0;
/// Completed files needed before the file-count estimate is blended in.
const MIN_FILES_FOR_WORK_ESTIMATE: u64 = 10;
const EXPECTED_FILE_COUNT: f64 = 2_000.0;
const EXPECTED_BYTES: f64 = 2.0 * 1024.0 * 1024.0 * 1024.0;

/// A per-file reading counts as a new file when the previous reading was
/// above this and the new one is more than `FILE_DROP_POINTS` lower.
const FILE_DONE_THRESHOLD: f64 = 90.0;
const FILE_DROP_POINTS: f64 = 50.0;

const PREPARING_MARKERS: &[&str] = &[
    "Backup directory is",
    "Started \"com.apple.mobilebackup2\"",
    "Negotiated Protocol Version",
    "Starting backup",
    "Requesting backup",
    "Full backup mode",
    "Incremental backup mode",
];
const INCREMENTAL_MARKER: &str = "Incremental backup mode";
const SUCCESS_MARKER: &str = "Backup Successful";

static PROGRESS_BAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[[^\]]*\]\s*(\d{1,3}(?:\.\d+)?)%(?:\s*\(\s*([\d.]+)\s*([KMGT]?i?B)\s*/\s*([\d.]+)\s*([KMGT]?i?B)\s*\))?",
    )
    .expect("progress bar pattern")
});
static RECEIVED_FILES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Received\s+(\d+)\s+files?").expect("received files pattern"));

/// Stage of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupPhase {
    Preparing,
    Transferring,
    Finishing,
    Extracting,
    Decrypting,
}

/// Progress snapshot emitted while a backup runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    pub phase: BackupPhase,

    /// Overall estimate, 0-100
    pub percent: f64,

    pub files_transferred: u64,
    pub total_files: Option<u64>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,

    /// Progress of the file currently being received
    pub current_file_percent: Option<f64>,

    pub estimated_seconds_remaining: Option<u64>,
}

impl BackupProgress {
    /// A snapshot with only a phase and a percentage.
    pub fn milestone(phase: BackupPhase, percent: f64) -> Self {
        Self {
            phase,
            percent,
            files_transferred: 0,
            total_files: None,
            bytes_transferred: 0,
            total_bytes: None,
            current_file_percent: None,
            estimated_seconds_remaining: None,
        }
    }
}

/// Blended overall estimate from elapsed time and completed work.
///
/// Pure: the same inputs always give the same answer. Result is clamped to
/// [`MIN_TRANSFER_PERCENT`, `MAX_TRANSFER_PERCENT`].
pub fn estimate_overall_percent(elapsed: Duration, files_completed: u64, bytes_transferred: u64) -> f64 {
    let secs = elapsed.as_secs_f64();
    let time_percent = secs / (secs + ASSUMED_BASE_SECS) * 100.0;

    let estimate = if files_completed >= MIN_FILES_FOR_WORK_ESTIMATE {
        let files = files_completed as f64;
        let bytes = bytes_transferred as f64;
        let file_percent = files / EXPECTED_FILE_COUNT.max(files * 1.25) * 100.0;
        let byte_percent = bytes / EXPECTED_BYTES.max(bytes * 1.25) * 100.0;
        let work_percent = (file_percent + byte_percent) / 2.0;
        (time_percent + work_percent) / 2.0
    } else {
        time_percent
    };

    estimate.clamp(MIN_TRANSFER_PERCENT, MAX_TRANSFER_PERCENT)
}

/// Stateful parser for one backup run's output lines.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    phase: BackupPhase,
    overall: f64,
    last_file_percent: Option<f64>,
    last_file_bytes: u64,
    last_file_total: u64,
    completed_bytes: u64,
    files_completed: u64,
    incremental: bool,
    succeeded: bool,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            phase: BackupPhase::Preparing,
            overall: 0.0,
            last_file_percent: None,
            last_file_bytes: 0,
            last_file_total: 0,
            completed_bytes: 0,
            files_completed: 0,
            incremental: false,
            succeeded: false,
        }
    }

    /// Whether the tool announced an incremental backup.
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Whether the tool printed its success line.
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.completed_bytes + self.last_file_bytes
    }

    /// Parses one line of output. `elapsed` is the time since the run started.
    /// Returns `None` for lines that carry no progress information.
    pub fn parse_line(&mut self, line: &str, elapsed: Duration) -> Option<BackupProgress> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.contains(SUCCESS_MARKER) {
            self.fold_current_file();
            self.succeeded = true;
            self.phase = BackupPhase::Finishing;
            self.overall = 100.0;
            return Some(self.snapshot(None, elapsed));
        }

        if let Some(caps) = RECEIVED_FILES.captures(line) {
            let count: u64 = caps[1].parse().ok()?;
            self.fold_current_file();
            self.files_completed = self.files_completed.max(count);
            self.phase = BackupPhase::Finishing;
            self.overall = self.overall.max(FINISHING_PERCENT);

            let mut progress = self.snapshot(None, elapsed);
            progress.files_transferred = count;
            progress.total_files = Some(count);
            return Some(progress);
        }

        if let Some(caps) = PROGRESS_BAR.captures(line) {
            let file_percent: f64 = caps[1].parse().ok()?;
            let current = caps
                .get(2)
                .zip(caps.get(3))
                .and_then(|(value, unit)| parse_size(value.as_str(), unit.as_str()));
            let total = caps
                .get(4)
                .zip(caps.get(5))
                .and_then(|(value, unit)| parse_size(value.as_str(), unit.as_str()));
            return Some(self.on_file_progress(file_percent, current, total, elapsed));
        }

        if PREPARING_MARKERS.iter().any(|marker| line.contains(marker)) {
            if line.contains(INCREMENTAL_MARKER) {
                self.incremental = true;
            }
            if self.phase == BackupPhase::Preparing {
                return Some(self.snapshot(None, elapsed));
            }
        }

        None
    }

    fn on_file_progress(
        &mut self,
        file_percent: f64,
        current: Option<u64>,
        total: Option<u64>,
        elapsed: Duration,
    ) -> BackupProgress {
        if let Some(previous) = self.last_file_percent {
            if previous > FILE_DONE_THRESHOLD && file_percent < previous - FILE_DROP_POINTS {
                self.fold_current_file();
            }
        }

        self.last_file_percent = Some(file_percent);
        self.last_file_bytes = current.unwrap_or(0);
        self.last_file_total = total.unwrap_or(self.last_file_bytes);

        if self.phase == BackupPhase::Preparing {
            self.phase = BackupPhase::Transferring;
        }
        if self.phase == BackupPhase::Transferring {
            let estimate =
                estimate_overall_percent(elapsed, self.files_completed, self.bytes_transferred());
            self.overall = self.overall.max(estimate).min(MAX_TRANSFER_PERCENT);
        }

        self.snapshot(Some(file_percent), elapsed)
    }

    /// Counts the file behind the last progress reading as received.
    fn fold_current_file(&mut self) {
        if self.last_file_percent.take().is_some() {
            self.files_completed += 1;
            self.completed_bytes += self.last_file_total.max(self.last_file_bytes);
            self.last_file_bytes = 0;
            self.last_file_total = 0;
        }
    }

    fn snapshot(&self, current_file_percent: Option<f64>, elapsed: Duration) -> BackupProgress {
        let estimated_seconds_remaining = if self.overall > 0.0 && self.overall < 100.0 {
            let secs = elapsed.as_secs_f64();
            Some((secs * (100.0 - self.overall) / self.overall).round() as u64)
        } else {
            None
        };

        BackupProgress {
            phase: self.phase,
            percent: self.overall,
            files_transferred: self.files_completed,
            total_files: None,
            bytes_transferred: self.bytes_transferred(),
            total_bytes: None,
            current_file_percent,
            estimated_seconds_remaining,
        }
    }
}

/// Splits raw process output into lines on both `\n` and `\r`.
#[derive(Debug, Default)]
pub struct OutputSplitter {
    pending: Vec<u8>,
}

impl OutputSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every complete, non-empty line in it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take_pending() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Returns whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!line.is_empty()).then_some(line)
    }
}

/// Converts a value like `10.0` with unit `MB` to bytes (binary multiples).
pub fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier = match unit.trim_end_matches("iB").trim_end_matches('B') {
        "" => 1.0,
        "K" => 1024.0,
        "M" => 1024.0 * 1024.0,
        "G" => 1024.0 * 1024.0 * 1024.0,
        "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
