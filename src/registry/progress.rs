//! Throughput, ETA and human-readable summaries derived from byte counters.

use std::fmt;
use std::time::Duration;

use crate::humanize::ByteSize;

/// Raw counters reported for one transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub total_written: u64,
    pub total_expected: Option<u64>,
    /// Time since the record's start time
    pub elapsed: Duration,
}

/// Remaining time split into clock components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingTime {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl RemainingTime {
    pub fn from_secs(total: u64) -> Self {
        Self {
            hours: total / 3600,
            minutes: (total % 3600) / 60,
            seconds: total % 60,
        }
    }

    pub fn as_secs(&self) -> u64 {
        self.hours * 3600 + self.minutes * 60 + self.seconds
    }
}

impl fmt::Display for RemainingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if self.hours > 0 {
            parts.push(format!("{} Hours", self.hours));
        }
        if self.minutes > 0 {
            parts.push(format!("{} Min", self.minutes));
        }
        if self.seconds > 0 || parts.is_empty() {
            parts.push(format!("{} sec", self.seconds));
        }
        f.write_str(&parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// In `[0, 1]`; `None` while the total size is unknown or zero
    pub fraction: Option<f64>,
    /// Bytes per second since the start time
    pub throughput: f64,
    /// `None` when it cannot be estimated
    pub eta: Option<RemainingTime>,
    pub file_size: Option<String>,
    pub downloaded: String,
    pub speed: String,
}

impl ProgressReport {
    pub fn calculate(sample: ProgressSample) -> Self {
        let fraction = match sample.total_expected {
            Some(expected) if expected > 0 => {
                Some((sample.total_written as f64 / expected as f64).clamp(0.0, 1.0))
            }
            _ => None,
        };

        let elapsed = sample.elapsed.as_secs_f64();
        let throughput = if elapsed > 0.0 {
            sample.total_written as f64 / elapsed
        } else {
            0.0
        };

        let eta = match (sample.total_expected, fraction) {
            (Some(expected), Some(_)) if throughput > 0.0 => {
                let remaining = expected.saturating_sub(sample.total_written);
                Some(RemainingTime::from_secs(
                    (remaining as f64 / throughput).floor() as u64,
                ))
            }
            _ => None,
        };

        Self {
            fraction,
            throughput,
            eta,
            file_size: sample
                .total_expected
                .filter(|expected| *expected > 0)
                .map(|expected| ByteSize(expected).to_human_readable()),
            downloaded: ByteSize(sample.total_written).to_human_readable(),
            speed: ByteSize(throughput as u64).to_human_readable(),
        }
    }

    /// Multi-line summary shown next to a download
    pub fn detail_text(&self) -> String {
        let time_left = if self.fraction == Some(1.0) {
            // Payload is complete but still being flushed
            "Please wait...".to_string()
        } else {
            match self.eta {
                Some(eta) => eta.to_string(),
                None => "Unknown".to_string(),
            }
        };

        let downloaded = match self.fraction {
            Some(fraction) => format!("{} ({:.2}%)", self.downloaded, fraction * 100.0),
            None => self.downloaded.clone(),
        };

        format!(
            "File Size: {}\nDownloaded: {}\nSpeed: {}/sec\nTime Left: {}",
            self.file_size.as_deref().unwrap_or("Unknown"),
            downloaded,
            self.speed,
            time_left
        )
    }
}
