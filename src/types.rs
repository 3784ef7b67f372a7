use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::constants::{MAX_TUNING_DELAY_SECS, RAW_STREAM_MARKER};
use crate::profiles::ProfileSelection;

/// A playlist entry selected for tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub name: String,
    pub group: String,
    pub stream_url: String,
}

impl Channel {
    /// Row key in the results table
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

/// Strips the raw-stream marker (and anything after it) from a display name.
pub fn base_name(name: &str) -> &str {
    match name.find(RAW_STREAM_MARKER) {
        Some(idx) => name[..idx].trim(),
        None => name.trim(),
    }
}

/// Terminal outcome of a single tuning attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuneOutcome {
    /// Play-start observed; elapsed time at the notification
    Tuned(Duration),
    TimedOut,
    StreamError(String),
}

impl TuneOutcome {
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            TuneOutcome::Tuned(elapsed) => Some(*elapsed),
            _ => None,
        }
    }

    pub fn is_tuned(&self) -> bool {
        matches!(self, TuneOutcome::Tuned(_))
    }
}

impl fmt::Display for TuneOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuneOutcome::Tuned(elapsed) => write!(f, "{:.4}s", elapsed.as_secs_f64()),
            TuneOutcome::TimedOut => f.write_str("Timed out"),
            TuneOutcome::StreamError(reason) if reason.is_empty() => f.write_str("Stream error"),
            TuneOutcome::StreamError(reason) => write!(f, "Stream error: {reason}"),
        }
    }
}

/// Container and codec names reported by the stream inspector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodecSummary {
    pub container: String,
    pub video: String,
    pub audio: String,
    /// More than one probe attempt was needed
    pub retried: bool,
}

impl fmt::Display for CodecSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Input: {}, Video: {}, Audio: {}", self.container, self.video, self.audio)
    }
}

/// Inspector result attached to a tune result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInfo {
    Probed(CodecSummary),
    Failed(String),
}

impl StreamInfo {
    pub fn retried(&self) -> bool {
        matches!(self, StreamInfo::Probed(summary) if summary.retried)
    }
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamInfo::Probed(summary) => summary.fmt(f),
            StreamInfo::Failed(reason) => write!(f, "Probe failed: {reason}"),
        }
    }
}

/// One channel measured in one run
#[derive(Debug, Clone)]
pub struct TuneResult {
    pub channel_name: String,
    pub run_label: String,
    pub outcome: TuneOutcome,
    pub thumbnail: Option<PathBuf>,
    pub codec_info: Option<StreamInfo>,
    /// Debug messages: failure reasons and correlated remote log errors
    pub notes: Vec<String>,
}

/// Pause between channels, fixed or swept over whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningDelay {
    Fixed(u64),
    Sweep { from: u64, to: u64 },
}

impl Default for TuningDelay {
    fn default() -> Self {
        TuningDelay::Fixed(0)
    }
}

impl TuningDelay {
    /// Delays to run, one run per entry
    pub fn delays(&self) -> Vec<Duration> {
        match *self {
            TuningDelay::Fixed(secs) => vec![Duration::from_secs(secs)],
            TuningDelay::Sweep { from, to } => (from..=to).map(Duration::from_secs).collect(),
        }
    }

    pub fn is_sweep(&self) -> bool {
        matches!(self, TuningDelay::Sweep { .. })
    }
}

impl FromStr for TuningDelay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |v: &str| {
            let secs = v
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid tuning delay '{v}', expected whole seconds"))?;
            if secs > MAX_TUNING_DELAY_SECS {
                return Err(format!("tuning delay {secs}s exceeds the {MAX_TUNING_DELAY_SECS}s maximum"));
            }
            Ok(secs)
        };
        match s.split_once('-') {
            Some((lo, hi)) => {
                let (from, to) = (parse(lo)?, parse(hi)?);
                if from > to {
                    return Err(format!("tuning delay range {from}-{to} is reversed"));
                }
                Ok(TuningDelay::Sweep { from, to })
            }
            None => Ok(TuningDelay::Fixed(parse(s)?)),
        }
    }
}

/// Everything one invocation needs
pub struct Options {
    pub config: Config,
    pub reset: bool,
    pub view: bool,
    pub thumbnails: bool,
    pub report: bool,
    pub probe: bool,
    pub debug: bool,
    pub profiles: Option<ProfileSelection>,
    pub tuning_delay: TuningDelay,
}
