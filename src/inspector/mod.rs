//! Stream inspection with FFprobe
//!
//! Runs independently of the tuning measurement; the summary is attached to
//! the result for display only.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::constants::{PROBE_ATTEMPTS, PROBE_RETRY_DELAY};
use crate::types::CodecSummary;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("Failed to execute ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("FFprobe timeout after {0:?}")]
    Timeout(Duration),

    #[error("FFprobe error: {0}")]
    Probe(String),

    #[error("Failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
    error: Option<ProbeErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeErrorInfo {
    code: Option<i32>,
    string: Option<String>,
}

pub struct StreamInspector {
    ffprobe_command: String,
    user_agent: String,
    probe_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl StreamInspector {
    pub fn new(ffprobe_command: impl Into<String>, user_agent: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            ffprobe_command: ffprobe_command.into(),
            user_agent: user_agent.into(),
            probe_timeout,
            attempts: PROBE_ATTEMPTS,
            retry_delay: PROBE_RETRY_DELAY,
        }
    }

    /// Probes `url`, retrying failed attempts. The summary records whether a retry was needed.
    pub async fn inspect(&self, url: &str) -> Result<CodecSummary, InspectError> {
        let mut attempt = 1;
        loop {
            match self.probe_once(url).await {
                Ok(mut summary) => {
                    summary.retried = attempt > 1;
                    return Ok(summary);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "    FFprobe attempt {attempt}/{} failed ({e}), retrying in {}s...",
                        self.attempts,
                        self.retry_delay.as_secs()
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn probe_once(&self, url: &str) -> Result<CodecSummary, InspectError> {
        debug!("Probing input stream: {url}");
        let io_timeout_us = self.probe_timeout.as_micros().to_string();

        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args(["-v", "error", "-print_format", "json", "-show_error"]);
        cmd.args(["-show_entries", "stream=codec_type,codec_name:format=format_name"]);
        cmd.args(["-user_agent", &self.user_agent]);
        cmd.args(["-timeout", &io_timeout_us]);
        cmd.arg(url);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The process gets a little longer than its own I/O timeout
        let limit = self.probe_timeout + Duration::from_secs(5);
        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| InspectError::Timeout(limit))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or("no output").trim().to_string();
            return Err(InspectError::Probe(last));
        }
        parse_probe_output(&stdout)
    }
}

/// Builds the summary from ffprobe's JSON document.
pub fn parse_probe_output(json: &str) -> Result<CodecSummary, InspectError> {
    let output: ProbeOutput = serde_json::from_str(json)?;
    if let Some(error) = output.error {
        let message = error.string.unwrap_or_else(|| "unknown ffprobe error".into());
        return Err(InspectError::Probe(match error.code {
            Some(code) => format!("{message} (code {code})"),
            None => message,
        }));
    }

    let container = output
        .format
        .and_then(|f| f.format_name)
        .map(|names| names.split(',').map(str::trim).collect::<Vec<_>>().join(", ").to_uppercase())
        .unwrap_or_else(|| "N/A".into());
    let codec_of = |kind: &str| {
        output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
            .and_then(|s| s.codec_name.as_deref())
            .map(str::to_uppercase)
            .unwrap_or_else(|| "N/A".into())
    };

    Ok(CodecSummary {
        container,
        video: normalize_video_codec(&codec_of("video")),
        audio: codec_of("audio"),
        retried: false,
    })
}

fn normalize_video_codec(codec: &str) -> String {
    match codec {
        "H264" => "AVC".into(),
        "H265" => "HEVC".into(),
        other => other.into(),
    }
}
