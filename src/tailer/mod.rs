//! Remote container log tailing over SSH
//!
//! The tailer runs as its own task for the whole run. Its only link to the
//! probe loop is the append-only [`LogSink`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RemoteLogConfig;
use crate::constants::{REMOTE_CONNECT_TIMEOUT_SECS, REMOTE_ERROR_KEYWORDS, REMOTE_LOG_HEALTH_CHECK, REMOTE_LOG_TAIL_LINES};

#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Append-only, timestamped store of remote log lines
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, text: impl Into<String>) {
        self.append_at(Utc::now(), text);
    }

    pub fn append_at(&self, at: DateTime<Utc>, text: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(LogLine { at, text: text.into() });
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines inside `[from, to]` that look like errors
    pub fn errors_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<String> {
        let Ok(lines) = self.lines.lock() else {
            return Vec::new();
        };
        lines
            .iter()
            .filter(|line| line.at >= from && line.at <= to)
            .filter(|line| {
                let lower = line.text.to_lowercase();
                REMOTE_ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
            })
            .map(|line| line.text.clone())
            .collect()
    }
}

/// Where and how to reach the container log
#[derive(Debug, Clone)]
pub struct TailTarget {
    pub ssh_command: String,
    pub host: String,
    pub username: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub container: String,
}

impl TailTarget {
    /// `None` when no host is configured
    pub fn from_config(config: &RemoteLogConfig) -> Option<Self> {
        let host = config.host.as_ref().filter(|h| !h.trim().is_empty())?;
        Some(Self {
            ssh_command: config.ssh_path.clone(),
            host: host.clone(),
            username: config.username.clone(),
            identity_file: config.identity_file.clone(),
            container: config.container.clone(),
        })
    }

    fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    pub fn remote_command(&self) -> String {
        format!("docker logs -f --tail {REMOTE_LOG_TAIL_LINES} {}", self.container)
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_command);
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.arg("-o").arg(format!("ConnectTimeout={REMOTE_CONNECT_TIMEOUT_SECS}"));
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.destination());
        cmd.arg(self.remote_command());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Handle to the running tail task
pub struct RemoteLogTailer {
    task: JoinHandle<()>,
}

impl RemoteLogTailer {
    /// Starts tailing in the background. Failures are logged, never returned.
    pub fn spawn(target: TailTarget, sink: LogSink) -> Self {
        Self {
            task: tokio::spawn(tail(target, sink)),
        }
    }

    /// Ends the remote session; dropping the task kills the ssh process.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn tail(target: TailTarget, sink: LogSink) {
    info!("Connecting to {} to tail logs...", target.host);
    let mut child = match target.build_command().spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("--- ERROR: Could not start ssh to tail Docker logs: {e} ---");
            return;
        }
    };
    info!("Executing remote command: {}", target.remote_command());

    // docker logs replays the container's stdout and stderr separately
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    match tokio::time::timeout(REMOTE_LOG_HEALTH_CHECK, rx.recv()).await {
        Ok(Some(line)) => record(&sink, line),
        Ok(None) => {}
        Err(_) => warn!(
            "--- WARNING: Connected, but no log data was received after {} seconds. The container might be silent. ---",
            REMOTE_LOG_HEALTH_CHECK.as_secs()
        ),
    }
    while let Some(line) = rx.recv().await {
        record(&sink, line);
    }

    match child.wait().await {
        Ok(status) if status.success() => info!("Remote log stream closed"),
        Ok(status) => warn!("Remote log session ended with {status}"),
        Err(e) => warn!("Remote log session failed: {e}"),
    }
}

fn record(sink: &LogSink, line: String) {
    debug!(target: "iptv_tuner::remote", "{line}");
    sink.append(line);
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if !line.is_empty() && tx.send(line).is_err() {
            break;
        }
    }
}
