//! Headless player built on the `ffmpeg` binary.
//!
//! The stream is decoded to the null muxer while `-progress pipe:1` reports
//! frame counts and the output clock; the first decoded frame is the
//! play-start notification. When frame capture is requested a second output
//! keeps one PNG per second in a private staging directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{EngineError, OpenRequest, PlaybackEngine, PlaybackSession, PlayerEvent};
use crate::constants::{PROGRESS_PERIOD_SECS, SNAPSHOT_POLL, SNAPSHOT_WAIT};

/// Field of an ffmpeg `-progress` block the probe cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressField {
    Frame(u64),
    OutTime(Duration),
}

/// Parses one `key=value` line of ffmpeg progress output.
pub fn parse_progress_line(line: &str) -> Option<ProgressField> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "frame" => value.trim().parse().ok().map(ProgressField::Frame),
        "out_time_us" => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| ProgressField::OutTime(Duration::from_micros(us as u64))),
        _ => None,
    }
}

pub struct FfmpegEngine {
    ffmpeg_path: String,
    show_video: bool,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_path: impl Into<String>, show_video: bool) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            show_video,
        }
    }

    /// Fails with [`EngineError::Unavailable`] when the binary cannot run.
    pub async fn verify(&self) -> Result<(), EngineError> {
        let status = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", self.ffmpeg_path)))?;
        if !status.success() {
            return Err(EngineError::Unavailable(format!(
                "{} -version exited with {status}",
                self.ffmpeg_path
            )));
        }
        Ok(())
    }

    fn build_command(&self, request: &OpenRequest<'_>, frame_path: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostdin", "-nostats", "-loglevel", "error"]);
        cmd.args(["-progress", "pipe:1", "-stats_period", PROGRESS_PERIOD_SECS]);
        cmd.args(["-user_agent", request.user_agent]);
        cmd.args(["-i", request.url]);
        cmd.args(["-f", "null", "-"]);

        if let Some(frame_path) = frame_path {
            cmd.args(["-map", "0:v:0?", "-vf", "fps=1", "-update", "1", "-atomic_writing", "1", "-y"]);
            cmd.arg(frame_path);
        }
        if self.show_video {
            cmd.args(["-map", "0:v:0?", "-an", "-pix_fmt", "yuv420p", "-f", "sdl"]);
            cmd.arg(request.title);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PlaybackEngine for FfmpegEngine {
    async fn open(&self, request: OpenRequest<'_>) -> Result<Box<dyn PlaybackSession>, EngineError> {
        let staging = if request.capture_frames {
            Some(TempDir::new().map_err(|e| EngineError::Open(format!("staging directory: {e}")))?)
        } else {
            None
        };
        let frame_path = staging.as_ref().map(|dir| dir.path().join("frame.png"));

        let mut child = self
            .build_command(&request, frame_path.as_deref())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    EngineError::Unavailable(format!("{}: {e}", self.ffmpeg_path))
                }
                _ => EngineError::Open(e.to_string()),
            })?;
        debug!("Started player for {}", request.url);

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => return Err(EngineError::Open("player pipes unavailable".into())),
        };

        let (tx, events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let progress = tokio::spawn(read_progress(stdout, tx.clone()));
        let stderr_task = tokio::spawn(read_stderr(stderr, tx.clone()));
        let supervisor = tokio::spawn(supervise(child, stderr_task, tx, stop_rx));

        Ok(Box::new(FfmpegSession {
            events,
            stop: Some(stop_tx),
            supervisor,
            progress,
            frame_path,
            _staging: staging,
        }))
    }
}

async fn read_progress(stdout: ChildStdout, tx: mpsc::UnboundedSender<PlayerEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut playing = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let event = match parse_progress_line(&line) {
            Some(ProgressField::Frame(frames)) if frames > 0 && !playing => {
                playing = true;
                PlayerEvent::Playing
            }
            Some(ProgressField::OutTime(position)) if playing => PlayerEvent::Position(position),
            _ => continue,
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}

/// Forwards player diagnostics and returns the last one for the exit report.
async fn read_stderr(stderr: ChildStderr, tx: mpsc::UnboundedSender<PlayerEvent>) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let _ = tx.send(PlayerEvent::TransientError(line.clone()));
        last = Some(line);
    }
    last
}

async fn supervise(
    mut child: Child,
    stderr_task: JoinHandle<Option<String>>,
    tx: mpsc::UnboundedSender<PlayerEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut stop => {
            let _ = child.kill().await;
            return;
        }
    };
    let last_error = stderr_task.await.ok().flatten();
    let event = match status {
        Ok(status) if status.success() => PlayerEvent::Ended,
        Ok(status) => PlayerEvent::FatalError(
            last_error.unwrap_or_else(|| format!("player exited with {status}")),
        ),
        Err(e) => PlayerEvent::FatalError(e.to_string()),
    };
    let _ = tx.send(event);
}

struct FfmpegSession {
    events: mpsc::UnboundedReceiver<PlayerEvent>,
    stop: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
    progress: JoinHandle<()>,
    frame_path: Option<PathBuf>,
    // Removed with the session
    _staging: Option<TempDir>,
}

#[async_trait]
impl PlaybackSession for FfmpegSession {
    async fn next_event(&mut self) -> Option<PlayerEvent> {
        self.events.recv().await
    }

    async fn snapshot(&mut self, path: &Path) -> Result<(), EngineError> {
        let frame = self
            .frame_path
            .as_ref()
            .ok_or_else(|| EngineError::Snapshot("frame capture was not enabled".into()))?;

        let deadline = tokio::time::Instant::now() + SNAPSHOT_WAIT;
        while !tokio::fs::try_exists(frame).await.unwrap_or(false) {
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Snapshot("no decoded frame available".into()));
            }
            tokio::time::sleep(SNAPSHOT_POLL).await;
        }
        tokio::fs::copy(frame, path)
            .await
            .map_err(|e| EngineError::Snapshot(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.supervisor).await;
        self.progress.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines() {
        assert_eq!(parse_progress_line("frame=0"), Some(ProgressField::Frame(0)));
        assert_eq!(parse_progress_line("frame=25\n"), Some(ProgressField::Frame(25)));
        assert_eq!(
            parse_progress_line("out_time_us=1500000"),
            Some(ProgressField::OutTime(Duration::from_millis(1500)))
        );
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("out_time_us=-9223372036854775807"), None);
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("garbage"), None);
    }

    #[test]
    fn command_carries_user_agent_and_capture_output() {
        let engine = FfmpegEngine::new("ffmpeg", false);
        let request = OpenRequest {
            url: "http://server/a",
            user_agent: "TestAgent/1.0",
            title: "A",
            capture_frames: true,
        };
        let cmd = engine.build_command(&request, Some(Path::new("/tmp/frame.png")));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let ua = args.iter().position(|a| a == "-user_agent").unwrap();
        assert_eq!(args[ua + 1], "TestAgent/1.0");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ua < input);
        let period = args.iter().position(|a| a == "-stats_period").unwrap();
        assert_eq!(args[period + 1], "0.05");
        assert!(period < input);
        assert_eq!(args.last().unwrap(), "/tmp/frame.png");
        assert!(!args.iter().any(|a| a == "sdl"));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = FfmpegEngine::new("/nonexistent/ffmpeg-binary", false);
        assert!(matches!(engine.verify().await, Err(EngineError::Unavailable(_))));
        let request = OpenRequest {
            url: "http://server/a",
            user_agent: "x",
            title: "A",
            capture_frames: false,
        };
        assert!(matches!(engine.open(request).await, Err(EngineError::Unavailable(_))));
    }
}
