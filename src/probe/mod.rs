//! Per-channel tuning measurement
//!
//! `Idle → Opening → WaitingForPlay → (Playing | TimedOut | Errored) → Closed`.
//! The elapsed clock starts when the open is requested and stops at the
//! play-start notification. Playing additionally requires the playback clock
//! to reach the minimum playback time without a fatal error. The session is
//! closed on every path before `measure` returns.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::constants::PLAYBACK_CONFIRM_GRACE;
use crate::engine::{EngineError, OpenRequest, PlaybackEngine, PlaybackSession, PlayerEvent};
use crate::types::{Channel, TuneOutcome, TuneResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Opening,
    WaitingForPlay,
    Playing,
    TimedOut,
    Errored,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub min_playback: Duration,
    pub user_agent: String,
    /// Capture a thumbnail into this directory for channels that play
    pub thumbnail_dir: Option<PathBuf>,
}

pub struct TuningProbe<'a> {
    engine: &'a dyn PlaybackEngine,
    settings: ProbeSettings,
}

impl<'a> TuningProbe<'a> {
    pub fn new(engine: &'a dyn PlaybackEngine, settings: ProbeSettings) -> Self {
        Self { engine, settings }
    }

    /// Measures one channel.
    ///
    /// Only [`EngineError::Unavailable`] is returned as an error; every other
    /// failure becomes a failed outcome in the result.
    pub async fn measure(&self, channel: &Channel, run_label: &str) -> Result<TuneResult, EngineError> {
        let mut state = ProbeState::Idle;
        let started = Instant::now();
        transition(&mut state, ProbeState::Opening, channel);

        let request = OpenRequest {
            url: &channel.stream_url,
            user_agent: &self.settings.user_agent,
            title: &channel.name,
            capture_frames: self.settings.thumbnail_dir.is_some(),
        };
        let mut session = match self.engine.open(request).await {
            Ok(session) => session,
            Err(EngineError::Unavailable(reason)) => return Err(EngineError::Unavailable(reason)),
            Err(e) => {
                transition(&mut state, ProbeState::Errored, channel);
                warn!("  -> Failed to open '{}': {e}", channel.name);
                transition(&mut state, ProbeState::Closed, channel);
                return Ok(self.result(channel, run_label, TuneOutcome::StreamError(e.to_string()), None));
            }
        };
        transition(&mut state, ProbeState::WaitingForPlay, channel);

        let outcome = self.await_playback(session.as_mut(), started).await;
        let terminal = match &outcome {
            TuneOutcome::Tuned(_) => ProbeState::Playing,
            TuneOutcome::TimedOut => ProbeState::TimedOut,
            TuneOutcome::StreamError(_) => ProbeState::Errored,
        };
        transition(&mut state, terminal, channel);

        let mut thumbnail = None;
        if state == ProbeState::Playing {
            if let Some(dir) = &self.settings.thumbnail_dir {
                thumbnail = capture_thumbnail(session.as_mut(), channel, dir).await;
            }
        }

        session.close().await;
        transition(&mut state, ProbeState::Closed, channel);

        match &outcome {
            TuneOutcome::Tuned(elapsed) => info!("  -> Tuned '{}' in {:.4}s", channel.name, elapsed.as_secs_f64()),
            TuneOutcome::TimedOut => warn!(
                "  -> Failed to tune '{}': playback did not start within {}s",
                channel.name,
                self.settings.timeout.as_secs()
            ),
            TuneOutcome::StreamError(reason) => warn!("  -> Failed to tune '{}': {reason}", channel.name),
        }
        Ok(self.result(channel, run_label, outcome, thumbnail))
    }

    async fn await_playback(&self, session: &mut dyn PlaybackSession, started: Instant) -> TuneOutcome {
        let deadline = started + self.settings.timeout;
        let mut warned = false;

        let play_at = loop {
            match timeout_at(deadline, session.next_event()).await {
                Err(_) => return TuneOutcome::TimedOut,
                Ok(Some(PlayerEvent::Playing)) => break started.elapsed(),
                Ok(Some(PlayerEvent::TransientError(message))) => warn_once(&mut warned, &message),
                Ok(Some(PlayerEvent::FatalError(message))) => return TuneOutcome::StreamError(message),
                Ok(Some(PlayerEvent::Ended)) | Ok(None) => {
                    return TuneOutcome::StreamError("stream ended before playback started".into());
                }
                Ok(Some(PlayerEvent::Position(_))) => {}
            }
        };

        // Play-start alone can be a pre-buffer; require continued playback.
        let min_playback = self.settings.min_playback;
        let confirm_deadline = Instant::now() + min_playback + PLAYBACK_CONFIRM_GRACE;
        loop {
            match timeout_at(confirm_deadline, session.next_event()).await {
                Err(_) => break,
                Ok(Some(PlayerEvent::Position(position))) if position >= min_playback => break,
                Ok(Some(PlayerEvent::FatalError(message))) => return TuneOutcome::StreamError(message),
                Ok(Some(PlayerEvent::Ended)) | Ok(None) => {
                    return TuneOutcome::StreamError("playback stopped right after it started".into());
                }
                Ok(Some(PlayerEvent::TransientError(message))) => warn_once(&mut warned, &message),
                Ok(Some(_)) => {}
            }
        }

        TuneOutcome::Tuned(play_at.min(self.settings.timeout))
    }

    fn result(
        &self,
        channel: &Channel,
        run_label: &str,
        outcome: TuneOutcome,
        thumbnail: Option<PathBuf>,
    ) -> TuneResult {
        let notes = match &outcome {
            TuneOutcome::Tuned(_) => Vec::new(),
            failed => vec![format!("Player: {failed}")],
        };
        TuneResult {
            channel_name: channel.base_name().to_string(),
            run_label: run_label.to_string(),
            outcome,
            thumbnail,
            codec_info: None,
            notes,
        }
    }
}

fn transition(state: &mut ProbeState, next: ProbeState, channel: &Channel) {
    debug!("{}: {:?} -> {:?}", channel.name, state, next);
    *state = next;
}

fn warn_once(warned: &mut bool, message: &str) {
    if !*warned {
        warn!("  -> Transient stream error ({message}), continuing to wait...");
        *warned = true;
    } else {
        debug!("Transient stream error: {message}");
    }
}

async fn capture_thumbnail(
    session: &mut dyn PlaybackSession,
    channel: &Channel,
    dir: &Path,
) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("  -> Cannot create thumbnail directory {}: {e}", dir.display());
        return None;
    }
    let path = dir.join(thumbnail_file_name(channel.base_name(), chrono::Local::now()));
    match session.snapshot(&path).await {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("  -> Thumbnail for '{}' failed: {e}", channel.name);
            None
        }
    }
}

/// `<name>_<YYYYmmdd_HHMMSS_mmm>.png` with characters illegal in file names removed
pub fn thumbnail_file_name(name: &str, at: chrono::DateTime<chrono::Local>) -> String {
    let safe: String = name
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect();
    format!("{}_{}.png", safe.trim(), at.format("%Y%m%d_%H%M%S_%3f"))
}
