//! Playback engine seam
//!
//! The tuning probe drives playback through these traits. The production
//! engine runs `ffmpeg` as a headless player; tests use scripted sessions.

mod ffmpeg;

pub use ffmpeg::{FfmpegEngine, parse_progress_line};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine itself cannot be started; no channel can be measured
    #[error("Playback engine unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to open stream: {0}")]
    Open(String),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),
}

/// Notifications emitted by an open playback session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Decoded video has started rendering
    Playing,
    /// Playback clock position
    Position(Duration),
    /// Recoverable fault such as a buffering hiccup
    TransientError(String),
    /// Unrecoverable fault; the session will produce nothing further
    FatalError(String),
    /// Stream ended normally
    Ended,
}

/// Parameters for opening a stream
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    pub url: &'a str,
    pub user_agent: &'a str,
    /// Window title when the engine shows video
    pub title: &'a str,
    /// Keep a decoded frame available for [`PlaybackSession::snapshot`]
    pub capture_frames: bool,
}

#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    async fn open(&self, request: OpenRequest<'_>) -> Result<Box<dyn PlaybackSession>, EngineError>;
}

#[async_trait]
pub trait PlaybackSession: Send {
    /// Next notification, or `None` once the session has nothing more to report.
    async fn next_event(&mut self) -> Option<PlayerEvent>;

    /// Writes the current frame as PNG to `path`.
    async fn snapshot(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Stops playback and releases every engine resource.
    async fn close(self: Box<Self>);
}
