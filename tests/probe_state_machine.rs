use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iptv_tuner::engine::{EngineError, OpenRequest, PlaybackEngine, PlaybackSession, PlayerEvent};
use iptv_tuner::probe::{ProbeSettings, TuningProbe};
use iptv_tuner::types::{Channel, TuneOutcome};

type Step = (Duration, PlayerEvent);

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    snapshots: AtomicUsize,
}

/// Engine whose sessions replay a fixed list of delayed events, then stay silent
struct ScriptedEngine {
    scripts: Mutex<VecDeque<Result<Vec<Step>, EngineError>>>,
    requests: Mutex<Vec<(String, String)>>,
    counters: Arc<Counters>,
}

impl ScriptedEngine {
    fn new(scripts: Vec<Result<Vec<Step>, EngineError>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    fn single(steps: Vec<Step>) -> Self {
        Self::new(vec![Ok(steps)])
    }
}

#[async_trait]
impl PlaybackEngine for ScriptedEngine {
    async fn open(&self, request: OpenRequest<'_>) -> Result<Box<dyn PlaybackSession>, EngineError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.url.to_string(), request.user_agent.to_string()));
        let steps = self.scripts.lock().unwrap().pop_front().expect("no script left")?;
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            steps: steps.into(),
            counters: self.counters.clone(),
        }))
    }
}

struct ScriptedSession {
    steps: VecDeque<Step>,
    counters: Arc<Counters>,
}

#[async_trait]
impl PlaybackSession for ScriptedSession {
    async fn next_event(&mut self) -> Option<PlayerEvent> {
        match self.steps.pop_front() {
            Some((delay, event)) => {
                tokio::time::sleep(delay).await;
                Some(event)
            }
            None => std::future::pending().await,
        }
    }

    async fn snapshot(&mut self, path: &Path) -> Result<(), EngineError> {
        self.counters.snapshots.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(path, b"\x89PNG")
            .await
            .map_err(|e| EngineError::Snapshot(e.to_string()))
    }

    async fn close(self: Box<Self>) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn channel(name: &str) -> Channel {
    Channel {
        name: name.into(),
        group: "News".into(),
        stream_url: format!("http://server/{name}"),
    }
}

fn settings(timeout: Duration) -> ProbeSettings {
    ProbeSettings {
        timeout,
        min_playback: ms(200),
        user_agent: "TestAgent/1.0".into(),
        thumbnail_dir: None,
    }
}

#[tokio::test(start_paused = true)]
async fn records_elapsed_time_at_play_start() {
    let engine = ScriptedEngine::single(vec![
        (ms(800), PlayerEvent::Playing),
        (ms(100), PlayerEvent::Position(ms(100))),
        (ms(150), PlayerEvent::Position(ms(250))),
    ]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("B"), "run1").await.unwrap();
    assert_eq!(result.outcome, TuneOutcome::Tuned(ms(800)));
    assert_eq!(result.channel_name, "B");
    assert_eq!(result.run_label, "run1");
    assert!(result.notes.is_empty());
    assert_eq!(engine.counters.closed.load(Ordering::SeqCst), 1);

    let requests = engine.requests.lock().unwrap();
    assert_eq!(requests[0], ("http://server/B".to_string(), "TestAgent/1.0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn no_play_start_within_timeout_is_a_failure() {
    let engine = ScriptedEngine::single(vec![(Duration::from_secs(5), PlayerEvent::Playing)]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("C"), "run1").await.unwrap();
    assert_eq!(result.outcome, TuneOutcome::TimedOut);
    assert_eq!(result.outcome.elapsed(), None);
    assert_eq!(result.notes, vec!["Player: Timed out".to_string()]);
    assert_eq!(engine.counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn play_start_just_after_deadline_times_out() {
    let engine = ScriptedEngine::single(vec![(ms(3_001), PlayerEvent::Playing)]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("C"), "run1").await.unwrap();
    assert_eq!(result.outcome, TuneOutcome::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_tolerated() {
    let engine = ScriptedEngine::single(vec![
        (ms(100), PlayerEvent::TransientError("buffering".into())),
        (ms(200), PlayerEvent::TransientError("buffering".into())),
        (ms(400), PlayerEvent::Playing),
    ]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    // No position reports: the confirmation window runs out without an error
    let result = probe.measure(&channel("A"), "run1").await.unwrap();
    assert_eq!(result.outcome, TuneOutcome::Tuned(ms(700)));
}

#[tokio::test(start_paused = true)]
async fn fatal_error_before_play_start() {
    let engine = ScriptedEngine::single(vec![(ms(500), PlayerEvent::FatalError("403 Forbidden".into()))]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("A"), "run1").await.unwrap();
    assert_eq!(result.outcome, TuneOutcome::StreamError("403 Forbidden".into()));
    assert_eq!(result.notes, vec!["Player: Stream error: 403 Forbidden".to_string()]);
    assert_eq!(engine.counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_during_confirmation_fails_the_channel() {
    let engine = ScriptedEngine::single(vec![
        (ms(500), PlayerEvent::Playing),
        (ms(50), PlayerEvent::Position(ms(40))),
        (ms(50), PlayerEvent::FatalError("decode error".into())),
    ]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("A"), "run1").await.unwrap();
    assert_eq!(result.outcome, TuneOutcome::StreamError("decode error".into()));
}

#[tokio::test(start_paused = true)]
async fn stream_ending_before_play_start_is_an_error() {
    let engine = ScriptedEngine::single(vec![(ms(300), PlayerEvent::Ended)]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("A"), "run1").await.unwrap();
    assert!(matches!(result.outcome, TuneOutcome::StreamError(_)));
}

#[tokio::test(start_paused = true)]
async fn thumbnails_only_for_playing_channels() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new(vec![
        Ok(vec![(ms(600), PlayerEvent::Playing), (ms(300), PlayerEvent::Position(ms(300)))]),
        Ok(vec![(ms(600), PlayerEvent::FatalError("gone".into()))]),
        Ok(vec![]),
    ]);
    let mut probe_settings = settings(Duration::from_secs(2));
    probe_settings.thumbnail_dir = Some(dir.path().join("thumbs"));
    let probe = TuningProbe::new(&engine, probe_settings);

    let playing = probe.measure(&channel("NPO1 ᴿᴬᵂ"), "run1").await.unwrap();
    let thumb = playing.thumbnail.expect("thumbnail for playing channel");
    assert!(thumb.exists());
    assert_eq!(thumb.parent(), Some(dir.path().join("thumbs").as_path()));
    let file_name = thumb.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("NPO1_") && file_name.ends_with(".png"));
    assert_eq!(playing.channel_name, "NPO1");

    let errored = probe.measure(&channel("B"), "run1").await.unwrap();
    assert!(errored.thumbnail.is_none());
    let silent = probe.measure(&channel("C"), "run1").await.unwrap();
    assert_eq!(silent.outcome, TuneOutcome::TimedOut);
    assert!(silent.thumbnail.is_none());

    assert_eq!(engine.counters.snapshots.load(Ordering::SeqCst), 1);
    assert_eq!(engine.counters.opened.load(Ordering::SeqCst), 3);
    assert_eq!(engine.counters.closed.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn unavailable_engine_aborts_the_run() {
    let engine = ScriptedEngine::new(vec![Err(EngineError::Unavailable("ffmpeg: not found".into()))]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let err = probe.measure(&channel("A"), "run1").await.unwrap_err();
    assert!(matches!(err, EngineError::Unavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn open_failure_is_a_failed_cell() {
    let engine = ScriptedEngine::new(vec![Err(EngineError::Open("connection refused".into()))]);
    let probe = TuningProbe::new(&engine, settings(Duration::from_secs(3)));

    let result = probe.measure(&channel("A"), "run1").await.unwrap();
    assert!(matches!(result.outcome, TuneOutcome::StreamError(ref reason) if reason.contains("connection refused")));
    assert_eq!(engine.counters.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn elapsed_never_exceeds_timeout() {
    let timeout = Duration::from_secs(2);
    for play_at in [0, 1, 1_000, 1_999, 2_000] {
        let engine = ScriptedEngine::single(vec![(ms(play_at), PlayerEvent::Playing)]);
        let probe = TuningProbe::new(&engine, settings(timeout));
        let result = probe.measure(&channel("A"), "run1").await.unwrap();
        if let Some(elapsed) = result.outcome.elapsed() {
            assert!(elapsed <= timeout, "{elapsed:?} > {timeout:?}");
        }
    }
}
