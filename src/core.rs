use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Local, Utc};
use reqwest::Client;
use tracing::{info, warn};

use crate::constants::{PROBE_SETTLE, PROFILE_SETTLE};
use crate::engine::{FfmpegEngine, PlaybackEngine};
use crate::inspector::StreamInspector;
use crate::network::create_http_client;
use crate::playlist::{self, Selection};
use crate::probe::{ProbeSettings, TuningProbe};
use crate::profiles::{ActiveProfile, DispatcharrClient, ProfileSelection, ProfileType, StreamProfile};
use crate::report::Reporter;
use crate::store::ResultsStore;
use crate::tailer::{LogSink, RemoteLogTailer, TailTarget};
use crate::types::{Channel, Options, StreamInfo, TuneResult};

const BASELINE_RUN: &str = "Baseline (direct)";

pub async fn run(opts: Options) -> anyhow::Result<()> {
    let config = &opts.config;
    let engine = FfmpegEngine::new(&config.tuning.ffmpeg_path, opts.view);
    engine.verify().await.context("Playback engine is not available")?;

    let store = ResultsStore::new(&config.output.results_file);
    if opts.reset {
        store.reset()?;
    }
    // A corrupt table stops the run before anything is tuned
    store.load_existing()?;

    let sink = LogSink::new();
    let tailer = match (opts.debug, TailTarget::from_config(&config.remote_log)) {
        (true, Some(target)) => Some(RemoteLogTailer::spawn(target, sink.clone())),
        (true, None) => {
            warn!("Debug mode: remote_log.host is not configured, container logs will not be tailed");
            None
        }
        _ => None,
    };

    let session = Session::new(&opts, &engine, &store, &sink)?;
    let outcome = session.run_all().await;
    if let Some(tailer) = tailer {
        tailer.stop().await;
    }
    outcome?;

    let table = store.load_existing()?;
    info!("{}", Reporter::render_console(&table));
    if opts.report {
        if table.is_empty() {
            info!("No results to include in report.");
        } else {
            Reporter::write_html(&table, &config.output.report_file)
                .with_context(|| format!("Could not write HTML report {}", config.output.report_file.display()))?;
        }
    }
    info!("Finished.");
    Ok(())
}

/// One invocation's run targets and the collaborators they share
struct Session<'a> {
    opts: &'a Options,
    engine: &'a dyn PlaybackEngine,
    store: &'a ResultsStore,
    sink: &'a LogSink,
    http: Client,
    inspector: Option<StreamInspector>,
    /// Clock for run labels
    now: fn() -> DateTime<Local>,
}

impl<'a> Session<'a> {
    fn new(opts: &'a Options, engine: &'a dyn PlaybackEngine, store: &'a ResultsStore, sink: &'a LogSink) -> anyhow::Result<Self> {
        let config = &opts.config;
        let http = create_http_client(&config.tuning.user_agent).context("Failed to create HTTP client")?;
        let inspector = opts.probe.then(|| {
            StreamInspector::new(
                &config.inspector.ffprobe_path,
                &config.tuning.user_agent,
                config.inspector.timeout(),
            )
        });
        Ok(Self {
            opts,
            engine,
            store,
            sink,
            http,
            inspector,
            now: Local::now,
        })
    }

    fn selection(&self) -> Selection<'a> {
        let playlist = &self.opts.config.playlist;
        Selection {
            target_group: &playlist.target_group,
            start_channel: &playlist.start_channel,
            count: playlist.channel_count,
        }
    }

    async fn run_all(&self) -> anyhow::Result<()> {
        let config = &self.opts.config;
        if config.playlist.run_baseline {
            info!("--- Testing Baseline (Direct) Profile ---");
            let channels = playlist::load(&self.http, &config.baseline_playlist_url(), &self.selection()).await?;
            self.run_target(BASELINE_RUN, &channels).await?;
        }

        match &self.opts.profiles {
            Some(selection) => self.run_profiles(selection).await,
            None => {
                let channels = playlist::load(&self.http, &config.proxied_playlist_url(), &self.selection()).await?;
                let kind = ProfileType::detect_playlist(&channels, &config.server.base_url()).unwrap_or(ProfileType::Proxy);
                info!("--- Testing {kind} Profile ---");
                self.run_target(&kind.to_string(), &channels).await
            }
        }
    }

    /// Switches server profiles one by one; the original profile is restored on every exit.
    async fn run_profiles(&self, selection: &ProfileSelection) -> anyhow::Result<()> {
        let server = &self.opts.config.server;
        let username = server
            .username
            .as_deref()
            .context("server.username is required to switch stream profiles")?;
        let password = server
            .password()
            .context("server.password (or IPTV_TUNER_PASSWORD) is required to switch stream profiles")?;

        let api = DispatcharrClient::login(&server.base_url(), &self.opts.config.tuning.user_agent, username, &password).await?;
        let profiles = api.list_profiles().await?;
        let active = api.active_profile().await?;

        info!("Available Streaming Profiles:");
        for (i, profile) in profiles.iter().enumerate() {
            info!("  {}) {} (ID: {})", i + 1, profile.name, profile.id);
        }
        let selected = selection.apply(&profiles);
        if selected.is_empty() {
            bail!("No valid profiles found for the given numbers");
        }

        let outcome = tokio::select! {
            outcome = self.run_selected(&api, &active, &selected) => outcome,
            _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("Interrupted")),
        };

        info!("--- Resetting to original active profile ---");
        if let Err(e) = api.set_active_profile(&active.setting_id, &active.profile_id).await {
            warn!("Could not restore the original stream profile {}: {e}", active.profile_id);
        }
        outcome
    }

    async fn run_selected(
        &self,
        api: &DispatcharrClient,
        active: &ActiveProfile,
        selected: &[&StreamProfile],
    ) -> anyhow::Result<()> {
        let url = self.opts.config.proxied_playlist_url();
        for profile in selected {
            info!("--- Testing Profile: {} ---", profile.name);
            if let Err(e) = api.set_active_profile(&active.setting_id, &profile.id).await {
                warn!("Skipping profile '{}': {e}", profile.name);
                continue;
            }
            tokio::time::sleep(PROFILE_SETTLE).await;
            let channels = playlist::load(api.http(), &url, &self.selection()).await?;
            self.run_target(&profile.name, &channels).await?;
        }
        Ok(())
    }

    /// Tunes `channels` once per configured delay and stores each pass as its own run.
    async fn run_target(&self, name: &str, channels: &[Channel]) -> anyhow::Result<()> {
        let delay = self.opts.tuning_delay;
        for pause in delay.delays() {
            let base = if delay.is_sweep() {
                format!("{name} (delay {}s)", pause.as_secs())
            } else {
                name.to_string()
            };
            let stamped = format!("{base}\n{}", (self.now)().format("%Y-%m-%d %H:%M"));
            let label = self.store.load_existing()?.unique_label(&stamped);

            let results = self.tune_channels(channels, &label, pause).await?;
            self.store.append_run(&results, &label)?;
        }
        Ok(())
    }

    async fn tune_channels(&self, channels: &[Channel], label: &str, pause: Duration) -> anyhow::Result<Vec<TuneResult>> {
        let config = &self.opts.config;
        let probe = TuningProbe::new(
            self.engine,
            ProbeSettings {
                timeout: config.tuning.timeout(),
                min_playback: config.tuning.min_playback(),
                user_agent: config.tuning.user_agent.clone(),
                thumbnail_dir: self.opts.thumbnails.then(|| config.output.thumbnail_dir.clone()),
            },
        );

        let mut results = Vec::with_capacity(channels.len());
        for (i, channel) in channels.iter().enumerate() {
            info!("[{}/{}] Tuning to '{}'...", i + 1, channels.len(), channel.name);
            let window_start = Utc::now();
            let mut result = probe.measure(channel, label).await?;

            if let Some(inspector) = &self.inspector {
                tokio::time::sleep(PROBE_SETTLE).await;
                let info = match inspector.inspect(&channel.stream_url).await {
                    Ok(summary) => {
                        info!("  -> {summary}");
                        StreamInfo::Probed(summary)
                    }
                    Err(e) => {
                        warn!("  -> Stream analysis failed: {e}");
                        result.notes.push(format!("FFprobe: {e}"));
                        StreamInfo::Failed(e.to_string())
                    }
                };
                result.codec_info = Some(info);
            }

            if self.opts.debug {
                let errors = self.sink.errors_between(window_start, Utc::now());
                result.notes.extend(errors.into_iter().map(|line| format!("Docker: {line}")));
            }
            results.push(result);

            if !pause.is_zero() && i + 1 < channels.len() {
                info!("  Waiting {}s before next channel...", pause.as_secs());
                tokio::time::sleep(pause).await;
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineError, OpenRequest, PlaybackSession, PlayerEvent};
    use crate::store::CellOutcome;
    use crate::types::{TuneOutcome, TuningDelay};

    #[derive(Clone)]
    enum Behaviour {
        PlaysAfter(u64),
        Silent,
        Fails(&'static str),
        Unavailable,
    }

    /// Engine whose sessions follow a per-URL behaviour
    struct FakeEngine {
        behaviours: HashMap<String, Behaviour>,
        sink: LogSink,
        opened: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn new(sink: &LogSink, behaviours: &[(&str, Behaviour)]) -> Self {
            Self {
                behaviours: behaviours.iter().map(|(url, b)| (url.to_string(), b.clone())).collect(),
                sink: sink.clone(),
                opened: Mutex::new(Vec::new()),
            }
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlaybackEngine for FakeEngine {
        async fn open(&self, request: OpenRequest<'_>) -> Result<Box<dyn PlaybackSession>, EngineError> {
            self.opened.lock().unwrap().push(request.url.to_string());
            let behaviour = self.behaviours.get(request.url).cloned().unwrap_or(Behaviour::Silent);
            let events = match behaviour {
                Behaviour::PlaysAfter(ms) => vec![
                    (ms, PlayerEvent::Playing),
                    (0, PlayerEvent::Position(Duration::from_millis(300))),
                ],
                Behaviour::Silent => Vec::new(),
                Behaviour::Fails(message) => {
                    // The proxy logs its side of the failure while the player gives up
                    self.sink.append(format!("ERROR {message}"));
                    vec![(0, PlayerEvent::FatalError(message.to_string()))]
                }
                Behaviour::Unavailable => return Err(EngineError::Unavailable("player missing".into())),
            };
            Ok(Box::new(FakeSession { events: events.into() }))
        }
    }

    struct FakeSession {
        events: VecDeque<(u64, PlayerEvent)>,
    }

    #[async_trait]
    impl PlaybackSession for FakeSession {
        async fn next_event(&mut self) -> Option<PlayerEvent> {
            match self.events.pop_front() {
                Some((ms, event)) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Some(event)
                }
                None => std::future::pending().await,
            }
        }

        async fn snapshot(&mut self, _path: &Path) -> Result<(), EngineError> {
            Err(EngineError::Snapshot("no frame".into()))
        }

        async fn close(self: Box<Self>) {}
    }

    fn options(dir: &Path) -> Options {
        let mut config = Config::default();
        config.output.results_file = dir.join("results.csv");
        config.tuning.timeout_secs = 2;
        Options {
            config,
            reset: false,
            view: false,
            thumbnails: false,
            report: false,
            probe: false,
            debug: false,
            profiles: None,
            tuning_delay: TuningDelay::default(),
        }
    }

    fn channel(name: &str) -> Channel {
        Channel {
            name: name.to_string(),
            group: "News".to_string(),
            stream_url: format!("http://server/{name}"),
        }
    }

    fn fixed_clock() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 20, 15, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_channels_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let sink = LogSink::new();
        let engine = FakeEngine::new(
            &sink,
            &[
                ("http://server/A", Behaviour::Silent),
                ("http://server/B", Behaviour::Fails("403 Forbidden")),
                ("http://server/C", Behaviour::PlaysAfter(400)),
            ],
        );
        let store = ResultsStore::new(&opts.config.output.results_file);
        let session = Session {
            now: fixed_clock,
            ..Session::new(&opts, &engine, &store, &sink).unwrap()
        };

        session.run_target("Proxy", &[channel("A"), channel("B"), channel("C")]).await.unwrap();

        assert_eq!(engine.opened(), ["http://server/A", "http://server/B", "http://server/C"]);
        let table = store.load_existing().unwrap();
        let label = "Proxy\n2024-05-01 20:15";
        assert_eq!(table.runs().len(), 1);
        assert_eq!(table.cell("A", label).unwrap().outcome, CellOutcome::TimedOut);
        assert_eq!(table.cell("B", label).unwrap().outcome, CellOutcome::Errored);
        assert_eq!(table.cell("C", label).unwrap().outcome, CellOutcome::Tuned { elapsed_ms: 400 });
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_engine_aborts_without_storing_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let sink = LogSink::new();
        let engine = FakeEngine::new(
            &sink,
            &[
                ("http://server/A", Behaviour::PlaysAfter(100)),
                ("http://server/B", Behaviour::Unavailable),
            ],
        );
        let store = ResultsStore::new(&opts.config.output.results_file);
        let session = Session::new(&opts, &engine, &store, &sink).unwrap();

        let err = session
            .run_target("Proxy", &[channel("A"), channel("B"), channel("C")])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("unavailable"));
        assert_eq!(engine.opened(), ["http://server/A", "http://server/B"]);
        assert!(store.load_existing().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_sweep_stores_one_run_per_second() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.tuning_delay = TuningDelay::Sweep { from: 0, to: 1 };
        let sink = LogSink::new();
        let engine = FakeEngine::new(
            &sink,
            &[
                ("http://server/A", Behaviour::PlaysAfter(100)),
                ("http://server/B", Behaviour::PlaysAfter(200)),
            ],
        );
        let store = ResultsStore::new(&opts.config.output.results_file);
        let session = Session {
            now: fixed_clock,
            ..Session::new(&opts, &engine, &store, &sink).unwrap()
        };

        let started = tokio::time::Instant::now();
        session.run_target("Proxy", &[channel("A"), channel("B")]).await.unwrap();

        let table = store.load_existing().unwrap();
        let labels: Vec<&str> = table.runs().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["Proxy (delay 0s)\n2024-05-01 20:15", "Proxy (delay 1s)\n2024-05-01 20:15"]);
        assert_eq!(engine.opened().len(), 4);
        // The one-second pass waits between its two channels only
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_label_gets_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let sink = LogSink::new();
        let engine = FakeEngine::new(&sink, &[("http://server/A", Behaviour::PlaysAfter(100))]);
        let store = ResultsStore::new(&opts.config.output.results_file);
        let session = Session {
            now: fixed_clock,
            ..Session::new(&opts, &engine, &store, &sink).unwrap()
        };

        session.run_target("Proxy", &[channel("A")]).await.unwrap();
        session.run_target("Proxy", &[channel("A")]).await.unwrap();

        let table = store.load_existing().unwrap();
        let labels: Vec<&str> = table.runs().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["Proxy\n2024-05-01 20:15", "Proxy\n2024-05-01 20:15 #2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_analysis_failure_is_recorded_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.probe = true;
        opts.config.inspector.ffprobe_path = "/nonexistent/ffprobe-binary".to_string();
        let sink = LogSink::new();
        let engine = FakeEngine::new(
            &sink,
            &[
                ("http://server/A", Behaviour::PlaysAfter(100)),
                ("http://server/B", Behaviour::Silent),
            ],
        );
        let store = ResultsStore::new(&opts.config.output.results_file);
        let session = Session::new(&opts, &engine, &store, &sink).unwrap();

        let results = session
            .tune_channels(&[channel("A"), channel("B")], "run1", Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(matches!(result.codec_info, Some(StreamInfo::Failed(_))));
            assert_eq!(result.notes.iter().filter(|n| n.starts_with("FFprobe: ")).count(), 1);
        }
        assert!(matches!(results[0].outcome, TuneOutcome::Tuned(_)));
        assert_eq!(results[1].outcome, TuneOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_errors_attach_to_the_channel_that_caused_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.debug = true;
        let sink = LogSink::new();
        sink.append("ERROR left over from an earlier session");
        let engine = FakeEngine::new(
            &sink,
            &[
                ("http://server/A", Behaviour::PlaysAfter(100)),
                ("http://server/B", Behaviour::Fails("upstream closed")),
                ("http://server/C", Behaviour::PlaysAfter(100)),
            ],
        );
        let store = ResultsStore::new(&opts.config.output.results_file);
        let session = Session::new(&opts, &engine, &store, &sink).unwrap();

        let results = session
            .tune_channels(&[channel("A"), channel("B"), channel("C")], "run1", Duration::ZERO)
            .await
            .unwrap();

        let docker = |i: usize| -> Vec<&str> {
            results[i]
                .notes
                .iter()
                .filter(|n| n.starts_with("Docker: "))
                .map(String::as_str)
                .collect()
        };
        assert!(docker(0).is_empty());
        assert_eq!(docker(1), ["Docker: ERROR upstream closed"]);
        assert!(docker(2).is_empty());
        assert!(results[1].notes.iter().any(|n| n.starts_with("Player: ")));
    }
}
