use std::fs::File;
use std::sync::Mutex;

use clap::Parser;
use iptv_tuner::config::Config;
use iptv_tuner::profiles::ProfileSelection;
use iptv_tuner::tuner::{Options, TuningDelay, run};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "iptv-tuner")]
#[command(about = "Measures IPTV channel tuning times and reports them per stream profile")]
#[command(after_help = "Examples:
  iptv-tuner                                   full run with report and thumbnails
  iptv-tuner --probe --debug                   add stream analysis and container log errors
  iptv-tuner --no-thumbnail --profiles=1,4     fast run of two server profiles
  iptv-tuner --tuningdelay=0-3                 one run per delay between channels")]
struct Opt {
    /// Configuration file
    #[arg(short, long, default_value = "iptv-tuner.toml")]
    config: String,

    /// Delete previous results before running
    #[arg(long)]
    reset: bool,

    /// Show the video while tuning
    #[arg(long)]
    view: bool,

    /// Capture a thumbnail of every channel that plays (default)
    #[arg(long, overrides_with = "no_thumbnail")]
    thumbnail: bool,

    /// Do not capture thumbnails
    #[arg(long, overrides_with = "thumbnail")]
    no_thumbnail: bool,

    /// Write the HTML report (default)
    #[arg(long, overrides_with = "no_report")]
    report: bool,

    /// Do not write the HTML report
    #[arg(long, overrides_with = "report")]
    no_report: bool,

    /// Analyse every stream with FFprobe
    #[arg(long)]
    probe: bool,

    /// Tail the server's container log and record errors per channel
    #[arg(long)]
    debug: bool,

    /// Server stream profiles to test: comma-separated numbers or 'all'
    #[arg(long, value_name = "LIST")]
    profiles: Option<ProfileSelection>,

    /// Seconds between channels, or a range like 0-3 for one run per delay
    #[arg(long = "tuningdelay", value_name = "SECS", default_value = "0")]
    tuning_delay: TuningDelay,

    /// Playlist group to test (overrides config)
    #[arg(long)]
    group: Option<String>,

    /// First channel to test (overrides config)
    #[arg(long)]
    start: Option<String>,

    /// Number of channels to test (overrides config)
    #[arg(long)]
    count: Option<usize>,

    /// Seconds to wait for playback per channel (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let mut config = Config::load_from_file(&opt.config)?;
    if let Some(group) = opt.group {
        config.playlist.target_group = group;
    }
    if let Some(start) = opt.start {
        config.playlist.start_channel = start;
    }
    if let Some(count) = opt.count {
        config.playlist.channel_count = count;
    }
    if let Some(timeout) = opt.timeout {
        config.tuning.timeout_secs = timeout;
    }
    config.validate()?;

    let mut log_filter = format!("iptv_tuner={}", opt.log_level);
    if opt.debug {
        log_filter.push_str(",iptv_tuner::remote=debug");
    }
    let log_file = match File::create(&config.output.log_file) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Warning: cannot write {}: {e}", config.output.log_file.display());
            None
        }
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(log_file.map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        }))
        .init();

    run(Options {
        config,
        reset: opt.reset,
        view: opt.view,
        thumbnails: opt.thumbnail || !opt.no_thumbnail,
        report: opt.report || !opt.no_report,
        probe: opt.probe,
        debug: opt.debug,
        profiles: opt.profiles,
        tuning_delay: opt.tuning_delay,
    })
    .await
}
