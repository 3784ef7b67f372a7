//! Constants for channel tuning, stream inspection and reporting

use std::time::Duration;

/// Client identity sent to IPTV servers; some reject unknown players
pub const DEFAULT_USER_AGENT: &str = "TiviMate/4.7.0 (Linux; Android 11)";

/// Tuning constants
pub const DEFAULT_TUNE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MIN_PLAYBACK_MS: u64 = 200;
pub const PLAYBACK_CONFIRM_GRACE: Duration = Duration::from_secs(2);
pub const SNAPSHOT_WAIT: Duration = Duration::from_secs(2);
pub const SNAPSHOT_POLL: Duration = Duration::from_millis(100);
/// Interval between ffmpeg progress blocks; bounds how late play-start is seen
pub const PROGRESS_PERIOD_SECS: &str = "0.05";
/// Upper bound for either end of `--tuningdelay`
pub const MAX_TUNING_DELAY_SECS: u64 = 3_600;

/// Pause after switching the server-side stream profile
pub const PROFILE_SETTLE: Duration = Duration::from_secs(2);

/// FFprobe constants
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
pub const PROBE_ATTEMPTS: u32 = 3;
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Pause between closing the player and probing the same stream
pub const PROBE_SETTLE: Duration = Duration::from_secs(1);

/// Remote log tailing
pub const REMOTE_LOG_TAIL_LINES: u32 = 25;
pub const REMOTE_LOG_HEALTH_CHECK: Duration = Duration::from_secs(5);
pub const REMOTE_CONNECT_TIMEOUT_SECS: u32 = 10;
pub const REMOTE_ERROR_KEYWORDS: &[&str] = &["error", "exception", "failed", "traceback"];

/// HTTP request timeout for playlist and API calls
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Report colour thresholds (elapsed milliseconds)
pub const FAST_THRESHOLD_MS: u64 = 1_500;
pub const MEDIUM_THRESHOLD_MS: u64 = 3_000;

/// Marker some servers append to channels served as raw ffmpeg streams
pub const RAW_STREAM_MARKER: &str = "ᴿᴬᵂ";

/// Results file column suffixes
pub const THUMB_SUFFIX: &str = "_thumb";
pub const INFO_SUFFIX: &str = "_info";
pub const INFO_RETRY_SUFFIX: &str = "_info_retry";
pub const DEBUG_SUFFIX: &str = "_debug";

/// Time cell markers in the results file
pub const TIMEOUT_MARKER: &str = "timeout";
pub const ERROR_MARKER: &str = "error";
