use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Default number of segment fetches allowed in flight.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Configurable options for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for manifest, variant playlist and probe requests
    pub fetch_timeout: Duration,

    /// Timeout for a single segment request. `None` disables it.
    pub segment_timeout: Option<Duration>,

    /// Upper bound on a remux process run. `None` means unbounded.
    pub remux_timeout: Option<Duration>,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Maximum number of segment fetches in flight
    pub concurrency: usize,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, merged under per-request headers
    pub headers: HeaderMap,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Path or name of the ffmpeg binary
    pub ffmpeg_path: String,

    /// Directory that holds segment staging dirs and finished artifacts
    pub work_dir: PathBuf,

    /// How long a retrieved artifact stays on disk before deletion
    pub artifact_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            segment_timeout: Some(Duration::from_secs(60)),
            remux_timeout: None,
            connect_timeout: Duration::from_secs(30),
            concurrency: DEFAULT_CONCURRENCY,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: EngineConfig::get_default_headers(),
            pool_max_idle_per_host: DEFAULT_CONCURRENCY,
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            work_dir: std::env::temp_dir().join("segmux"),
            artifact_grace: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Effective download concurrency, never below one.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_ffmpeg_path(mut self, path: impl Into<String>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }
}
