use once_cell::sync::Lazy;
use std::{env, path::PathBuf, time::Duration};

/// Holds all tunables, read-once from ENV with fallbacks.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory standing in for the flash filesystem.
    pub data_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Multiplier applied to `connect_timeout` when the user retries.
    pub connect_retry_factor: u32,
    /// Debounce between the link coming up and account work starting.
    pub link_grace: Duration,
    pub poll_interval: Duration,
    /// Poll cadence while IDLE or SLEEP, so resumed playback is noticed.
    pub idle_poll_interval: Duration,
    pub sleep_timeout: Duration,
    pub pause_sleep_timeout: Duration,
    pub active_tick: Duration,
    pub idle_tick: Duration,
    pub render_tick: Duration,
    pub art_stall_timeout: Duration,
    pub art_target_size: u32,
    /// Largest cover-art download accepted, in bytes.
    pub art_max_bytes: usize,
    pub callback_port: u16,
    /// `None` keeps the listener alive until a code arrives.
    pub callback_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub accounts_url: String,
    pub api_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("./data"),
            connect_timeout: Duration::from_millis(15_000),
            connect_retry_factor: 2,
            link_grace: Duration::from_millis(1_500),
            poll_interval: Duration::from_millis(2_000),
            idle_poll_interval: Duration::from_millis(5_000),
            sleep_timeout: Duration::from_secs(5 * 60),
            pause_sleep_timeout: Duration::from_secs(15 * 60),
            active_tick: Duration::from_millis(100),
            idle_tick: Duration::from_millis(2_000),
            render_tick: Duration::from_millis(5),
            art_stall_timeout: Duration::from_secs(5),
            art_target_size: 300,
            art_max_bytes: 2 * 1024 * 1024,
            callback_port: 8888,
            callback_timeout: None,
            request_timeout: Duration::from_secs(10),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            accounts_url: "https://accounts.spotify.com".to_string(),
            api_url: "https://api.spotify.com/v1".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        // optionally load .env
        let _ = dotenvy::dotenv();

        let defaults = Settings::default();

        // helper to parse any FromStr value
        fn parse<T: std::str::FromStr>(var: &str, default: T) -> T {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        // helper to parse millis into Duration
        fn parse_millis(var: &str, default: Duration) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        // helper to parse seconds into Duration
        fn parse_secs(var: &str, default: Duration) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        }

        Settings {
            data_dir: env::var("DEVICE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            connect_timeout: parse_millis("CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            connect_retry_factor: parse("CONNECT_RETRY_FACTOR", defaults.connect_retry_factor),
            link_grace: parse_millis("LINK_GRACE_MS", defaults.link_grace),
            poll_interval: parse_millis("POLL_INTERVAL_MS", defaults.poll_interval),
            idle_poll_interval: parse_millis("IDLE_POLL_INTERVAL_MS", defaults.idle_poll_interval),
            sleep_timeout: parse_secs("SLEEP_TIMEOUT_SECS", defaults.sleep_timeout),
            pause_sleep_timeout: parse_secs(
                "PAUSE_SLEEP_TIMEOUT_SECS",
                defaults.pause_sleep_timeout,
            ),
            active_tick: parse_millis("ACTIVE_TICK_MS", defaults.active_tick),
            idle_tick: parse_millis("IDLE_TICK_MS", defaults.idle_tick),
            render_tick: parse_millis("RENDER_TICK_MS", defaults.render_tick),
            art_stall_timeout: parse_secs("ART_STALL_TIMEOUT_SECS", defaults.art_stall_timeout),
            art_target_size: parse("ART_TARGET_SIZE", defaults.art_target_size),
            art_max_bytes: parse("ART_MAX_BYTES", defaults.art_max_bytes),
            callback_port: parse("CALLBACK_PORT", defaults.callback_port),
            callback_timeout: env::var("CALLBACK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
            request_timeout: parse_secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            min_backoff: parse_millis("MIN_BACKOFF_MS", defaults.min_backoff),
            max_backoff: parse_secs("MAX_BACKOFF_SECS", defaults.max_backoff),
            accounts_url: env::var("ACCOUNTS_URL").unwrap_or(defaults.accounts_url),
            api_url: env::var("API_URL").unwrap_or(defaults.api_url),
        }
    }

    /// Timeout used when the user asks to retry a failed connection.
    pub fn retry_connect_timeout(&self) -> Duration {
        self.connect_timeout * self.connect_retry_factor.max(1)
    }
}

/// Global settings instance
pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);
