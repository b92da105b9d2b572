use log::info;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WINDOW_SIZE: usize = 10;
pub const DEFAULT_SMOOTHING_FACTOR: f64 = 0.3;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Upper bound for the poll interval and request timeout.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const REALTIME_PATH: &str = "/realtime/";

/// Settings for one station session.
#[derive(Debug, Clone, PartialEq)]
pub struct StationConfig {
    pub host: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub window_size: usize,
    /// EMA alpha used for the rolling average.
    pub smoothing_factor: f64,
    /// Consecutive failed cycles before the station is reported unavailable.
    pub failure_threshold: u32,
}

impl StationConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            window_size: DEFAULT_WINDOW_SIZE,
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_smoothing_factor(mut self, alpha: f64) -> Self {
        self.smoothing_factor = alpha;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Load configuration from the environment (and `.env` if present).
    ///
    /// `GAIA_HOST` is required; every other variable falls back to its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let host = env::var("GAIA_HOST").map_err(|_| ConfigError::MissingVar("GAIA_HOST"))?;
        let mut config = StationConfig::new(host.trim());

        if let Some(secs) = parse_var::<u64>("GAIA_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("GAIA_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var("GAIA_WINDOW_SIZE")? {
            config.window_size = size;
        }
        if let Some(alpha) = parse_var("GAIA_SMOOTHING_FACTOR")? {
            config.smoothing_factor = alpha;
        }
        if let Some(threshold) = parse_var("GAIA_FAILURE_THRESHOLD")? {
            config.failure_threshold = threshold;
        }

        config.validate()?;
        info!(
            "Loaded configuration for station {} (interval {}s, window {})",
            config.host,
            config.poll_interval.as_secs(),
            config.window_size
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NotPositive("poll interval"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NotPositive("timeout"));
        }
        if self.poll_interval > MAX_DURATION {
            return Err(ConfigError::TooLong("poll interval"));
        }
        if self.timeout > MAX_DURATION {
            return Err(ConfigError::TooLong("timeout"));
        }
        if self.window_size == 0 {
            return Err(ConfigError::NotPositive("window size"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::NotPositive("failure threshold"));
        }
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            return Err(ConfigError::SmoothingFactor(self.smoothing_factor));
        }
        Ok(())
    }

    /// `http://{host}/realtime/`, rejecting hosts that smuggle a scheme or path.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let host = self.host.trim();
        let invalid = || ConfigError::InvalidHost(self.host.clone());
        if host.is_empty()
            || host.contains(['/', '?', '#', '@'])
            || host.contains(char::is_whitespace)
        {
            return Err(invalid());
        }

        let url =
            Url::parse(&format!("http://{}{}", host, REALTIME_PATH)).map_err(|_| invalid())?;
        if url.host_str().is_none() || url.path() != REALTIME_PATH {
            return Err(invalid());
        }
        Ok(url)
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
        Err(_) => Ok(None),
    }
}
