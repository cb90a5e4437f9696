use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use crate::tracker::EventTracker;

/// Data center region hosting the flag, stream, and cohort servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerZone {
    /// United States (the default).
    #[default]
    US,
    /// European Union.
    EU,
}

impl ServerZone {
    fn flag_server_url(self) -> &'static str {
        match self {
            ServerZone::US => "https://api.lab.amplitude.com/",
            ServerZone::EU => "https://flag.lab.eu.amplitude.com/",
        }
    }

    fn stream_server_url(self) -> &'static str {
        match self {
            ServerZone::US => "https://stream.lab.amplitude.com",
            ServerZone::EU => "https://stream.lab.eu.amplitude.com",
        }
    }

    fn cohort_server_url(self) -> &'static str {
        match self {
            ServerZone::US => "https://cohort-v2.lab.amplitude.com",
            ServerZone::EU => "https://cohort-v2.lab.eu.amplitude.com",
        }
    }
}

impl FromStr for ServerZone {
    type Err = String;

    /// Zone names are case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "us" => Ok(ServerZone::US),
            "eu" => Ok(ServerZone::EU),
            other => Err(format!("unknown server zone: {other}")),
        }
    }
}

/// Configuration for [`Client`](crate::Client).
///
/// Unset urls resolve to the defaults of [`Config::server_zone`]. Zero durations are replaced with
/// defaults by [`Config::fill_defaults`].
///
/// ```
/// # use experiment_local::{Config, ServerZone};
/// # use std::time::Duration;
/// let config = Config::new()
///     .with_server_zone(ServerZone::EU)
///     .with_stream_updates(true)
///     .with_flag_config_poller_interval(Duration::from_secs(60));
/// ```
#[derive(Clone, Default)]
pub struct Config {
    pub server_zone: ServerZone,
    /// Flag server. Defaults to the zone's flag server.
    pub server_url: Option<String>,
    pub flag_config_poller_interval: Duration,
    pub flag_config_poller_request_timeout: Duration,
    /// Receive flag updates over a server-sent-events stream, falling back to polling.
    pub stream_updates: bool,
    /// Stream server. Defaults to the zone's stream server.
    pub stream_server_url: Option<String>,
    pub stream_flag_conn_timeout: Duration,
    /// Cohort targeting is disabled unless this is set.
    pub cohort_sync_config: Option<CohortSyncConfig>,
    pub assignment_config: Option<AssignmentConfig>,
    pub exposure_config: Option<ExposureConfig>,
}

impl Config {
    /// Default value for [`Config::flag_config_poller_interval`].
    pub const DEFAULT_FLAG_CONFIG_POLLER_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`Config::flag_config_poller_request_timeout`].
    pub const DEFAULT_FLAG_CONFIG_POLLER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default value for [`Config::stream_flag_conn_timeout`].
    pub const DEFAULT_STREAM_FLAG_CONN_TIMEOUT: Duration = Duration::from_millis(1500);

    pub fn new() -> Config {
        Config::default().fill_defaults()
    }

    pub fn with_server_zone(mut self, server_zone: ServerZone) -> Config {
        self.server_zone = server_zone;
        self
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Config {
        self.server_url = Some(server_url.into());
        self
    }

    pub fn with_flag_config_poller_interval(mut self, interval: Duration) -> Config {
        self.flag_config_poller_interval = interval;
        self
    }

    pub fn with_flag_config_poller_request_timeout(mut self, timeout: Duration) -> Config {
        self.flag_config_poller_request_timeout = timeout;
        self
    }

    pub fn with_stream_updates(mut self, stream_updates: bool) -> Config {
        self.stream_updates = stream_updates;
        self
    }

    pub fn with_stream_server_url(mut self, stream_server_url: impl Into<String>) -> Config {
        self.stream_server_url = Some(stream_server_url.into());
        self
    }

    pub fn with_stream_flag_conn_timeout(mut self, timeout: Duration) -> Config {
        self.stream_flag_conn_timeout = timeout;
        self
    }

    pub fn with_cohort_sync_config(mut self, cohort_sync_config: CohortSyncConfig) -> Config {
        self.cohort_sync_config = Some(cohort_sync_config);
        self
    }

    pub fn with_assignment_config(mut self, assignment_config: AssignmentConfig) -> Config {
        self.assignment_config = Some(assignment_config);
        self
    }

    pub fn with_exposure_config(mut self, exposure_config: ExposureConfig) -> Config {
        self.exposure_config = Some(exposure_config);
        self
    }

    /// Flag server url, explicit or the zone default.
    pub fn server_url(&self) -> &str {
        self.server_url
            .as_deref()
            .unwrap_or_else(|| self.server_zone.flag_server_url())
    }

    /// Stream server url, explicit or the zone default.
    pub fn stream_server_url(&self) -> &str {
        self.stream_server_url
            .as_deref()
            .unwrap_or_else(|| self.server_zone.stream_server_url())
    }

    /// Cohort server url, explicit or the zone default.
    pub fn cohort_server_url(&self) -> Option<&str> {
        let cohort_sync_config = self.cohort_sync_config.as_ref()?;
        Some(
            cohort_sync_config
                .cohort_server_url
                .as_deref()
                .unwrap_or_else(|| self.server_zone.cohort_server_url()),
        )
    }

    /// Replace unset (zero) values with defaults, leaving explicit values intact.
    pub fn fill_defaults(mut self) -> Config {
        if self.flag_config_poller_interval.is_zero() {
            self.flag_config_poller_interval = Config::DEFAULT_FLAG_CONFIG_POLLER_INTERVAL;
        }
        if self.flag_config_poller_request_timeout.is_zero() {
            self.flag_config_poller_request_timeout =
                Config::DEFAULT_FLAG_CONFIG_POLLER_REQUEST_TIMEOUT;
        }
        if self.stream_flag_conn_timeout.is_zero() {
            self.stream_flag_conn_timeout = Config::DEFAULT_STREAM_FLAG_CONN_TIMEOUT;
        }
        self.cohort_sync_config = self.cohort_sync_config.map(CohortSyncConfig::fill_defaults);
        self.assignment_config = self.assignment_config.map(|mut c| {
            if c.cache_capacity == 0 {
                c.cache_capacity = AssignmentConfig::DEFAULT_CACHE_CAPACITY;
            }
            c
        });
        self.exposure_config = self.exposure_config.map(|mut c| {
            if c.cache_capacity == 0 {
                c.cache_capacity = ExposureConfig::DEFAULT_CACHE_CAPACITY;
            }
            c
        });
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_zone", &self.server_zone)
            .field("server_url", &self.server_url())
            .field("flag_config_poller_interval", &self.flag_config_poller_interval)
            .field(
                "flag_config_poller_request_timeout",
                &self.flag_config_poller_request_timeout,
            )
            .field("stream_updates", &self.stream_updates)
            .field("stream_server_url", &self.stream_server_url())
            .field("stream_flag_conn_timeout", &self.stream_flag_conn_timeout)
            .field("cohort_sync_config", &self.cohort_sync_config)
            .field("assignment_config", &self.assignment_config.is_some())
            .field("exposure_config", &self.exposure_config.is_some())
            .finish()
    }
}

/// Cohort download settings. Requires a pair of cohort api credentials.
#[derive(Clone)]
pub struct CohortSyncConfig {
    pub api_key: String,
    pub secret_key: String,
    pub max_cohort_size: u32,
    /// How often stored cohorts are refreshed. Values below the default are raised to it.
    pub cohort_polling_interval: Duration,
    /// Cohort server. Defaults to the zone's cohort server.
    pub cohort_server_url: Option<String>,
    pub cohort_request_timeout: Duration,
}

impl CohortSyncConfig {
    pub const DEFAULT_MAX_COHORT_SIZE: u32 = i32::MAX as u32;
    /// Default, and minimum, value for [`CohortSyncConfig::cohort_polling_interval`].
    pub const DEFAULT_COHORT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_COHORT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> CohortSyncConfig {
        CohortSyncConfig {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            max_cohort_size: CohortSyncConfig::DEFAULT_MAX_COHORT_SIZE,
            cohort_polling_interval: CohortSyncConfig::DEFAULT_COHORT_POLLING_INTERVAL,
            cohort_server_url: None,
            cohort_request_timeout: CohortSyncConfig::DEFAULT_COHORT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_max_cohort_size(mut self, max_cohort_size: u32) -> CohortSyncConfig {
        self.max_cohort_size = max_cohort_size;
        self
    }

    pub fn with_cohort_polling_interval(mut self, interval: Duration) -> CohortSyncConfig {
        self.cohort_polling_interval = interval;
        self
    }

    pub fn with_cohort_server_url(mut self, url: impl Into<String>) -> CohortSyncConfig {
        self.cohort_server_url = Some(url.into());
        self
    }

    fn fill_defaults(mut self) -> CohortSyncConfig {
        if self.max_cohort_size == 0 {
            self.max_cohort_size = CohortSyncConfig::DEFAULT_MAX_COHORT_SIZE;
        }
        if self.cohort_polling_interval < CohortSyncConfig::DEFAULT_COHORT_POLLING_INTERVAL {
            self.cohort_polling_interval = CohortSyncConfig::DEFAULT_COHORT_POLLING_INTERVAL;
        }
        if self.cohort_request_timeout.is_zero() {
            self.cohort_request_timeout = CohortSyncConfig::DEFAULT_COHORT_REQUEST_TIMEOUT;
        }
        self
    }
}

impl fmt::Debug for CohortSyncConfig {
    // Keep credentials out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortSyncConfig")
            .field("max_cohort_size", &self.max_cohort_size)
            .field("cohort_polling_interval", &self.cohort_polling_interval)
            .field("cohort_server_url", &self.cohort_server_url)
            .field("cohort_request_timeout", &self.cohort_request_timeout)
            .finish_non_exhaustive()
    }
}

/// Assignment event tracking. Every distinct evaluation result is tracked once a day per user.
#[derive(Clone)]
pub struct AssignmentConfig {
    pub tracker: Arc<dyn EventTracker + Send + Sync>,
    pub cache_capacity: usize,
}

impl AssignmentConfig {
    pub const DEFAULT_CACHE_CAPACITY: usize = 65536;

    pub fn new(tracker: impl EventTracker + Send + Sync + 'static) -> AssignmentConfig {
        AssignmentConfig {
            tracker: Arc::new(tracker),
            cache_capacity: AssignmentConfig::DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> AssignmentConfig {
        self.cache_capacity = cache_capacity;
        self
    }
}

/// Exposure event tracking for evaluations made with
/// [`EvaluateOptions::tracks_exposure`](crate::EvaluateOptions::tracks_exposure).
#[derive(Clone)]
pub struct ExposureConfig {
    pub tracker: Arc<dyn EventTracker + Send + Sync>,
    pub cache_capacity: usize,
}

impl ExposureConfig {
    pub const DEFAULT_CACHE_CAPACITY: usize = 65536;

    pub fn new(tracker: impl EventTracker + Send + Sync + 'static) -> ExposureConfig {
        ExposureConfig {
            tracker: Arc::new(tracker),
            cache_capacity: ExposureConfig::DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> ExposureConfig {
        self.cache_capacity = cache_capacity;
        self
    }
}
