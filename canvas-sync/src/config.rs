//! Service configuration.
//!
//! Every section has sensible defaults; `SyncConfig::from_env()` layers
//! environment overrides on top of them at startup.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Transport and process settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory stores only)
    pub storage_path: Option<PathBuf>,
    /// Outbound queue capacity per connection
    pub outbox_capacity: usize,
    /// Time allowed for a graceful shutdown before forcing exit
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            storage_path: None,
            outbox_capacity: 256,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Room cache bounds.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Rooms idle for longer than this are evicted
    pub ttl: Duration,
    /// Hard cap on cached rooms; the sweep trims down to half of it
    pub max_rooms: usize,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_rooms: 100,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Write-behind timing.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Quiet period per object before a commit
    pub debounce: Duration,
    /// Quiet period per room before the idle saver drains it
    pub room_idle_save: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            room_idle_save: Duration::from_secs(2),
        }
    }
}

/// Per-connection fixed-window limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Events allowed per window
    pub max_events: u32,
    /// Window length
    pub window: Duration,
    /// Idle entries older than `window * stale_windows` are swept
    pub stale_windows: u32,
    /// How often stale entries are swept
    pub sweep_interval: Duration,
    /// Delay before a limited connection is automatically reset
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events: 50,
            window: Duration::from_millis(1000),
            stale_windows: 10,
            sweep_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub rate_limit: RateLimitConfig,
}

impl SyncConfig {
    /// Small bounds and short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                outbox_capacity: 64,
                shutdown_grace: Duration::from_secs(5),
                ..ServerConfig::default()
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(60),
                max_rooms: 8,
                sweep_interval: Duration::from_secs(10),
            },
            pipeline: PipelineConfig::default(),
            rate_limit: RateLimitConfig {
                max_events: 1000,
                ..RateLimitConfig::default()
            },
        }
    }

    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CANVAS_BIND_ADDR") {
            config.server.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", port)?;
            config.server.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(path) = lookup("CANVAS_STORAGE_PATH") {
            config.server.storage_path = Some(PathBuf::from(path));
        }
        if let Some(v) = lookup("CANVAS_SHUTDOWN_GRACE_SECS") {
            config.server.shutdown_grace = Duration::from_secs(parse("CANVAS_SHUTDOWN_GRACE_SECS", v)?);
        }
        if let Some(v) = lookup("CANVAS_CACHE_TTL_SECS") {
            config.cache.ttl = Duration::from_secs(parse("CANVAS_CACHE_TTL_SECS", v)?);
        }
        if let Some(v) = lookup("CANVAS_CACHE_MAX_ROOMS") {
            config.cache.max_rooms = parse("CANVAS_CACHE_MAX_ROOMS", v)?;
        }
        if let Some(v) = lookup("CANVAS_DEBOUNCE_MS") {
            config.pipeline.debounce = Duration::from_millis(parse("CANVAS_DEBOUNCE_MS", v)?);
        }
        if let Some(v) = lookup("CANVAS_ROOM_IDLE_SAVE_MS") {
            config.pipeline.room_idle_save =
                Duration::from_millis(parse("CANVAS_ROOM_IDLE_SAVE_MS", v)?);
        }
        if let Some(v) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            config.rate_limit.max_events = parse("RATE_LIMIT_MAX_REQUESTS", v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_WINDOW_MS") {
            config.rate_limit.window = Duration::from_millis(parse("RATE_LIMIT_WINDOW_MS", v)?);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}
