//! Layered configuration (TOML file + environment overrides) for the
//! worker pool runtime.
//!
//! A `config::Config` builder chain reads an optional default file, an
//! optional caller-supplied file, then environment variables under a
//! crate-specific prefix, deserialized into a `#[serde(default)]` settings
//! tree so every field has a sane fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

const DEFAULT_CONFIG_PATH: &str = "configs/pool-runtime.toml";
const ENV_PREFIX: &str = "POOL_RUNTIME";

/// Root configuration tree for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Scheduler/pool-level options.
    pub pool: PoolSettings,
    /// Default per-task options applied when a submission doesn't override them.
    pub task: TaskSettings,
    /// Image cache options.
    pub image_cache: ImageCacheSettings,
    /// Image processor options.
    pub image_processor: ImageProcessorSettings,
    /// Logging/tracing options.
    pub observability: ObservabilitySettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            task: TaskSettings::default(),
            image_cache: ImageCacheSettings::default(),
            image_processor: ImageProcessorSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] (if present), then `path` (if
    /// given, required), then `POOL_RUNTIME__*` environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> PoolResult<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let built = builder.build().map_err(|e| PoolError::Configuration(e.to_string()))?;
        built.try_deserialize().map_err(|e| PoolError::Configuration(e.to_string()))
    }

    /// Defaults with no file or environment sources consulted.
    pub fn load() -> PoolResult<Self> {
        Self::load_from_path(None::<PathBuf>)
    }
}

/// Scheduler-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Upper bound on pending (queued) tasks. `submit` rejects past this.
    pub max_queue_size: usize,
    /// Default per-task timeout when not overridden.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Default max retry attempts when not overridden.
    pub default_max_retries: u32,
    /// Default retry backoff base delay.
    #[serde(with = "humantime_serde")]
    pub default_retry_delay_base: Duration,
    /// Default retry backoff cap.
    #[serde(with = "humantime_serde")]
    pub default_max_backoff_delay: Duration,
    /// Default retry jitter upper bound.
    #[serde(with = "humantime_serde")]
    pub default_max_jitter: Duration,
    /// Dead-letter queue capacity.
    pub dead_letter_queue_size: usize,
    /// How long the pool waits for in-flight tasks to drain on a graceful
    /// `shutdown` before forcing cancellation.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
    /// Interval of the no-busy-poll safety tick the dispatch loop uses to
    /// reap idle units and re-check circuit breakers.
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Default bounds applied to any unit kind with no explicit override.
    pub default_min_units: usize,
    /// Default max units per kind.
    pub default_max_units: usize,
    /// Default idle timeout before an idle unit above `default_min_units`
    /// is reaped.
    #[serde(with = "humantime_serde")]
    pub default_idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            default_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            default_retry_delay_base: Duration::from_millis(500),
            default_max_backoff_delay: Duration::from_secs(30),
            default_max_jitter: Duration::from_millis(250),
            dead_letter_queue_size: 1000,
            shutdown_grace_period: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5),
            default_min_units: 0,
            default_max_units: 8,
            default_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Default task-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Default priority for submissions that don't specify one.
    pub default_priority: crate::task::Priority,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self { default_priority: crate::task::Priority::Normal }
    }
}

/// Two-tier image cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheSettings {
    /// Whether the cache is consulted/populated at all.
    pub enabled: bool,
    /// Max entries held in the in-memory LRU tier.
    pub memory_capacity: usize,
    /// Directory backing the persistent tier; `None` disables it.
    pub persistent_dir: Option<PathBuf>,
    /// Discrete output scales the cache quantizes requested scales to.
    pub discrete_scales: Vec<u32>,
}

impl Default for ImageCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: 256,
            persistent_dir: None,
            discrete_scales: vec![25, 50, 75, 100, 150, 200],
        }
    }
}

/// Image processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageProcessorSettings {
    /// Base seconds of timeout budget per megabyte of input.
    pub seconds_per_mb: f64,
    /// Extra seconds added for lossless formats (e.g. PNG, BMP).
    pub lossless_penalty_secs: f64,
    /// Seconds subtracted for high-efficiency formats (e.g. AVIF, WebP).
    pub high_efficiency_bonus_secs: f64,
    /// Floor applied after penalties/bonuses.
    pub minimum_timeout_secs: f64,
}

impl Default for ImageProcessorSettings {
    fn default() -> Self {
        Self {
            seconds_per_mb: 5.0,
            lossless_penalty_secs: 5.0,
            high_efficiency_bonus_secs: 2.0,
            minimum_timeout_secs: 5.0,
        }
    }
}

/// Logging/tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// `tracing_subscriber::EnvFilter` directive string.
    pub log_level: String,
    /// Emit structured JSON logs instead of the human-readable format.
    pub json_logs: bool,
    /// Port the prometheus text exporter listens on, when embedded by a host.
    pub metrics_port: u16,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logs: false, metrics_port: 9090 }
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_any_source() {
        let cfg = RuntimeConfig::load().unwrap();
        assert_eq!(cfg.pool.default_max_retries, 3);
        assert!(cfg.image_cache.enabled);
    }
}
