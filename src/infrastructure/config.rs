// Configuration - file and environment layers, validated into runtime settings
use crate::application::engine::EngineSettings;
use crate::application::estimator::{EstimatorSettings, LimitComputation, RebaselinePolicy};
use crate::application::publisher::PersistenceSettings;
use crate::application::refresh_loop::RefreshSettings;
use crate::domain::chart::RuleSet;
use crate::domain::errors::ConfigError;
use crate::domain::observation::IngestOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub oee: OeeConfig,
    pub refresh: RefreshConfig,
    pub feed: FeedConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RebaselineMode {
    PerObservation,
    Batch,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComputationMode {
    FullRecompute,
    Incremental,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub retention_window: usize,
    pub min_baseline: usize,
    pub rebaseline: RebaselineMode,
    /// Observations between recomputes in batch mode.
    pub rebaseline_every: usize,
    pub extended_rules: bool,
    pub limit_computation: ComputationMode,
    /// Points kept per chart in the snapshot.
    pub chart_points: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_window: 30,
            min_baseline: 20,
            rebaseline: RebaselineMode::PerObservation,
            rebaseline_every: 10,
            extended_rules: false,
            limit_computation: ComputationMode::FullRecompute,
            chart_points: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OeeConfig {
    pub reporting_interval_secs: u64,
    /// Units per minute of run time.
    pub theoretical_rate: f64,
    pub history_len: usize,
    /// Planned minutes assumed for records without `planned_time`.
    pub default_planned_time: Option<f64>,
}

impl Default for OeeConfig {
    fn default() -> Self {
        Self {
            reporting_interval_secs: 86_400,
            theoretical_rate: 1.0,
            history_len: 30,
            default_planned_time: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RefreshConfig {
    pub cadence_ms: u64,
    pub feed_wait_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 1000,
            feed_wait_ms: 250,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Channel,
    #[serde(rename = "jsonl")]
    JsonLines,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    pub kind: FeedKind,
    pub path: Option<String>,
    pub max_batch: usize,
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            kind: FeedKind::Channel,
            path: None,
            max_batch: 500,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[serde(rename = "none")]
    Disabled,
    #[serde(rename = "jsonl")]
    JsonLines,
    Influx,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InfluxSettings {
    pub host: String,
    pub token: String,
    pub database: String,
    pub retention_policy: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_measurement() -> String {
    "spc_metrics".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub kind: SinkKind,
    pub path: String,
    pub influx: Option<InfluxSettings>,
    pub queue_capacity: usize,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::JsonLines,
            path: "data/spc_metrics.jsonl".to_string(),
            influx: None,
            queue_capacity: 64,
            retries: 3,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedSettings {
    Channel { capacity: usize, max_batch: usize },
    JsonLines { path: PathBuf, max_batch: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkSettings {
    Disabled,
    JsonLines { path: PathBuf },
    Influx(InfluxSettings),
}

/// Validated settings the binary wires together.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub bind: SocketAddr,
    pub engine: EngineSettings,
    pub refresh: RefreshSettings,
    pub feed: FeedSettings,
    pub sink: SinkSettings,
    pub persistence: PersistenceSettings,
}

fn positive<T: PartialOrd + Default>(field: &'static str, value: T) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<RuntimeSettings, ConfigError> {
        let bind: SocketAddr = self
            .server
            .bind
            .parse()
            .map_err(|e| ConfigError::invalid("server.bind", format!("{e}")))?;

        let engine = &self.engine;
        if engine.retention_window < 2 {
            return Err(ConfigError::invalid(
                "engine.retention_window",
                "must hold at least 2 observations",
            ));
        }
        if engine.min_baseline < 2 || engine.min_baseline > engine.retention_window {
            return Err(ConfigError::invalid(
                "engine.min_baseline",
                format!("must be between 2 and {}", engine.retention_window),
            ));
        }
        let policy = match engine.rebaseline {
            RebaselineMode::PerObservation => RebaselinePolicy::PerObservation,
            RebaselineMode::Batch => RebaselinePolicy::Batch {
                every: positive("engine.rebaseline_every", engine.rebaseline_every)?,
            },
        };
        let computation = match engine.limit_computation {
            ComputationMode::FullRecompute => LimitComputation::FullRecompute,
            ComputationMode::Incremental => LimitComputation::Incremental,
        };

        let oee = &self.oee;
        if !oee.theoretical_rate.is_finite() {
            return Err(ConfigError::invalid("oee.theoretical_rate", "must be finite"));
        }
        let reporting_secs = positive("oee.reporting_interval_secs", oee.reporting_interval_secs)?;
        let reporting_interval = i64::try_from(reporting_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| ConfigError::invalid("oee.reporting_interval_secs", "is too large"))?;
        if let Some(planned) = oee.default_planned_time {
            if !planned.is_finite() || planned <= 0.0 {
                return Err(ConfigError::invalid(
                    "oee.default_planned_time",
                    "must be a positive number of minutes",
                ));
            }
        }

        let engine_settings = EngineSettings {
            estimator: EstimatorSettings {
                retention_window: engine.retention_window,
                min_baseline: engine.min_baseline,
                policy,
                computation,
            },
            rules: RuleSet {
                two_of_three: engine.extended_rules,
            },
            chart_points: positive("engine.chart_points", engine.chart_points)?,
            reporting_interval,
            theoretical_rate: positive("oee.theoretical_rate", oee.theoretical_rate)?,
            oee_history_len: positive("oee.history_len", oee.history_len)?,
            ingest: IngestOptions {
                default_planned_time: oee.default_planned_time,
            },
        };

        let refresh = RefreshSettings {
            cadence: Duration::from_millis(positive("refresh.cadence_ms", self.refresh.cadence_ms)?),
            feed_wait: Duration::from_millis(positive(
                "refresh.feed_wait_ms",
                self.refresh.feed_wait_ms,
            )?),
        };

        let feed = match self.feed.kind {
            FeedKind::Channel => FeedSettings::Channel {
                capacity: positive("feed.channel_capacity", self.feed.channel_capacity)?,
                max_batch: positive("feed.max_batch", self.feed.max_batch)?,
            },
            FeedKind::JsonLines => FeedSettings::JsonLines {
                path: self
                    .feed
                    .path
                    .as_deref()
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingSetting {
                        component: "jsonl feed",
                        field: "feed.path",
                    })?,
                max_batch: positive("feed.max_batch", self.feed.max_batch)?,
            },
        };

        let persistence = &self.persistence;
        let sink = match persistence.kind {
            SinkKind::Disabled => SinkSettings::Disabled,
            SinkKind::JsonLines => SinkSettings::JsonLines {
                path: PathBuf::from(&persistence.path),
            },
            SinkKind::Influx => SinkSettings::Influx(persistence.influx.clone().ok_or(
                ConfigError::MissingSetting {
                    component: "influx sink",
                    field: "persistence.influx",
                },
            )?),
        };

        Ok(RuntimeSettings {
            bind,
            engine: engine_settings,
            refresh,
            feed,
            sink,
            persistence: PersistenceSettings {
                queue_capacity: positive("persistence.queue_capacity", persistence.queue_capacity)?,
                retries: persistence.retries,
                retry_delay: Duration::from_millis(persistence.retry_delay_ms),
            },
        })
    }
}

/// Load `config/spc.{toml,yaml,json}` (optional) overlaid with `SPC__SECTION__KEY` variables.
pub fn load_config() -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/spc").required(false))
        .add_source(
            config::Environment::with_prefix("SPC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
