// Error taxonomy for the SPC/OEE engine
use crate::domain::limits::Metric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A raw feed record that could not become an `Observation`.
/// Dropped and counted by the caller, never coerced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedRecordError {
    #[error("record is not valid JSON: {0}")]
    Unparseable(String),

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("timestamp `{0}` is neither RFC 3339 nor YYYY-MM-DD")]
    InvalidTimestamp(String),

    #[error("field `{field}` = {value} must be a whole number")]
    NotAnInteger { field: &'static str, value: f64 },

    #[error("field `{field}` = {value} is out of range ({expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("defect_count {defects} exceeds lot_size {lot_size}")]
    DefectsExceedLot { defects: u64, lot_size: u64 },

    #[error("downtime {downtime} exceeds planned_time {planned_time}")]
    DowntimeExceedsPlanned { downtime: f64, planned_time: f64 },
}

/// Why a metric has no usable limits yet. This is the "pending" display state, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BaselineShortfall {
    TooFewObservations { have: usize, need: usize },
    ZeroMovingRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("insufficient baseline for {metric}: {shortfall:?}")]
pub struct InsufficientBaselineError {
    pub metric: Metric,
    pub shortfall: BaselineShortfall,
}

impl InsufficientBaselineError {
    pub fn too_few(metric: Metric, have: usize, need: usize) -> Self {
        Self {
            metric,
            shortfall: BaselineShortfall::TooFewObservations { have, need },
        }
    }

    pub fn zero_moving_range(metric: Metric) -> Self {
        Self {
            metric,
            shortfall: BaselineShortfall::ZeroMovingRange,
        }
    }
}

/// An OEE factor whose denominator is zero for the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedMetricError {
    #[error("planned time sums to zero")]
    ZeroPlannedTime,
    #[error("run time sums to zero")]
    ZeroRunTime,
    #[error("no units produced")]
    ZeroUnitsProduced,
    #[error("a contributing factor is undefined")]
    UndefinedFactor,
}

#[derive(Debug, Error)]
pub enum PersistenceWriteError {
    #[error("failed to write metrics record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode metrics record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink rejected metrics record: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("chart {chart} has a non-finite {what}")]
    NonFinite { chart: String, what: &'static str },

    #[error("OEE factor {factor} = {value} is outside [0, 1]")]
    RatioOutOfRange { factor: &'static str, value: f64 },
}

/// Invalid configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{component} requires `{field}`")]
    MissingSetting {
        component: &'static str,
        field: &'static str,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_record_messages() {
        let err = MalformedRecordError::DefectsExceedLot {
            defects: 12,
            lot_size: 10,
        };
        assert_eq!(err.to_string(), "defect_count 12 exceeds lot_size 10");

        let err = MalformedRecordError::MissingField("lot_size");
        assert_eq!(err.to_string(), "required field `lot_size` is missing");
    }

    #[test]
    fn test_baseline_shortfall_serializes_with_reason_tag() {
        let err = InsufficientBaselineError::too_few(Metric::CycleTime, 3, 20);
        let json = serde_json::to_value(err).unwrap();
        assert_eq!(json["metric"], "cycle_time");
        assert_eq!(json["shortfall"]["reason"], "too_few_observations");
        assert_eq!(json["shortfall"]["need"], 20);
    }

    #[test]
    fn test_persistence_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: PersistenceWriteError = io_err.into();
        assert!(matches!(err, PersistenceWriteError::Io(_)));
    }
}
