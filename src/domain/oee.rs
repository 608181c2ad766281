// OEE report domain model
use crate::domain::errors::UndefinedMetricError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OEE factor: a ratio in [0, 1], or undefined because its denominator was zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Factor {
    Defined { value: f64 },
    Undefined { reason: UndefinedMetricError },
}

impl Factor {
    /// `numerator / denominator` clamped to [0, 1], undefined when the denominator is zero.
    pub fn ratio(numerator: f64, denominator: f64, when_zero: UndefinedMetricError) -> Self {
        if denominator > 0.0 && denominator.is_finite() && numerator.is_finite() {
            Factor::Defined {
                value: (numerator / denominator).clamp(0.0, 1.0),
            }
        } else {
            Factor::Undefined { reason: when_zero }
        }
    }

    pub fn value(&self) -> Result<f64, UndefinedMetricError> {
        match self {
            Factor::Defined { value } => Ok(*value),
            Factor::Undefined { reason } => Err(*reason),
        }
    }

    pub fn defined(&self) -> Option<f64> {
        self.value().ok()
    }

    /// Product of factors; undefined as soon as one factor is.
    pub fn product(factors: &[Factor]) -> Self {
        factors
            .iter()
            .try_fold(1.0, |acc, f| f.value().map(|v| acc * v))
            .map(|value| Factor::Defined { value })
            .unwrap_or(Factor::Undefined {
                reason: UndefinedMetricError::UndefinedFactor,
            })
    }
}

/// Quality figures derived from the defect rate of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub defect_rate: f64,
    pub first_pass_yield: f64,
    /// Defects per million opportunities, one opportunity per unit.
    pub dpmo: f64,
    /// Approximate process sigma level, 0 to 6.
    pub sigma_level: f64,
    /// First-pass yield compounded over `PROCESS_STEPS` steps.
    pub rolled_throughput_yield: f64,
}

/// Average number of process steps a unit passes through.
pub const PROCESS_STEPS: f64 = 1.5;

impl QualityMetrics {
    pub fn from_counts(defects: u64, units: u64) -> Option<Self> {
        if units == 0 {
            return None;
        }
        let defect_rate = defects as f64 / units as f64;
        let sigma_level = if defect_rate <= 0.0 {
            6.0
        } else if defect_rate >= 1.0 {
            0.0
        } else {
            (0.8406 - 3.42 * defect_rate.log10()).clamp(0.0, 6.0)
        };

        Some(Self {
            defect_rate,
            first_pass_yield: 1.0 - defect_rate,
            dpmo: defect_rate * 1_000_000.0,
            sigma_level,
            rolled_throughput_yield: (1.0 - defect_rate).powf(PROCESS_STEPS),
        })
    }
}

/// OEE figures for one reporting interval. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OeeReport {
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub availability: Factor,
    pub performance: Factor,
    pub quality: Factor,
    pub oee: Factor,
    pub observation_count: usize,
    pub units_produced: u64,
    pub defects: u64,
    /// Minutes.
    pub planned_time: f64,
    /// Minutes.
    pub run_time: f64,
    pub quality_metrics: Option<QualityMetrics>,
}

impl OeeReport {
    pub fn factors(&self) -> [(&'static str, Factor); 4] {
        [
            ("availability", self.availability),
            ("performance", self.performance),
            ("quality", self.quality),
            ("oee", self.oee),
        ]
    }
}

/// Rolling means of each factor. Each mean covers only the reports where that
/// factor is defined, so one undefined interval never drags the others down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OeeAverages {
    pub availability: Option<f64>,
    pub performance: Option<f64>,
    pub quality: Option<f64>,
    pub oee: Option<f64>,
}

impl OeeAverages {
    pub fn over<'a>(reports: impl IntoIterator<Item = &'a OeeReport> + Clone) -> Self {
        let mean = |pick: fn(&OeeReport) -> Factor| {
            let (sum, count) = reports
                .clone()
                .into_iter()
                .filter_map(|r| pick(r).defined())
                .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
            (count > 0).then(|| sum / count as f64)
        };
        Self {
            availability: mean(|r| r.availability),
            performance: mean(|r| r.performance),
            quality: mean(|r| r.quality),
            oee: mean(|r| r.oee),
        }
    }
}
