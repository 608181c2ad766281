// Chart points and out-of-control rule classification
use crate::domain::limits::{ControlLimits, Metric};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Number of immediately preceding points the run rules may look at.
pub const LOOKBACK: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChartId {
    #[serde(rename = "p_chart")]
    PChart,
    #[serde(rename = "cycle_time_i")]
    CycleTimeIndividuals,
    #[serde(rename = "cycle_time_mr")]
    CycleTimeMovingRange,
    #[serde(rename = "downtime_i")]
    DowntimeIndividuals,
    #[serde(rename = "downtime_mr")]
    DowntimeMovingRange,
}

impl ChartId {
    pub const ALL: [ChartId; 5] = [
        ChartId::PChart,
        ChartId::CycleTimeIndividuals,
        ChartId::CycleTimeMovingRange,
        ChartId::DowntimeIndividuals,
        ChartId::DowntimeMovingRange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartId::PChart => "p_chart",
            ChartId::CycleTimeIndividuals => "cycle_time_i",
            ChartId::CycleTimeMovingRange => "cycle_time_mr",
            ChartId::DowntimeIndividuals => "downtime_i",
            ChartId::DowntimeMovingRange => "downtime_mr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == name)
    }

    pub fn metric(&self) -> Metric {
        match self {
            ChartId::PChart => Metric::DefectRate,
            ChartId::CycleTimeIndividuals | ChartId::CycleTimeMovingRange => Metric::CycleTime,
            ChartId::DowntimeIndividuals | ChartId::DowntimeMovingRange => Metric::Downtime,
        }
    }

    pub fn is_moving_range(&self) -> bool {
        matches!(
            self,
            ChartId::CycleTimeMovingRange | ChartId::DowntimeMovingRange
        )
    }
}

impl fmt::Display for ChartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a violated out-of-control rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFlag {
    /// Point beyond the 3-sigma control limits.
    BeyondControlLimits,
    /// Point and at least one of the two before it beyond 2 sigma on the same side.
    TwoOfThreeBeyondTwoSigma,
}

impl RuleFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleFlag::BeyondControlLimits => "beyond_control_limits",
            RuleFlag::TwoOfThreeBeyondTwoSigma => "two_of_three_beyond_two_sigma",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleSet {
    pub two_of_three: bool,
}

/// Reference back to the observation a point was plotted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRef {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub observation: ObservationRef,
    pub plotted_value: f64,
    /// Limits active when the point was classified; absent while the baseline is pending.
    pub limits: Option<ControlLimits>,
    pub flags: BTreeSet<RuleFlag>,
}

impl ChartPoint {
    pub fn is_out_of_control(&self) -> bool {
        !self.flags.is_empty()
    }
}

/// Classify one plotted value against the limits active for it.
///
/// `preceding` holds the plotted values immediately before this one, oldest first;
/// only the last `LOOKBACK` of them are considered.
pub fn classify(
    observation: ObservationRef,
    value: f64,
    limits: Option<&ControlLimits>,
    preceding: &[f64],
    rules: RuleSet,
) -> ChartPoint {
    let mut flags = BTreeSet::new();

    if let Some(limits) = limits {
        if limits.beyond_limits(value).is_some() {
            flags.insert(RuleFlag::BeyondControlLimits);
        }

        if rules.two_of_three {
            if let Some(side) = limits.beyond_two_sigma(value) {
                let recent = &preceding[preceding.len().saturating_sub(LOOKBACK)..];
                let same_side = recent
                    .iter()
                    .filter(|&&v| limits.beyond_two_sigma(v) == Some(side))
                    .count();
                if same_side >= 1 {
                    flags.insert(RuleFlag::TwoOfThreeBeyondTwoSigma);
                }
            }
        }
    }

    ChartPoint {
        observation,
        plotted_value: value,
        limits: limits.cloned(),
        flags,
    }
}
