// Control limit formulas for the P-chart and the I-MR pair
use crate::domain::errors::InsufficientBaselineError;
use crate::domain::observation::Observation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// d2 for moving ranges of two consecutive points.
pub const D2: f64 = 1.128;
/// Lower-case d3 (standard deviation of the relative range) for moving ranges
/// of two points. Not the MR-chart LCL factor, which is 0 for n = 2.
pub const SMALL_D3: f64 = 0.8525;
/// MR-chart upper limit factor, 1 + 3 * d3 / d2.
pub const D4: f64 = 3.267;

/// Width of the control band in sigmas.
const SIGMA_MULTIPLIER: f64 = 3.0;

/// Moving-range means below this fraction of the center line count as zero.
const ZERO_RANGE_TOLERANCE: f64 = 1e-12;

/// A tracked process metric. Each one owns a `MetricSeries` in the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Proportion of defective units per lot (P-chart).
    DefectRate,
    /// Average cycle time in seconds (I-MR).
    CycleTime,
    /// Downtime in minutes (I-MR).
    Downtime,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::DefectRate, Metric::CycleTime, Metric::Downtime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::DefectRate => "defect_rate",
            Metric::CycleTime => "cycle_time",
            Metric::Downtime => "downtime",
        }
    }

    /// The individual value charted for this metric.
    pub fn value(&self, observation: &Observation) -> f64 {
        match self {
            Metric::DefectRate => observation.defect_proportion(),
            Metric::CycleTime => observation.cycle_time(),
            Metric::Downtime => observation.downtime(),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the center line a point falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Above,
    Below,
}

/// Control limits computed from one basis window. Replaced wholesale on recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub center_line: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub sigma: f64,
    /// Number of observations the limits were computed from.
    pub basis_window: usize,
    /// Timestamp of the newest observation in the basis window.
    pub computed_at: DateTime<Utc>,
    pub revision: u64,
}

impl ControlLimits {
    /// Side on which `value` falls outside the control limits, if any.
    pub fn beyond_limits(&self, value: f64) -> Option<Side> {
        if value > self.upper_limit {
            Some(Side::Above)
        } else if value < self.lower_limit {
            Some(Side::Below)
        } else {
            None
        }
    }

    /// Side on which `value` lies more than two sigmas from the center line, if any.
    pub fn beyond_two_sigma(&self, value: f64) -> Option<Side> {
        let band = 2.0 * self.sigma;
        if value > self.center_line + band {
            Some(Side::Above)
        } else if value < self.center_line - band {
            Some(Side::Below)
        } else {
            None
        }
    }

    pub fn is_finite(&self) -> bool {
        self.center_line.is_finite()
            && self.upper_limit.is_finite()
            && self.lower_limit.is_finite()
            && self.sigma.is_finite()
    }
}

/// Pooled totals over a P-chart basis window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProportionTotals {
    pub defects: u64,
    pub inspected: u64,
    pub count: usize,
}

impl ProportionTotals {
    pub fn from_window<'a>(window: impl IntoIterator<Item = &'a Observation>) -> Self {
        window.into_iter().fold(Self::default(), |mut acc, obs| {
            acc.add(obs);
            acc
        })
    }

    pub fn add(&mut self, observation: &Observation) {
        self.defects += observation.defect_count();
        self.inspected += observation.lot_size();
        self.count += 1;
    }

    pub fn remove(&mut self, observation: &Observation) {
        self.defects -= observation.defect_count();
        self.inspected -= observation.lot_size();
        self.count -= 1;
    }
}

/// Running sums over an individuals basis window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndividualsTotals {
    pub count: usize,
    pub sum: f64,
    /// Sum of |x[i] - x[i-1]| over adjacent pairs inside the window.
    pub moving_range_sum: f64,
}

impl IndividualsTotals {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            count: values.len(),
            sum: values.iter().sum(),
            moving_range_sum: values.windows(2).map(|w| (w[1] - w[0]).abs()).sum(),
        }
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Mean moving range, or `None` with fewer than two values.
    pub fn moving_range_mean(&self) -> Option<f64> {
        if self.count < 2 {
            None
        } else {
            Some(self.moving_range_sum / (self.count - 1) as f64)
        }
    }
}

/// P-chart limits: p-bar +/- 3 * sqrt(p-bar * (1 - p-bar) / n-bar), clamped to [0, 1].
pub fn proportion_limits(
    totals: &ProportionTotals,
    computed_at: DateTime<Utc>,
    revision: u64,
) -> Result<ControlLimits, InsufficientBaselineError> {
    if totals.count == 0 || totals.inspected == 0 {
        return Err(InsufficientBaselineError::too_few(
            Metric::DefectRate,
            totals.count,
            1,
        ));
    }

    let p_bar = totals.defects as f64 / totals.inspected as f64;
    let n_bar = totals.inspected as f64 / totals.count as f64;
    let sigma = (p_bar * (1.0 - p_bar) / n_bar).max(0.0).sqrt();

    Ok(ControlLimits {
        center_line: p_bar,
        upper_limit: (p_bar + SIGMA_MULTIPLIER * sigma).clamp(0.0, 1.0),
        lower_limit: (p_bar - SIGMA_MULTIPLIER * sigma).clamp(0.0, 1.0),
        sigma,
        basis_window: totals.count,
        computed_at,
        revision,
    })
}

/// Individuals (I) chart limits: mean +/- 3 * MR-bar / d2.
pub fn individuals_limits(
    metric: Metric,
    totals: &IndividualsTotals,
    computed_at: DateTime<Utc>,
    revision: u64,
) -> Result<ControlLimits, InsufficientBaselineError> {
    let (center, mr_bar) = usable_moving_range(metric, totals)?;
    let sigma = mr_bar / D2;

    Ok(ControlLimits {
        center_line: center,
        upper_limit: center + SIGMA_MULTIPLIER * sigma,
        lower_limit: center - SIGMA_MULTIPLIER * sigma,
        sigma,
        basis_window: totals.count,
        computed_at,
        revision,
    })
}

/// Moving-range (MR) chart limits: center MR-bar, UCL D4 * MR-bar, LCL 0.
pub fn moving_range_limits(
    metric: Metric,
    totals: &IndividualsTotals,
    computed_at: DateTime<Utc>,
    revision: u64,
) -> Result<ControlLimits, InsufficientBaselineError> {
    let (_, mr_bar) = usable_moving_range(metric, totals)?;

    Ok(ControlLimits {
        center_line: mr_bar,
        upper_limit: D4 * mr_bar,
        lower_limit: 0.0,
        sigma: SMALL_D3 * mr_bar / D2,
        basis_window: totals.count,
        computed_at,
        revision,
    })
}

fn usable_moving_range(
    metric: Metric,
    totals: &IndividualsTotals,
) -> Result<(f64, f64), InsufficientBaselineError> {
    let mr_bar = totals
        .moving_range_mean()
        .ok_or(InsufficientBaselineError::too_few(metric, totals.count, 2))?;
    let center = totals.mean();
    if !center.is_finite() || !(mr_bar > ZERO_RANGE_TOLERANCE * center.abs().max(1.0)) {
        return Err(InsufficientBaselineError::zero_moving_range(metric));
    }
    Ok((center, mr_bar))
}
