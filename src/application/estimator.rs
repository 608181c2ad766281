// Control-limit estimator - rolling baselines per metric and the re-baselining policy
use crate::domain::chart::ChartId;
use crate::domain::errors::InsufficientBaselineError;
use crate::domain::limits::{
    individuals_limits, moving_range_limits, proportion_limits, ControlLimits,
    IndividualsTotals, Metric, ProportionTotals,
};
use crate::domain::observation::Observation;
use std::collections::{BTreeMap, VecDeque};

/// When control limits are recomputed from the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaselinePolicy {
    /// After every accepted observation.
    PerObservation,
    /// Once `every` observations have accumulated since the last recompute.
    /// Limits still appear as soon as the baseline first becomes sufficient.
    Batch { every: usize },
}

/// How the window statistics feeding the limits are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitComputation {
    /// Re-sum the whole window on every recompute.
    FullRecompute,
    /// Use running sums maintained on append and eviction.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorSettings {
    pub retention_window: usize,
    pub min_baseline: usize,
    pub policy: RebaselinePolicy,
    pub computation: LimitComputation,
}

/// Bounded, append-only window of observations for one metric.
#[derive(Debug, Clone)]
struct MetricSeries {
    metric: Metric,
    window: VecDeque<Observation>,
    capacity: usize,
    proportion: ProportionTotals,
    individuals: IndividualsTotals,
}

impl MetricSeries {
    fn new(metric: Metric, capacity: usize) -> Self {
        Self {
            metric,
            window: VecDeque::with_capacity(capacity + 1),
            capacity,
            proportion: ProportionTotals::default(),
            individuals: IndividualsTotals::default(),
        }
    }

    fn push(&mut self, observation: Observation) {
        let value = self.metric.value(&observation);
        if let Some(previous) = self.window.back() {
            self.individuals.moving_range_sum += (value - self.metric.value(previous)).abs();
        }
        self.individuals.sum += value;
        self.individuals.count += 1;
        self.proportion.add(&observation);
        self.window.push_back(observation);

        while self.window.len() > self.capacity {
            let Some(evicted) = self.window.pop_front() else {
                break;
            };
            let old = self.metric.value(&evicted);
            if let Some(next) = self.window.front() {
                self.individuals.moving_range_sum -= (self.metric.value(next) - old).abs();
            }
            self.individuals.sum -= old;
            self.individuals.count -= 1;
            self.proportion.remove(&evicted);
        }
        self.individuals.moving_range_sum = self.individuals.moving_range_sum.max(0.0);
    }

    fn len(&self) -> usize {
        self.window.len()
    }

    fn values(&self) -> Vec<f64> {
        self.window.iter().map(|o| self.metric.value(o)).collect()
    }

    fn proportion_totals(&self, computation: LimitComputation) -> ProportionTotals {
        match computation {
            LimitComputation::FullRecompute => ProportionTotals::from_window(&self.window),
            LimitComputation::Incremental => self.proportion,
        }
    }

    fn individuals_totals(&self, computation: LimitComputation) -> IndividualsTotals {
        match computation {
            LimitComputation::FullRecompute => IndividualsTotals::from_values(&self.values()),
            LimitComputation::Incremental => self.individuals,
        }
    }
}

/// Owns every metric series and the control limits currently in force.
#[derive(Debug, Clone)]
pub struct ControlLimitEstimator {
    settings: EstimatorSettings,
    series: BTreeMap<Metric, MetricSeries>,
    limits: BTreeMap<ChartId, Result<ControlLimits, InsufficientBaselineError>>,
    revisions: BTreeMap<ChartId, u64>,
    since_rebaseline: BTreeMap<ChartId, usize>,
}

impl ControlLimitEstimator {
    pub fn new(settings: EstimatorSettings) -> Self {
        tracing::info!(
            retention_window = settings.retention_window,
            min_baseline = settings.min_baseline,
            policy = ?settings.policy,
            computation = ?settings.computation,
            "Control-limit estimator configured"
        );

        let series = Metric::ALL
            .into_iter()
            .map(|m| (m, MetricSeries::new(m, settings.retention_window)))
            .collect();
        let limits = ChartId::ALL
            .into_iter()
            .map(|c| {
                let pending = InsufficientBaselineError::too_few(c.metric(), 0, settings.min_baseline);
                (c, Err(pending))
            })
            .collect();

        Self {
            settings,
            series,
            limits,
            revisions: BTreeMap::new(),
            since_rebaseline: BTreeMap::new(),
        }
    }

    /// Append an observation to every metric series and re-baseline if the policy says so.
    /// Returns whether any limits were recomputed.
    pub fn record(&mut self, observation: Observation) -> bool {
        for series in self.series.values_mut() {
            series.push(observation);
        }

        let mut recomputed = false;
        for chart in ChartId::ALL {
            let since = {
                let counter = self.since_rebaseline.entry(chart).or_insert(0);
                *counter += 1;
                *counter
            };

            let len = self.series_len(chart.metric());
            if len < self.settings.min_baseline {
                self.limits.insert(
                    chart,
                    Err(InsufficientBaselineError::too_few(
                        chart.metric(),
                        len,
                        self.settings.min_baseline,
                    )),
                );
                continue;
            }

            let due = match self.settings.policy {
                RebaselinePolicy::PerObservation => true,
                RebaselinePolicy::Batch { every } => since >= every,
            };
            let first_baseline = self.limits.get(&chart).is_some_and(|l| l.is_err());
            if due || first_baseline {
                self.recompute(chart);
                self.since_rebaseline.insert(chart, 0);
                recomputed = true;
            }
        }
        recomputed
    }

    /// P-chart limits for `defect_rate`, I-chart limits for the continuous metrics.
    pub fn current_limits(&self, metric: Metric) -> Result<ControlLimits, InsufficientBaselineError> {
        let chart = match metric {
            Metric::DefectRate => ChartId::PChart,
            Metric::CycleTime => ChartId::CycleTimeIndividuals,
            Metric::Downtime => ChartId::DowntimeIndividuals,
        };
        self.limits_for(chart).cloned()
    }

    pub fn limits_for(&self, chart: ChartId) -> Result<&ControlLimits, InsufficientBaselineError> {
        match self.limits.get(&chart) {
            Some(Ok(limits)) => Ok(limits),
            Some(Err(e)) => Err(*e),
            None => Err(InsufficientBaselineError::too_few(
                chart.metric(),
                0,
                self.settings.min_baseline,
            )),
        }
    }

    pub fn series_len(&self, metric: Metric) -> usize {
        self.series.get(&metric).map(MetricSeries::len).unwrap_or(0)
    }

    /// Observations currently retained for `metric`, oldest first.
    #[cfg(test)]
    pub fn window(&self, metric: Metric) -> impl Iterator<Item = &Observation> + '_ {
        self.series.get(&metric).into_iter().flat_map(|s| s.window.iter())
    }

    fn recompute(&mut self, chart: ChartId) {
        let metric = chart.metric();
        let Some(series) = self.series.get(&metric) else {
            return;
        };
        let Some(newest) = series.window.back() else {
            return;
        };
        let computed_at = newest.timestamp();
        let revision = self.revisions.get(&chart).copied().unwrap_or(0) + 1;
        let computation = self.settings.computation;

        let result = match chart {
            ChartId::PChart => {
                proportion_limits(&series.proportion_totals(computation), computed_at, revision)
            }
            ChartId::CycleTimeIndividuals | ChartId::DowntimeIndividuals => individuals_limits(
                metric,
                &series.individuals_totals(computation),
                computed_at,
                revision,
            ),
            ChartId::CycleTimeMovingRange | ChartId::DowntimeMovingRange => moving_range_limits(
                metric,
                &series.individuals_totals(computation),
                computed_at,
                revision,
            ),
        };

        match &result {
            Ok(limits) => {
                self.revisions.insert(chart, revision);
                tracing::debug!(
                    chart = %chart,
                    revision,
                    center = limits.center_line,
                    ucl = limits.upper_limit,
                    lcl = limits.lower_limit,
                    "Recomputed control limits"
                );
            }
            Err(e) => {
                tracing::debug!(chart = %chart, error = %e, "Control limits pending");
            }
        }
        self.limits.insert(chart, result);
    }
}
