// SPC engine - the per-observation pipeline owned by the refresh loop
use crate::application::chart_engine::ChartEngine;
use crate::application::estimator::{ControlLimitEstimator, EstimatorSettings};
use crate::application::oee_calculator::{Admission, IntervalAccumulator, OeeCalculator};
use crate::domain::chart::{ChartId, RuleSet};
use crate::domain::limits::Metric;
use crate::domain::observation::{ingest, IngestOptions, Observation, RawRecord};
use crate::domain::oee::{OeeAverages, OeeReport};
use crate::domain::snapshot::{ChartSeries, CycleActivity, IngestStats};
use chrono::Duration;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub estimator: EstimatorSettings,
    pub rules: RuleSet,
    /// Points kept per chart for display.
    pub chart_points: usize,
    pub reporting_interval: Duration,
    /// Units per minute of run time.
    pub theoretical_rate: f64,
    pub oee_history_len: usize,
    pub ingest: IngestOptions,
}

/// OEE figures handed to the publisher alongside the charts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OeeSummary {
    pub latest: Option<OeeReport>,
    pub in_progress: Option<OeeReport>,
    pub history: Vec<OeeReport>,
    pub averages: OeeAverages,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub out_of_control_points: usize,
    /// Points plotted and intervals closed by this batch.
    pub activity: CycleActivity,
}

/// Owns all mutable SPC/OEE state. Exactly one refresh loop drives it.
pub struct SpcEngine {
    settings: EngineSettings,
    estimator: ControlLimitEstimator,
    charts: ChartEngine,
    calculator: OeeCalculator,
    accumulator: IntervalAccumulator,
    oee_history: VecDeque<OeeReport>,
    stats: IngestStats,
    next_sequence: u64,
}

impl SpcEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            estimator: ControlLimitEstimator::new(settings.estimator),
            charts: ChartEngine::new(settings.rules, settings.chart_points),
            calculator: OeeCalculator::new(settings.theoretical_rate),
            accumulator: IntervalAccumulator::new(settings.reporting_interval),
            oee_history: VecDeque::with_capacity(settings.oee_history_len),
            stats: IngestStats::default(),
            next_sequence: 0,
            settings,
        }
    }

    pub fn ingest_batch(&mut self, records: &[RawRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for raw in records {
            match ingest(raw, &self.settings.ingest) {
                Ok(observation) => {
                    self.process(observation, &mut outcome);
                    outcome.accepted += 1;
                }
                Err(e) => {
                    self.stats.rejected += 1;
                    outcome.rejected += 1;
                    tracing::warn!(error = %e, "Dropping malformed record");
                }
            }
        }
        outcome
    }

    fn process(&mut self, observation: Observation, outcome: &mut BatchOutcome) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.stats.accepted += 1;

        if self.estimator.record(observation) {
            for metric in Metric::ALL {
                if let Ok(limits) = self.estimator.current_limits(metric) {
                    tracing::trace!(
                        metric = %metric,
                        revision = limits.revision,
                        center = limits.center_line,
                        ucl = limits.upper_limit,
                        lcl = limits.lower_limit,
                        "Control limits in force"
                    );
                }
            }
        }
        let points = self.charts.plot(sequence, &observation, &self.estimator);
        outcome.out_of_control_points += points.iter().filter(|(_, p)| p.is_out_of_control()).count();
        outcome.activity.points.extend(points);

        match self.accumulator.accept(observation) {
            Admission::Open => {}
            Admission::Late => {
                self.stats.late += 1;
                tracing::debug!(
                    sequence,
                    timestamp = %observation.timestamp(),
                    "Observation predates the open reporting interval; excluded from OEE"
                );
            }
            Admission::Closed(closed) => {
                let report = self
                    .calculator
                    .compute(closed.start, closed.end, &closed.observations);
                tracing::info!(
                    interval_start = %report.interval_start,
                    observations = report.observation_count,
                    oee = ?report.oee.defined(),
                    "Closed reporting interval"
                );
                outcome.activity.closed.push(report.clone());
                self.oee_history.push_back(report);
                while self.oee_history.len() > self.settings.oee_history_len {
                    self.oee_history.pop_front();
                }
            }
        }
    }

    pub fn charts(&self) -> BTreeMap<ChartId, ChartSeries> {
        self.charts.series(&self.estimator)
    }

    pub fn oee(&self) -> OeeSummary {
        let in_progress = self
            .accumulator
            .open_interval()
            .map(|(start, end, observations)| self.calculator.compute(start, end, observations));
        OeeSummary {
            latest: self.oee_history.back().cloned(),
            in_progress,
            history: self.oee_history.iter().cloned().collect(),
            averages: OeeAverages::over(&self.oee_history),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    #[cfg(test)]
    pub fn estimator(&self) -> &ControlLimitEstimator {
        &self.estimator
    }
}
