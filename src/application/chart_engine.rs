// Chart engine - classifies each observation on every chart and keeps the chart series
use crate::application::estimator::ControlLimitEstimator;
use crate::domain::chart::{classify, ChartId, ChartPoint, ObservationRef, RuleSet, LOOKBACK};
use crate::domain::limits::Metric;
use crate::domain::observation::Observation;
use crate::domain::snapshot::{ChartSeries, ChartStatus};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Default)]
struct ChartTrack {
    /// Plotted values preceding the next point, bounded by `LOOKBACK`.
    recent: VecDeque<f64>,
    points: VecDeque<ChartPoint>,
}

#[derive(Debug, Clone)]
pub struct ChartEngine {
    rules: RuleSet,
    history_len: usize,
    tracks: BTreeMap<ChartId, ChartTrack>,
    /// Last individual value per continuous metric, for moving ranges.
    last_values: BTreeMap<Metric, f64>,
}

impl ChartEngine {
    pub fn new(rules: RuleSet, history_len: usize) -> Self {
        Self {
            rules,
            history_len,
            tracks: ChartId::ALL
                .into_iter()
                .map(|id| (id, ChartTrack::default()))
                .collect(),
            last_values: BTreeMap::new(),
        }
    }

    /// Plot one observation on every chart against the limits currently in force.
    /// Returns the new points, keyed by chart.
    pub fn plot(
        &mut self,
        sequence: u64,
        observation: &Observation,
        estimator: &ControlLimitEstimator,
    ) -> Vec<(ChartId, ChartPoint)> {
        let obs_ref = ObservationRef {
            sequence,
            timestamp: observation.timestamp(),
        };

        let mut plotted = Vec::with_capacity(ChartId::ALL.len());
        for chart in ChartId::ALL {
            let metric = chart.metric();
            let individual = metric.value(observation);
            let value = if chart.is_moving_range() {
                match self.last_values.get(&metric) {
                    Some(previous) => (individual - previous).abs(),
                    None => continue,
                }
            } else {
                individual
            };

            let limits = estimator.limits_for(chart).ok();
            let Some(track) = self.tracks.get_mut(&chart) else {
                continue;
            };
            let preceding: Vec<f64> = track.recent.iter().copied().collect();
            let point = classify(obs_ref, value, limits, &preceding, self.rules);

            track.recent.push_back(value);
            while track.recent.len() > LOOKBACK {
                track.recent.pop_front();
            }
            track.points.push_back(point.clone());
            while track.points.len() > self.history_len {
                track.points.pop_front();
            }

            if point.is_out_of_control() {
                tracing::info!(
                    chart = %chart,
                    sequence,
                    value,
                    flags = ?point.flags,
                    "Out-of-control point"
                );
            }
            plotted.push((chart, point));
        }

        for metric in [Metric::CycleTime, Metric::Downtime] {
            self.last_values.insert(metric, metric.value(observation));
        }
        plotted
    }

    /// Chart-ready series for every chart, with the limits currently in force.
    pub fn series(&self, estimator: &ControlLimitEstimator) -> BTreeMap<ChartId, ChartSeries> {
        ChartId::ALL
            .into_iter()
            .map(|chart| {
                let (status, limits) = match estimator.limits_for(chart) {
                    Ok(limits) => (ChartStatus::Active, Some(limits.clone())),
                    Err(e) => (
                        ChartStatus::Pending {
                            shortfall: e.shortfall,
                        },
                        None,
                    ),
                };
                let points = self
                    .tracks
                    .get(&chart)
                    .map(|t| t.points.iter().cloned().collect())
                    .unwrap_or_default();
                (
                    chart,
                    ChartSeries {
                        status,
                        limits,
                        points,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::estimator::{EstimatorSettings, LimitComputation, RebaselinePolicy};
    use crate::domain::chart::RuleFlag;
    use chrono::{Duration, TimeZone, Utc};

    fn estimator(window: usize, min: usize) -> ControlLimitEstimator {
        ControlLimitEstimator::new(EstimatorSettings {
            retention_window: window,
            min_baseline: min,
            policy: RebaselinePolicy::PerObservation,
            computation: LimitComputation::FullRecompute,
        })
    }

    fn obs(i: i64, cycle: f64) -> Observation {
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + Duration::hours(i);
        Observation::new(ts, 2, 100, cycle, 10.0 + (i % 3) as f64, 480.0).unwrap()
    }

    #[test]
    fn test_moving_range_starts_at_second_observation() {
        let mut est = estimator(30, 20);
        let mut engine = ChartEngine::new(RuleSet::default(), 30);

        est.record(obs(0, 40.0));
        let first = engine.plot(0, &obs(0, 40.0), &est);
        assert!(first.iter().all(|(id, _)| !id.is_moving_range()));

        est.record(obs(1, 43.0));
        let second = engine.plot(1, &obs(1, 43.0), &est);
        let mr = second
            .iter()
            .find(|(id, _)| *id == ChartId::CycleTimeMovingRange)
            .map(|(_, p)| p.plotted_value);
        assert_eq!(mr, Some(3.0));
    }

    #[test]
    fn test_points_are_unflagged_while_pending() {
        let mut est = estimator(30, 20);
        let mut engine = ChartEngine::new(RuleSet { two_of_three: true }, 30);
        for i in 0..5 {
            let o = obs(i, 40.0 + 50.0 * i as f64);
            est.record(o);
            for (_, point) in engine.plot(i as u64, &o, &est) {
                assert!(point.flags.is_empty());
                assert!(point.limits.is_none());
            }
        }
        let series = engine.series(&est);
        assert!(matches!(
            series[&ChartId::CycleTimeIndividuals].status,
            ChartStatus::Pending { .. }
        ));
    }

    #[test]
    fn test_spike_is_flagged_after_baseline() {
        let mut est = estimator(30, 5);
        let mut engine = ChartEngine::new(RuleSet::default(), 30);
        let cycles = [45.0, 46.0, 44.5, 45.5, 45.0, 44.8, 45.2, 90.0];
        let mut last = Vec::new();
        for (i, &c) in cycles.iter().enumerate() {
            let o = obs(i as i64, c);
            est.record(o);
            last = engine.plot(i as u64, &o, &est);
        }
        let spike = last
            .iter()
            .find(|(id, _)| *id == ChartId::CycleTimeIndividuals)
            .map(|(_, p)| p.clone())
            .unwrap();
        assert!(spike.flags.contains(&RuleFlag::BeyondControlLimits));
        assert!(spike.limits.is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut est = estimator(10, 2);
        let mut engine = ChartEngine::new(RuleSet::default(), 4);
        for i in 0..12 {
            let o = obs(i, 40.0 + (i % 5) as f64);
            est.record(o);
            engine.plot(i as u64, &o, &est);
        }
        let series = engine.series(&est);
        let points = &series[&ChartId::PChart].points;
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].observation.sequence, 8);
        assert_eq!(points[3].observation.sequence, 11);
    }
}
