// Snapshot domain model - the unit handed to display and persistence
use crate::domain::chart::{ChartId, ChartPoint};
use crate::domain::errors::{BaselineShortfall, PublishError};
use crate::domain::limits::ControlLimits;
use crate::domain::oee::{OeeAverages, OeeReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChartStatus {
    Active,
    Pending { shortfall: BaselineShortfall },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub status: ChartStatus,
    /// Limits currently in force, if any.
    pub limits: Option<ControlLimits>,
    /// Oldest first.
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Accepted but older than the open OEE interval, so left out of OEE.
    pub late: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub generated_at: DateTime<Utc>,
    pub charts: BTreeMap<ChartId, ChartSeries>,
    /// Latest closed reporting interval.
    pub oee: Option<OeeReport>,
    /// Provisional figures for the interval still open.
    pub oee_in_progress: Option<OeeReport>,
    /// Closed reports, oldest first.
    pub oee_history: Vec<OeeReport>,
    /// Rolling factor means over `oee_history`.
    pub oee_averages: OeeAverages,
    pub stats: IngestStats,
}

impl Snapshot {
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            generated_at,
            charts: BTreeMap::new(),
            oee: None,
            oee_in_progress: None,
            oee_history: Vec::new(),
            oee_averages: OeeAverages::default(),
            stats: IngestStats::default(),
        }
    }

    /// Reject snapshots that would show non-finite values or out-of-range ratios.
    pub fn validate(&self) -> Result<(), PublishError> {
        for (id, series) in &self.charts {
            let non_finite = |what| PublishError::NonFinite {
                chart: id.to_string(),
                what,
            };
            if series.limits.as_ref().is_some_and(|l| !l.is_finite()) {
                return Err(non_finite("control limit"));
            }
            for point in &series.points {
                if !point.plotted_value.is_finite() {
                    return Err(non_finite("plotted value"));
                }
                if point.limits.as_ref().is_some_and(|l| !l.is_finite()) {
                    return Err(non_finite("point limit"));
                }
            }
        }

        let reports = self
            .oee
            .iter()
            .chain(self.oee_in_progress.iter())
            .chain(self.oee_history.iter());
        for report in reports {
            for (factor, value) in report.factors() {
                if let Some(v) = value.defined() {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(PublishError::RatioOutOfRange { factor, value: v });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Everything one refresh cycle added, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleActivity {
    pub points: Vec<(ChartId, ChartPoint)>,
    /// Reporting intervals closed during the cycle, oldest first.
    pub closed: Vec<OeeReport>,
}

/// Row-oriented persisted form of a snapshot plus the cycle that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub sequence: u64,
    pub generated_at: DateTime<Utc>,
    pub accepted: u64,
    pub rejected: u64,
    pub late: u64,
    /// One row per chart: status and the limits in force at publish time.
    pub charts: Vec<ChartRow>,
    /// One row per point plotted since the previous record.
    pub points: Vec<PointRow>,
    /// Latest closed reporting interval.
    pub oee: Option<OeeRow>,
    /// Intervals closed since the previous record.
    pub closed_intervals: Vec<OeeRow>,
    pub oee_averages: OeeAverages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRow {
    pub chart: String,
    pub status: String,
    pub center_line: Option<f64>,
    pub upper_limit: Option<f64>,
    pub lower_limit: Option<f64>,
    pub sigma: Option<f64>,
    pub limits_revision: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRow {
    pub chart: String,
    pub observation_sequence: u64,
    pub observed_at: DateTime<Utc>,
    pub value: f64,
    pub center_line: Option<f64>,
    pub upper_limit: Option<f64>,
    pub lower_limit: Option<f64>,
    pub limits_revision: Option<u64>,
    /// Comma-separated rule identifiers violated by this point.
    pub flags: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OeeRow {
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub availability: Option<f64>,
    pub performance: Option<f64>,
    pub quality: Option<f64>,
    pub oee: Option<f64>,
    pub units_produced: u64,
    pub defects: u64,
    pub observation_count: usize,
    pub rolled_throughput_yield: Option<f64>,
}

impl From<&OeeReport> for OeeRow {
    fn from(report: &OeeReport) -> Self {
        Self {
            interval_start: report.interval_start,
            interval_end: report.interval_end,
            availability: report.availability.defined(),
            performance: report.performance.defined(),
            quality: report.quality.defined(),
            oee: report.oee.defined(),
            units_produced: report.units_produced,
            defects: report.defects,
            observation_count: report.observation_count,
            rolled_throughput_yield: report.quality_metrics.map(|q| q.rolled_throughput_yield),
        }
    }
}

impl PointRow {
    fn new(chart: ChartId, point: &ChartPoint) -> Self {
        let limits = point.limits.as_ref();
        Self {
            chart: chart.to_string(),
            observation_sequence: point.observation.sequence,
            observed_at: point.observation.timestamp,
            value: point.plotted_value,
            center_line: limits.map(|l| l.center_line),
            upper_limit: limits.map(|l| l.upper_limit),
            lower_limit: limits.map(|l| l.lower_limit),
            limits_revision: limits.map(|l| l.revision),
            flags: point
                .flags
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl MetricsRecord {
    pub fn new(snapshot: &Snapshot, activity: &CycleActivity) -> Self {
        let charts = snapshot
            .charts
            .iter()
            .map(|(id, series)| {
                let limits = series.limits.as_ref();
                ChartRow {
                    chart: id.to_string(),
                    status: match series.status {
                        ChartStatus::Active => "active".to_string(),
                        ChartStatus::Pending { .. } => "pending".to_string(),
                    },
                    center_line: limits.map(|l| l.center_line),
                    upper_limit: limits.map(|l| l.upper_limit),
                    lower_limit: limits.map(|l| l.lower_limit),
                    sigma: limits.map(|l| l.sigma),
                    limits_revision: limits.map(|l| l.revision),
                }
            })
            .collect();

        Self {
            sequence: snapshot.sequence,
            generated_at: snapshot.generated_at,
            accepted: snapshot.stats.accepted,
            rejected: snapshot.stats.rejected,
            late: snapshot.stats.late,
            charts,
            points: activity
                .points
                .iter()
                .map(|(chart, point)| PointRow::new(*chart, point))
                .collect(),
            oee: snapshot.oee.as_ref().map(OeeRow::from),
            closed_intervals: activity.closed.iter().map(OeeRow::from).collect(),
            oee_averages: snapshot.oee_averages,
        }
    }

    /// Points of this record that broke at least one rule.
    pub fn out_of_control(&self) -> impl Iterator<Item = &PointRow> {
        self.points.iter().filter(|p| !p.flags.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chart::{ObservationRef, RuleFlag};
    use crate::domain::errors::UndefinedMetricError;
    use crate::domain::oee::Factor;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, hour, 0, 0).unwrap()
    }

    fn limits() -> ControlLimits {
        ControlLimits {
            center_line: 45.0,
            upper_limit: 51.0,
            lower_limit: 39.0,
            sigma: 2.0,
            basis_window: 20,
            computed_at: at(1),
            revision: 4,
        }
    }

    fn snapshot() -> Snapshot {
        let point = ChartPoint {
            observation: ObservationRef {
                sequence: 21,
                timestamp: at(1),
            },
            plotted_value: 52.0,
            limits: Some(limits()),
            flags: BTreeSet::from([RuleFlag::BeyondControlLimits]),
        };
        let mut snapshot = Snapshot::empty(at(2));
        snapshot.sequence = 7;
        snapshot.charts.insert(
            ChartId::CycleTimeIndividuals,
            ChartSeries {
                status: ChartStatus::Active,
                limits: Some(limits()),
                points: vec![point],
            },
        );
        snapshot.charts.insert(
            ChartId::PChart,
            ChartSeries {
                status: ChartStatus::Pending {
                    shortfall: BaselineShortfall::TooFewObservations { have: 3, need: 20 },
                },
                limits: None,
                points: Vec::new(),
            },
        );
        snapshot.oee = Some(OeeReport {
            interval_start: at(0),
            interval_end: at(1),
            availability: Factor::Defined { value: 0.875 },
            performance: Factor::Defined { value: 0.9 },
            quality: Factor::Undefined {
                reason: UndefinedMetricError::ZeroUnitsProduced,
            },
            oee: Factor::Undefined {
                reason: UndefinedMetricError::UndefinedFactor,
            },
            observation_count: 1,
            units_produced: 0,
            defects: 0,
            planned_time: 480.0,
            run_time: 420.0,
            quality_metrics: None,
        });
        snapshot
    }

    fn point(sequence: u64, value: f64, flags: BTreeSet<RuleFlag>) -> ChartPoint {
        ChartPoint {
            observation: ObservationRef {
                sequence,
                timestamp: at(1),
            },
            plotted_value: value,
            limits: Some(limits()),
            flags,
        }
    }

    #[test]
    fn test_metrics_record_keeps_every_point_of_the_cycle() {
        let activity = CycleActivity {
            points: vec![
                (ChartId::CycleTimeIndividuals, point(19, 45.5, BTreeSet::new())),
                (
                    ChartId::CycleTimeIndividuals,
                    point(20, 400.0, BTreeSet::from([RuleFlag::BeyondControlLimits])),
                ),
                (ChartId::CycleTimeIndividuals, point(21, 45.2, BTreeSet::new())),
            ],
            closed: Vec::new(),
        };
        let record = MetricsRecord::new(&snapshot(), &activity);
        assert_eq!(record.sequence, 7);
        assert_eq!(record.points.len(), 3);

        let flagged: Vec<_> = record.out_of_control().collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 400.0);
        assert_eq!(flagged[0].observation_sequence, 20);
        assert_eq!(flagged[0].flags, "beyond_control_limits");
        assert_eq!(flagged[0].upper_limit, Some(51.0));
    }

    #[test]
    fn test_metrics_record_flattens_chart_state_and_oee() {
        let mut snapshot = snapshot();
        let closed = snapshot.oee.clone().into_iter().collect::<Vec<_>>();
        snapshot.oee_averages = OeeAverages::over(&closed);
        let activity = CycleActivity {
            points: Vec::new(),
            closed: closed.clone(),
        };
        let record = MetricsRecord::new(&snapshot, &activity);
        assert_eq!(record.charts.len(), 2);

        let p_chart = &record.charts[0];
        assert_eq!(p_chart.chart, "p_chart");
        assert_eq!(p_chart.status, "pending");
        assert!(p_chart.upper_limit.is_none());

        let cycle = &record.charts[1];
        assert_eq!(cycle.chart, "cycle_time_i");
        assert_eq!(cycle.limits_revision, Some(4));

        let oee = record.oee.clone().unwrap();
        assert_eq!(oee.availability, Some(0.875));
        assert_eq!(oee.quality, None);
        assert_eq!(oee.oee, None);
        assert_eq!(record.closed_intervals, vec![oee]);
        assert_eq!(record.oee_averages.availability, Some(0.875));
        assert_eq!(record.oee_averages.oee, None);
    }

    #[test]
    fn test_validate_rejects_non_finite_values() {
        let mut bad = snapshot();
        if let Some(series) = bad.charts.get_mut(&ChartId::CycleTimeIndividuals) {
            series.points[0].plotted_value = f64::NAN;
        }
        assert!(matches!(bad.validate(), Err(PublishError::NonFinite { .. })));
        assert!(snapshot().validate().is_ok());
    }

    #[test]
    fn test_snapshot_json_uses_chart_names_as_keys() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert!(json["charts"]["cycle_time_i"]["points"].is_array());
        assert_eq!(json["charts"]["p_chart"]["status"]["state"], "pending");
        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot());
    }
}
