// OEE calculator - Availability, Performance, Quality per reporting interval
use crate::domain::errors::UndefinedMetricError;
use crate::domain::observation::Observation;
use crate::domain::oee::{Factor, OeeReport, QualityMetrics};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct OeeCalculator {
    /// Theoretical production rate in units per minute of run time.
    theoretical_rate: f64,
}

impl OeeCalculator {
    pub fn new(theoretical_rate: f64) -> Self {
        Self { theoretical_rate }
    }

    /// OEE for all observations of one reporting interval.
    pub fn compute(
        &self,
        interval_start: DateTime<Utc>,
        interval_end: DateTime<Utc>,
        observations: &[Observation],
    ) -> OeeReport {
        let planned_time: f64 = observations.iter().map(|o| o.planned_time()).sum();
        let run_time: f64 = observations.iter().map(|o| o.run_time()).sum();
        let units_produced: u64 = observations.iter().map(|o| o.lot_size()).sum();
        let defects: u64 = observations.iter().map(|o| o.defect_count()).sum();

        let availability = Factor::ratio(run_time, planned_time, UndefinedMetricError::ZeroPlannedTime);
        // Performance above 1 means the line outran the configured theoretical rate;
        // Factor::ratio clamps it to 1.
        let performance = Factor::ratio(
            units_produced as f64,
            self.theoretical_rate * run_time,
            UndefinedMetricError::ZeroRunTime,
        );
        let quality = Factor::ratio(
            units_produced.saturating_sub(defects) as f64,
            units_produced as f64,
            UndefinedMetricError::ZeroUnitsProduced,
        );
        let oee = Factor::product(&[availability, performance, quality]);

        OeeReport {
            interval_start,
            interval_end,
            availability,
            performance,
            quality,
            oee,
            observation_count: observations.len(),
            units_produced,
            defects,
            planned_time,
            run_time,
            quality_metrics: QualityMetrics::from_counts(defects, units_produced),
        }
    }
}

/// Observations of a reporting interval that has just been closed.
#[derive(Debug, Clone)]
pub struct ClosedInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone)]
pub enum Admission {
    /// Added to the open interval.
    Open,
    /// Opened a new interval after closing the previous one.
    Closed(ClosedInterval),
    /// Older than the open interval; not counted toward OEE.
    Late,
}

/// Groups observations into epoch-aligned reporting intervals.
#[derive(Debug, Clone)]
pub struct IntervalAccumulator {
    length: Duration,
    open_start: Option<DateTime<Utc>>,
    observations: Vec<Observation>,
}

impl IntervalAccumulator {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            open_start: None,
            observations: Vec::new(),
        }
    }

    pub fn interval_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let len_ms = self.length.num_milliseconds().max(1);
        let start_ms = timestamp.timestamp_millis().div_euclid(len_ms) * len_ms;
        DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or(timestamp)
    }

    pub fn accept(&mut self, observation: Observation) -> Admission {
        let start = self.interval_start(observation.timestamp());
        match self.open_start {
            None => {
                self.open_start = Some(start);
                self.observations.push(observation);
                Admission::Open
            }
            Some(open) if start == open => {
                self.observations.push(observation);
                Admission::Open
            }
            Some(open) if start < open => Admission::Late,
            Some(open) => {
                let closed = ClosedInterval {
                    start: open,
                    end: open + self.length,
                    observations: std::mem::take(&mut self.observations),
                };
                self.open_start = Some(start);
                self.observations.push(observation);
                Admission::Closed(closed)
            }
        }
    }

    /// Bounds and contents of the interval still open.
    pub fn open_interval(&self) -> Option<(DateTime<Utc>, DateTime<Utc>, &[Observation])> {
        self.open_start
            .map(|start| (start, start + self.length, self.observations.as_slice()))
    }
}
