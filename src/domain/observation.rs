// Observation domain model and feed adapter
use crate::domain::errors::MalformedRecordError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest count accepted from a feed. Above this an `f64` no longer holds every integer.
const MAX_EXACT_COUNT: f64 = 9_007_199_254_740_992.0;

/// A record as it arrives from a feed, before validation.
///
/// Field names also accept the column names of the production dataset
/// (`Date`, `Defects_Total`, `Production_Volume`, ...). Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "Date")]
    pub timestamp: Option<String>,
    #[serde(default, alias = "Defects_Total")]
    pub defect_count: Option<f64>,
    #[serde(default, alias = "Production_Volume")]
    pub lot_size: Option<f64>,
    #[serde(default, alias = "Average_Cycle_Time")]
    pub cycle_time: Option<f64>,
    #[serde(default, alias = "Downtime_Total")]
    pub downtime: Option<f64>,
    #[serde(default, alias = "Planned_Time")]
    pub planned_time: Option<f64>,
    /// Set when the feed could not decode the record at all.
    #[serde(skip)]
    pub parse_error: Option<String>,
}

impl RawRecord {
    /// Decode one JSON line. Undecodable lines still yield a record so the
    /// adapter can reject and count them like any other malformed input.
    pub fn from_json_line(line: &str) -> Self {
        match serde_json::from_str::<RawRecord>(line) {
            Ok(record) => record,
            Err(e) => RawRecord {
                parse_error: Some(e.to_string()),
                ..RawRecord::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Planned run time (minutes) assumed for records that do not carry one.
    pub default_planned_time: Option<f64>,
}

/// One validated production observation. Immutable once created.
/// Serialize-only: every instance goes through `Observation::new`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    timestamp: DateTime<Utc>,
    defect_count: u64,
    lot_size: u64,
    cycle_time: f64,
    downtime: f64,
    planned_time: f64,
}

impl Observation {
    pub fn new(
        timestamp: DateTime<Utc>,
        defect_count: u64,
        lot_size: u64,
        cycle_time: f64,
        downtime: f64,
        planned_time: f64,
    ) -> Result<Self, MalformedRecordError> {
        if lot_size == 0 {
            return Err(MalformedRecordError::OutOfRange {
                field: "lot_size",
                value: 0.0,
                expected: "> 0",
            });
        }
        if defect_count > lot_size {
            return Err(MalformedRecordError::DefectsExceedLot {
                defects: defect_count,
                lot_size,
            });
        }
        positive("cycle_time", cycle_time)?;
        positive("planned_time", planned_time)?;
        if !downtime.is_finite() || downtime < 0.0 {
            return Err(MalformedRecordError::OutOfRange {
                field: "downtime",
                value: downtime,
                expected: ">= 0",
            });
        }
        if downtime > planned_time {
            return Err(MalformedRecordError::DowntimeExceedsPlanned {
                downtime,
                planned_time,
            });
        }

        Ok(Self {
            timestamp,
            defect_count,
            lot_size,
            cycle_time,
            downtime,
            planned_time,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn defect_count(&self) -> u64 {
        self.defect_count
    }

    pub fn lot_size(&self) -> u64 {
        self.lot_size
    }

    /// Seconds per unit.
    pub fn cycle_time(&self) -> f64 {
        self.cycle_time
    }

    /// Minutes.
    pub fn downtime(&self) -> f64 {
        self.downtime
    }

    /// Minutes.
    pub fn planned_time(&self) -> f64 {
        self.planned_time
    }

    /// Planned time minus downtime, in minutes.
    pub fn run_time(&self) -> f64 {
        self.planned_time - self.downtime
    }

    pub fn defect_proportion(&self) -> f64 {
        self.defect_count as f64 / self.lot_size as f64
    }
}

/// Normalize a raw feed record into an `Observation`.
pub fn ingest(raw: &RawRecord, options: &IngestOptions) -> Result<Observation, MalformedRecordError> {
    if let Some(reason) = &raw.parse_error {
        return Err(MalformedRecordError::Unparseable(reason.clone()));
    }

    let timestamp_text = raw
        .timestamp
        .as_deref()
        .ok_or(MalformedRecordError::MissingField("timestamp"))?;
    let timestamp = parse_timestamp(timestamp_text)?;

    let defect_count = whole_number(
        "defect_count",
        raw.defect_count
            .ok_or(MalformedRecordError::MissingField("defect_count"))?,
    )?;
    let lot_size = whole_number(
        "lot_size",
        raw.lot_size.ok_or(MalformedRecordError::MissingField("lot_size"))?,
    )?;
    let cycle_time = raw
        .cycle_time
        .ok_or(MalformedRecordError::MissingField("cycle_time"))?;
    let downtime = raw
        .downtime
        .ok_or(MalformedRecordError::MissingField("downtime"))?;
    let planned_time = raw
        .planned_time
        .or(options.default_planned_time)
        .ok_or(MalformedRecordError::MissingField("planned_time"))?;

    Observation::new(
        timestamp,
        defect_count,
        lot_size,
        cycle_time,
        downtime,
        planned_time,
    )
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, MalformedRecordError> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MalformedRecordError::InvalidTimestamp(text.to_string()))
}

fn whole_number(field: &'static str, value: f64) -> Result<u64, MalformedRecordError> {
    if !value.is_finite() || value < 0.0 || value > MAX_EXACT_COUNT {
        return Err(MalformedRecordError::OutOfRange {
            field,
            value,
            expected: "a non-negative count",
        });
    }
    if value.fract() != 0.0 {
        return Err(MalformedRecordError::NotAnInteger { field, value });
    }
    Ok(value as u64)
}

fn positive(field: &'static str, value: f64) -> Result<(), MalformedRecordError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MalformedRecordError::OutOfRange {
            field,
            value,
            expected: "> 0",
        })
    }
}
