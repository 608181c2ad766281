// InfluxDB sink - line protocol writes and InfluxQL read-back
use crate::application::snapshot_sink::SnapshotSink;
use crate::domain::errors::PersistenceWriteError;
use crate::domain::snapshot::MetricsRecord;
use crate::infrastructure::config::InfluxSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    host: String,
    token: String,
    database: String,
    retention_policy: String,
    measurement: String,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResponse {
    results: Vec<InfluxQLResult>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResult {
    #[serde(default)]
    series: Option<Vec<InfluxQLSeries>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLSeries {
    columns: Vec<String>,
    values: Vec<Vec<serde_json::Value>>,
}

impl InfluxSink {
    pub fn new(settings: InfluxSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: settings.host.trim_end_matches('/').to_string(),
            token: settings.token,
            database: settings.database,
            retention_policy: settings.retention_policy,
            measurement: settings.measurement,
        }
    }

    fn write_url(&self) -> String {
        format!(
            "{}/write?db={}&rp={}&precision=u",
            self.host,
            urlencoding::encode(&self.database),
            urlencoding::encode(&self.retention_policy)
        )
    }

    fn build_query_url(&self, query: &str) -> String {
        format!(
            "{}/query?db={}&rp={}&q={}",
            self.host,
            urlencoding::encode(&self.database),
            urlencoding::encode(&self.retention_policy),
            urlencoding::encode(query)
        )
    }

    async fn execute_query(&self, query: &str) -> Result<InfluxQLResponse> {
        let response = self
            .client
            .get(self.build_query_url(query))
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send request to InfluxDB")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("InfluxDB query failed with status {}: {}", status, body);
        }

        let data = response
            .json::<InfluxQLResponse>()
            .await
            .context("Failed to parse InfluxDB response")?;

        if let Some(error) = data.results.first().and_then(|r| r.error.as_ref()) {
            anyhow::bail!("InfluxDB query error: {}", error);
        }

        Ok(data)
    }
}

fn escape_key(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_string_field(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One line per record. Chart state, the newest point of each chart, and OEE
/// are flattened into fields for dashboards; the full record, every point
/// included, travels as JSON in the `record` field.
fn to_line_protocol(measurement: &str, record: &MetricsRecord) -> Result<String, serde_json::Error> {
    let mut fields = vec![
        format!("sequence={}i", record.sequence),
        format!("accepted={}i", record.accepted),
        format!("rejected={}i", record.rejected),
        format!("late={}i", record.late),
        format!("points={}i", record.points.len()),
        format!("out_of_control={}i", record.out_of_control().count()),
    ];
    for row in &record.charts {
        let chart = escape_key(&row.chart);
        let newest = record.points.iter().rev().find(|p| p.chart == row.chart);
        let columns = [
            ("value", newest.map(|p| p.value)),
            ("center", row.center_line),
            ("ucl", row.upper_limit),
            ("lcl", row.lower_limit),
        ];
        for (suffix, value) in columns {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                fields.push(format!("{chart}_{suffix}={v}"));
            }
        }
    }
    if let Some(oee) = &record.oee {
        let columns = [
            ("availability", oee.availability),
            ("performance", oee.performance),
            ("quality", oee.quality),
            ("oee", oee.oee),
            ("rty", oee.rolled_throughput_yield),
        ];
        for (name, value) in columns {
            if let Some(v) = value {
                fields.push(format!("{name}={v}"));
            }
        }
    }
    let averages = [
        ("availability_average", record.oee_averages.availability),
        ("performance_average", record.oee_averages.performance),
        ("quality_average", record.oee_averages.quality),
        ("oee_average", record.oee_averages.oee),
    ];
    for (name, value) in averages {
        if let Some(v) = value {
            fields.push(format!("{name}={v}"));
        }
    }
    let json = serde_json::to_string(record)?;
    fields.push(format!("record=\"{}\"", escape_string_field(&json)));

    // Microseconds: consecutive snapshots may be only 1us apart.
    Ok(format!(
        "{} {} {}",
        escape_key(measurement),
        fields.join(","),
        record.generated_at.timestamp_micros()
    ))
}

fn records_from_response(response: InfluxQLResponse) -> Result<Vec<MetricsRecord>> {
    let mut records = Vec::new();
    for series in response.results.into_iter().flat_map(|r| r.series.unwrap_or_default()) {
        let Some(record_idx) = series.columns.iter().position(|c| c == "record") else {
            continue;
        };
        for row in &series.values {
            if let Some(json) = row.get(record_idx).and_then(|v| v.as_str()) {
                let record = serde_json::from_str::<MetricsRecord>(json)
                    .context("Stored metrics record is not valid JSON")?;
                records.push(record);
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl SnapshotSink for InfluxSink {
    async fn append(&self, record: &MetricsRecord) -> Result<(), PersistenceWriteError> {
        let body = to_line_protocol(&self.measurement, record)?;
        let response = self
            .client
            .post(self.write_url())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| PersistenceWriteError::Rejected(format!("InfluxDB unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceWriteError::Rejected(format!(
                "InfluxDB write failed with status {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<MetricsRecord>> {
        let query = format!(
            "SELECT \"record\" FROM \"{}\" ORDER BY time ASC",
            self.measurement.replace('"', "\\\"")
        );
        tracing::debug!("Executing history query: {}", query);
        let response = self.execute_query(&query).await?;
        records_from_response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::oee::OeeAverages;
    use crate::domain::snapshot::{ChartRow, OeeRow, PointRow};
    use chrono::{TimeZone, Utc};

    fn record() -> MetricsRecord {
        let at = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        let point = |sequence, value, flags: &str| PointRow {
            chart: "p_chart".to_string(),
            observation_sequence: sequence,
            observed_at: at,
            value,
            center_line: Some(0.015),
            upper_limit: Some(0.05),
            lower_limit: Some(0.0),
            limits_revision: Some(3),
            flags: flags.to_string(),
        };
        MetricsRecord {
            sequence: 7,
            generated_at: at + chrono::Duration::microseconds(1),
            accepted: 40,
            rejected: 2,
            late: 1,
            charts: vec![ChartRow {
                chart: "p_chart".to_string(),
                status: "active".to_string(),
                center_line: Some(0.015),
                upper_limit: Some(0.05),
                lower_limit: Some(0.0),
                sigma: Some(0.01),
                limits_revision: Some(3),
            }],
            points: vec![point(38, 0.09, "beyond_control_limits"), point(39, 0.02, "")],
            oee: Some(OeeRow {
                interval_start: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                interval_end: at,
                availability: Some(0.875),
                performance: Some(0.9),
                quality: None,
                oee: None,
                units_produced: 0,
                defects: 0,
                observation_count: 1,
                rolled_throughput_yield: None,
            }),
            closed_intervals: Vec::new(),
            oee_averages: OeeAverages {
                availability: Some(0.8),
                ..OeeAverages::default()
            },
        }
    }

    #[test]
    fn test_line_protocol_fields() {
        let line = to_line_protocol("spc metrics", &record()).unwrap();
        assert!(line.starts_with(
            "spc\\ metrics sequence=7i,accepted=40i,rejected=2i,late=1i,points=2i,out_of_control=1i,"
        ));
        assert!(line.contains("p_chart_value=0.02,"));
        assert!(line.contains("p_chart_ucl=0.05"));
        assert!(line.contains("availability=0.875"));
        assert!(line.contains("availability_average=0.8"));
        assert!(!line.contains("quality="));
        assert!(line.contains(r#"record="{\"sequence\":7"#));
        assert!(line.ends_with(" 1672617600000001"));
    }

    #[test]
    fn test_query_url_is_encoded() {
        let sink = InfluxSink::new(InfluxSettings {
            host: "http://localhost:8086/".to_string(),
            token: "t".to_string(),
            database: "factory line".to_string(),
            retention_policy: "autogen".to_string(),
            measurement: "spc_metrics".to_string(),
        });
        assert_eq!(
            sink.write_url(),
            "http://localhost:8086/write?db=factory%20line&rp=autogen&precision=u"
        );
        assert!(sink
            .build_query_url("SELECT \"record\" FROM \"spc_metrics\"")
            .starts_with("http://localhost:8086/query?db=factory%20line&rp=autogen&q=SELECT%20"));
    }

    #[test]
    fn test_records_from_query_response() {
        let stored = serde_json::to_string(&record()).unwrap();
        let body = serde_json::json!({
            "results": [{
                "statement_id": 0,
                "series": [{
                    "name": "spc_metrics",
                    "columns": ["time", "record"],
                    "values": [["2023-01-02T00:00:00Z", stored]]
                }]
            }]
        });
        let response: InfluxQLResponse = serde_json::from_value(body).unwrap();
        assert_eq!(records_from_response(response).unwrap(), vec![record()]);
    }

    #[test]
    fn test_empty_query_response() {
        let response: InfluxQLResponse =
            serde_json::from_value(serde_json::json!({"results": [{"statement_id": 0}]})).unwrap();
        assert!(records_from_response(response).unwrap().is_empty());
    }
}
