//! Inbound event payloads and their wire formats

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Routing key for batched check-ins
pub const CHECKIN_BATCH_KEY: &str = "gym.checkins.batch";
/// Routing key for daily report requests
pub const DAILY_REPORT_KEY: &str = "gym.reports.daily";
/// Routing key for churn analysis triggers
pub const CHURN_ANALYZE_KEY: &str = "gym.churn.analyze";

/// One attendance record inside a `gym.checkins.batch` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinEntry {
    #[serde(rename = "aluno_id")]
    pub member_id: i64,

    #[serde(rename = "data", with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// `gym.checkins.batch` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinBatch {
    pub checkins: Vec<CheckinEntry>,
}

/// `gym.reports.daily` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReportRequest {
    #[serde(rename = "data_referencia", with = "iso_date")]
    pub reference_date: NaiveDate,
}

/// `gym.churn.*` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnAnalysisRequest {
    #[serde(rename = "tipo")]
    pub kind: String,

    #[serde(rename = "data", default, with = "iso_timestamp_opt")]
    pub requested_at: Option<DateTime<Utc>>,
}

/// What a churn analysis request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisKind {
    /// Rescore every member with the current model
    Full,
    /// Retrain on all members, then rescore
    Retrain,
    /// Any other tag; treated as a rescore
    Other(String),
}

impl ChurnAnalysisRequest {
    pub fn full_analysis(at: DateTime<Utc>) -> Self {
        Self {
            kind: "analise_completa".to_string(),
            requested_at: Some(at),
        }
    }

    pub fn analysis_kind(&self) -> AnalysisKind {
        match self.kind.as_str() {
            "analise_completa" | "full" => AnalysisKind::Full,
            "retreino" | "retrain" => AnalysisKind::Retrain,
            other => AnalysisKind::Other(other.to_string()),
        }
    }
}

/// Operation tag carried by `gym.batch.*` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    Checkins,
    Report,
    Churn,
}

impl BatchOperation {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "checkins" => Some(BatchOperation::Checkins),
            "relatorio" => Some(BatchOperation::Report),
            "churn" => Some(BatchOperation::Churn),
            _ => None,
        }
    }
}

/// `gym.batch.*` body: an operation tag plus the payload of the target handler,
/// either nested under `dados` or flattened next to the tag.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchEnvelope {
    #[serde(rename = "operacao")]
    pub operation: String,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl BatchEnvelope {
    /// The payload to hand to the target handler
    pub fn nested_payload(&self) -> Value {
        match self.rest.get("dados") {
            Some(nested) => nested.clone(),
            None => Value::Object(self.rest.clone()),
        }
    }
}

/// Parse an ISO 8601 timestamp.
///
/// Accepts RFC 3339, naive date-times (taken as UTC) and bare dates
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

/// Parse an ISO 8601 date; a full timestamp is truncated to its UTC date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
}

mod iso_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

mod iso_timestamp_opt {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_str(&ts.to_rfc3339()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
            None => Ok(None),
        }
    }
}

mod iso_date {
    use super::*;

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format("%Y-%m-%d").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        parse_date(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid date: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 18, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-05T18:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05T15:30:00-03:00"), Some(expected));
        // Python's datetime.isoformat() without tz
        assert_eq!(parse_timestamp("2024-03-05T18:30:00.000000"), Some(expected));

        let midnight = parse_timestamp("2024-03-05").unwrap();
        assert_eq!(midnight.hour(), 0);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_checkin_batch_wire_format() {
        let json = r#"{"checkins": [{"aluno_id": 7, "data": "2024-03-05T18:30:00"}]}"#;
        let batch: CheckinBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.checkins.len(), 1);
        assert_eq!(batch.checkins[0].member_id, 7);
        assert_eq!(batch.checkins[0].timestamp.day(), 5);
    }

    #[test]
    fn test_report_request_accepts_datetime() {
        let json = r#"{"data_referencia": "2024-03-05T10:00:00"}"#;
        let req: DailyReportRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.reference_date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn test_analysis_kind() {
        let json = r#"{"tipo": "retreino", "data": "2024-03-05T10:00:00"}"#;
        let req: ChurnAnalysisRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.analysis_kind(), AnalysisKind::Retrain);

        let json = r#"{"tipo": "analise_completa"}"#;
        let req: ChurnAnalysisRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.analysis_kind(), AnalysisKind::Full);
        assert!(req.requested_at.is_none());
    }

    #[test]
    fn test_batch_envelope_payload_shapes() {
        let nested = r#"{"operacao": "relatorio", "dados": {"data_referencia": "2024-03-05"}}"#;
        let env: BatchEnvelope = serde_json::from_str(nested).unwrap();
        assert_eq!(BatchOperation::from_tag(&env.operation), Some(BatchOperation::Report));
        let req: DailyReportRequest = serde_json::from_value(env.nested_payload()).unwrap();
        assert_eq!(req.reference_date.day(), 5);

        let flat = r#"{"operacao": "checkins", "checkins": []}"#;
        let env: BatchEnvelope = serde_json::from_str(flat).unwrap();
        let batch: CheckinBatch = serde_json::from_value(env.nested_payload()).unwrap();
        assert!(batch.checkins.is_empty());

        assert_eq!(BatchOperation::from_tag("delete_everything"), None);
    }
}
