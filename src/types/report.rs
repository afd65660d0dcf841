//! Daily attendance report records

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of the trailing attendance window, in days
pub const REPORT_WINDOW_DAYS: i64 = 30;

/// Closed time window `[start, end]` used for report queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportPeriod {
    /// `[reference - 30 days 00:00, reference 23:59:59.999]`
    pub fn trailing(reference: NaiveDate) -> Self {
        let start = (reference - Duration::days(REPORT_WINDOW_DAYS))
            .and_time(NaiveTime::MIN)
            .and_utc();
        let end = reference.and_time(NaiveTime::MIN).and_utc() + Duration::days(1)
            - Duration::milliseconds(1);
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Human-readable label, e.g. `2024-02-04..2024-03-05`
    pub fn label(&self) -> String {
        format!(
            "{}..{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// One member's line in the daily report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub member_id: i64,
    pub name: String,
    pub checkin_count: u32,
    /// `checkin_count / 30`, capped at 1.0
    pub ratio: f64,
    pub period: String,
}

/// A complete report as delivered to a sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub report_id: String,
    pub reference_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub records: Vec<ReportRecord>,
}

impl DailyReport {
    pub fn new(reference_date: NaiveDate, records: Vec<ReportRecord>) -> Self {
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            reference_date,
            generated_at: Utc::now(),
            records,
        }
    }
}
