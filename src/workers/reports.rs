//! `gym.reports.daily`: trailing 30-day attendance report

use super::{Dispatcher, HandlerOutcome};
use crate::store::{CheckinWindow, UnitOfWork};
use crate::types::events::DailyReportRequest;
use crate::types::report::{DailyReport, ReportPeriod, ReportRecord, REPORT_WINDOW_DAYS};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Destination for generated daily reports
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &DailyReport) -> Result<()>;
}

/// Writes reports to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn deliver(&self, report: &DailyReport) -> Result<()> {
        let total: u32 = report.records.iter().map(|r| r.checkin_count).sum();
        info!(
            report_id = %report.report_id,
            reference_date = %report.reference_date,
            members = report.records.len(),
            checkins = total,
            "Daily report generated"
        );
        for record in &report.records {
            debug!(
                member_id = record.member_id,
                name = %record.name,
                checkins = record.checkin_count,
                ratio = record.ratio,
                period = %record.period,
                "Report line"
            );
        }
        Ok(())
    }
}

impl Dispatcher {
    pub(crate) async fn handle_daily_report(&self, payload: Value) -> Result<HandlerOutcome> {
        let request: DailyReportRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Invalid daily report request, dropping");
                self.metrics.record_dropped();
                return Ok(HandlerOutcome::dropped());
            }
        };

        let report = self.build_daily_report(request.reference_date).await?;
        self.sink.deliver(&report).await?;
        Ok(HandlerOutcome::processed(report.records.len()))
    }

    /// Per-member attendance over `[D - 30 days, D]`
    pub async fn build_daily_report(&self, reference: NaiveDate) -> Result<DailyReport> {
        let period = ReportPeriod::trailing(reference);
        let mut uow = self.store.begin().await?;
        let result = collect_records(uow.as_mut(), period).await;

        // Read-only session
        if let Err(e) = uow.rollback().await {
            warn!(error = %e, "Failed to close report session");
        }

        Ok(DailyReport::new(reference, result?))
    }
}

async fn collect_records(uow: &mut dyn UnitOfWork, period: ReportPeriod) -> Result<Vec<ReportRecord>> {
    let window = CheckinWindow::between(period.start, period.end);
    let label = period.label();
    let members = uow.list_members().await?;
    let mut records = Vec::with_capacity(members.len());

    for member in members {
        let count = uow.fetch_checkins(member.id, Some(window)).await?.len() as u32;
        records.push(ReportRecord {
            member_id: member.id,
            name: member.name,
            checkin_count: count,
            ratio: (count as f64 / REPORT_WINDOW_DAYS as f64).min(1.0),
            period: label.clone(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::harness;
    use super::super::NeverRetrain;
    use crate::types::member::{CheckinEvent, Member};
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_report_counts_only_window() {
        let h = harness(Box::new(NeverRetrain));
        let enrolled = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        h.store.insert_member(Member::new(1, "Ana", enrolled));

        // Five inside [2024-02-04, 2024-03-05], two just outside
        let stamps = [
            (2, 4, 0, 0),
            (2, 10, 12, 0),
            (2, 29, 7, 0),
            (3, 4, 8, 0),
            (3, 5, 23, 59),
            (2, 3, 23, 0),
            (3, 6, 0, 30),
        ];
        for (month, day, hour, minute) in stamps {
            let ts = Utc.with_ymd_and_hms(2024, month, day, hour, minute, 0).unwrap();
            h.store.insert_checkin(CheckinEvent::new(1, ts));
        }

        let payload = json!({"data_referencia": "2024-03-05"});
        let outcome = h
            .dispatcher
            .dispatch("daily_reports", "gym.reports.daily", payload.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome.processed, 1);

        let reports = h.sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.reference_date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(report.records[0].checkin_count, 5);
        assert!((report.records[0].ratio - 5.0 / 30.0).abs() < 1e-9);
        assert_eq!(report.records[0].period, "2024-02-04..2024-03-05");

        // Reports never write
        assert_eq!(h.store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_ratio_is_capped() {
        let h = harness(Box::new(NeverRetrain));
        let enrolled = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        h.store.insert_member(Member::new(1, "Ana", enrolled));
        for day in 5..=29 {
            for hour in [7, 19] {
                let ts = Utc.with_ymd_and_hms(2024, 2, day, hour, 0, 0).unwrap();
                h.store.insert_checkin(CheckinEvent::new(1, ts));
            }
        }

        let report = h
            .dispatcher
            .build_daily_report(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
            .await
            .unwrap();
        assert_eq!(report.records[0].checkin_count, 50);
        assert_eq!(report.records[0].ratio, 1.0);
    }
}
