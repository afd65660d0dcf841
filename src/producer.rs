//! Event and report publishers

use crate::broker::BrokerClient;
use crate::config::NatsConfig;
use crate::types::events::{
    ChurnAnalysisRequest, CheckinBatch, CheckinEntry, DailyReportRequest, CHECKIN_BATCH_KEY,
    CHURN_ANALYZE_KEY, DAILY_REPORT_KEY,
};
use crate::types::report::DailyReport;
use crate::workers::ReportSink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Publishes pipeline events onto the exchange
pub struct EventPublisher {
    broker: Mutex<BrokerClient>,
}

impl EventPublisher {
    pub fn new(config: &NatsConfig) -> Self {
        Self {
            broker: Mutex::new(BrokerClient::new(config)),
        }
    }

    /// Connect now instead of on first publish
    pub async fn connect(&self) -> Result<()> {
        self.broker.lock().await.ensure_connected().await
    }

    /// Publish any JSON payload under `routing_key`
    pub async fn publish<T: Serialize + Sync + ?Sized>(&self, routing_key: &str, payload: &T) -> Result<()> {
        self.broker.lock().await.publish(routing_key, payload).await
    }

    /// `gym.checkins.batch`
    pub async fn publish_checkin_batch(&self, checkins: Vec<CheckinEntry>) -> Result<()> {
        let count = checkins.len();
        self.publish(CHECKIN_BATCH_KEY, &CheckinBatch { checkins }).await?;
        debug!(checkins = count, "Published check-in batch");
        Ok(())
    }

    /// `gym.reports.daily` for `reference_date`
    pub async fn schedule_daily_report(&self, reference_date: NaiveDate) -> Result<()> {
        self.publish(DAILY_REPORT_KEY, &DailyReportRequest { reference_date })
            .await?;
        debug!(reference_date = %reference_date, "Scheduled daily report");
        Ok(())
    }

    /// `gym.churn.analyze` requesting a full sweep
    pub async fn trigger_churn_analysis(&self) -> Result<()> {
        self.publish(CHURN_ANALYZE_KEY, &ChurnAnalysisRequest::full_analysis(Utc::now()))
            .await?;
        debug!("Triggered churn analysis");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.broker.lock().await.close().await
    }
}

/// Publishes daily reports to a plain NATS subject
pub struct ReportProducer {
    broker: Mutex<BrokerClient>,
    subject: String,
}

impl ReportProducer {
    pub fn new(config: &NatsConfig, subject: &str) -> Self {
        Self {
            broker: Mutex::new(BrokerClient::new(config)),
            subject: subject.to_string(),
        }
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn close(&self) -> Result<()> {
        self.broker.lock().await.close().await
    }
}

#[async_trait]
impl ReportSink for ReportProducer {
    async fn deliver(&self, report: &DailyReport) -> Result<()> {
        self.broker
            .lock()
            .await
            .publish_core(&self.subject, report)
            .await?;
        info!(
            report_id = %report.report_id,
            subject = %self.subject,
            members = report.records.len(),
            "Published daily report"
        );
        Ok(())
    }
}
