//! Event dispatcher and per-queue handlers.
//!
//! Each delivery is routed by queue (falling back to the routing key) to one
//! handler. Handlers open their own unit of work, commit once on success and
//! roll back on a fatal error. Bad items inside a message are skipped, never
//! propagated.

mod batch;
mod checkins;
mod churn;
pub mod policy;
mod reports;

pub use churn::SweepSummary;
pub use policy::{EveryNth, NeverRetrain, RetrainPolicy};
pub use reports::{LogReportSink, ReportSink};

use crate::consumer::DeliveryHandler;
use crate::metrics::PipelineMetrics;
use crate::models::inference::RiskEngine;
use crate::models::trainer::ModelTrainer;
use crate::store::{MemberStore, UnitOfWork};
use crate::types::member::Member;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Scores at or above this are logged with their risk factors
const HIGH_RISK_THRESHOLD: f64 = 0.7;

/// Handler family a queue feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Checkins,
    DailyReports,
    ChurnAnalysis,
    Batch,
}

impl QueueKind {
    /// Resolve by queue name, then by routing-key prefix
    pub fn resolve(queue: &str, subject: &str) -> Option<Self> {
        match queue {
            "checkins" => return Some(QueueKind::Checkins),
            "daily_reports" => return Some(QueueKind::DailyReports),
            "churn_analysis" => return Some(QueueKind::ChurnAnalysis),
            "batch_processing" => return Some(QueueKind::Batch),
            _ => {}
        }

        if subject.starts_with("gym.checkins.") {
            Some(QueueKind::Checkins)
        } else if subject == "gym.reports.daily" {
            Some(QueueKind::DailyReports)
        } else if subject.starts_with("gym.churn.") {
            Some(QueueKind::ChurnAnalysis)
        } else if subject.starts_with("gym.batch.") {
            Some(QueueKind::Batch)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Checkins => "checkins",
            QueueKind::DailyReports => "daily_reports",
            QueueKind::ChurnAnalysis => "churn_analysis",
            QueueKind::Batch => "batch_processing",
        }
    }
}

/// What a handler did with one delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Items applied (check-ins stored, members scored, report lines)
    pub processed: usize,
    /// Items dropped as invalid
    pub skipped: usize,
}

impl HandlerOutcome {
    pub fn processed(processed: usize) -> Self {
        Self {
            processed,
            skipped: 0,
        }
    }

    /// A whole message that was dropped
    pub fn dropped() -> Self {
        Self {
            processed: 0,
            skipped: 1,
        }
    }
}

/// Routes deliveries to handlers; shared by every queue loop
pub struct Dispatcher {
    store: Arc<dyn MemberStore>,
    trainer: Arc<ModelTrainer>,
    sink: Arc<dyn ReportSink>,
    policy: Box<dyn RetrainPolicy>,
    metrics: Arc<PipelineMetrics>,
    /// Check-ins ingested since start, fed to the retrain policy
    ingested: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MemberStore>,
        trainer: Arc<ModelTrainer>,
        sink: Arc<dyn ReportSink>,
        policy: Box<dyn RetrainPolicy>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            trainer,
            sink,
            policy,
            metrics,
            ingested: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<RiskEngine> {
        self.trainer.engine()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Decode and route one delivery
    pub async fn dispatch(&self, queue: &str, subject: &str, payload: &[u8]) -> Result<HandlerOutcome> {
        let Some(kind) = QueueKind::resolve(queue, subject) else {
            warn!(queue = %queue, subject = %subject, "No handler for delivery, dropping");
            self.metrics.record_dropped();
            return Ok(HandlerOutcome::dropped());
        };

        let body: Value = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(queue = %queue, subject = %subject, error = %e, "Malformed JSON payload, dropping");
                self.metrics.record_dropped();
                return Ok(HandlerOutcome::dropped());
            }
        };

        debug!(queue = %queue, subject = %subject, handler = kind.as_str(), "Dispatching delivery");

        match kind {
            QueueKind::Checkins => self.handle_checkins(body).await,
            QueueKind::DailyReports => self.handle_daily_report(body).await,
            QueueKind::ChurnAnalysis => self.handle_churn_analysis(body).await,
            QueueKind::Batch => self.handle_batch(body).await,
        }
    }

    /// Score `members` against their full history and stage the new scores
    async fn rescore(
        &self,
        uow: &mut dyn UnitOfWork,
        members: &[Member],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let engine = self.trainer.engine();
        let mut scores = Vec::with_capacity(members.len());

        for member in members {
            let checkins = uow.fetch_checkins(member.id, None).await?;
            let assessment = engine.assess_at(member, &checkins, now);
            self.metrics.record_score(assessment.path, assessment.score);

            if assessment.score >= HIGH_RISK_THRESHOLD {
                debug!(
                    member_id = member.id,
                    score = assessment.score,
                    path = assessment.path.as_str(),
                    factors = ?assessment.factors,
                    "High churn risk"
                );
            }
            scores.push((member.id, assessment.score));
        }

        uow.update_risk_scores(&scores).await?;
        Ok(scores.len())
    }
}

/// Commit on success, roll back (best effort) on failure
async fn finish<T>(uow: Box<dyn UnitOfWork>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn handle(&self, queue: &str, subject: &str, payload: &[u8]) -> Result<HandlerOutcome> {
        let start = Instant::now();
        let result = self.dispatch(queue, subject, payload).await;
        self.metrics
            .record_message(queue, start.elapsed(), result.is_err());
        result
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::harness;
    use super::*;
    use crate::types::member::Member;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_resolve_queue_kind() {
        assert_eq!(QueueKind::resolve("checkins", ""), Some(QueueKind::Checkins));
        assert_eq!(
            QueueKind::resolve("batch_processing", "gym.batch.nightly"),
            Some(QueueKind::Batch)
        );
        // Custom queue names fall back to the routing key
        assert_eq!(
            QueueKind::resolve("reports_v2", "gym.reports.daily"),
            Some(QueueKind::DailyReports)
        );
        assert_eq!(
            QueueKind::resolve("anything", "gym.churn.analyze"),
            Some(QueueKind::ChurnAnalysis)
        );
        assert_eq!(QueueKind::resolve("anything", "gym.unknown"), None);
    }

    #[tokio::test]
    async fn test_malformed_json_is_dropped() {
        let h = harness(Box::new(NeverRetrain));

        let outcome = h
            .dispatcher
            .dispatch("checkins", "gym.checkins.batch", b"{not json")
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::dropped());
        assert_eq!(h.dispatcher.metrics().messages_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(h.store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_records_metrics() {
        let h = harness(Box::new(NeverRetrain));
        h.store.insert_member(Member::new(1, "Ana", Utc::now()));

        let payload = br#"{"tipo": "analise_completa"}"#;
        let outcome = h
            .dispatcher
            .handle("churn_analysis", "gym.churn.analyze", payload)
            .await
            .unwrap();

        assert_eq!(outcome.processed, 1);
        let metrics = h.dispatcher.metrics();
        assert_eq!(metrics.messages_processed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_messages_by_queue().get("churn_analysis"), Some(&1));
    }
}
