//! `gym.churn.*`: rescoring sweeps and full retraining from the store

use super::{finish, Dispatcher, HandlerOutcome};
use crate::feature_extractor::FeatureVector;
use crate::store::UnitOfWork;
use crate::types::events::{AnalysisKind, ChurnAnalysisRequest};
use crate::types::member::Member;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

/// Result of a sweep over the member base
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// A new model was trained and installed during the sweep
    pub trained: bool,
    /// Members whose score was rewritten
    pub rescored: usize,
}

impl Dispatcher {
    pub(crate) async fn handle_churn_analysis(&self, payload: Value) -> Result<HandlerOutcome> {
        let request: ChurnAnalysisRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Invalid churn analysis request, dropping");
                self.metrics.record_dropped();
                return Ok(HandlerOutcome::dropped());
            }
        };

        let kind = request.analysis_kind();
        info!(
            kind = %request.kind,
            requested_at = ?request.requested_at,
            "Churn analysis requested"
        );

        let summary = match kind {
            AnalysisKind::Retrain => self.sweep(true, false).await?,
            AnalysisKind::Full => self.sweep(false, false).await?,
            AnalysisKind::Other(tag) => {
                warn!(kind = %tag, "Unrecognized analysis kind, rescoring only");
                self.sweep(false, false).await?
            }
        };

        Ok(HandlerOutcome::processed(summary.rescored))
    }

    /// Train on every member (cancelled = churned), then rescore active members
    pub async fn retrain_from_store(&self) -> Result<SweepSummary> {
        self.sweep(true, true).await
    }

    async fn sweep(&self, retrain: bool, active_only: bool) -> Result<SweepSummary> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;
        let result = self.sweep_in(uow.as_mut(), retrain, active_only, now).await;
        let summary = finish(uow, result).await?;

        info!(
            trained = summary.trained,
            rescored = summary.rescored,
            model_version = self.engine().current_model().version,
            "Churn sweep committed"
        );
        Ok(summary)
    }

    async fn sweep_in(
        &self,
        uow: &mut dyn UnitOfWork,
        retrain: bool,
        active_only: bool,
        now: DateTime<Utc>,
    ) -> Result<SweepSummary> {
        let members = uow.list_members().await?;

        let trained = if retrain {
            self.train_on(uow, &members, now).await?
        } else {
            false
        };

        let targets: Vec<Member> = if active_only {
            members.into_iter().filter(Member::is_active).collect()
        } else {
            members
        };
        let rescored = self.rescore(uow, &targets, now).await?;

        Ok(SweepSummary { trained, rescored })
    }

    /// Build the labeled set and run the trainer off the async runtime
    async fn train_on(
        &self,
        uow: &mut dyn UnitOfWork,
        members: &[Member],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let extractor = self.engine().extractor();
        let mut features: Vec<FeatureVector> = Vec::with_capacity(members.len());
        let mut labels: Vec<u8> = Vec::with_capacity(members.len());

        for member in members {
            let checkins = uow.fetch_checkins(member.id, None).await?;
            // Cancelled members are observed as of their cancellation
            let as_of = member.cancelled_at.map_or(now, |at| at.min(now));
            match extractor.extract(member, &checkins, as_of) {
                Ok(f) => {
                    features.push(f);
                    labels.push(member.status().churn_label());
                }
                Err(e) => warn!(member_id = member.id, error = %e, "Excluding member from training set"),
            }
        }

        let samples = labels.len();
        let positives = labels.iter().filter(|l| **l == 1).count();
        info!(samples = samples, positives = positives, "Training churn model");

        let trainer = self.trainer.clone();
        let trained = tokio::task::spawn_blocking(move || trainer.train(&features, &labels))
            .await
            .context("Training task panicked")?;

        self.metrics.record_training(trained);
        Ok(trained)
    }
}
