//! `gym.checkins.*`: batch check-in ingestion

use super::{finish, Dispatcher, HandlerOutcome};
use crate::store::UnitOfWork;
use crate::types::events::CheckinEntry;
use crate::types::member::{CheckinEvent, Member};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

impl Dispatcher {
    /// Append every valid entry, rescore the members it touched, commit once.
    /// Then let the retrain policy decide whether a full retrain is due.
    pub(crate) async fn handle_checkins(&self, payload: Value) -> Result<HandlerOutcome> {
        let Some(raw_entries) = payload.get("checkins").and_then(Value::as_array) else {
            warn!("Check-in batch without a `checkins` array, dropping");
            self.metrics.record_dropped();
            return Ok(HandlerOutcome::dropped());
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut skipped = 0;
        for (index, raw) in raw_entries.iter().enumerate() {
            match serde_json::from_value::<CheckinEntry>(raw.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(index = index, error = %e, "Skipping malformed check-in entry");
                    skipped += 1;
                }
            }
        }

        let mut uow = self.store.begin().await?;
        let result = self.ingest(uow.as_mut(), &entries).await;
        let (ingested, unknown) = finish(uow, result).await?;
        skipped += unknown;

        self.metrics.record_ingested(ingested, skipped);
        info!(ingested = ingested, skipped = skipped, "Check-in batch processed");

        let before = self.ingested.fetch_add(ingested as u64, Ordering::Relaxed);
        let after = before + ingested as u64;
        if ingested > 0 && self.policy.should_retrain(before, after) {
            info!(total_ingested = after, "Retrain policy fired");
            // Ingestion is already committed; a failed retrain only logs
            if let Err(e) = self.retrain_from_store().await {
                warn!(error = %e, "Retrain after ingestion failed");
            }
        }

        Ok(HandlerOutcome {
            processed: ingested,
            skipped,
        })
    }

    /// Returns (ingested, skipped for unknown member)
    async fn ingest(
        &self,
        uow: &mut dyn UnitOfWork,
        entries: &[CheckinEntry],
    ) -> Result<(usize, usize)> {
        let mut touched: BTreeMap<i64, Member> = BTreeMap::new();
        let mut ingested = 0;
        let mut unknown = 0;

        for entry in entries {
            let member = match touched.get(&entry.member_id) {
                Some(member) => member.clone(),
                None => match uow.fetch_member(entry.member_id).await? {
                    Some(member) => member,
                    None => {
                        warn!(member_id = entry.member_id, "Skipping check-in for unknown member");
                        unknown += 1;
                        continue;
                    }
                },
            };

            uow.append_checkin(&CheckinEvent::new(entry.member_id, entry.timestamp))
                .await?;
            touched.insert(member.id, member);
            ingested += 1;
        }

        let members: Vec<Member> = touched.into_values().collect();
        self.rescore(uow, &members, Utc::now()).await?;

        Ok((ingested, unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::harness;
    use super::super::{EveryNth, NeverRetrain};
    use crate::types::member::Member;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_member_is_skipped_and_rest_commits() {
        let h = harness(Box::new(NeverRetrain));
        let now = Utc::now();
        h.store.insert_member(Member::new(1, "Ana", now - Duration::days(60)));

        let payload = json!({
            "checkins": [
                {"aluno_id": 1, "data": (now - Duration::hours(2)).to_rfc3339()},
                {"aluno_id": 999, "data": (now - Duration::hours(1)).to_rfc3339()},
                {"aluno_id": 1, "data": (now - Duration::days(1)).to_rfc3339()},
            ]
        });

        let outcome = h
            .dispatcher
            .dispatch("checkins", "gym.checkins.batch", payload.to_string().as_bytes())
            .await
            .unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(h.store.checkins_for(1).len(), 2);
        assert!(h.store.checkins_for(999).is_empty());
        assert_eq!(h.store.commit_count(), 1);

        let score = h.store.member(1).unwrap().risk_score;
        assert!(score > 0.0 && score <= 1.0);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let h = harness(Box::new(NeverRetrain));
        let now = Utc::now();
        h.store.insert_member(Member::new(1, "Ana", now - Duration::days(10)));

        let payload = json!({
            "checkins": [
                {"aluno_id": "one", "data": now.to_rfc3339()},
                {"aluno_id": 1, "data": "not a date"},
                {"aluno_id": 1},
                {"aluno_id": 1, "data": now.to_rfc3339()},
            ]
        });

        let outcome = h
            .dispatcher
            .dispatch("checkins", "gym.checkins.batch", payload.to_string().as_bytes())
            .await
            .unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(h.store.checkins_for(1).len(), 1);
    }

    #[tokio::test]
    async fn test_retrain_policy_fires_on_threshold() {
        let h = harness(Box::new(EveryNth(2)));
        let now = Utc::now();
        h.store.insert_member(Member::new(1, "Ana", now - Duration::days(90)));
        h.store.insert_member(
            Member::new(2, "Bruno", now - Duration::days(200)).cancelled(now - Duration::days(20)),
        );

        let payload = json!({
            "checkins": [
                {"aluno_id": 1, "data": (now - Duration::days(1)).to_rfc3339()},
                {"aluno_id": 1, "data": (now - Duration::days(3)).to_rfc3339()},
            ]
        });

        h.dispatcher
            .dispatch("checkins", "gym.checkins.batch", payload.to_string().as_bytes())
            .await
            .unwrap();

        assert!(h.dispatcher.engine().is_trained());
        assert!(h.dir.path().join("churn_model.json").exists());
    }
}
