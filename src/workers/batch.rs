//! `gym.batch.*`: generic router keyed by `operacao`

use super::{Dispatcher, HandlerOutcome};
use crate::types::events::{BatchEnvelope, BatchOperation};
use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

impl Dispatcher {
    pub(crate) async fn handle_batch(&self, payload: Value) -> Result<HandlerOutcome> {
        let envelope: BatchEnvelope = match serde_json::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Batch message without an operation, dropping");
                self.metrics.record_dropped();
                return Ok(HandlerOutcome::dropped());
            }
        };

        let Some(operation) = BatchOperation::from_tag(&envelope.operation) else {
            warn!(operation = %envelope.operation, "Unknown batch operation, dropping");
            self.metrics.record_dropped();
            return Ok(HandlerOutcome::dropped());
        };

        debug!(operation = %envelope.operation, "Routing batch operation");
        let nested = envelope.nested_payload();
        match operation {
            BatchOperation::Checkins => self.handle_checkins(nested).await,
            BatchOperation::Report => self.handle_daily_report(nested).await,
            BatchOperation::Churn => self.handle_churn_analysis(nested).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::harness;
    use super::super::{HandlerOutcome, NeverRetrain};
    use crate::types::member::Member;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_routes_nested_and_flat_payloads() {
        let h = harness(Box::new(NeverRetrain));
        let now = Utc::now();
        h.store.insert_member(Member::new(1, "Ana", now - Duration::days(30)));

        let nested = json!({
            "operacao": "checkins",
            "dados": {"checkins": [{"aluno_id": 1, "data": now.to_rfc3339()}]}
        });
        let outcome = h
            .dispatcher
            .dispatch("batch_processing", "gym.batch.import", nested.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome.processed, 1);

        let flat = json!({"operacao": "relatorio", "data_referencia": now.date_naive().to_string()});
        h.dispatcher
            .dispatch("batch_processing", "gym.batch.reports", flat.to_string().as_bytes())
            .await
            .unwrap();
        let reports = h.sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].records[0].checkin_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_dropped() {
        let h = harness(Box::new(NeverRetrain));
        let payload = json!({"operacao": "delete_everything"});

        let outcome = h
            .dispatcher
            .dispatch("batch_processing", "gym.batch.x", payload.to_string().as_bytes())
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::dropped());
        assert_eq!(h.store.commit_count(), 0);
    }
}
