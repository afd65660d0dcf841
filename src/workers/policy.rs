//! Retraining cadence, evaluated against the running count of ingested check-ins

/// Decides whether ingesting check-ins should trigger a full retrain
pub trait RetrainPolicy: Send + Sync {
    /// Called after a batch moved the ingested total from `before` to `after`
    fn should_retrain(&self, before: u64, after: u64) -> bool;
}

/// Retrain each time the total crosses a multiple of `n`
#[derive(Debug, Clone, Copy)]
pub struct EveryNth(pub u64);

impl RetrainPolicy for EveryNth {
    fn should_retrain(&self, before: u64, after: u64) -> bool {
        self.0 > 0 && after / self.0 > before / self.0
    }
}

/// Never retrain on ingestion; retraining only via `gym.churn.*` requests
#[derive(Debug, Clone, Copy)]
pub struct NeverRetrain;

impl RetrainPolicy for NeverRetrain {
    fn should_retrain(&self, _before: u64, _after: u64) -> bool {
        false
    }
}

/// Policy for a `pipeline.retrain_every` setting (0 disables)
pub fn from_interval(retrain_every: u64) -> Box<dyn RetrainPolicy> {
    if retrain_every == 0 {
        Box::new(NeverRetrain)
    } else {
        Box::new(EveryNth(retrain_every))
    }
}
