//! Model training: fits the normalizer and classifier, persists the artifact,
//! and installs it in the scoring engine.

use crate::error::TrainingError;
use crate::feature_extractor::{FeatureVector, FEATURE_COUNT};
use crate::models::classifier::{LogisticRegression, Normalizer, TrainingParams};
use crate::models::inference::RiskEngine;
use crate::models::loader::{ModelLoader, ScoringModel};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Trains churn classifiers for a [`RiskEngine`]
pub struct ModelTrainer {
    engine: Arc<RiskEngine>,
    loader: ModelLoader,
    params: TrainingParams,
    /// Serializes training runs so versions are assigned in order
    running: Mutex<()>,
}

impl ModelTrainer {
    pub fn new(engine: Arc<RiskEngine>, loader: ModelLoader, params: TrainingParams) -> Self {
        Self {
            engine,
            loader,
            params,
            running: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<RiskEngine> {
        &self.engine
    }

    /// Train on labeled features (`1` = churned). Returns whether a new model
    /// was persisted and installed; on `false` the previous model is untouched.
    pub fn train(&self, features: &[FeatureVector], labels: &[u8]) -> bool {
        match self.try_train(features, labels) {
            Ok(model) => {
                info!(
                    version = model.version,
                    samples = model.samples,
                    positives = model.positives,
                    "Model training succeeded"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, samples = features.len(), "Model training failed");
                false
            }
        }
    }

    /// Train and return the installed model, or why training was rejected
    pub fn try_train(
        &self,
        features: &[FeatureVector],
        labels: &[u8],
    ) -> Result<ScoringModel, TrainingError> {
        validate(features, labels)?;

        let _guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let rows: Vec<[f64; FEATURE_COUNT]> = features.iter().map(|f| f.to_array()).collect();
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(TrainingError::Numerical("non-finite feature values".to_string()));
        }

        let normalizer = Normalizer::fit(&rows)?;
        let scaled = rows
            .iter()
            .map(|row| normalizer.transform(row))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| TrainingError::Numerical(e.to_string()))?;
        let classifier = LogisticRegression::fit(&scaled, labels, &self.params)?;

        let model = ScoringModel {
            version: self.engine.current_model().version + 1,
            trained: true,
            trained_at: Some(Utc::now()),
            samples: labels.len(),
            positives: labels.iter().filter(|l| **l == 1).count(),
            normalizer,
            classifier: Some(classifier),
        };

        // Persist before installing: a failed write leaves the old model live
        self.loader.save(&model)?;
        self.engine.install(model.clone());

        Ok(model)
    }
}

fn validate(features: &[FeatureVector], labels: &[u8]) -> Result<(), TrainingError> {
    if features.len() != labels.len() {
        return Err(TrainingError::LengthMismatch {
            features: features.len(),
            labels: labels.len(),
        });
    }
    if labels.len() < 2 {
        return Err(TrainingError::TooFewSamples(labels.len()));
    }
    if let Some(bad) = labels.iter().find(|l| **l > 1) {
        return Err(TrainingError::InvalidLabel(*bad));
    }
    let positives = labels.iter().filter(|l| **l == 1).count();
    if positives == 0 || positives == labels.len() {
        return Err(TrainingError::SingleClass);
    }
    Ok(())
}
