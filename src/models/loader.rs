//! Scoring model artifact and its on-disk persistence

use crate::models::classifier::{LogisticRegression, Normalizer};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Normalizer + classifier pair, versioned.
///
/// Both halves live in one artifact so a reader never observes a normalizer
/// from one training run paired with a classifier from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringModel {
    /// Incremented on every successful training
    pub version: u64,
    pub trained: bool,
    pub trained_at: Option<DateTime<Utc>>,
    /// Number of training samples
    pub samples: usize,
    /// Number of positive (churned) samples
    pub positives: usize,
    pub normalizer: Normalizer,
    pub classifier: Option<LogisticRegression>,
}

impl ScoringModel {
    /// Model state at process start: heuristic scoring only
    pub fn untrained() -> Self {
        Self {
            version: 0,
            trained: false,
            trained_at: None,
            samples: 0,
            positives: 0,
            normalizer: Normalizer::default(),
            classifier: None,
        }
    }

    /// The fitted normalizer, if this model carries one
    pub fn active_normalizer(&self) -> Option<&Normalizer> {
        (self.trained && self.normalizer.is_fitted()).then_some(&self.normalizer)
    }
}

impl Default for ScoringModel {
    fn default() -> Self {
        Self::untrained()
    }
}

/// Reads and writes the model artifact file
#[derive(Debug, Clone)]
pub struct ModelLoader {
    path: PathBuf,
}

impl ModelLoader {
    /// Create a loader for the artifact at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the artifact if one exists.
    ///
    /// Returns `Ok(None)` when no artifact has been written yet.
    pub fn load(&self) -> Result<Option<ScoringModel>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No model artifact found, starting untrained");
            return Ok(None);
        }

        let bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read model artifact {:?}", self.path))?;
        let model: ScoringModel = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to decode model artifact {:?}", self.path))?;

        info!(
            path = %self.path.display(),
            version = model.version,
            trained = model.trained,
            samples = model.samples,
            "Model artifact loaded"
        );

        Ok(Some(model))
    }

    /// Load the artifact, falling back to an untrained model on any failure
    pub fn load_or_untrained(&self) -> ScoringModel {
        match self.load() {
            Ok(Some(model)) => model,
            Ok(None) => ScoringModel::untrained(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable model artifact");
                ScoringModel::untrained()
            }
        }
    }

    /// Persist the artifact atomically: write a temp file next to the target,
    /// fsync it, then rename over the target.
    pub fn save(&self, model: &ScoringModel) -> std::result::Result<(), crate::error::TrainingError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let payload = serde_json::to_vec_pretty(model)?;
        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(
            path = %self.path.display(),
            version = model.version,
            "Model artifact persisted"
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "model".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_extractor::FEATURE_COUNT;

    fn trained_model() -> ScoringModel {
        ScoringModel {
            version: 3,
            trained: true,
            trained_at: Some(Utc::now()),
            samples: 10,
            positives: 2,
            normalizer: Normalizer {
                mean: vec![0.5; FEATURE_COUNT],
                scale: vec![2.0; FEATURE_COUNT],
            },
            classifier: Some(LogisticRegression {
                weights: vec![0.1; FEATURE_COUNT],
                bias: -0.3,
                classes: vec![0, 1],
            }),
        }
    }

    #[test]
    fn test_missing_artifact_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(dir.path().join("churn_model.json"));
        assert!(loader.load().unwrap().is_none());
        assert!(!loader.load_or_untrained().trained);
    }

    #[test]
    fn test_save_replaces_artifact_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(dir.path().join("models").join("churn_model.json"));

        loader.save(&ScoringModel::untrained()).unwrap();
        let model = trained_model();
        loader.save(&model).unwrap();

        assert_eq!(loader.load().unwrap(), Some(model));
        assert!(!loader.temp_path().exists());
    }

    #[test]
    fn test_corrupt_artifact_falls_back_to_untrained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("churn_model.json");
        fs::write(&path, b"{not json").unwrap();

        let loader = ModelLoader::new(&path);
        assert!(loader.load().is_err());
        assert_eq!(loader.load_or_untrained(), ScoringModel::untrained());
    }
}
