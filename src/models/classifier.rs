//! Feature normalizer and logistic-regression churn classifier

use crate::error::TrainingError;
use crate::feature_extractor::FEATURE_COUNT;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Logistic function, stable for large |z|
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Standard-score scaler fitted on training features.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub mean: Vec<f64>,
    /// Population standard deviation per feature; constant features get 1.0
    pub scale: Vec<f64>,
}

impl Normalizer {
    /// Fit mean and scale on a set of feature rows
    pub fn fit(rows: &[[f64; FEATURE_COUNT]]) -> Result<Self, TrainingError> {
        if rows.is_empty() {
            return Err(TrainingError::TooFewSamples(0));
        }
        let n = rows.len() as f64;

        let mut mean = vec![0.0; FEATURE_COUNT];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                *m += v / n;
            }
        }

        let mut scale = vec![0.0; FEATURE_COUNT];
        for row in rows {
            for (i, v) in row.iter().enumerate() {
                scale[i] += (v - mean[i]).powi(2) / n;
            }
        }
        for s in scale.iter_mut() {
            *s = s.sqrt();
            if *s < 1e-12 {
                *s = 1.0;
            }
        }

        if mean.iter().chain(scale.iter()).any(|v| !v.is_finite()) {
            return Err(TrainingError::Numerical(
                "non-finite normalizer statistics".to_string(),
            ));
        }

        Ok(Self { mean, scale })
    }

    pub fn is_fitted(&self) -> bool {
        self.mean.len() == FEATURE_COUNT && self.scale.len() == FEATURE_COUNT
    }

    /// Scale one feature row
    pub fn transform(&self, row: &[f64; FEATURE_COUNT]) -> Result<[f64; FEATURE_COUNT]> {
        if !self.is_fitted() {
            bail!(
                "normalizer expects {} features, fitted on {}",
                FEATURE_COUNT,
                self.mean.len()
            );
        }

        let mut out = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            out[i] = (row[i] - self.mean[i]) / self.scale[i];
        }
        if out.iter().any(|v| !v.is_finite()) {
            bail!("normalized features are not finite");
        }
        Ok(out)
    }
}

/// Gradient-descent hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub learning_rate: f64,
    pub epochs: usize,
    /// L2 penalty on the weights (not the bias)
    pub l2: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 1000,
            l2: 0.01,
        }
    }
}

/// Binary logistic regression over normalized features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Distinct labels seen during training
    pub classes: Vec<u8>,
}

impl LogisticRegression {
    /// Per-class sample weights: the minority class is weighted by
    /// `majority_count / minority_count`, the majority by 1.
    pub fn class_weights(labels: &[u8]) -> [f64; 2] {
        let positives = labels.iter().filter(|l| **l == 1).count() as f64;
        let negatives = labels.len() as f64 - positives;
        if positives == 0.0 || negatives == 0.0 {
            return [1.0, 1.0];
        }
        if positives < negatives {
            [1.0, negatives / positives]
        } else {
            [positives / negatives, 1.0]
        }
    }

    /// Fit on normalized rows with class-balanced batch gradient descent
    pub fn fit(
        rows: &[[f64; FEATURE_COUNT]],
        labels: &[u8],
        params: &TrainingParams,
    ) -> Result<Self, TrainingError> {
        if rows.len() != labels.len() {
            return Err(TrainingError::LengthMismatch {
                features: rows.len(),
                labels: labels.len(),
            });
        }
        if let Some(bad) = labels.iter().find(|l| **l > 1) {
            return Err(TrainingError::InvalidLabel(*bad));
        }

        let mut classes: Vec<u8> = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();

        let class_weights = Self::class_weights(labels);
        let sample_weights: Vec<f64> = labels
            .iter()
            .map(|l| class_weights[*l as usize])
            .collect();
        let total_weight: f64 = sample_weights.iter().sum();

        let mut weights = vec![0.0; FEATURE_COUNT];
        let mut bias = 0.0;

        for _ in 0..params.epochs {
            let mut grad_w = [0.0; FEATURE_COUNT];
            let mut grad_b = 0.0;

            for ((row, label), sw) in rows.iter().zip(labels).zip(&sample_weights) {
                let z = bias + dot(&weights, row);
                let err = (sigmoid(z) - *label as f64) * sw;
                for (g, x) in grad_w.iter_mut().zip(row.iter()) {
                    *g += err * x;
                }
                grad_b += err;
            }

            for (w, g) in weights.iter_mut().zip(grad_w.iter()) {
                *w -= params.learning_rate * (g / total_weight + params.l2 * *w);
            }
            bias -= params.learning_rate * grad_b / total_weight;
        }

        if !bias.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err(TrainingError::Numerical(
                "classifier parameters are not finite".to_string(),
            ));
        }

        Ok(Self {
            weights,
            bias,
            classes,
        })
    }

    /// Probability of the positive ("will churn") class.
    ///
    /// `None` when the model cannot produce a two-class probability: it saw a
    /// single class, its shape is wrong, or the output is not finite.
    pub fn predict_proba(&self, row: &[f64; FEATURE_COUNT]) -> Option<f64> {
        if self.classes.len() < 2 || self.weights.len() != FEATURE_COUNT {
            return None;
        }
        let p = sigmoid(self.bias + dot(&self.weights, row));
        p.is_finite().then_some(p.clamp(0.0, 1.0))
    }
}

fn dot(weights: &[f64], row: &[f64; FEATURE_COUNT]) -> f64 {
    weights.iter().zip(row.iter()).map(|(w, x)| w * x).sum()
}
