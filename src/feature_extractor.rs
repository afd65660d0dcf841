//! Feature extraction for churn-risk scoring.
//!
//! Turns a member record and its attendance history into the fixed-length
//! vector consumed by both the heuristic and the trained classifier.

use crate::error::FeatureError;
use crate::models::classifier::Normalizer;
use crate::types::member::{CheckinEvent, Member};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of features produced by the extractor
pub const FEATURE_COUNT: usize = 7;

/// Cap for `days_since_checkin`, also used when there are no check-ins
pub const MAX_DAYS_SINCE_CHECKIN: f64 = 365.0;
/// Cap for `interval_variance`
pub const MAX_INTERVAL_VARIANCE: f64 = 100.0;
/// Variance used when fewer than two check-ins exist
pub const DEFAULT_INTERVAL_VARIANCE: f64 = 30.0;

/// Behavioral features of one member at one point in time.
///
/// Field order matches [`FeatureExtractor::feature_names`] and the layout of
/// [`FeatureVector::to_array`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Check-ins in the last 7 days / 7, in [0, 1]
    pub weekly_ratio: f64,
    /// Check-ins in the last 30 days / 30, in [0, 1]
    pub monthly_ratio: f64,
    /// Days since the latest check-in, in [0, 365]
    pub days_since_checkin: f64,
    /// Population variance of day gaps between check-ins, in [0, 100]
    pub interval_variance: f64,
    /// Days since enrollment, at least 1
    pub tenure_days: f64,
    /// Lifetime check-ins per day of tenure, in [0, 1]
    pub lifetime_density: f64,
    /// Current plan price, 0.0 when unknown
    pub plan_price: f64,
}

impl FeatureVector {
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.weekly_ratio,
            self.monthly_ratio,
            self.days_since_checkin,
            self.interval_variance,
            self.tenure_days,
            self.lifetime_density,
            self.plan_price,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Feature extractor that transforms attendance history into model input.
pub struct FeatureExtractor;

impl FeatureExtractor {
    /// Create a new feature extractor.
    pub fn new() -> Self {
        Self
    }

    /// Extract features for a member as of `now`.
    ///
    /// Check-ins dated after `now` are ignored. Fails only when the member has
    /// no enrollment date.
    pub fn extract(
        &self,
        member: &Member,
        checkins: &[CheckinEvent],
        now: DateTime<Utc>,
    ) -> Result<FeatureVector, FeatureError> {
        let enrolled_at = member.enrolled_at.ok_or(FeatureError::MissingEnrollment {
            member_id: member.id,
        })?;

        let mut valid: Vec<DateTime<Utc>> = checkins
            .iter()
            .map(|c| c.timestamp)
            .filter(|ts| *ts <= now)
            .collect();
        valid.sort();

        let week_start = now - Duration::days(7);
        let month_start = now - Duration::days(30);
        let last_week = valid.iter().filter(|ts| **ts >= week_start).count() as f64;
        let last_month = valid.iter().filter(|ts| **ts >= month_start).count() as f64;

        let days_since_checkin = match valid.last() {
            Some(last) => ((now - *last).num_days() as f64).clamp(0.0, MAX_DAYS_SINCE_CHECKIN),
            None => MAX_DAYS_SINCE_CHECKIN,
        };

        let dates: Vec<NaiveDate> = valid.iter().map(|ts| ts.date_naive()).collect();
        let interval_variance = interval_variance(&dates);

        let tenure_days = ((now - enrolled_at).num_days() as f64).max(1.0);
        let lifetime_density = (valid.len() as f64 / tenure_days).min(1.0);

        let features = FeatureVector {
            weekly_ratio: (last_week / 7.0).min(1.0),
            monthly_ratio: (last_month / 30.0).min(1.0),
            days_since_checkin,
            interval_variance,
            tenure_days,
            lifetime_density,
            plan_price: member.plan_price.unwrap_or(0.0),
        };

        debug!(
            member_id = member.id,
            checkins = valid.len(),
            ignored_future = checkins.len() - valid.len(),
            ?features,
            "Extracted features"
        );

        Ok(features)
    }

    /// Build the classifier input for a feature vector.
    ///
    /// Applies the normalizer when one is present and fitted. If normalization
    /// fails the raw features are returned instead.
    pub fn prepare(
        &self,
        features: &FeatureVector,
        normalizer: Option<&Normalizer>,
    ) -> [f64; FEATURE_COUNT] {
        let raw = features.to_array();
        match normalizer.filter(|n| n.is_fitted()) {
            Some(normalizer) => match normalizer.transform(&raw) {
                Ok(scaled) => scaled,
                Err(e) => {
                    debug!(error = %e, "Normalization failed, using raw features");
                    raw
                }
            },
            None => raw,
        }
    }

    /// Get the number of features produced.
    pub fn feature_count(&self) -> usize {
        FEATURE_COUNT
    }

    /// Get feature names, in vector order.
    pub fn feature_names(&self) -> Vec<&'static str> {
        vec![
            "weekly_ratio",
            "monthly_ratio",
            "days_since_checkin",
            "interval_variance",
            "tenure_days",
            "lifetime_density",
            "plan_price",
        ]
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Population variance of consecutive day gaps, clamped to [0, 100].
/// Expects `dates` sorted ascending.
fn interval_variance(dates: &[NaiveDate]) -> f64 {
    if dates.len() < 2 {
        return DEFAULT_INTERVAL_VARIANCE;
    }

    let gaps: Vec<f64> = dates
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days() as f64)
        .collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;

    variance.clamp(0.0, MAX_INTERVAL_VARIANCE)
}
