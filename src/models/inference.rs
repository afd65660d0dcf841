//! Churn risk scoring engine.
//!
//! Scores members with the installed classifier when one has been trained and
//! falls back to the deterministic heuristic otherwise. Scoring never fails:
//! anything that prevents a score yields the neutral 0.5.

use crate::feature_extractor::{FeatureExtractor, FeatureVector};
use crate::models::heuristic::{
    HeuristicScorer, EARLY_ENGAGEMENT_WEEKLY_RATIO, EARLY_TENURE_DAYS, PREMIUM_PLAN_PRICE,
};
use crate::models::loader::ScoringModel;
use crate::types::member::{CheckinEvent, Member};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Score reported when no assessment could be made
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Which scorer produced a risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringPath {
    /// Rule-based fallback (no usable trained model)
    Heuristic,
    /// Trained classifier
    Model,
    /// Features could not be computed; neutral score returned
    Neutral,
}

impl ScoringPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringPath::Heuristic => "heuristic",
            ScoringPath::Model => "model",
            ScoringPath::Neutral => "neutral",
        }
    }
}

/// Result of scoring one member. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Churn probability (0.0 - 1.0)
    pub score: f64,
    /// Human-readable risk factors, most severe first
    pub factors: Vec<String>,
    pub path: ScoringPath,
}

impl RiskAssessment {
    fn neutral() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            factors: Vec::new(),
            path: ScoringPath::Neutral,
        }
    }
}

/// Scoring engine holding the current model.
///
/// The model is swapped as a whole `Arc`, so a scoring call that started
/// before a retrain finishes with the old (normalizer, classifier) pair.
pub struct RiskEngine {
    extractor: FeatureExtractor,
    heuristic: HeuristicScorer,
    model: RwLock<Arc<ScoringModel>>,
}

impl RiskEngine {
    /// Create an engine around an initial model
    pub fn new(model: ScoringModel) -> Self {
        info!(
            version = model.version,
            trained = model.trained,
            "Risk engine initialized"
        );
        Self {
            extractor: FeatureExtractor::new(),
            heuristic: HeuristicScorer::default(),
            model: RwLock::new(Arc::new(model)),
        }
    }

    /// Engine with no trained model (heuristic scoring)
    pub fn untrained() -> Self {
        Self::new(ScoringModel::untrained())
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Snapshot of the installed model
    pub fn current_model(&self) -> Arc<ScoringModel> {
        match self.model.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the installed model
    pub fn install(&self, model: ScoringModel) {
        let version = model.version;
        let model = Arc::new(model);
        match self.model.write() {
            Ok(mut guard) => *guard = model,
            Err(poisoned) => *poisoned.into_inner() = model,
        }
        info!(version = version, "Scoring model installed");
    }

    pub fn is_trained(&self) -> bool {
        self.current_model().trained
    }

    /// Assess a member as of now
    pub fn assess(&self, member: &Member, checkins: &[CheckinEvent]) -> RiskAssessment {
        self.assess_at(member, checkins, Utc::now())
    }

    /// Assess a member as of `now`
    pub fn assess_at(
        &self,
        member: &Member,
        checkins: &[CheckinEvent],
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let features = match self.extractor.extract(member, checkins, now) {
            Ok(features) => features,
            Err(e) => {
                warn!(member_id = member.id, error = %e, "Feature extraction failed, using neutral score");
                return RiskAssessment::neutral();
            }
        };

        let model = self.current_model();
        let (score, path) = self.score_features(&features, &model);
        let factors = if path == ScoringPath::Neutral {
            Vec::new()
        } else {
            explain_features(&features)
        };

        debug!(
            member_id = member.id,
            score = score,
            path = path.as_str(),
            model_version = model.version,
            "Member assessed"
        );

        RiskAssessment {
            score,
            factors,
            path,
        }
    }

    /// Score an already-extracted (raw) feature vector against a model
    pub fn score_features(&self, features: &FeatureVector, model: &ScoringModel) -> (f64, ScoringPath) {
        if !features.is_finite() {
            warn!(?features, "Non-finite features, using neutral score");
            return (NEUTRAL_SCORE, ScoringPath::Neutral);
        }

        if model.trained {
            if let Some(classifier) = &model.classifier {
                let input = self.extractor.prepare(features, model.active_normalizer());
                match classifier.predict_proba(&input) {
                    Some(p) => return (p, ScoringPath::Model),
                    None => debug!(
                        version = model.version,
                        "Classifier has no two-class probability, using heuristic"
                    ),
                }
            }
        }

        (self.heuristic.score(features), ScoringPath::Heuristic)
    }

    /// Risk factors for a member as of now
    pub fn explain(&self, member: &Member, checkins: &[CheckinEvent]) -> Vec<String> {
        self.explain_at(member, checkins, Utc::now())
    }

    /// Risk factors for a member as of `now`, from raw (un-normalized) features
    pub fn explain_at(
        &self,
        member: &Member,
        checkins: &[CheckinEvent],
        now: DateTime<Utc>,
    ) -> Vec<String> {
        match self.extractor.extract(member, checkins, now) {
            Ok(features) => explain_features(&features),
            Err(e) => {
                warn!(member_id = member.id, error = %e, "Cannot explain risk");
                Vec::new()
            }
        }
    }
}

/// Risk factors from fixed thresholds over raw features
pub fn explain_features(f: &FeatureVector) -> Vec<String> {
    let mut factors = Vec::new();
    let days = f.days_since_checkin.round() as i64;
    let per_week = f.weekly_ratio * 7.0;

    if f.days_since_checkin > 14.0 {
        factors.push(format!("inactive {days} days - high risk"));
    } else if f.days_since_checkin > 7.0 {
        factors.push(format!("inactive {days} days"));
    }

    if f.lifetime_density == 0.0 {
        factors.push("no attendance recorded".to_string());
    }

    if f.weekly_ratio < 0.15 {
        factors.push(format!("very low frequency ({per_week:.0} check-ins in the last 7 days)"));
    } else if f.weekly_ratio < 0.3 {
        factors.push(format!("below-average frequency ({per_week:.0} check-ins in the last 7 days)"));
    }

    if f.tenure_days <= EARLY_TENURE_DAYS && f.weekly_ratio < EARLY_ENGAGEMENT_WEEKLY_RATIO {
        factors.push("low engagement in early enrollment".to_string());
    }

    if f.interval_variance > 50.0 {
        factors.push("irregular attendance pattern".to_string());
    }

    if f.tenure_days > EARLY_TENURE_DAYS && f.lifetime_density < 0.1 {
        factors.push("low lifetime attendance".to_string());
    }

    if f.plan_price > PREMIUM_PLAN_PRICE {
        factors.push("high-value plan".to_string());
    }

    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_extractor::FEATURE_COUNT;
    use crate::models::classifier::{LogisticRegression, Normalizer};
    use chrono::Duration;

    fn model_with_classes(classes: Vec<u8>) -> ScoringModel {
        ScoringModel {
            version: 1,
            trained: true,
            trained_at: Some(Utc::now()),
            samples: 10,
            positives: 2,
            normalizer: Normalizer {
                mean: vec![0.0; FEATURE_COUNT],
                scale: vec![1.0; FEATURE_COUNT],
            },
            classifier: Some(LogisticRegression {
                weights: vec![0.0; FEATURE_COUNT],
                bias: 1.0,
                classes,
            }),
        }
    }

    #[test]
    fn test_scenario_inactive_member_is_high_risk() {
        let engine = RiskEngine::untrained();
        let now = Utc::now();
        let member = Member::new(1, "Eva", now - Duration::days(40));

        let assessment = engine.assess_at(&member, &[], now);

        assert_eq!(assessment.path, ScoringPath::Heuristic);
        assert!(assessment.score >= 0.7, "score was {}", assessment.score);
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.starts_with("inactive") || f.starts_with("very low frequency")));
    }

    #[test]
    fn test_scenario_engaged_new_member_is_low_risk() {
        let engine = RiskEngine::untrained();
        let now = Utc::now();
        let member = Member::new(2, "Felipe", now - Duration::days(5)).with_plan_price(99.90);
        let checkins: Vec<CheckinEvent> = (0..5)
            .map(|d| CheckinEvent::new(2, now - Duration::days(d) - Duration::hours(1)))
            .collect();

        let assessment = engine.assess_at(&member, &checkins, now);

        assert_eq!(assessment.path, ScoringPath::Heuristic);
        assert!(assessment.score <= 0.4, "score was {}", assessment.score);
    }

    #[test]
    fn test_assessment_is_idempotent() {
        let engine = RiskEngine::untrained();
        let now = Utc::now();
        let member = Member::new(3, "Gabi", now - Duration::days(90));
        let checkins = vec![
            CheckinEvent::new(3, now - Duration::days(3)),
            CheckinEvent::new(3, now - Duration::days(17)),
        ];

        let first = engine.assess_at(&member, &checkins, now);
        let second = engine.assess_at(&member, &checkins, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_enrollment_gives_neutral_score() {
        let engine = RiskEngine::untrained();
        let mut member = Member::new(4, "Hugo", Utc::now());
        member.enrolled_at = None;

        let assessment = engine.assess(&member, &[]);
        assert_eq!(assessment.path, ScoringPath::Neutral);
        assert_eq!(assessment.score, NEUTRAL_SCORE);
        assert!(assessment.factors.is_empty());
    }

    #[test]
    fn test_trained_model_is_used() {
        let engine = RiskEngine::new(model_with_classes(vec![0, 1]));
        let now = Utc::now();
        let member = Member::new(5, "Iris", now - Duration::days(40));

        let assessment = engine.assess_at(&member, &[], now);
        assert_eq!(assessment.path, ScoringPath::Model);
        assert!((0.0..=1.0).contains(&assessment.score));
    }

    #[test]
    fn test_single_class_model_falls_back_to_heuristic() {
        let engine = RiskEngine::new(model_with_classes(vec![0]));
        let now = Utc::now();
        let member = Member::new(6, "Joana", now - Duration::days(40));

        let assessment = engine.assess_at(&member, &[], now);
        assert_eq!(assessment.path, ScoringPath::Heuristic);
    }

    #[test]
    fn test_install_swaps_model() {
        let engine = RiskEngine::untrained();
        let before = engine.current_model();
        assert!(!engine.is_trained());

        engine.install(model_with_classes(vec![0, 1]));

        assert!(engine.is_trained());
        // Snapshot taken earlier is unaffected
        assert!(!before.trained);
    }

    #[test]
    fn test_explain_reads_raw_features_of_trained_engine() {
        // Normalized recency would be (20 - 100) / 10 = -8, below any threshold
        let mut model = model_with_classes(vec![0, 1]);
        model.normalizer.mean[2] = 100.0;
        model.normalizer.scale[2] = 10.0;
        let engine = RiskEngine::new(model);
        assert!(engine.is_trained());

        let now = Utc::now();
        let member = Member::new(7, "Kaio", now - Duration::days(120));
        let checkins = vec![
            CheckinEvent::new(7, now - Duration::days(20)),
            CheckinEvent::new(7, now - Duration::days(27)),
        ];

        let reasons = engine.explain_at(&member, &checkins, now);
        assert_eq!(reasons[0], "inactive 20 days - high risk");

        let assessment = engine.assess_at(&member, &checkins, now);
        assert_eq!(assessment.path, ScoringPath::Model);
        assert_eq!(assessment.factors, reasons);
    }

    #[test]
    fn test_explain_without_enrollment_is_empty() {
        let engine = RiskEngine::new(model_with_classes(vec![0, 1]));
        let mut member = Member::new(8, "Lia", Utc::now());
        member.enrolled_at = None;
        assert!(engine.explain(&member, &[]).is_empty());
    }

    #[test]
    fn test_model_scores_stay_in_unit_interval() {
        let engine = RiskEngine::untrained();
        let extremes = [
            FeatureVector {
                weekly_ratio: 0.0,
                monthly_ratio: 0.0,
                days_since_checkin: 0.0,
                interval_variance: 0.0,
                tenure_days: 1.0,
                lifetime_density: 0.0,
                plan_price: 0.0,
            },
            FeatureVector {
                weekly_ratio: 1.0,
                monthly_ratio: 1.0,
                days_since_checkin: 365.0,
                interval_variance: 100.0,
                tenure_days: 1e9,
                lifetime_density: 1.0,
                plan_price: 1e9,
            },
            FeatureVector {
                weekly_ratio: 1e9,
                monthly_ratio: -1e9,
                days_since_checkin: 1e9,
                interval_variance: -1e9,
                tenure_days: 1e9,
                lifetime_density: 1e9,
                plan_price: -1e9,
            },
        ];

        for sign in [1.0, -1.0] {
            let mut model = model_with_classes(vec![0, 1]);
            if let Some(classifier) = model.classifier.as_mut() {
                classifier.weights = vec![sign * 1e6; FEATURE_COUNT];
                classifier.bias = sign * 1e3;
            }

            for features in &extremes {
                let (score, path) = engine.score_features(features, &model);
                assert_eq!(path, ScoringPath::Model);
                assert!((0.0..=1.0).contains(&score), "score was {score}");
            }
        }
    }

    #[test]
    fn test_explain_thresholds() {
        let features = FeatureVector {
            weekly_ratio: 0.1,
            monthly_ratio: 0.05,
            days_since_checkin: 20.0,
            interval_variance: 80.0,
            tenure_days: 25.0,
            lifetime_density: 0.2,
            plan_price: 249.90,
        };
        let factors = explain_features(&features);

        assert_eq!(factors[0], "inactive 20 days - high risk");
        assert!(factors.iter().any(|f| f.starts_with("very low frequency")));
        assert!(factors.contains(&"low engagement in early enrollment".to_string()));
        assert!(factors.contains(&"irregular attendance pattern".to_string()));
        assert!(factors.contains(&"high-value plan".to_string()));
        assert!(!factors.contains(&"low lifetime attendance".to_string()));
    }

    #[test]
    fn test_explain_healthy_member_has_no_factors() {
        let features = FeatureVector {
            weekly_ratio: 0.57,
            monthly_ratio: 0.5,
            days_since_checkin: 1.0,
            interval_variance: 2.0,
            tenure_days: 200.0,
            lifetime_density: 0.4,
            plan_price: 99.90,
        };
        assert!(explain_features(&features).is_empty());
    }
}
