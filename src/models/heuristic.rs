//! Rule-based churn score used while no trained classifier is installed

use crate::feature_extractor::FeatureVector;
use crate::models::classifier::sigmoid;

/// Plans above this price count as premium
pub const PREMIUM_PLAN_PRICE: f64 = 199.90;
/// Early-enrollment window, in days
pub const EARLY_TENURE_DAYS: f64 = 30.0;
/// Weekly ratio below which an early member counts as disengaged
pub const EARLY_ENGAGEMENT_WEEKLY_RATIO: f64 = 0.3;

/// Relative weight of each risk signal. Weights sum to 1.
#[derive(Debug, Clone)]
pub struct HeuristicWeights {
    pub inactivity: f64,
    pub weekly_frequency: f64,
    pub lifetime_density: f64,
    pub monthly_frequency: f64,
    pub irregularity: f64,
    pub premium_plan: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            inactivity: 0.35,
            weekly_frequency: 0.30,
            lifetime_density: 0.125,
            monthly_frequency: 0.125,
            irregularity: 0.05,
            premium_plan: 0.05,
        }
    }
}

/// Deterministic hand-tuned scorer.
///
/// Each signal is mapped to a deficit in [0, 1] (1 = worst), the weighted sum
/// is centered around 0, shifted up (disengaged) or down (engaged) for members
/// in their first 30 days, and folded back into [0, 1] with a logistic curve.
pub struct HeuristicScorer {
    weights: HeuristicWeights,
    /// Logistic steepness applied to the centered value
    steepness: f64,
    /// Shift added for disengaged early members
    early_amplification: f64,
    /// Shift subtracted for engaged early members
    early_damping: f64,
}

impl HeuristicScorer {
    pub fn new(weights: HeuristicWeights) -> Self {
        Self {
            weights,
            steepness: 6.0,
            early_amplification: 0.1,
            early_damping: 0.1,
        }
    }

    /// Score raw (un-normalized) features. Always in [0, 1].
    pub fn score(&self, f: &FeatureVector) -> f64 {
        let w = &self.weights;

        // Deficits: 1.0 means the worst observed behavior for that signal.
        // Three visits a week (3/7) counts as fully engaged.
        let inactivity = (f.days_since_checkin / 30.0).clamp(0.0, 1.0);
        let low_weekly = 1.0 - (f.weekly_ratio / 0.43).clamp(0.0, 1.0);
        let low_monthly = 1.0 - (f.monthly_ratio / 0.4).clamp(0.0, 1.0);
        let low_density = 1.0 - (f.lifetime_density / 0.4).clamp(0.0, 1.0);
        let irregularity = (f.interval_variance / 100.0).clamp(0.0, 1.0);
        let premium = if f.plan_price > PREMIUM_PLAN_PRICE { 1.0 } else { 0.0 };

        let raw = w.inactivity * inactivity
            + w.weekly_frequency * low_weekly
            + w.lifetime_density * low_density
            + w.monthly_frequency * low_monthly
            + w.irregularity * irregularity
            + w.premium_plan * premium;

        let mut centered = raw - 0.5;
        if f.tenure_days <= EARLY_TENURE_DAYS {
            if f.weekly_ratio < EARLY_ENGAGEMENT_WEEKLY_RATIO {
                centered += self.early_amplification;
            } else {
                centered -= self.early_damping;
            }
        }

        let score = sigmoid(self.steepness * centered);
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.5
        }
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new(HeuristicWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(weekly: f64, monthly: f64, days_since: f64, tenure: f64, density: f64) -> FeatureVector {
        FeatureVector {
            weekly_ratio: weekly,
            monthly_ratio: monthly,
            days_since_checkin: days_since,
            interval_variance: 30.0,
            tenure_days: tenure,
            lifetime_density: density,
            plan_price: 99.9,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let w = HeuristicWeights::default();
        let sum = w.inactivity
            + w.weekly_frequency
            + w.lifetime_density
            + w.monthly_frequency
            + w.irregularity
            + w.premium_plan;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_inactive_member_scores_high() {
        let scorer = HeuristicScorer::default();
        let score = scorer.score(&features(0.0, 0.0, 365.0, 40.0, 0.0));
        assert!(score >= 0.9, "score was {score}");
    }

    #[test]
    fn test_regular_member_scores_low() {
        let scorer = HeuristicScorer::default();
        let score = scorer.score(&features(0.57, 0.5, 1.0, 200.0, 0.45));
        assert!(score <= 0.1, "score was {score}");
    }

    #[test]
    fn test_early_tenure_amplifies_and_damps() {
        let scorer = HeuristicScorer::default();

        let disengaged_late = scorer.score(&features(0.0, 0.0, 20.0, 60.0, 0.0));
        let disengaged_early = scorer.score(&features(0.0, 0.0, 20.0, 20.0, 0.0));
        assert!(disengaged_early > disengaged_late);

        let engaged_late = scorer.score(&features(0.43, 0.1, 0.0, 60.0, 0.5));
        let engaged_early = scorer.score(&features(0.43, 0.1, 0.0, 20.0, 0.5));
        assert!(engaged_early < engaged_late);
    }

    #[test]
    fn test_score_is_clamped_for_extreme_inputs() {
        let scorer = HeuristicScorer::default();
        for f in [
            features(0.0, 0.0, 365.0, 1.0, 0.0),
            features(1.0, 1.0, 0.0, 1.0, 1.0),
            features(1.0, 1.0, 0.0, 10_000.0, 1.0),
            features(-5.0, 7.0, -3.0, 0.0, 42.0),
        ] {
            let s = scorer.score(&f);
            assert!((0.0..=1.0).contains(&s));
        }
    }
}
