//! Churn scoring models: heuristic fallback, trainable classifier, training
//! and artifact persistence

pub mod classifier;
pub mod heuristic;
pub mod inference;
pub mod loader;
pub mod trainer;

pub use heuristic::HeuristicScorer;
pub use inference::{RiskAssessment, RiskEngine, ScoringPath};
pub use loader::{ModelLoader, ScoringModel};
pub use trainer::ModelTrainer;
