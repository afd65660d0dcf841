//! Gym Churn Pipeline Library
//!
//! A message-driven worker that ingests gym attendance events, keeps member
//! churn-risk scores current, and retrains its classifier from the
//! membership database.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod producer;
pub mod store;
pub mod types;
pub mod workers;

pub use broker::BrokerClient;
pub use config::AppConfig;
pub use consumer::{DeliveryHandler, QueueConsumer};
pub use feature_extractor::{FeatureExtractor, FeatureVector};
pub use models::{ModelLoader, ModelTrainer, RiskAssessment, RiskEngine, ScoringPath};
pub use producer::{EventPublisher, ReportProducer};
pub use store::{MemberStore, MemoryStore, PgStore, UnitOfWork};
pub use types::{CheckinEvent, DailyReport, Member};
pub use workers::{Dispatcher, HandlerOutcome, ReportSink};
