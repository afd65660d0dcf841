//! Gym Churn Pipeline - Main Entry Point
//!
//! Consumes gym events from NATS JetStream, keeps member churn-risk scores
//! current, and retrains the scoring model from the membership database.
//! Runs one consume loop per bound queue.

use anyhow::Result;
use gym_churn_pipeline::{
    config::{AppConfig, LoggingConfig},
    consumer::{DeliveryHandler, QueueConsumer},
    metrics::{MetricsReporter, PipelineMetrics},
    models::{ModelLoader, ModelTrainer, RiskEngine},
    producer::ReportProducer,
    store::PgStore,
    workers::{policy, Dispatcher, LogReportSink, ReportSink},
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the configured format applies
    let config = AppConfig::load()?;
    init_logging(&config.logging)?;

    info!("Starting Gym Churn Pipeline");
    info!(
        exchange = %config.nats.exchange,
        queues = config.nats.queues.len(),
        ack_mode = ?config.pipeline.ack_mode,
        retrain_every = config.pipeline.retrain_every,
        "Configuration loaded successfully"
    );

    // Initialize metrics
    let metrics = Arc::new(PipelineMetrics::new());

    // Scoring model: persisted artifact if present, heuristic otherwise
    let loader = ModelLoader::new(&config.models.artifact_path);
    let engine = Arc::new(RiskEngine::new(loader.load_or_untrained()));
    info!(
        features = engine.extractor().feature_count(),
        trained = engine.is_trained(),
        "Risk engine ready"
    );
    let trainer = Arc::new(ModelTrainer::new(
        engine.clone(),
        loader,
        config.models.training.clone(),
    ));

    let store = PgStore::connect(&config.database.url, config.database.max_connections).await?;

    let report_producer = config
        .reports
        .subject
        .as_deref()
        .map(|subject| Arc::new(ReportProducer::new(&config.nats, subject)));
    let sink: Arc<dyn ReportSink> = match &report_producer {
        Some(producer) => {
            info!(subject = %producer.subject(), "Publishing daily reports to NATS");
            producer.clone()
        }
        None => Arc::new(LogReportSink),
    };

    let dispatcher: Arc<dyn DeliveryHandler> = Arc::new(Dispatcher::new(
        Arc::new(store.clone()),
        trainer,
        sink,
        policy::from_interval(config.pipeline.retrain_every),
        metrics.clone(),
    ));

    // Start metrics reporter
    let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.metrics_interval_secs);
    let reporter_task = tokio::spawn(reporter.start());

    // One consume loop per queue, each with its own connection
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = JoinSet::new();
    for binding in &config.nats.queues {
        let consumer = QueueConsumer::new(&config.nats, &binding.name, config.pipeline.ack_mode);
        info!(queue = %binding.name, pattern = %binding.pattern, "Spawning queue consumer");
        loops.spawn(consumer.run(dispatcher.clone(), shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping consumers...");
    if shutdown_tx.send(true).is_err() {
        warn!("All consumers already stopped");
    }

    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Consumer stopped with error"),
            Err(e) => error!(error = %e, "Consumer task panicked"),
        }
    }

    if let Some(producer) = report_producer {
        if let Err(e) = producer.close().await {
            warn!(error = %e, "Failed to close report publisher");
        }
    }
    reporter_task.abort();
    store.close().await;

    // Print final summary
    info!("Pipeline shutting down...");
    metrics.print_summary();

    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("gym_churn_pipeline={0},gym_churn_worker={0}", logging.level)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.pretty().init(),
    }
    Ok(())
}
