//! Test Event Producer
//!
//! Publishes synthetic check-in batches to NATS, followed by a daily report
//! request and a churn analysis trigger, for local pipeline testing.
//!
//! Usage: test_producer [nats_url] [batches] [batch_size] [members] [lapse_rate] [delay_ms]

use chrono::{Duration as ChronoDuration, Utc};
use gym_churn_pipeline::config::AppConfig;
use gym_churn_pipeline::producer::EventPublisher;
use gym_churn_pipeline::types::{CheckinBatch, CheckinEntry};
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Synthetic attendance generator
struct CheckinGenerator {
    rng: rand::rngs::ThreadRng,
    members: i64,
    lapse_rate: f64,
}

impl CheckinGenerator {
    fn new(members: i64, lapse_rate: f64) -> Self {
        Self {
            rng: rand::thread_rng(),
            members: members.max(1),
            lapse_rate: lapse_rate.clamp(0.0, 1.0),
        }
    }

    /// Members `1..=n*(1-lapse_rate)` are regulars; the rest rarely show up
    fn is_regular(&self, member_id: i64) -> bool {
        let regulars = ((self.members as f64) * (1.0 - self.lapse_rate)).round() as i64;
        member_id <= regulars
    }

    fn generate_entry(&mut self) -> CheckinEntry {
        let now = Utc::now();
        let member_id = self.rng.gen_range(1..=self.members);

        // Regulars train within the last day, lapsing members weeks ago
        let hours_ago = if self.is_regular(member_id) {
            self.rng.gen_range(0..24)
        } else {
            self.rng.gen_range(24 * 14..24 * 45)
        };

        CheckinEntry {
            member_id,
            timestamp: now - ChronoDuration::hours(hours_ago)
                - ChronoDuration::minutes(self.rng.gen_range(0..60)),
        }
    }

    fn generate_batch(&mut self, size: usize) -> Vec<CheckinEntry> {
        (0..size).map(|_| self.generate_entry()).collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Event Producer");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let batches: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(20);
    let batch_size: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(10);
    let members: i64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(50);
    let lapse_rate: f64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(0.2);
    let delay_ms: u64 = args.get(6).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        batches = batches,
        batch_size = batch_size,
        members = members,
        lapse_rate = lapse_rate,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    let mut config = AppConfig::default();
    config.nats.url = nats_url.to_string();
    let publisher = EventPublisher::new(&config.nats);

    if let Err(e) = publisher.connect().await {
        warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
        return run_dry_mode(batches, batch_size, members, lapse_rate, delay_ms).await;
    }

    let mut generator = CheckinGenerator::new(members, lapse_rate);
    let mut published_checkins = 0;

    for i in 0..batches {
        let batch = generator.generate_batch(batch_size);
        published_checkins += batch.len();
        publisher.publish_checkin_batch(batch).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} batches ({} check-ins)",
                i + 1,
                batches,
                published_checkins
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    publisher.schedule_daily_report(Utc::now().date_naive()).await?;
    publisher.trigger_churn_analysis().await?;
    publisher.close().await?;

    info!(
        "Completed! Published {} batches ({} check-ins), a daily report request and a churn trigger",
        batches, published_checkins
    );

    Ok(())
}

async fn run_dry_mode(
    batches: u64,
    batch_size: usize,
    members: i64,
    lapse_rate: f64,
    delay_ms: u64,
) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = CheckinGenerator::new(members, lapse_rate);

    for i in 0..batches {
        let batch = CheckinBatch {
            checkins: generator.generate_batch(batch_size),
        };
        let json = serde_json::to_string_pretty(&batch)?;

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample batch {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
