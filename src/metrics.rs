//! Runtime metrics for the churn pipeline worker.

use crate::models::inference::ScoringPath;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for pipeline activity
pub struct PipelineMetrics {
    /// Total deliveries handled
    pub messages_processed: AtomicU64,
    /// Deliveries whose handler returned an error
    pub handler_failures: AtomicU64,
    /// Deliveries dropped as undecodable or unroutable
    pub messages_dropped: AtomicU64,
    /// Check-ins appended to the store
    pub checkins_ingested: AtomicU64,
    /// Batch items skipped as invalid (unknown member, malformed entry)
    pub items_skipped: AtomicU64,
    /// Successful training runs
    pub trainings_succeeded: AtomicU64,
    /// Rejected or failed training runs
    pub trainings_failed: AtomicU64,
    /// Deliveries per queue
    messages_by_queue: RwLock<HashMap<String, u64>>,
    /// Scores produced per scoring path
    scores_by_path: RwLock<HashMap<ScoringPath, u64>>,
    /// Handler durations (in microseconds)
    handler_times: RwLock<Vec<u64>>,
    /// Risk score distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            checkins_ingested: AtomicU64::new(0),
            items_skipped: AtomicU64::new(0),
            trainings_succeeded: AtomicU64::new(0),
            trainings_failed: AtomicU64::new(0),
            messages_by_queue: RwLock::new(HashMap::new()),
            scores_by_path: RwLock::new(HashMap::new()),
            handler_times: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a handled delivery
    pub fn record_message(&self, queue: &str, handling_time: Duration, failed: bool) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut by_queue) = self.messages_by_queue.write() {
            *by_queue.entry(queue.to_string()).or_insert(0) += 1;
        }

        if let Ok(mut times) = self.handler_times.write() {
            times.push(handling_time.as_micros() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingested(&self, ingested: usize, skipped: usize) {
        self.checkins_ingested
            .fetch_add(ingested as u64, Ordering::Relaxed);
        self.items_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn record_training(&self, succeeded: bool) {
        if succeeded {
            self.trainings_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.trainings_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a produced risk score
    pub fn record_score(&self, path: ScoringPath, score: f64) {
        if let Ok(mut by_path) = self.scores_by_path.write() {
            *by_path.entry(path).or_insert(0) += 1;
        }

        let bucket = (score.clamp(0.0, 1.0) * 10.0).min(9.0) as usize;
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Get handler time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let times = match self.handler_times.read() {
            Ok(times) => times,
            Err(_) => return ProcessingStats::default(),
        };
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: *sorted.last().unwrap_or(&0),
        }
    }

    /// Scores produced per scoring path
    pub fn get_scores_by_path(&self) -> HashMap<ScoringPath, u64> {
        self.scores_by_path
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn get_messages_by_queue(&self) -> HashMap<String, u64> {
        self.messages_by_queue
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Get score distribution
    pub fn get_score_distribution(&self) -> [u64; 10] {
        self.score_buckets.read().map(|b| *b).unwrap_or([0; 10])
    }

    /// Get current throughput (messages per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.messages_processed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Log a summary of everything recorded so far
    pub fn print_summary(&self) {
        let processing = self.get_processing_stats();
        let by_path = self.get_scores_by_path();
        let path_count = |p: ScoringPath| by_path.get(&p).copied().unwrap_or(0);

        info!(
            messages = self.messages_processed.load(Ordering::Relaxed),
            failures = self.handler_failures.load(Ordering::Relaxed),
            dropped = self.messages_dropped.load(Ordering::Relaxed),
            throughput = format!("{:.2} msg/s", self.get_throughput()),
            "Pipeline summary"
        );
        info!(
            ingested = self.checkins_ingested.load(Ordering::Relaxed),
            skipped = self.items_skipped.load(Ordering::Relaxed),
            trainings_ok = self.trainings_succeeded.load(Ordering::Relaxed),
            trainings_failed = self.trainings_failed.load(Ordering::Relaxed),
            "Ingestion and training"
        );
        info!(
            heuristic = path_count(ScoringPath::Heuristic),
            model = path_count(ScoringPath::Model),
            neutral = path_count(ScoringPath::Neutral),
            distribution = ?self.get_score_distribution(),
            "Scoring paths"
        );
        info!(
            mean_us = processing.mean_us,
            p50_us = processing.p50_us,
            p95_us = processing.p95_us,
            p99_us = processing.p99_us,
            max_us = processing.max_us,
            "Handler latency"
        );
        for (queue, count) in self.get_messages_by_queue() {
            info!(queue = %queue, messages = count, "Queue activity");
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Periodic metrics reporter
pub struct MetricsReporter {
    metrics: std::sync::Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: std::sync::Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_message("checkins", Duration::from_micros(100), false);
        metrics.record_message("checkins", Duration::from_micros(300), true);
        metrics.record_message("daily_reports", Duration::from_micros(200), false);
        metrics.record_ingested(4, 1);

        assert_eq!(metrics.messages_processed.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.handler_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.checkins_ingested.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.items_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_messages_by_queue().get("checkins"), Some(&2));

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean_us, 200);
        assert_eq!(stats.max_us, 300);
    }

    #[test]
    fn test_score_paths_and_buckets() {
        let metrics = PipelineMetrics::new();

        metrics.record_score(ScoringPath::Heuristic, 0.95);
        metrics.record_score(ScoringPath::Heuristic, 1.0);
        metrics.record_score(ScoringPath::Neutral, 0.5);

        let by_path = metrics.get_scores_by_path();
        assert_eq!(by_path.get(&ScoringPath::Heuristic), Some(&2));
        assert_eq!(by_path.get(&ScoringPath::Model), None);

        let buckets = metrics.get_score_distribution();
        assert_eq!(buckets[9], 2);
        assert_eq!(buckets[5], 1);
    }
}
