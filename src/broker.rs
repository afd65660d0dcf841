//! NATS JetStream broker client.
//!
//! The topic exchange is a file-backed, interest-retained stream whose
//! subjects are the queue binding patterns; each queue is a durable pull
//! consumer filtered on its pattern. The connection is opened lazily and
//! re-opened when the previous one dropped.

use crate::config::{AckMode, NatsConfig, QueueBinding};
use anyhow::{anyhow, Context, Result};
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream};
use async_nats::{Client, HeaderMap};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consumer type handed to the queue loops
pub type QueueStream = jetstream::consumer::Consumer<pull::Config>;

/// One broker connection with its declared topology
pub struct BrokerClient {
    url: String,
    exchange: String,
    bindings: Vec<QueueBinding>,
    ack_wait: Duration,
    connection: Option<Connection>,
}

struct Connection {
    client: Client,
    jetstream: jetstream::Context,
}

impl BrokerClient {
    /// Create a client; nothing is opened until first use
    pub fn new(config: &NatsConfig) -> Self {
        Self {
            url: config.url.clone(),
            exchange: config.exchange.clone(),
            bindings: config.queues.clone(),
            ack_wait: Duration::from_secs(config.ack_wait_secs),
            connection: None,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Open (or re-open) the connection and declare the topology
    async fn connection(&mut self) -> Result<&Connection> {
        let stale = match &self.connection {
            Some(conn) => conn.client.connection_state() == State::Disconnected,
            None => true,
        };

        if stale {
            if self.connection.is_some() {
                warn!(url = %self.url, "Broker connection lost, reconnecting");
            }
            let client = async_nats::connect(&self.url)
                .await
                .with_context(|| format!("Failed to connect to NATS at {}", self.url))?;
            let jetstream = jetstream::new(client.clone());
            declare_topology(&jetstream, &self.exchange, &self.bindings).await?;
            info!(url = %self.url, exchange = %self.exchange, "Connected to NATS");
            self.connection = Some(Connection { client, jetstream });
        }

        self.connection
            .as_ref()
            .ok_or_else(|| anyhow!("broker connection unavailable"))
    }

    /// Connect eagerly, declaring the topology
    pub async fn ensure_connected(&mut self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    /// Durable pull consumer for a bound queue, acknowledging per `ack_mode`
    pub async fn queue_consumer(&mut self, queue: &str, ack_mode: AckMode) -> Result<QueueStream> {
        let binding = self
            .bindings
            .iter()
            .find(|b| b.name == queue)
            .cloned()
            .ok_or_else(|| anyhow!("queue {queue} is not bound to exchange {}", self.exchange))?;
        let exchange = self.exchange.clone();
        let config = consumer_config(&binding, ack_mode, self.ack_wait);
        let conn = self.connection().await?;

        let stream = conn
            .jetstream
            .get_stream(&exchange)
            .await
            .with_context(|| format!("Failed to open stream {exchange}"))?;

        let mut consumer: QueueStream = stream
            .get_or_create_consumer(&binding.name, config.clone())
            .await
            .with_context(|| format!("Failed to declare queue {}", binding.name))?;

        let current = consumer.cached_info().config.filter_subject.clone();
        if filter_drifted(&current, &binding.pattern) {
            info!(
                queue = %binding.name,
                from = %current,
                to = %binding.pattern,
                "Updating queue binding"
            );
            consumer = stream
                .update_consumer(config)
                .await
                .with_context(|| format!("Failed to rebind queue {}", binding.name))?;
        }

        debug!(queue = %binding.name, pattern = %binding.pattern, "Queue consumer ready");
        Ok(consumer)
    }

    /// Persistent JSON publish; waits for the stream acknowledgement
    pub async fn publish<T: Serialize + ?Sized>(&mut self, routing_key: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_vec(payload).context("Failed to encode message")?;
        let conn = self.connection().await?;

        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/json");

        conn.jetstream
            .publish_with_headers(routing_key.to_string(), headers, body.into())
            .await
            .with_context(|| format!("Failed to publish to {routing_key}"))?
            .await
            .with_context(|| format!("Publish to {routing_key} was not acknowledged"))?;

        debug!(routing_key = %routing_key, "Message published");
        Ok(())
    }

    /// Fire-and-forget JSON publish outside the exchange (reports, dead letters)
    pub async fn publish_core<T: Serialize + ?Sized>(&mut self, subject: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_vec(payload).context("Failed to encode message")?;
        let conn = self.connection().await?;
        conn.client
            .publish(subject.to_string(), body.into())
            .await
            .with_context(|| format!("Failed to publish to {subject}"))?;
        Ok(())
    }

    /// Flush pending writes and drop the connection
    pub async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.take() {
            conn.client.flush().await.context("Failed to flush NATS connection")?;
            info!(url = %self.url, "Broker connection closed");
        }
        Ok(())
    }
}

/// Get-or-create the exchange stream; widen its subjects when bindings drift
async fn declare_topology(
    js: &jetstream::Context,
    exchange: &str,
    bindings: &[QueueBinding],
) -> Result<()> {
    let config = stream_config(exchange, bindings);
    let wanted = config.subjects.clone();

    let stream = js
        .get_or_create_stream(config.clone())
        .await
        .with_context(|| format!("Failed to declare exchange {exchange}"))?;

    let current = stream.cached_info().config.subjects.clone();
    if let Some(merged) = merged_subjects(&current, &wanted) {
        info!(exchange = %exchange, subjects = ?merged, "Updating exchange bindings");
        js.update_stream(&stream::Config {
            subjects: merged,
            ..stream.cached_info().config.clone()
        })
        .await
        .with_context(|| format!("Failed to update exchange {exchange}"))?;
    }
    Ok(())
}

/// Exchange stream; a message is removed once every bound queue has it acked
pub fn stream_config(exchange: &str, bindings: &[QueueBinding]) -> stream::Config {
    stream::Config {
        name: exchange.to_string(),
        subjects: stream_subjects(bindings),
        storage: stream::StorageType::File,
        retention: stream::RetentionPolicy::Interest,
        ..Default::default()
    }
}

/// Queue consumer settings.
///
/// `Immediate` never acks, so the server counts a message as consumed when
/// it is delivered and never redelivers it. `AfterHandling` keeps a single
/// delivery in flight, redelivered only if unacked after `ack_wait`.
pub fn consumer_config(binding: &QueueBinding, ack_mode: AckMode, ack_wait: Duration) -> pull::Config {
    let base = pull::Config {
        durable_name: Some(binding.name.clone()),
        filter_subject: binding.pattern.clone(),
        ..Default::default()
    };
    match ack_mode {
        AckMode::Immediate => pull::Config {
            ack_policy: AckPolicy::None,
            ..base
        },
        AckMode::AfterHandling => pull::Config {
            ack_policy: AckPolicy::Explicit,
            ack_wait,
            max_ack_pending: 1,
            ..base
        },
    }
}

fn filter_drifted(current: &str, wanted: &str) -> bool {
    current != wanted
}

/// Unique binding patterns, in declaration order
pub fn stream_subjects(bindings: &[QueueBinding]) -> Vec<String> {
    let mut subjects: Vec<String> = Vec::with_capacity(bindings.len());
    for binding in bindings {
        if !subjects.contains(&binding.pattern) {
            subjects.push(binding.pattern.clone());
        }
    }
    subjects
}

/// Union of `current` and `wanted`, or `None` when nothing is missing
fn merged_subjects(current: &[String], wanted: &[String]) -> Option<Vec<String>> {
    let missing: Vec<&String> = wanted.iter().filter(|s| !current.contains(*s)).collect();
    if missing.is_empty() {
        return None;
    }
    let mut merged = current.to_vec();
    merged.extend(missing.into_iter().cloned());
    Some(merged)
}

/// Dead-letter subject for a queue
pub fn dead_letter_subject(prefix: &str, queue: &str) -> String {
    format!("{prefix}.{queue}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_stream_subjects_from_default_bindings() {
        let config = AppConfig::default();
        let subjects = stream_subjects(&config.nats.queues);
        assert_eq!(
            subjects,
            vec!["gym.checkins.*", "gym.reports.daily", "gym.churn.*", "gym.batch.*"]
        );
    }

    #[test]
    fn test_shared_pattern_declared_once() {
        let bindings = vec![
            QueueBinding::new("checkins", "gym.checkins.*"),
            QueueBinding::new("checkins_audit", "gym.checkins.*"),
        ];
        assert_eq!(stream_subjects(&bindings), vec!["gym.checkins.*"]);
    }

    #[test]
    fn test_merge_only_when_drifted() {
        let current = vec!["gym.checkins.*".to_string()];
        assert_eq!(merged_subjects(&current, &current), None);

        let wanted = vec!["gym.checkins.*".to_string(), "gym.churn.*".to_string()];
        assert_eq!(merged_subjects(&current, &wanted), Some(wanted.clone()));
    }

    #[test]
    fn test_stream_config_drops_acked_messages() {
        let config = AppConfig::default();
        let stream = stream_config("gym_events", &config.nats.queues);
        assert_eq!(stream.name, "gym_events");
        assert_eq!(stream.retention, stream::RetentionPolicy::Interest);
        assert_eq!(stream.storage, stream::StorageType::File);
        assert_eq!(stream.subjects, stream_subjects(&config.nats.queues));
    }

    #[test]
    fn test_immediate_consumer_is_never_redelivered() {
        let binding = QueueBinding::new("checkins", "gym.checkins.*");
        let config = consumer_config(&binding, AckMode::Immediate, Duration::from_secs(300));
        assert_eq!(config.durable_name.as_deref(), Some("checkins"));
        assert_eq!(config.filter_subject, "gym.checkins.*");
        assert_eq!(config.ack_policy, AckPolicy::None);
    }

    #[test]
    fn test_after_handling_consumer_holds_one_delivery() {
        let binding = QueueBinding::new("churn_analysis", "gym.churn.*");
        let config = consumer_config(&binding, AckMode::AfterHandling, Duration::from_secs(300));
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.max_ack_pending, 1);
        assert_eq!(config.ack_wait, Duration::from_secs(300));
        assert_eq!(config.filter_subject, "gym.churn.*");
    }

    #[test]
    fn test_filter_drift() {
        assert!(!filter_drifted("gym.checkins.*", "gym.checkins.*"));
        assert!(filter_drifted("gym.checkins.batch", "gym.checkins.*"));
    }

    #[test]
    fn test_dead_letter_subject() {
        assert_eq!(
            dead_letter_subject("gym_deadletter", "checkins"),
            "gym_deadletter.checkins"
        );
    }

    #[test]
    fn test_client_is_lazy() {
        let client = BrokerClient::new(&AppConfig::default().nats);
        assert_eq!(client.exchange(), "gym_events");
        assert_eq!(client.bindings().len(), 4);
    }
}
