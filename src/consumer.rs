//! Queue consume loops

use crate::broker::{dead_letter_subject, BrokerClient};
use crate::config::{AckMode, NatsConfig};
use crate::workers::HandlerOutcome;
use anyhow::{anyhow, bail, Context, Result};
use async_nats::jetstream::{AckKind, Message};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Processes one delivery from a queue
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, queue: &str, subject: &str, payload: &[u8]) -> Result<HandlerOutcome>;
}

/// Consume loop for one durable queue, owning its own broker connection
pub struct QueueConsumer {
    broker: BrokerClient,
    queue: String,
    ack_mode: AckMode,
    dead_letter_subject: String,
    reconnect_delay: Duration,
}

impl QueueConsumer {
    pub fn new(config: &NatsConfig, queue: &str, ack_mode: AckMode) -> Self {
        Self {
            broker: BrokerClient::new(config),
            queue: queue.to_string(),
            ack_mode,
            dead_letter_subject: dead_letter_subject(&config.dead_letter_prefix, queue),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
        }
    }

    /// Get the queue name
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until `shutdown` flips, re-establishing the stream after errors
    pub async fn run(
        mut self,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(queue = %self.queue, ack_mode = ?self.ack_mode, "Queue consumer starting");

        while !is_stopping(&shutdown) {
            match self.consume(handler.as_ref(), &mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        error = %format!("{e:#}"),
                        retry_in_secs = self.reconnect_delay.as_secs(),
                        "Consume loop interrupted"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(queue = %self.queue, "Queue consumer stopping");
        self.broker.close().await
    }

    /// Returns `Ok` only on shutdown
    async fn consume(
        &mut self,
        handler: &dyn DeliveryHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let consumer = self.broker.queue_consumer(&self.queue, self.ack_mode).await?;
        let mut messages = consumer
            .messages()
            .await
            .with_context(|| format!("Failed to open message stream for {}", self.queue))?;
        info!(queue = %self.queue, "Consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                next = messages.next() => match next {
                    Some(Ok(message)) => self.process(handler, message).await?,
                    Some(Err(e)) => return Err(e).context("Message stream error"),
                    None => bail!("Message stream for {} ended", self.queue),
                },
            }
        }
    }

    async fn process(&mut self, handler: &dyn DeliveryHandler, message: Message) -> Result<()> {
        let subject = message.subject.to_string();

        match self.ack_mode {
            // Consumed on delivery; the consumer has no acks
            AckMode::Immediate => {
                if let Err(e) = handler.handle(&self.queue, &subject, &message.payload).await {
                    error!(queue = %self.queue, subject = %subject, error = %format!("{e:#}"), "Handler failed");
                }
            }
            AckMode::AfterHandling => {
                match handler.handle(&self.queue, &subject, &message.payload).await {
                    Ok(outcome) => {
                        debug!(queue = %self.queue, processed = outcome.processed, skipped = outcome.skipped, "Delivery handled");
                        message.ack().await.map_err(|e| anyhow!(e)).context("Ack failed")?;
                    }
                    Err(e) => {
                        error!(queue = %self.queue, subject = %subject, error = %format!("{e:#}"), "Handler failed, dead-lettering");
                        self.dead_letter(&subject, &message.payload, &e).await;
                        message
                            .ack_with(AckKind::Term)
                            .await
                            .map_err(|e| anyhow!(e))
                            .context("Term ack failed")?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(&mut self, subject: &str, payload: &[u8], cause: &anyhow::Error) {
        let body = match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) => value,
            Err(_) => json!(String::from_utf8_lossy(payload)),
        };
        let letter = json!({
            "queue": self.queue,
            "subject": subject,
            "error": format!("{cause:#}"),
            "failed_at": chrono::Utc::now().to_rfc3339(),
            "payload": body,
        });

        let target = self.dead_letter_subject.clone();
        if let Err(e) = self.broker.publish_core(&target, &letter).await {
            error!(subject = %target, error = %e, "Failed to publish dead letter");
        }
    }
}

fn is_stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
