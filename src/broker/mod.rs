//! Topic-exchange message broker seam.
//!
//! Exchanges route by AMQP topic rules to bound queues. Deliveries are leased: a
//! delivery that is neither acked, requeued nor dead-lettered before its lease expires
//! is delivered again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;
use crate::metrics::HealthStatus;

mod memory;
mod postgres;
mod routing;

pub use memory::MemoryBroker;
pub use postgres::PgBroker;
pub use routing::topic_matches;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub message_id: Uuid,
    pub body: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub i64);

#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Uuid,
    pub body: Vec<u8>,
    /// Deliveries so far, this one included.
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Where dead-lettered messages land. Defaults to `dlq.<name>`.
    pub dead_letter_queue: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_queue: None,
        }
    }

    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    pub fn dead_letter_name(&self) -> String {
        self.dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("dlq.{}", self.name))
    }
}

#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub id: i64,
    pub queue: String,
    pub source_queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Uuid,
    pub body: Vec<u8>,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Route `message` through `exchange`; returns how many queues received it.
    /// Unroutable messages are dropped and count as zero.
    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<usize>;

    /// Lease up to `max` ready deliveries from `queue`.
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return the delivery to its queue, visible again after `delay`.
    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// Dead letters recorded for `queue`, whether named as the source or the
    /// dead-letter queue itself. Oldest first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn health(&self) -> HealthStatus;
}
