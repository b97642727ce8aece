use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Broker, DeadLetter, Delivery, DeliveryTag, OutboundMessage, QueueSpec, topic_matches};
use crate::metrics::HealthStatus;
use crate::{Error, Result};

/// In-process topic exchange. Messages do not survive the process.
#[derive(Debug)]
pub struct MemoryBroker {
    lease: Duration,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: i64,
    dead: Vec<DeadLetter>,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    in_flight: HashMap<i64, (Stored, Instant)>,
}

#[derive(Clone, Debug)]
struct Stored {
    tag: i64,
    exchange: String,
    routing_key: String,
    message_id: Uuid,
    body: Vec<u8>,
    attempts: u32,
    available_at: Instant,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(30))
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            state: Mutex::new(State::default()),
        }
    }

    /// Ready plus in-flight messages on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.state.lock().expect("memory broker poisoned");
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.in_flight.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        state.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        state
            .queues
            .entry(spec.name.clone())
            .and_modify(|q| q.spec = spec.clone())
            .or_insert_with(|| QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        if !state.queues.contains_key(queue) {
            return Err(Error::Broker(format!("queue `{queue}` is not declared")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<usize> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        if !state.exchanges.contains(exchange) {
            return Err(Error::Broker(format!("exchange `{exchange}` is not declared")));
        }
        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let now = Instant::now();
        for queue in &targets {
            state.next_tag += 1;
            let tag = state.next_tag;
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Stored {
                    tag,
                    exchange: exchange.to_string(),
                    routing_key: message.routing_key.clone(),
                    message_id: message.message_id,
                    body: message.body.clone(),
                    attempts: 0,
                    available_at: now,
                });
            }
        }
        Ok(targets.len())
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Broker(format!("queue `{queue}` is not declared")))?;
        let now = Instant::now();

        let expired: Vec<i64> = q
            .in_flight
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some((msg, _)) = q.in_flight.remove(&tag) {
                q.ready.push_front(msg);
            }
        }

        let mut out = Vec::new();
        let mut waiting = VecDeque::with_capacity(q.ready.len());
        while let Some(mut msg) = q.ready.pop_front() {
            if out.len() < max && msg.available_at <= now {
                msg.attempts += 1;
                out.push(Delivery {
                    tag: DeliveryTag(msg.tag),
                    queue: queue.to_string(),
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                    message_id: msg.message_id,
                    body: msg.body.clone(),
                    attempts: msg.attempts,
                });
                q.in_flight.insert(msg.tag, (msg, now + self.lease));
            } else {
                waiting.push_back(msg);
            }
        }
        q.ready = waiting;
        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        if let Some(q) = state.queues.get_mut(&delivery.queue) {
            q.in_flight.remove(&delivery.tag.0);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        if let Some(q) = state.queues.get_mut(&delivery.queue) {
            if let Some((mut msg, _)) = q.in_flight.remove(&delivery.tag.0) {
                msg.available_at = Instant::now() + delay;
                q.ready.push_back(msg);
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut state = self.state.lock().expect("memory broker poisoned");
        let Some(q) = state.queues.get_mut(&delivery.queue) else {
            return Ok(());
        };
        let Some((msg, _)) = q.in_flight.remove(&delivery.tag.0) else {
            return Ok(());
        };
        let dead_letter_queue = q.spec.dead_letter_name();
        let id = state.dead.len() as i64 + 1;
        state.dead.push(DeadLetter {
            id,
            queue: dead_letter_queue,
            source_queue: delivery.queue.clone(),
            exchange: msg.exchange,
            routing_key: msg.routing_key,
            message_id: msg.message_id,
            body: msg.body,
            attempts: msg.attempts,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock().expect("memory broker poisoned");
        Ok(state
            .dead
            .iter()
            .filter(|d| d.queue == queue || d.source_queue == queue)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Up
    }
}
