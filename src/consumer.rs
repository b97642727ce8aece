//! Event consumer runtime.
//!
//! One consumer drains one queue and applies each envelope through a handler:
//!
//! - applied: ack
//! - poison (malformed envelope, no usable tenant): dead-letter immediately
//! - failed: requeue with backoff, dead-letter once `max_retries` is exhausted
//! - unknown event type: ack and ignore
//!
//! Shutdown is cooperative: intake stops, the delivery being handled finishes,
//! deliveries fetched but not yet started are handed back to the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::broker::{Broker, Delivery, QueueSpec};
use crate::config::{BrokerConfig, Config};
use crate::directory::TenantDirectory;
use crate::events::{Envelope, USER_EVENTS_EXCHANGE};
use crate::metrics::{self, metrics};
use crate::{Error, Result};

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub exchange: String,
    pub patterns: Vec<String>,
    pub dead_letter_queue: Option<String>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            patterns: Vec::new(),
            dead_letter_queue: None,
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    /// The whole `user.#` family on this service's user-events queue.
    pub fn user_events(config: &BrokerConfig) -> Self {
        Self::new(config.queue_name("user"), USER_EVENTS_EXCHANGE)
            .pattern("user.#")
            .dead_letter_to(config.dead_letter_queue())
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub prefetch: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 16,
            poll_interval: Duration::from_millis(250),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefetch: config.broker.prefetch as usize,
            poll_interval: config.broker.poll_interval,
            max_retries: config.broker.max_retries,
            base_backoff: config.broker.retry_backoff,
            shutdown_grace: config.consumer.shutdown_grace,
            ..Self::default()
        }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let delay = self.base_backoff.saturating_mul(attempts.max(1));
        delay.min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Listening,
    Draining,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored,
    Requeued,
    DeadLettered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub applied: usize,
    pub ignored: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

impl TickReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Ignored => self.ignored += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

pub struct Consumer {
    broker: Arc<dyn Broker>,
    subscription: Subscription,
    handler: Arc<dyn EnvelopeHandler>,
    options: ConsumerOptions,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        subscription: Subscription,
        handler: Arc<dyn EnvelopeHandler>,
        options: ConsumerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            broker,
            subscription,
            handler,
            options,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Declare the exchange, the queue and its bindings. Idempotent.
    pub async fn declare(&self) -> Result<()> {
        let sub = &self.subscription;
        self.broker.declare_exchange(&sub.exchange).await?;
        let mut spec = QueueSpec::new(&sub.queue);
        spec.dead_letter_queue = sub.dead_letter_queue.clone();
        self.broker.declare_queue(&spec).await?;
        for pattern in &sub.patterns {
            self.broker
                .bind_queue(&sub.queue, &sub.exchange, pattern)
                .await?;
        }
        Ok(())
    }

    /// Fetch and handle one batch.
    #[instrument(skip(self), fields(queue = %self.subscription.queue, handler = self.handler.name()))]
    pub async fn tick_once(&self) -> Result<TickReport> {
        let deliveries = self
            .broker
            .fetch(&self.subscription.queue, self.options.prefetch)
            .await?;
        let mut report = TickReport {
            fetched: deliveries.len(),
            ..TickReport::default()
        };
        for delivery in deliveries {
            report.record(self.handle_delivery(delivery).await);
        }
        Ok(report)
    }

    /// Declare topology, then consume until [`ConsumerHandle::shutdown`].
    pub async fn start(self) -> Result<ConsumerHandle> {
        self.declare().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let join = tokio::spawn(self.run(shutdown_rx));
        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            state,
            join,
        })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.subscription.queue.clone();
        self.state.send_replace(ConsumerState::Listening);
        tracing::info!(target: "tenantry::consumer", queue = %queue, handler = self.handler.name(), "consumer listening");

        'intake: while !*shutdown.borrow() {
            let deliveries = match self.broker.fetch(&queue, self.options.prefetch).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    tracing::warn!(target: "tenantry::consumer", queue = %queue, error = %err, "fetch failed");
                    Vec::new()
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'intake;
                        }
                    }
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            }

            let mut pending = deliveries.into_iter();
            while let Some(delivery) = pending.next() {
                if *shutdown.borrow() {
                    self.state.send_replace(ConsumerState::Draining);
                    self.release(delivery).await;
                    for rest in pending.by_ref() {
                        self.release(rest).await;
                    }
                    break 'intake;
                }
                self.handle_delivery(delivery).await;
            }
        }

        self.state.send_replace(ConsumerState::Draining);
        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!(target: "tenantry::consumer", queue = %queue, "consumer stopped");
    }

    async fn release(&self, delivery: Delivery) {
        if let Err(err) = self.broker.requeue(&delivery, Duration::ZERO).await {
            tracing::warn!(
                target: "tenantry::consumer",
                queue = %delivery.queue,
                error = %err,
                "could not hand back unstarted delivery; it returns when its lease expires"
            );
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) -> Outcome {
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(Error::UnknownEventType(ty)) => {
                tracing::debug!(
                    target: "tenantry::consumer",
                    queue = %delivery.queue,
                    event_type = %ty,
                    "ignoring unknown event type"
                );
                self.settle(self.broker.ack(&delivery).await, &delivery);
                return Outcome::Ignored;
            }
            Err(err) => {
                metrics::incr(&metrics().envelopes_rejected_total);
                tracing::error!(
                    target: "tenantry::consumer",
                    queue = %delivery.queue,
                    message_id = %delivery.message_id,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "rejecting envelope"
                );
                return self.dead_letter(&delivery, &err).await;
            }
        };

        match self.handler.handle(&envelope).await {
            Ok(()) => {
                metrics::incr(&metrics().events_applied_total);
                tracing::debug!(
                    target: "tenantry::consumer",
                    event_id = %envelope.id,
                    event_type = %envelope.event_type(),
                    tenant_id = %envelope.tenant.id(),
                    correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
                    "envelope applied"
                );
                self.settle(self.broker.ack(&delivery).await, &delivery);
                Outcome::Applied
            }
            Err(err) if err.is_poison() => {
                tracing::error!(
                    target: "tenantry::consumer",
                    event_id = %envelope.id,
                    tenant_id = %envelope.tenant.id(),
                    error = %err,
                    "envelope cannot be applied"
                );
                self.dead_letter(&delivery, &err).await
            }
            Err(err) if delivery.attempts > self.options.max_retries => {
                tracing::error!(
                    target: "tenantry::consumer",
                    event_id = %envelope.id,
                    event_type = %envelope.event_type(),
                    tenant_id = %envelope.tenant.id(),
                    attempts = delivery.attempts,
                    error = %err,
                    "retries exhausted; dead-lettering"
                );
                self.dead_letter(&delivery, &err).await
            }
            Err(err) => {
                let delay = self.options.backoff(delivery.attempts);
                tracing::warn!(
                    target: "tenantry::consumer",
                    event_id = %envelope.id,
                    event_type = %envelope.event_type(),
                    attempts = delivery.attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "apply failed; requeueing"
                );
                metrics::incr(&metrics().events_redelivered_total);
                self.settle(self.broker.requeue(&delivery, delay).await, &delivery);
                Outcome::Requeued
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, err: &Error) -> Outcome {
        metrics::incr(&metrics().events_dead_lettered_total);
        self.settle(
            self.broker.dead_letter(delivery, &err.to_string()).await,
            delivery,
        );
        Outcome::DeadLettered
    }

    // A failed settle leaves the lease to expire, which redelivers the message.
    fn settle(&self, result: Result<()>, delivery: &Delivery) {
        if let Err(err) = result {
            tracing::warn!(
                target: "tenantry::consumer",
                queue = %delivery.queue,
                message_id = %delivery.message_id,
                error = %err,
                "broker did not accept settlement"
            );
        }
    }
}

pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConsumerState>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Stop intake and wait up to `grace` for in-flight work. Past the grace period the
    /// task is aborted and its unsettled deliveries come back when their leases expire.
    pub async fn shutdown(mut self, grace: Duration) -> Result<()> {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(joined) => joined.map_err(Error::from),
            Err(_) => {
                tracing::warn!(
                    target: "tenantry::consumer",
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "consumer did not drain within grace period; aborting"
                );
                self.join.abort();
                Err(Error::DeadlineExceeded)
            }
        }
    }
}

/// Rejects envelopes whose tenant fields disagree with the directory before they reach
/// the inner handler.
pub struct VerifyingHandler<H> {
    directory: Arc<dyn TenantDirectory>,
    inner: H,
}

impl<H> VerifyingHandler<H> {
    pub fn new(directory: Arc<dyn TenantDirectory>, inner: H) -> Self {
        Self { directory, inner }
    }
}

#[async_trait]
impl<H: EnvelopeHandler> EnvelopeHandler for VerifyingHandler<H> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let claimed = &envelope.tenant;
        let Some(tenant) = self.directory.get(claimed.id()).await? else {
            return Err(Error::InvalidTenantContext(format!(
                "tenant {} is not in the directory",
                claimed.id()
            )));
        };
        if tenant.partition() != claimed.partition() {
            return Err(Error::InvalidTenantContext(format!(
                "tenant {} owns partition {}, envelope names {}",
                claimed.id(),
                tenant.partition(),
                claimed.partition()
            )));
        }
        self.inner.handle(envelope).await
    }
}

/// Fan one envelope out to several handlers in order; the first failure stops the chain.
pub struct HandlerChain {
    name: String,
    handlers: Vec<Arc<dyn EnvelopeHandler>>,
}

impl HandlerChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.handlers.push(handler);
        self
    }
}

#[async_trait]
impl EnvelopeHandler for HandlerChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        for handler in &self.handlers {
            handler.handle(envelope).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        let opts = ConsumerOptions {
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(5),
            ..ConsumerOptions::default()
        };
        assert_eq!(opts.backoff(1), Duration::from_secs(2));
        assert_eq!(opts.backoff(2), Duration::from_secs(4));
        assert_eq!(opts.backoff(9), Duration::from_secs(5));
    }

    #[test]
    fn tick_report_tallies_every_outcome() {
        let mut report = TickReport {
            fetched: 5,
            ..TickReport::default()
        };
        for outcome in [
            Outcome::Applied,
            Outcome::Applied,
            Outcome::Ignored,
            Outcome::Requeued,
            Outcome::DeadLettered,
        ] {
            report.record(outcome);
        }
        assert_eq!(
            report.applied + report.ignored + report.requeued + report.dead_lettered,
            report.fetched
        );
        assert_eq!(report.applied, 2);
    }

    #[test]
    fn user_events_subscription_follows_naming() {
        let cfg = BrokerConfig {
            service: "inventory".into(),
            ..BrokerConfig::default()
        };
        let sub = Subscription::user_events(&cfg);
        assert_eq!(sub.queue, "inventory.user-events");
        assert_eq!(sub.exchange, "user.events");
        assert_eq!(sub.patterns, ["user.#"]);
        assert_eq!(sub.dead_letter_queue.as_deref(), Some("dlq.inventory"));
    }
}
