use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::Result;
use crate::broker::{Broker, OutboundMessage};
use crate::context::TenantContext;
use crate::events::{DomainEvent, EXCHANGES, Envelope};
use crate::metrics::{self, metrics};

/// Best-effort publisher for committed state changes.
///
/// Call only after the originating transaction committed. A failed publish is logged
/// and counted but never reported to the caller: the primary write already happened.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    source: String,
}

impl EventPublisher {
    /// Declares the domain exchanges so that publishing never races topology setup.
    pub async fn new(broker: Arc<dyn Broker>, source: impl Into<String>) -> Result<Self> {
        for exchange in EXCHANGES {
            broker.declare_exchange(exchange).await?;
        }
        Ok(Self {
            broker,
            source: source.into(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the envelope id when the broker accepted the message.
    pub async fn publish(&self, tenant: &TenantContext, event: DomainEvent) -> Option<Uuid> {
        let envelope = Envelope::new(self.source.clone(), tenant.clone(), event);
        self.publish_envelope(envelope).await
    }

    pub async fn publish_with_correlation(
        &self,
        tenant: &TenantContext,
        event: DomainEvent,
        correlation_id: impl Into<String>,
    ) -> Option<Uuid> {
        let envelope = Envelope::new(self.source.clone(), tenant.clone(), event)
            .with_correlation_id(correlation_id);
        self.publish_envelope(envelope).await
    }

    /// Publish and surface failures. Returns how many queues received the message.
    #[instrument(skip_all, fields(event_id = %envelope.id, event_type = %envelope.event_type()))]
    pub async fn try_publish(&self, envelope: &Envelope) -> Result<usize> {
        let message = OutboundMessage {
            routing_key: envelope.routing_key().to_string(),
            message_id: envelope.id,
            body: envelope.encode()?,
        };
        let routed = self.broker.publish(envelope.exchange(), message).await?;
        if routed == 0 {
            tracing::debug!(
                target: "tenantry::publisher",
                routing_key = envelope.routing_key(),
                "no queue bound for routing key"
            );
        }
        Ok(routed)
    }

    async fn publish_envelope(&self, envelope: Envelope) -> Option<Uuid> {
        match self.try_publish(&envelope).await {
            Ok(_) => {
                metrics::incr(&metrics().events_published_total);
                Some(envelope.id)
            }
            Err(err) => {
                metrics::incr(&metrics().publish_failures_total);
                tracing::error!(
                    target: "tenantry::publisher",
                    event_id = %envelope.id,
                    event_type = %envelope.event_type(),
                    tenant_id = %envelope.tenant.id(),
                    error = %err,
                    "event publish failed; continuing without notification"
                );
                None
            }
        }
    }
}
