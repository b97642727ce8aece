//! Domain events exchanged between services and the envelope that carries them.
//!
//! The wire format is flat JSON:
//!
//! ```json
//! { "id": "..", "type": "user.updated", "source": "user-service",
//!   "timestamp": "2024-05-01T10:00:00Z", "correlation_id": "..",
//!   "tenant_id": "..", "tenant_slug": "north", "tenant_schema": "tenant_north",
//!   "data": { .. } }
//! ```
//!
//! Unknown fields are ignored. The three tenant fields are mandatory.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::TenantContext;
use crate::{Error, Result};

pub const USER_EVENTS_EXCHANGE: &str = "user.events";
pub const STAFF_EVENTS_EXCHANGE: &str = "staff.events";
pub const INVENTORY_EVENTS_EXCHANGE: &str = "inventory.events";

pub const EXCHANGES: [&str; 3] = [
    USER_EVENTS_EXCHANGE,
    STAFF_EVENTS_EXCHANGE,
    INVENTORY_EVENTS_EXCHANGE,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserRoleChanged,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::UserDeleted,
        EventType::UserRoleChanged,
    ];

    /// Wire tag, also used as the routing key.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserCreated => "user.created",
            EventType::UserUpdated => "user.updated",
            EventType::UserDeleted => "user.deleted",
            EventType::UserRoleChanged => "user.role.changed",
        }
    }

    pub fn exchange(&self) -> &'static str {
        match self {
            EventType::UserCreated
            | EventType::UserUpdated
            | EventType::UserDeleted
            | EventType::UserRoleChanged => USER_EVENTS_EXCHANGE,
        }
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownEventType(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Sparse change-set: only fields that changed are present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
}

impl UserChanges {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.role_name.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub user_id: Uuid,
    #[serde(default)]
    pub changes: UserChanges,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_email: Option<String>,
}

impl UserUpdated {
    /// The post-update email, whichever field carried it.
    pub fn effective_email(&self) -> Option<&str> {
        self.changes
            .email
            .as_deref()
            .or(self.new_email.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRoleChanged {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_role_name: Option<String>,
    pub new_role_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainEvent {
    UserCreated(UserCreated),
    UserUpdated(UserUpdated),
    UserDeleted(UserDeleted),
    UserRoleChanged(UserRoleChanged),
}

impl DomainEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::UserCreated(_) => EventType::UserCreated,
            DomainEvent::UserUpdated(_) => EventType::UserUpdated,
            DomainEvent::UserDeleted(_) => EventType::UserDeleted,
            DomainEvent::UserRoleChanged(_) => EventType::UserRoleChanged,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            DomainEvent::UserCreated(e) => e.user_id,
            DomainEvent::UserUpdated(e) => e.user_id,
            DomainEvent::UserDeleted(e) => e.user_id,
            DomainEvent::UserRoleChanged(e) => e.user_id,
        }
    }

    pub fn decode(event_type: EventType, data: Value) -> Result<Self> {
        let event = match event_type {
            EventType::UserCreated => DomainEvent::UserCreated(serde_json::from_value(data)?),
            EventType::UserUpdated => DomainEvent::UserUpdated(serde_json::from_value(data)?),
            EventType::UserDeleted => DomainEvent::UserDeleted(serde_json::from_value(data)?),
            EventType::UserRoleChanged => {
                DomainEvent::UserRoleChanged(serde_json::from_value(data)?)
            }
        };
        Ok(event)
    }

    pub fn to_data(&self) -> Result<Value> {
        let value = match self {
            DomainEvent::UserCreated(e) => serde_json::to_value(e)?,
            DomainEvent::UserUpdated(e) => serde_json::to_value(e)?,
            DomainEvent::UserDeleted(e) => serde_json::to_value(e)?,
            DomainEvent::UserRoleChanged(e) => serde_json::to_value(e)?,
        };
        Ok(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub source: String,
    pub emitted_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub tenant: TenantContext,
    pub event: DomainEvent,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    tenant_slug: Option<String>,
    #[serde(default)]
    tenant_schema: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn new(source: impl Into<String>, tenant: TenantContext, event: DomainEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            emitted_at: Utc::now(),
            correlation_id: None,
            tenant,
            event,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_emitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.emitted_at = at;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    pub fn routing_key(&self) -> &'static str {
        self.event_type().as_str()
    }

    pub fn exchange(&self) -> &'static str {
        self.event_type().exchange()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            id: Some(self.id),
            event_type: Some(self.event_type().as_str().to_string()),
            source: Some(self.source.clone()),
            timestamp: Some(self.emitted_at),
            correlation_id: self.correlation_id.clone(),
            tenant_id: Some(self.tenant.id().to_string()),
            tenant_slug: Some(self.tenant.slug().to_string()),
            tenant_schema: Some(self.tenant.partition().to_string()),
            data: self.event.to_data()?,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode and validate a delivery body.
    ///
    /// Tenant fields are checked before anything else: an envelope that cannot be
    /// attributed to a tenant is [`Error::InvalidEnvelope`] whatever its type. A
    /// well-formed envelope of a type this build does not know is
    /// [`Error::UnknownEventType`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidEnvelope(format!("malformed json: {e}")))?;

        let tenant = TenantContext::from_parts(
            wire.tenant_id.as_deref(),
            wire.tenant_slug.as_deref(),
            wire.tenant_schema.as_deref(),
        )
        .map_err(|e| Error::InvalidEnvelope(format!("tenant fields: {e}")))?;

        let raw_type = wire
            .event_type
            .ok_or_else(|| Error::InvalidEnvelope("missing event type".into()))?;
        let event_type: EventType = raw_type.parse()?;

        let id = wire
            .id
            .ok_or_else(|| Error::InvalidEnvelope("missing event id".into()))?;
        let emitted_at = wire
            .timestamp
            .ok_or_else(|| Error::InvalidEnvelope("missing timestamp".into()))?;

        let event = DomainEvent::decode(event_type, wire.data)
            .map_err(|e| Error::InvalidEnvelope(format!("{event_type} payload: {e}")))?;

        Ok(Self {
            id,
            source: wire.source.unwrap_or_default(),
            emitted_at,
            correlation_id: wire.correlation_id,
            tenant,
            event,
        })
    }
}
