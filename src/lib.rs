//! Tenantry: tenant isolation and cross-service cache sync for schema-partitioned Postgres.

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod context;
pub mod directory;
mod error;
pub mod events;
pub mod executor;
pub mod lookup;
pub mod metrics;
pub mod publisher;
pub mod resolver;
pub mod schema;
pub mod testing;

pub use config::Config;
pub use context::{PartitionLocator, TenantContext, TenantId};
pub use error::{Error, Result, WithContext};
pub use executor::{PartitionBinding, ScopedExecutor};
pub use schema::{SchemaConfig, SchemaManager, SchemaPlan};

pub mod prelude {
    pub use crate::auth::{LoginService, TokenIssuer};
    pub use crate::broker::{Broker, MemoryBroker, PgBroker};
    pub use crate::cache::{EmailIndexProjection, UserCacheProjection, UserCacheStore};
    pub use crate::consumer::{Consumer, ConsumerOptions, EnvelopeHandler, Subscription};
    pub use crate::directory::{TenantDirectory, TenantStatus};
    pub use crate::events::{DomainEvent, Envelope, EventType};
    pub use crate::publisher::EventPublisher;
    pub use crate::resolver::TenantResolver;
    pub use crate::{Error, Result, ScopedExecutor, TenantContext, TenantId};
}
