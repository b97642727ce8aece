use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tenantry::broker::{
    Broker, DeadLetter, Delivery, MemoryBroker, OutboundMessage, QueueSpec,
};
use tenantry::cache::{EmailIndexProjection, MemoryUserCache, UserCacheProjection, UserCacheStore};
use tenantry::config::BrokerConfig;
use tenantry::consumer::{
    Consumer, ConsumerOptions, ConsumerState, EnvelopeHandler, HandlerChain, Subscription,
    VerifyingHandler,
};
use tenantry::context::{PartitionLocator, TenantContext, TenantId};
use tenantry::directory::{MemoryTenantDirectory, Tenant, TenantStatus};
use tenantry::events::{
    DomainEvent, Envelope, USER_EVENTS_EXCHANGE, UserChanges, UserCreated, UserDeleted,
    UserRoleChanged, UserUpdated,
};
use tenantry::lookup::{EmailIndex, MemoryEmailIndex};
use tenantry::metrics::HealthStatus;
use tenantry::publisher::EventPublisher;
use tenantry::{Error, Result as TenantryResult};
use uuid::Uuid;

fn ctx(slug: &str) -> TenantContext {
    TenantContext::new(
        TenantId::new(Uuid::new_v4()),
        slug,
        PartitionLocator::for_slug(slug).unwrap(),
    )
    .unwrap()
}

fn options() -> ConsumerOptions {
    ConsumerOptions {
        poll_interval: Duration::from_millis(10),
        max_retries: 2,
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        ..ConsumerOptions::default()
    }
}

fn subscription() -> Subscription {
    Subscription::user_events(&BrokerConfig {
        service: "inventory".into(),
        ..BrokerConfig::default()
    })
}

fn created(user_id: Uuid, email: &str) -> DomainEvent {
    DomainEvent::UserCreated(UserCreated {
        user_id,
        email: email.into(),
        first_name: "Grace".into(),
        last_name: "Hopper".into(),
        role_name: Some("staff".into()),
        username: None,
    })
}

fn updated(user_id: Uuid, changes: UserChanges) -> DomainEvent {
    DomainEvent::UserUpdated(UserUpdated {
        user_id,
        changes,
        old_email: None,
        new_email: None,
    })
}

struct Harness {
    broker: Arc<MemoryBroker>,
    cache: Arc<MemoryUserCache>,
    consumer: Consumer,
    publisher: EventPublisher,
}

async fn harness() -> Result<Harness> {
    let broker = Arc::new(MemoryBroker::new());
    let cache = Arc::new(MemoryUserCache::new());
    let consumer = Consumer::new(
        broker.clone(),
        subscription(),
        Arc::new(UserCacheProjection::new(cache.clone())),
        options(),
    );
    consumer.declare().await?;
    let publisher = EventPublisher::new(broker.clone(), "user-service").await?;
    Ok(Harness {
        broker,
        cache,
        consumer,
        publisher,
    })
}

#[tokio::test]
async fn replayed_create_does_not_clobber_later_update() -> Result<()> {
    let h = harness().await?;
    let tenant = ctx("north");
    let user = Uuid::new_v4();
    let t0 = Utc::now();

    let create = Envelope::new("user-service", tenant.clone(), created(user, "old@x.com"))
        .with_emitted_at(t0);
    let update = Envelope::new(
        "user-service",
        tenant.clone(),
        updated(
            user,
            UserChanges {
                email: Some("new@x.com".into()),
                ..UserChanges::default()
            },
        ),
    )
    .with_emitted_at(t0 + ChronoDuration::seconds(1));

    h.publisher.try_publish(&create).await?;
    h.publisher.try_publish(&update).await?;
    h.publisher.try_publish(&create).await?;

    let report = h.consumer.tick_once().await?;
    assert_eq!(report.fetched, 3);
    assert_eq!(report.applied, 3);

    let cached = h.cache.get(&tenant, user).await?.expect("cached user");
    assert_eq!(cached.email, "new@x.com");
    assert_eq!(cached.first_name, "Grace");
    assert_eq!(cached.role_name.as_deref(), Some("staff"));
    Ok(())
}

#[tokio::test]
async fn duplicate_creates_converge() -> Result<()> {
    let once = harness().await?;
    let many = harness().await?;
    let tenant = ctx("north");
    let user = Uuid::new_v4();
    let create = Envelope::new("user-service", tenant.clone(), created(user, "g@x.com"));

    once.publisher.try_publish(&create).await?;
    once.consumer.tick_once().await?;
    for _ in 0..4 {
        many.publisher.try_publish(&create).await?;
    }
    many.consumer.tick_once().await?;

    assert_eq!(
        once.cache.get(&tenant, user).await?,
        many.cache.get(&tenant, user).await?
    );
    assert_eq!(many.cache.live(tenant.partition()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn update_and_delete_of_unknown_user_are_noops() -> Result<()> {
    let h = harness().await?;
    let tenant = ctx("north");
    let ghost = Uuid::new_v4();

    h.publisher
        .publish(
            &tenant,
            updated(
                ghost,
                UserChanges {
                    first_name: Some("Nobody".into()),
                    ..UserChanges::default()
                },
            ),
        )
        .await
        .expect("published");
    h.publisher
        .publish(
            &tenant,
            DomainEvent::UserDeleted(UserDeleted {
                user_id: ghost,
                email: None,
            }),
        )
        .await
        .expect("published");

    let report = h.consumer.tick_once().await?;
    assert_eq!(report.applied, 2);
    assert_eq!(report.dead_lettered, 0);
    assert!(h.cache.get(&tenant, ghost).await?.is_none());
    assert!(h.cache.live(tenant.partition()).is_empty());
    Ok(())
}

#[tokio::test]
async fn partial_update_keeps_other_fields() -> Result<()> {
    let h = harness().await?;
    let tenant = ctx("north");
    let user = Uuid::new_v4();

    h.publisher.publish(&tenant, created(user, "g@x.com")).await;
    h.consumer.tick_once().await?;
    let before = h.cache.get(&tenant, user).await?.expect("created");

    h.publisher
        .publish(
            &tenant,
            updated(
                user,
                UserChanges {
                    last_name: Some("Murray".into()),
                    ..UserChanges::default()
                },
            ),
        )
        .await;
    h.publisher
        .publish(
            &tenant,
            DomainEvent::UserRoleChanged(UserRoleChanged {
                user_id: user,
                old_role_name: Some("staff".into()),
                new_role_name: "admin".into(),
            }),
        )
        .await;
    h.consumer.tick_once().await?;

    let after = h.cache.get(&tenant, user).await?.expect("still cached");
    assert_eq!(after.last_name, "Murray");
    assert_eq!(after.role_name.as_deref(), Some("admin"));
    assert_eq!(after.first_name, before.first_name);
    assert_eq!(after.email, before.email);
    Ok(())
}

#[tokio::test]
async fn delete_removes_record() -> Result<()> {
    let h = harness().await?;
    let tenant = ctx("north");
    let user = Uuid::new_v4();

    h.publisher.publish(&tenant, created(user, "g@x.com")).await;
    h.publisher
        .publish(
            &tenant,
            DomainEvent::UserDeleted(UserDeleted {
                user_id: user,
                email: Some("g@x.com".into()),
            }),
        )
        .await;
    h.consumer.tick_once().await?;
    assert!(h.cache.get(&tenant, user).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn tenants_never_touch_each_others_records() -> Result<()> {
    let h = harness().await?;
    let north = ctx("north");
    let south = ctx("south");
    let user = Uuid::new_v4();

    h.publisher.publish(&north, created(user, "n@x.com")).await;
    h.publisher
        .publish(
            &south,
            DomainEvent::UserDeleted(UserDeleted {
                user_id: user,
                email: None,
            }),
        )
        .await;
    h.consumer.tick_once().await?;

    assert!(h.cache.get(&north, user).await?.is_some());
    assert!(h.cache.get(&south, user).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn envelope_without_tenant_is_dead_lettered() -> Result<()> {
    let h = harness().await?;
    let body = serde_json::to_vec(&json!({
        "id": Uuid::new_v4(),
        "type": "user.created",
        "timestamp": Utc::now(),
        "tenant_id": Uuid::new_v4(),
        "tenant_slug": "north",
        "data": { "user_id": Uuid::new_v4(), "email": "x@x.com" },
    }))?;
    h.broker
        .publish(
            USER_EVENTS_EXCHANGE,
            OutboundMessage {
                routing_key: "user.created".into(),
                message_id: Uuid::new_v4(),
                body,
            },
        )
        .await?;

    let report = h.consumer.tick_once().await?;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.broker.depth("inventory.user-events"), 0);

    let dead = h.broker.dead_letters("dlq.inventory", 10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].source_queue, "inventory.user-events");
    assert!(dead[0].reason.contains("tenant"));
    Ok(())
}

#[tokio::test]
async fn unknown_event_type_is_acked_and_ignored() -> Result<()> {
    let h = harness().await?;
    let tenant = ctx("north");
    let body = serde_json::to_vec(&json!({
        "id": Uuid::new_v4(),
        "type": "user.password.reset",
        "timestamp": Utc::now(),
        "tenant_id": tenant.id().to_string(),
        "tenant_slug": tenant.slug(),
        "tenant_schema": tenant.partition().as_str(),
        "data": {},
    }))?;
    h.broker
        .publish(
            USER_EVENTS_EXCHANGE,
            OutboundMessage {
                routing_key: "user.password.reset".into(),
                message_id: Uuid::new_v4(),
                body,
            },
        )
        .await?;

    let report = h.consumer.tick_once().await?;
    assert_eq!(report.ignored, 1);
    assert_eq!(h.broker.depth("inventory.user-events"), 0);
    assert!(h.broker.dead_letters("dlq.inventory", 10).await?.is_empty());
    Ok(())
}

struct Flaky {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl EnvelopeHandler for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn handle(&self, _envelope: &Envelope) -> TenantryResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::Broker("storage unavailable".into()));
        }
        Ok(())
    }
}

async fn flaky_consumer(failures: usize) -> Result<(Arc<MemoryBroker>, Arc<Flaky>, Consumer)> {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Flaky {
        failures_left: AtomicUsize::new(failures),
        calls: AtomicUsize::new(0),
    });
    let consumer = Consumer::new(broker.clone(), subscription(), handler.clone(), options());
    consumer.declare().await?;
    let publisher = EventPublisher::new(broker.clone(), "user-service").await?;
    publisher
        .publish(&ctx("north"), created(Uuid::new_v4(), "f@x.com"))
        .await
        .expect("published");
    Ok((broker, handler, consumer))
}

#[tokio::test]
async fn transient_failure_is_redelivered_then_applied() -> Result<()> {
    let (broker, handler, consumer) = flaky_consumer(1).await?;

    let first = consumer.tick_once().await?;
    assert_eq!(first.requeued, 1);
    let second = consumer.tick_once().await?;
    assert_eq!(second.applied, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.depth("inventory.user-events"), 0);
    Ok(())
}

#[tokio::test]
async fn repeated_failure_ends_in_dead_letter() -> Result<()> {
    let (broker, handler, consumer) = flaky_consumer(usize::MAX).await?;

    let mut dead_lettered = 0;
    for _ in 0..5 {
        dead_lettered += consumer.tick_once().await?.dead_lettered;
    }
    assert_eq!(dead_lettered, 1);
    // max_retries = 2: two redeliveries after the first attempt.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.depth("inventory.user-events"), 0);

    let dead = broker.dead_letters("inventory.user-events", 10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].queue, "dlq.inventory");
    Ok(())
}

#[tokio::test]
async fn envelope_naming_wrong_partition_is_dead_lettered() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let cache = Arc::new(MemoryUserCache::new());
    let directory = Arc::new(MemoryTenantDirectory::new());
    let real = ctx("north");
    directory.insert(Tenant::new(real.clone(), "North", TenantStatus::Active, Utc::now()));

    let handler = VerifyingHandler::new(directory, UserCacheProjection::new(cache.clone()));
    let consumer = Consumer::new(broker.clone(), subscription(), Arc::new(handler), options());
    consumer.declare().await?;
    let publisher = EventPublisher::new(broker.clone(), "user-service").await?;

    let forged = TenantContext::new(
        real.id(),
        real.slug(),
        PartitionLocator::parse("tenant_south")?,
    )?;
    let user = Uuid::new_v4();
    publisher.publish(&forged, created(user, "f@x.com")).await;
    publisher.publish(&real, created(user, "r@x.com")).await;

    let report = consumer.tick_once().await?;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.applied, 1);
    assert!(cache.get(&forged, user).await?.is_none());
    assert_eq!(cache.get(&real, user).await?.expect("applied").email, "r@x.com");
    Ok(())
}

#[tokio::test]
async fn chain_keeps_cache_and_email_index_in_step() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let cache = Arc::new(MemoryUserCache::new());
    let index = Arc::new(MemoryEmailIndex::new());
    let chain = HandlerChain::new("user-sync")
        .with(Arc::new(UserCacheProjection::new(cache.clone())))
        .with(Arc::new(EmailIndexProjection::new(index.clone())));
    let consumer = Consumer::new(broker.clone(), subscription(), Arc::new(chain), options());
    consumer.declare().await?;
    let publisher = EventPublisher::new(broker.clone(), "user-service").await?;
    let tenant = ctx("north");
    let user = Uuid::new_v4();

    publisher.publish(&tenant, created(user, "Old@X.com")).await;
    publisher
        .publish(
            &tenant,
            DomainEvent::UserUpdated(UserUpdated {
                user_id: user,
                changes: UserChanges::default(),
                old_email: Some("old@x.com".into()),
                new_email: Some("new@x.com".into()),
            }),
        )
        .await;
    consumer.tick_once().await?;

    assert!(index.get_by_email("old@x.com").await?.is_none());
    let entry = index.get_by_email("NEW@x.com").await?.expect("indexed");
    assert_eq!(entry.user_id, user);
    assert_eq!(entry.tenant, tenant);
    assert_eq!(cache.get(&tenant, user).await?.expect("cached").email, "new@x.com");

    publisher
        .publish(
            &tenant,
            DomainEvent::UserDeleted(UserDeleted {
                user_id: user,
                email: None,
            }),
        )
        .await;
    consumer.tick_once().await?;
    assert!(index.is_empty());
    Ok(())
}

#[tokio::test]
async fn started_consumer_applies_then_drains_on_shutdown() -> Result<()> {
    let h = harness().await?;
    let tenant = ctx("north");
    let user = Uuid::new_v4();
    let cache = h.cache.clone();

    assert_eq!(h.consumer.state(), ConsumerState::Stopped);
    let handle = h.consumer.start().await?;
    h.publisher.publish(&tenant, created(user, "live@x.com")).await;

    let mut seen = false;
    for _ in 0..200 {
        if cache.get(&tenant, user).await?.is_some() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "consumer never applied the envelope");
    assert_eq!(handle.state(), ConsumerState::Listening);

    handle.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

struct Slow;

#[async_trait]
impl EnvelopeHandler for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn handle(&self, _envelope: &Envelope) -> TenantryResult<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_hands_back_unstarted_deliveries() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let consumer = Consumer::new(broker.clone(), subscription(), Arc::new(Slow), options());
    consumer.declare().await?;
    let publisher = EventPublisher::new(broker.clone(), "user-service").await?;
    let tenant = ctx("north");
    for i in 0..5 {
        publisher
            .publish(&tenant, created(Uuid::new_v4(), &format!("u{i}@x.com")))
            .await;
    }

    let handle = consumer.start().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown(Duration::from_secs(5)).await?;

    // The in-flight delivery finished; the rest went back to the queue.
    let remaining = broker.fetch("inventory.user-events", 10).await?;
    assert_eq!(remaining.len(), 4);
    Ok(())
}

/// Accepts topology calls, refuses every publish.
struct Unreachable(MemoryBroker);

#[async_trait]
impl Broker for Unreachable {
    async fn declare_exchange(&self, name: &str) -> TenantryResult<()> {
        self.0.declare_exchange(name).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TenantryResult<()> {
        self.0.declare_queue(spec).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> TenantryResult<()> {
        self.0.bind_queue(queue, exchange, pattern).await
    }

    async fn publish(&self, _exchange: &str, _message: OutboundMessage) -> TenantryResult<usize> {
        Err(Error::Broker("connection refused".into()))
    }

    async fn fetch(&self, queue: &str, max: usize) -> TenantryResult<Vec<Delivery>> {
        self.0.fetch(queue, max).await
    }

    async fn ack(&self, delivery: &Delivery) -> TenantryResult<()> {
        self.0.ack(delivery).await
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> TenantryResult<()> {
        self.0.requeue(delivery, delay).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> TenantryResult<()> {
        self.0.dead_letter(delivery, reason).await
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> TenantryResult<Vec<DeadLetter>> {
        self.0.dead_letters(queue, limit).await
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Down("connection refused".into())
    }
}

#[tokio::test]
async fn publish_failure_is_swallowed() -> Result<()> {
    let broker = Arc::new(Unreachable(MemoryBroker::new()));
    let publisher = EventPublisher::new(broker.clone(), "user-service").await?;

    let outcome = publisher
        .publish(&ctx("north"), created(Uuid::new_v4(), "x@x.com"))
        .await;
    assert!(outcome.is_none());
    assert!(!broker.health().await.is_up());
    Ok(())
}
