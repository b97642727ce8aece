//! Denormalized user records kept in each tenant partition, fed by `user.*` events.
//!
//! Every record carries a `last_event_at` watermark. Writes older than the watermark
//! are dropped, so redelivered or reordered envelopes never roll a record back.
//! Deletes leave a tombstone that keeps the watermark alive.
//!
//! The watermark is per record, not per field. An older update that arrives after a
//! newer one is dropped whole, even when it touched different fields: the record keeps
//! the newer event's state and the older event's fields are lost until the next write
//! that carries them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::consumer::EnvelopeHandler;
use crate::context::{PartitionLocator, TenantContext, TenantId};
use crate::events::{DomainEvent, Envelope, UserChanges, UserCreated};
use crate::executor::ScopedExecutor;
use crate::lookup::EmailIndex;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedUser {
    pub user_id: Uuid,
    pub tenant_id: TenantId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role_name: Option<String>,
    pub last_event_at: DateTime<Utc>,
}

impl CachedUser {
    pub fn from_created(tenant: &TenantContext, event: &UserCreated, at: DateTime<Utc>) -> Self {
        Self {
            user_id: event.user_id,
            tenant_id: tenant.id(),
            first_name: event.first_name.clone(),
            last_name: event.last_name.clone(),
            email: event.email.clone(),
            role_name: event.role_name.clone(),
            last_event_at: at,
        }
    }

    fn merge(&mut self, changes: &UserChanges, at: DateTime<Utc>) {
        if let Some(first_name) = &changes.first_name {
            self.first_name = first_name.clone();
        }
        if let Some(last_name) = &changes.last_name {
            self.last_name = last_name.clone();
        }
        if let Some(email) = &changes.email {
            self.email = email.clone();
        }
        if let Some(role_name) = &changes.role_name {
            self.role_name = Some(role_name.clone());
        }
        self.last_event_at = at;
    }
}

/// Idempotent writes against one tenant's cached users. Each write returns whether it
/// changed anything.
#[async_trait]
pub trait UserCacheStore: Send + Sync {
    async fn get(&self, tenant: &TenantContext, user_id: Uuid) -> Result<Option<CachedUser>>;

    /// Insert or overwrite, unless the stored record has seen a newer event.
    async fn upsert(&self, tenant: &TenantContext, user: CachedUser) -> Result<bool>;

    /// Merge the present fields into a live record. Missing and deleted records are left alone.
    async fn merge(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        changes: &UserChanges,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Tombstone a live record. Missing records are left alone.
    async fn delete(&self, tenant: &TenantContext, user_id: Uuid, at: DateTime<Utc>)
    -> Result<bool>;
}

/// Postgres store: reads and writes `user_cache` in the tenant's partition through the
/// scoped executor.
#[derive(Clone, Debug)]
pub struct PgUserCache {
    executor: ScopedExecutor,
}

impl PgUserCache {
    pub fn new(executor: ScopedExecutor) -> Self {
        Self { executor }
    }
}

type CachedUserRow = (
    Uuid,
    Uuid,
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
);

async fn select_user(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    user_id: Uuid,
) -> Result<Option<CachedUserRow>> {
    let row = sqlx::query_as::<_, CachedUserRow>(
        "select user_id, tenant_id, first_name, last_name, email, role_name, last_event_at
           from user_cache
          where user_id = $1 and tenant_id = $2 and deleted_at is null",
    )
    .bind(user_id)
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// The record always belongs to the tenant it is written under.
async fn upsert_user(conn: &mut PgConnection, tenant_id: Uuid, user: CachedUser) -> Result<u64> {
    let done = sqlx::query(
        "insert into user_cache
             (user_id, tenant_id, first_name, last_name, email, role_name,
              last_event_at, deleted_at, updated_at)
         values ($1, $2, $3, $4, $5, $6, $7, null, now())
         on conflict (user_id) do update
            set first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                role_name = coalesce(excluded.role_name, user_cache.role_name),
                last_event_at = excluded.last_event_at,
                deleted_at = null,
                updated_at = now()
          where user_cache.tenant_id = excluded.tenant_id
            and user_cache.last_event_at <= excluded.last_event_at",
    )
    .bind(user.user_id)
    .bind(tenant_id)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(&user.email)
    .bind(&user.role_name)
    .bind(user.last_event_at)
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

async fn merge_user(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    user_id: Uuid,
    changes: UserChanges,
    at: DateTime<Utc>,
) -> Result<u64> {
    let done = sqlx::query(
        "update user_cache
            set first_name = coalesce($3, first_name),
                last_name = coalesce($4, last_name),
                email = coalesce($5, email),
                role_name = coalesce($6, role_name),
                last_event_at = $7,
                updated_at = now()
          where user_id = $1
            and tenant_id = $2
            and deleted_at is null
            and last_event_at <= $7",
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(&changes.first_name)
    .bind(&changes.last_name)
    .bind(&changes.email)
    .bind(&changes.role_name)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

async fn tombstone_user(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    user_id: Uuid,
    at: DateTime<Utc>,
) -> Result<u64> {
    let done = sqlx::query(
        "update user_cache
            set deleted_at = $3,
                last_event_at = greatest(last_event_at, $3),
                updated_at = now()
          where user_id = $1 and tenant_id = $2 and deleted_at is null",
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

#[async_trait]
impl UserCacheStore for PgUserCache {
    async fn get(&self, tenant: &TenantContext, user_id: Uuid) -> Result<Option<CachedUser>> {
        let tenant_id = tenant.id().as_uuid();
        let row = self
            .executor
            .run(tenant, move |conn: &mut PgConnection| {
                Box::pin(select_user(conn, tenant_id, user_id))
            })
            .await?;
        Ok(row.map(
            |(user_id, tenant_id, first_name, last_name, email, role_name, last_event_at)| {
                CachedUser {
                    user_id,
                    tenant_id: TenantId::new(tenant_id),
                    first_name,
                    last_name,
                    email,
                    role_name,
                    last_event_at,
                }
            },
        ))
    }

    async fn upsert(&self, tenant: &TenantContext, user: CachedUser) -> Result<bool> {
        let tenant_id = tenant.id().as_uuid();
        let affected = self
            .executor
            .run(tenant, move |conn: &mut PgConnection| {
                Box::pin(upsert_user(conn, tenant_id, user))
            })
            .await?;
        Ok(affected > 0)
    }

    async fn merge(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        changes: &UserChanges,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let tenant_id = tenant.id().as_uuid();
        let changes = changes.clone();
        let affected = self
            .executor
            .run(tenant, move |conn: &mut PgConnection| {
                Box::pin(merge_user(conn, tenant_id, user_id, changes, at))
            })
            .await?;
        Ok(affected > 0)
    }

    async fn delete(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let tenant_id = tenant.id().as_uuid();
        let affected = self
            .executor
            .run(tenant, move |conn: &mut PgConnection| {
                Box::pin(tombstone_user(conn, tenant_id, user_id, at))
            })
            .await?;
        Ok(affected > 0)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    user: CachedUser,
    deleted: bool,
}

/// In-process store keyed by partition, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryUserCache {
    records: Mutex<HashMap<(PartitionLocator, Uuid), Slot>>,
}

impl MemoryUserCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live records in `partition`, ordered by user id.
    pub fn live(&self, partition: &PartitionLocator) -> Vec<CachedUser> {
        let records = self.records.lock().expect("user cache poisoned");
        let mut users: Vec<CachedUser> = records
            .iter()
            .filter(|((p, _), slot)| p == partition && !slot.deleted)
            .map(|(_, slot)| slot.user.clone())
            .collect();
        users.sort_by_key(|u| u.user_id);
        users
    }
}

#[async_trait]
impl UserCacheStore for MemoryUserCache {
    async fn get(&self, tenant: &TenantContext, user_id: Uuid) -> Result<Option<CachedUser>> {
        let records = self.records.lock().expect("user cache poisoned");
        Ok(records
            .get(&(tenant.partition().clone(), user_id))
            .filter(|slot| !slot.deleted && slot.user.tenant_id == tenant.id())
            .map(|slot| slot.user.clone()))
    }

    async fn upsert(&self, tenant: &TenantContext, mut user: CachedUser) -> Result<bool> {
        user.tenant_id = tenant.id();
        let mut records = self.records.lock().expect("user cache poisoned");
        let key = (tenant.partition().clone(), user.user_id);
        match records.get_mut(&key) {
            Some(slot) => {
                if slot.user.tenant_id != user.tenant_id
                    || slot.user.last_event_at > user.last_event_at
                {
                    return Ok(false);
                }
                if user.role_name.is_none() {
                    user.role_name = slot.user.role_name.take();
                }
                slot.user = user;
                slot.deleted = false;
            }
            None => {
                records.insert(
                    key,
                    Slot {
                        user,
                        deleted: false,
                    },
                );
            }
        }
        Ok(true)
    }

    async fn merge(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        changes: &UserChanges,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.lock().expect("user cache poisoned");
        let Some(slot) = records.get_mut(&(tenant.partition().clone(), user_id)) else {
            return Ok(false);
        };
        if slot.deleted || slot.user.tenant_id != tenant.id() || slot.user.last_event_at > at {
            return Ok(false);
        }
        slot.user.merge(changes, at);
        Ok(true)
    }

    async fn delete(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.lock().expect("user cache poisoned");
        let Some(slot) = records.get_mut(&(tenant.partition().clone(), user_id)) else {
            return Ok(false);
        };
        if slot.deleted || slot.user.tenant_id != tenant.id() {
            return Ok(false);
        }
        slot.deleted = true;
        slot.user.last_event_at = slot.user.last_event_at.max(at);
        Ok(true)
    }
}

/// Applies `user.*` envelopes to a [`UserCacheStore`].
pub struct UserCacheProjection {
    store: Arc<dyn UserCacheStore>,
}

impl UserCacheProjection {
    pub fn new(store: Arc<dyn UserCacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EnvelopeHandler for UserCacheProjection {
    fn name(&self) -> &str {
        "user-cache"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let tenant = &envelope.tenant;
        let at = envelope.emitted_at;
        let changed = match &envelope.event {
            DomainEvent::UserCreated(event) => {
                self.store
                    .upsert(tenant, CachedUser::from_created(tenant, event, at))
                    .await?
            }
            DomainEvent::UserUpdated(event) => {
                let mut changes = event.changes.clone();
                if changes.email.is_none() {
                    changes.email = event.new_email.clone();
                }
                if changes.is_empty() {
                    false
                } else {
                    self.store.merge(tenant, event.user_id, &changes, at).await?
                }
            }
            DomainEvent::UserDeleted(event) => self.store.delete(tenant, event.user_id, at).await?,
            DomainEvent::UserRoleChanged(event) => {
                let changes = UserChanges {
                    role_name: Some(event.new_role_name.clone()),
                    ..UserChanges::default()
                };
                self.store.merge(tenant, event.user_id, &changes, at).await?
            }
        };
        if !changed {
            tracing::debug!(
                target: "tenantry::cache",
                event_id = %envelope.id,
                event_type = %envelope.event_type(),
                user_id = %envelope.event.user_id(),
                tenant_id = %tenant.id(),
                "envelope left cache unchanged"
            );
        }
        Ok(())
    }
}

/// Keeps the global email index in step with `user.*` envelopes.
pub struct EmailIndexProjection {
    index: Arc<dyn EmailIndex>,
}

impl EmailIndexProjection {
    pub fn new(index: Arc<dyn EmailIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl EnvelopeHandler for EmailIndexProjection {
    fn name(&self) -> &str {
        "email-index"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let tenant = &envelope.tenant;
        match &envelope.event {
            DomainEvent::UserCreated(event) => {
                self.index.upsert(&event.email, event.user_id, tenant).await
            }
            DomainEvent::UserUpdated(event) => match (&event.old_email, event.effective_email()) {
                (Some(old), Some(new)) if !old.eq_ignore_ascii_case(new) => {
                    self.index.update_email(old, new, event.user_id, tenant).await
                }
                (_, Some(new)) => self.index.upsert(new, event.user_id, tenant).await,
                (_, None) => Ok(()),
            },
            DomainEvent::UserDeleted(event) => {
                self.index.delete_by_user_id(tenant.id(), event.user_id).await?;
                Ok(())
            }
            DomainEvent::UserRoleChanged(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn ctx(slug: &str) -> TenantContext {
        TenantContext::new(
            TenantId::new(Uuid::new_v4()),
            slug,
            PartitionLocator::for_slug(slug).unwrap(),
        )
        .unwrap()
    }

    fn user(tenant: &TenantContext, id: Uuid, email: &str, at: DateTime<Utc>) -> CachedUser {
        CachedUser {
            user_id: id,
            tenant_id: tenant.id(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: email.into(),
            role_name: Some("admin".into()),
            last_event_at: at,
        }
    }

    #[tokio::test]
    async fn older_writes_lose_to_watermark() {
        let store = MemoryUserCache::new();
        let t = ctx("acme");
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);

        assert!(store.upsert(&t, user(&t, id, "a@x.com", t0)).await.unwrap());
        let changes = UserChanges {
            email: Some("b@x.com".into()),
            ..UserChanges::default()
        };
        assert!(store.merge(&t, id, &changes, t1).await.unwrap());
        assert!(!store.upsert(&t, user(&t, id, "a@x.com", t0)).await.unwrap());

        let got = store.get(&t, id).await.unwrap().unwrap();
        assert_eq!(got.email, "b@x.com");
        assert_eq!(got.first_name, "Ada");
    }

    #[tokio::test]
    async fn late_update_is_dropped_even_for_untouched_fields() {
        let store = MemoryUserCache::new();
        let t = ctx("acme");
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);
        let t2 = t0 + Duration::seconds(2);
        assert!(store.upsert(&t, user(&t, id, "a@x.com", t0)).await.unwrap());

        let email = UserChanges {
            email: Some("b@x.com".into()),
            ..UserChanges::default()
        };
        let first_name = UserChanges {
            first_name: Some("Grace".into()),
            ..UserChanges::default()
        };
        assert!(store.merge(&t, id, &email, t2).await.unwrap());
        assert!(!store.merge(&t, id, &first_name, t1).await.unwrap());

        let got = store.get(&t, id).await.unwrap().unwrap();
        assert_eq!(got.email, "b@x.com");
        assert_eq!(got.first_name, "Ada");
        assert_eq!(got.last_event_at, t2);
    }

    #[tokio::test]
    async fn tombstone_blocks_stale_resurrection() {
        let store = MemoryUserCache::new();
        let t = ctx("acme");
        let id = Uuid::new_v4();
        let t0 = Utc::now();

        store.upsert(&t, user(&t, id, "a@x.com", t0)).await.unwrap();
        assert!(store.delete(&t, id, t0 + Duration::seconds(5)).await.unwrap());
        assert!(!store.delete(&t, id, t0 + Duration::seconds(6)).await.unwrap());
        assert!(!store.upsert(&t, user(&t, id, "a@x.com", t0)).await.unwrap());
        assert!(store.get(&t, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partitions_do_not_see_each_other() {
        let store = MemoryUserCache::new();
        let a = ctx("alpha");
        let b = ctx("beta");
        let id = Uuid::new_v4();
        store.upsert(&a, user(&a, id, "a@x.com", Utc::now())).await.unwrap();

        assert!(store.get(&b, id).await.unwrap().is_none());
        assert!(!store.delete(&b, id, Utc::now()).await.unwrap());
        assert!(store.get(&a, id).await.unwrap().is_some());
        assert_eq!(store.live(a.partition()).len(), 1);
        assert!(store.live(b.partition()).is_empty());
    }
}
