//! Global email -> tenant index. A cache in front of the login scan, never authoritative.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::{TenantContext, TenantId};
use crate::schema::qualified_name;
use crate::Result;

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub email: String,
    pub user_id: Uuid,
    pub tenant: TenantContext,
}

#[async_trait]
pub trait EmailIndex: Send + Sync {
    async fn get_by_email(&self, email: &str) -> Result<Option<IndexEntry>>;

    async fn upsert(&self, email: &str, user_id: Uuid, tenant: &TenantContext) -> Result<()>;

    async fn delete_by_email(&self, email: &str) -> Result<bool>;

    async fn delete_by_user_id(&self, tenant: TenantId, user_id: Uuid) -> Result<u64>;

    /// Move an entry from `old_email` to `new_email` in one step.
    async fn update_email(
        &self,
        old_email: &str,
        new_email: &str,
        user_id: Uuid,
        tenant: &TenantContext,
    ) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct PgEmailIndex {
    pool: PgPool,
    table: String,
}

type IndexRow = (String, Uuid, Uuid, String, String);

impl PgEmailIndex {
    pub fn new(pool: PgPool) -> Self {
        Self::with_schema(pool, "public")
    }

    pub fn with_schema(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            table: qualified_name(schema, "user_tenant_lookup"),
        }
    }

    fn upsert_sql(&self) -> String {
        format!(
            "insert into {} (email, user_id, tenant_id, tenant_slug, tenant_schema)
             values ($1, $2, $3, $4, $5)
             on conflict (email) do update set
               user_id = excluded.user_id,
               tenant_id = excluded.tenant_id,
               tenant_slug = excluded.tenant_slug,
               tenant_schema = excluded.tenant_schema,
               updated_at = now()",
            self.table
        )
    }
}

#[async_trait]
impl EmailIndex for PgEmailIndex {
    async fn get_by_email(&self, email: &str) -> Result<Option<IndexEntry>> {
        let sql = format!(
            "select email, user_id, tenant_id, tenant_slug, tenant_schema from {} where email = $1",
            self.table
        );
        let row: Option<IndexRow> = sqlx::query_as(&sql)
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await?;
        let Some((email, user_id, tenant_id, slug, schema)) = row else {
            return Ok(None);
        };
        let tenant = TenantContext::from_parts(
            Some(&tenant_id.to_string()),
            Some(&slug),
            Some(&schema),
        )?;
        Ok(Some(IndexEntry {
            email,
            user_id,
            tenant,
        }))
    }

    async fn upsert(&self, email: &str, user_id: Uuid, tenant: &TenantContext) -> Result<()> {
        sqlx::query(&self.upsert_sql())
            .bind(normalize_email(email))
            .bind(user_id)
            .bind(tenant.id().as_uuid())
            .bind(tenant.slug())
            .bind(tenant.partition().as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_email(&self, email: &str) -> Result<bool> {
        let sql = format!("delete from {} where email = $1", self.table);
        let res = sqlx::query(&sql)
            .bind(normalize_email(email))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_by_user_id(&self, tenant: TenantId, user_id: Uuid) -> Result<u64> {
        let sql = format!(
            "delete from {} where tenant_id = $1 and user_id = $2",
            self.table
        );
        let res = sqlx::query(&sql)
            .bind(tenant.as_uuid())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn update_email(
        &self,
        old_email: &str,
        new_email: &str,
        user_id: Uuid,
        tenant: &TenantContext,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let delete = format!(
            "delete from {} where email = $1 and user_id = $2",
            self.table
        );
        sqlx::query(&delete)
            .bind(normalize_email(old_email))
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.upsert_sql())
            .bind(normalize_email(new_email))
            .bind(user_id)
            .bind(tenant.id().as_uuid())
            .bind(tenant.slug())
            .bind(tenant.partition().as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEmailIndex {
    entries: Mutex<HashMap<String, IndexEntry>>,
}

impl MemoryEmailIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("email index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EmailIndex for MemoryEmailIndex {
    async fn get_by_email(&self, email: &str) -> Result<Option<IndexEntry>> {
        let entries = self.entries.lock().expect("email index poisoned");
        Ok(entries.get(&normalize_email(email)).cloned())
    }

    async fn upsert(&self, email: &str, user_id: Uuid, tenant: &TenantContext) -> Result<()> {
        let email = normalize_email(email);
        let mut entries = self.entries.lock().expect("email index poisoned");
        entries.insert(
            email.clone(),
            IndexEntry {
                email,
                user_id,
                tenant: tenant.clone(),
            },
        );
        Ok(())
    }

    async fn delete_by_email(&self, email: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("email index poisoned");
        Ok(entries.remove(&normalize_email(email)).is_some())
    }

    async fn delete_by_user_id(&self, tenant: TenantId, user_id: Uuid) -> Result<u64> {
        let mut entries = self.entries.lock().expect("email index poisoned");
        let before = entries.len();
        entries.retain(|_, e| !(e.user_id == user_id && e.tenant.id() == tenant));
        Ok((before - entries.len()) as u64)
    }

    async fn update_email(
        &self,
        old_email: &str,
        new_email: &str,
        user_id: Uuid,
        tenant: &TenantContext,
    ) -> Result<()> {
        let old = normalize_email(old_email);
        let new = normalize_email(new_email);
        let mut entries = self.entries.lock().expect("email index poisoned");
        if entries.get(&old).is_some_and(|e| e.user_id == user_id) {
            entries.remove(&old);
        }
        entries.insert(
            new.clone(),
            IndexEntry {
                email: new,
                user_id,
                tenant: tenant.clone(),
            },
        );
        Ok(())
    }
}
