//! Tenant directory: the shared registry of tenants and their partitions.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::{PartitionLocator, TenantContext, TenantId};
use crate::schema::qualified_name;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Trial,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Trial => "trial",
            TenantStatus::Suspended => "suspended",
        }
    }

    /// Only active and trial tenants may take part in login resolution.
    pub fn is_resolvable(&self) -> bool {
        matches!(self, TenantStatus::Active | TenantStatus::Trial)
    }
}

impl FromStr for TenantStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "trial" => Ok(TenantStatus::Trial),
            "suspended" => Ok(TenantStatus::Suspended),
            other => Err(Error::InvalidTenantContext(format!(
                "unknown subscription status `{other}`"
            ))),
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tenant {
    context: TenantContext,
    name: String,
    status: TenantStatus,
    created_at: DateTime<Utc>,
}

pub(crate) type TenantRow = (Uuid, String, String, String, String, DateTime<Utc>);

impl Tenant {
    pub fn new(
        context: TenantContext,
        name: impl Into<String>,
        status: TenantStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            context,
            name: name.into(),
            status,
            created_at,
        }
    }

    pub(crate) fn from_row(row: TenantRow) -> Result<Self> {
        let (id, name, slug, schema_name, status, created_at) = row;
        let context = TenantContext::new(
            TenantId::new(id),
            slug,
            PartitionLocator::parse(&schema_name)?,
        )?;
        Ok(Self::new(context, name, status.parse()?, created_at))
    }

    /// The binding every request for this tenant carries.
    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    pub fn id(&self) -> TenantId {
        self.context.id()
    }

    pub fn slug(&self) -> &str {
        self.context.slug()
    }

    pub fn partition(&self) -> &PartitionLocator {
        self.context.partition()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TenantStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Input for registering a tenant. The partition is fixed here and never changes.
#[derive(Clone, Debug)]
pub struct NewTenant {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub partition: PartitionLocator,
    pub status: TenantStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewTenant {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Result<Self> {
        let slug = slug.into();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            partition: PartitionLocator::for_slug(&slug)?,
            slug,
            status: TenantStatus::Active,
            created_at: None,
        })
    }

    pub fn status(mut self, status: TenantStatus) -> Self {
        self.status = status;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Active and trial tenants, oldest first (`created_at`, then `id`).
    async fn resolvable_tenants(&self) -> Result<Vec<Tenant>>;

    /// A single tenant, only if it is currently resolvable.
    async fn get_resolvable(&self, id: TenantId) -> Result<Option<Tenant>>;

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>>;

    /// Status is the only mutable attribute of a tenant.
    async fn set_status(&self, id: TenantId, status: TenantStatus) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct PgTenantDirectory {
    pool: PgPool,
    table: String,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self::with_schema(pool, "public")
    }

    pub fn with_schema(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            table: qualified_name(schema, "tenants"),
        }
    }

    /// Every non-deleted tenant regardless of status, oldest first.
    pub async fn list(&self) -> Result<Vec<Tenant>> {
        let sql = format!(
            "select id, name, slug, schema_name, subscription_status, created_at
               from {}
              where deleted_at is null
              order by created_at asc, id asc",
            self.table
        );
        let rows: Vec<TenantRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(collect_valid(rows))
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn resolvable_tenants(&self) -> Result<Vec<Tenant>> {
        let sql = format!(
            "select id, name, slug, schema_name, subscription_status, created_at
               from {}
              where subscription_status in ('active', 'trial')
                and deleted_at is null
              order by created_at asc, id asc",
            self.table
        );
        let rows: Vec<TenantRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(collect_valid(rows))
    }

    async fn get_resolvable(&self, id: TenantId) -> Result<Option<Tenant>> {
        let sql = format!(
            "select id, name, slug, schema_name, subscription_status, created_at
               from {}
              where id = $1
                and subscription_status in ('active', 'trial')
                and deleted_at is null",
            self.table
        );
        let row: Option<TenantRow> = sqlx::query_as(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Tenant::from_row).transpose()
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>> {
        let sql = format!(
            "select id, name, slug, schema_name, subscription_status, created_at
               from {}
              where id = $1 and deleted_at is null",
            self.table
        );
        let row: Option<TenantRow> = sqlx::query_as(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Tenant::from_row).transpose()
    }

    async fn set_status(&self, id: TenantId, status: TenantStatus) -> Result<()> {
        let sql = format!(
            "update {} set subscription_status = $2 where id = $1 and deleted_at is null",
            self.table
        );
        let res = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::TenantNotFound(id.to_string()));
        }
        tracing::info!(tenant_id = %id, status = %status, "tenant status changed");
        Ok(())
    }
}

fn collect_valid(rows: Vec<TenantRow>) -> Vec<Tenant> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.0;
            match Tenant::from_row(row) {
                Ok(tenant) => Some(tenant),
                Err(err) => {
                    tracing::error!(
                        target: "tenantry::directory",
                        tenant_id = %id,
                        error = %err,
                        "skipping tenant with an unusable directory row"
                    );
                    None
                }
            }
        })
        .collect()
}

/// In-process directory for tests and single-node tooling.
#[derive(Debug, Default)]
pub struct MemoryTenantDirectory {
    tenants: Mutex<Vec<Tenant>>,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Tenant) {
        let mut tenants = self.tenants.lock().expect("tenant directory poisoned");
        tenants.retain(|t| t.id() != tenant.id());
        tenants.push(tenant);
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn resolvable_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = self.tenants.lock().expect("tenant directory poisoned");
        let mut out: Vec<Tenant> = tenants
            .iter()
            .filter(|t| t.status.is_resolvable())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(out)
    }

    async fn get_resolvable(&self, id: TenantId) -> Result<Option<Tenant>> {
        Ok(self.get(id).await?.filter(|t| t.status.is_resolvable()))
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>> {
        let tenants = self.tenants.lock().expect("tenant directory poisoned");
        Ok(tenants.iter().find(|t| t.id() == id).cloned())
    }

    async fn set_status(&self, id: TenantId, status: TenantStatus) -> Result<()> {
        let mut tenants = self.tenants.lock().expect("tenant directory poisoned");
        let tenant = tenants
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| Error::TenantNotFound(id.to_string()))?;
        tenant.status = status;
        Ok(())
    }
}
