//! Helpers for integration tests and local bootstrap.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::Result;
use crate::context::{PartitionLocator, TenantContext, TenantId};
use crate::directory::{NewTenant, Tenant, TenantStatus};
use crate::executor::ScopedExecutor;
use crate::schema::{SchemaConfig, SchemaManager, SchemaPlan};

/// Create the shared tables in `public`.
pub async fn migrate(pool: &PgPool) -> Result<SchemaPlan> {
    SchemaManager::new(pool.clone())
        .sync(&SchemaConfig::default())
        .await
}

/// Register a tenant in `public.tenants` and provision its partition.
pub async fn provision_tenant(
    pool: &PgPool,
    name: &str,
    slug: &str,
    status: TenantStatus,
) -> Result<Tenant> {
    let tenant = NewTenant::new(name, slug)?.status(status);
    SchemaManager::new(pool.clone())
        .register_tenant("public", &tenant)
        .await
}

/// Insert a login account into the tenant's `users` table.
pub async fn insert_account(
    executor: &ScopedExecutor,
    tenant: &TenantContext,
    email: &str,
    password_hash: &str,
    status: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let email = email.to_string();
    let password_hash = password_hash.to_string();
    let status = status.to_string();
    executor
        .run(tenant, move |conn: &mut PgConnection| {
            Box::pin(async move {
                sqlx::query(
                    "insert into users (id, email, password_hash, first_name, last_name, status)
                     values ($1, $2, $3, 'Test', 'User', $4)",
                )
                .bind(id)
                .bind(email)
                .bind(password_hash)
                .bind(status)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(id)
}

/// A context for `slug` with a fresh id, not backed by any directory row.
pub fn tenant_context(slug: &str) -> Result<TenantContext> {
    TenantContext::new(
        TenantId::new(Uuid::new_v4()),
        slug,
        PartitionLocator::for_slug(slug)?,
    )
}
