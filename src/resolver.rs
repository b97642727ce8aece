//! Login-time tenant resolution: find which tenant owns an email before any tenant
//! context exists.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::context::TenantContext;
use crate::directory::{Tenant, TenantDirectory};
use crate::executor::ScopedExecutor;
use crate::lookup::{EmailIndex, normalize_email};
use crate::metrics::{self, metrics};
use crate::{Error, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub status: String,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Partition-scoped, read-only account lookup.
#[async_trait]
pub trait AccountProbe: Send + Sync {
    async fn find_by_email(&self, tenant: &TenantContext, email: &str) -> Result<Option<Account>>;
}

#[derive(Clone, Debug)]
pub struct PgAccountProbe {
    executor: ScopedExecutor,
}

impl PgAccountProbe {
    pub fn new(executor: ScopedExecutor) -> Self {
        Self { executor }
    }
}

type AccountRow = (Uuid, String, String, String, String, String);

async fn select_account(conn: &mut PgConnection, email: String) -> Result<Option<AccountRow>> {
    let row = sqlx::query_as::<_, AccountRow>(
        "select id, email, password_hash, first_name, last_name, status
           from users
          where lower(email) = $1 and deleted_at is null
          limit 1",
    )
    .bind(email)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

#[async_trait]
impl AccountProbe for PgAccountProbe {
    async fn find_by_email(&self, tenant: &TenantContext, email: &str) -> Result<Option<Account>> {
        let email = normalize_email(email);
        let row = self
            .executor
            .run(tenant, move |conn: &mut PgConnection| {
                Box::pin(select_account(conn, email))
            })
            .await?;
        Ok(row.map(
            |(id, email, password_hash, first_name, last_name, status)| Account {
                id,
                email,
                password_hash,
                first_name,
                last_name,
                status,
            },
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub account: Account,
    pub tenant: Tenant,
}

#[derive(Clone)]
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
    probe: Arc<dyn AccountProbe>,
    index: Option<Arc<dyn EmailIndex>>,
}

impl TenantResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>, probe: Arc<dyn AccountProbe>) -> Self {
        Self {
            directory,
            probe,
            index: None,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn EmailIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Resolve `email` to its account and owning tenant.
    ///
    /// The oldest resolvable tenant holding the email wins, with or without an index.
    /// Unknown emails and inactive accounts both fail as [`Error::InvalidCredentials`].
    /// Directory or partition probe failures propagate as infrastructure errors.
    #[instrument(skip_all)]
    pub async fn resolve(&self, email: &str) -> Result<Resolution> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        let tenants = self.directory.resolvable_tenants().await?;

        if let Some(index) = &self.index {
            match self.resolve_via_index(index.as_ref(), &tenants, &email).await {
                Ok(Some(found)) if found.account.is_active() => {
                    metrics::incr(&metrics().login_index_hits_total);
                    return Ok(found);
                }
                Ok(Some(found)) => {
                    tracing::debug!(
                        target: "tenantry::resolver",
                        tenant_id = %found.tenant.id(),
                        "indexed account is not active; scanning"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "tenantry::resolver",
                        error = %err,
                        "email index unavailable; falling back to partition scan"
                    );
                }
            }
        }

        for tenant in tenants {
            metrics::incr(&metrics().login_probes_total);
            if let Some(account) = self.probe.find_by_email(tenant.context(), &email).await? {
                return accept(Resolution { account, tenant });
            }
        }

        tracing::debug!(target: "tenantry::resolver", "no resolvable tenant owns the email");
        Err(Error::InvalidCredentials)
    }

    /// An index entry only names a candidate. The candidate and every older resolvable
    /// tenant are probed together and the oldest holder is returned. `Ok(None)` means
    /// miss or stale entry; the caller falls back to the scan.
    async fn resolve_via_index(
        &self,
        index: &dyn EmailIndex,
        tenants: &[Tenant],
        email: &str,
    ) -> Result<Option<Resolution>> {
        let Some(entry) = index.get_by_email(email).await? else {
            return Ok(None);
        };
        let Some(position) = tenants.iter().position(|t| t.id() == entry.tenant.id()) else {
            tracing::debug!(
                target: "tenantry::resolver",
                tenant_id = %entry.tenant.id(),
                "index points at a tenant that is not resolvable"
            );
            return Ok(None);
        };
        let indexed = &tenants[position];
        if indexed.partition() != entry.tenant.partition() {
            tracing::warn!(
                target: "tenantry::resolver",
                tenant_id = %indexed.id(),
                indexed = %entry.tenant.partition(),
                actual = %indexed.partition(),
                "index entry disagrees with directory partition"
            );
            return Ok(None);
        }

        let candidates = &tenants[..=position];
        let found = try_join_all(candidates.iter().map(|tenant| {
            metrics::incr(&metrics().login_probes_total);
            self.probe.find_by_email(tenant.context(), email)
        }))
        .await?;

        let Some((tenant, account)) = candidates
            .iter()
            .zip(found)
            .find_map(|(tenant, account)| account.map(|a| (tenant.clone(), a)))
        else {
            tracing::debug!(
                target: "tenantry::resolver",
                tenant_id = %indexed.id(),
                "stale index entry"
            );
            return Ok(None);
        };
        if tenant.id() != indexed.id() {
            tracing::debug!(
                target: "tenantry::resolver",
                indexed = %indexed.id(),
                oldest = %tenant.id(),
                "an older tenant also holds the email"
            );
        }
        Ok(Some(Resolution { account, tenant }))
    }
}

fn accept(found: Resolution) -> Result<Resolution> {
    if !found.account.is_active() {
        tracing::debug!(
            target: "tenantry::resolver",
            tenant_id = %found.tenant.id(),
            status = %found.account.status,
            "account is not active"
        );
        return Err(Error::InvalidCredentials);
    }
    Ok(found)
}
