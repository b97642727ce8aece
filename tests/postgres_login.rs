use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tenantry::auth::{LoginService, TokenIssuer, hash_password};
use tenantry::config::AuthConfig;
use tenantry::directory::{PgTenantDirectory, TenantStatus};
use tenantry::lookup::{EmailIndex, PgEmailIndex};
use tenantry::resolver::{Account, AccountProbe, PgAccountProbe, TenantResolver};
use tenantry::testing::{insert_account, migrate, provision_tenant};
use tenantry::{Error, ScopedExecutor, TenantContext};
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

/// Counts probes per partition before delegating to Postgres.
struct Counting {
    inner: PgAccountProbe,
    calls: Mutex<HashMap<String, usize>>,
}

impl Counting {
    fn calls(&self, partition: &str) -> usize {
        self.calls.lock().unwrap().get(partition).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AccountProbe for Counting {
    async fn find_by_email(
        &self,
        tenant: &TenantContext,
        email: &str,
    ) -> tenantry::Result<Option<Account>> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(tenant.partition().to_string())
            .or_default() += 1;
        self.inner.find_by_email(tenant, email).await
    }
}

#[tokio::test]
async fn login_resolves_across_partitions() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");
    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await?;
    migrate(&pool).await?;

    let a = provision_tenant(&pool, "Tenant A", "a", TenantStatus::Active).await?;
    let b = provision_tenant(&pool, "Tenant B", "b", TenantStatus::Suspended).await?;
    let c = provision_tenant(&pool, "Tenant C", "c", TenantStatus::Active).await?;

    let exec = ScopedExecutor::new(pool.clone());
    let hash = hash_password("s3cret", 4).await?;
    let a_user = insert_account(&exec, a.context(), "a@x.com", &hash, "active").await?;
    insert_account(&exec, b.context(), "b@x.com", &hash, "active").await?;
    insert_account(&exec, c.context(), "a@x.com", &hash, "active").await?;
    insert_account(&exec, c.context(), "off@x.com", &hash, "inactive").await?;

    let probe = Arc::new(Counting {
        inner: PgAccountProbe::new(exec.clone()),
        calls: Mutex::new(HashMap::new()),
    });
    let index = Arc::new(PgEmailIndex::new(pool.clone()));
    let resolver = TenantResolver::new(Arc::new(PgTenantDirectory::new(pool.clone())), probe.clone())
        .with_index(index.clone());
    let login = LoginService::new(
        resolver.clone(),
        TokenIssuer::new(&AuthConfig {
            jwt_secret: "pg-secret".into(),
            ..AuthConfig::default()
        })?,
    )
    .with_hash_cost(4);

    // Suspended tenant B is never probed.
    assert!(matches!(
        login.login("b@x.com", "s3cret").await,
        Err(Error::InvalidCredentials)
    ));
    assert_eq!(probe.calls("tenant_b"), 0);

    // Duplicate email: the oldest tenant wins every time.
    for _ in 0..3 {
        let found = resolver.resolve("A@x.com").await?;
        assert_eq!(found.tenant.id(), a.id());
        assert_eq!(found.account.id, a_user);
    }

    assert!(matches!(
        login.login("off@x.com", "s3cret").await,
        Err(Error::InvalidCredentials)
    ));

    let outcome = login.login("a@x.com", "s3cret").await?;
    assert_eq!(outcome.tenant.partition().as_str(), "tenant_a");

    // An index entry pointing at C is confirmed against the older tenant A; suspended B
    // is skipped.
    let c_probes = probe.calls("tenant_c");
    let a_probes = probe.calls("tenant_a");
    assert_eq!(resolver.resolve("a@x.com").await?.account.id, a_user);
    let c_account = insert_account(&exec, c.context(), "only-c@x.com", &hash, "active").await?;
    index.upsert("only-c@x.com", c_account, c.context()).await?;
    let via_index = resolver.resolve("only-c@x.com").await?;
    assert_eq!(via_index.tenant.id(), c.id());
    assert_eq!(probe.calls("tenant_a"), a_probes + 2);
    assert_eq!(probe.calls("tenant_c"), c_probes + 1);
    assert_eq!(probe.calls("tenant_b"), 0);

    // Indexing the duplicate under C does not change who owns it.
    index.upsert("a@x.com", a_user, c.context()).await?;
    assert_eq!(resolver.resolve("a@x.com").await?.tenant.id(), a.id());
    Ok(())
}
