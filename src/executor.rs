//! Scoped executor: every tenant-bound statement runs on a connection whose partition
//! binding was set for exactly one operation and cleared before the connection can be
//! borrowed again.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres};
use tracing::instrument;

use crate::context::{self, TenantContext};
use crate::metrics::{self, HealthStatus, metrics};
use crate::schema::quote_ident;
use crate::{Error, Result};

const RESET_SESSION_SQL: &str =
    "reset search_path; reset statement_timeout; reset app.current_tenant";

/// How the partition binding is attached to a borrowed connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBinding {
    /// `set_config(.., true)` inside a transaction; commit or rollback drops the binding.
    #[default]
    Transaction,
    /// Session-level binding, explicitly reset before release. A failed reset closes the
    /// connection instead of returning it to the pool.
    Session,
}

impl FromStr for PartitionBinding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transaction" | "tx" => Ok(Self::Transaction),
            "session" => Ok(Self::Session),
            other => Err(Error::Config(format!("unknown partition binding `{other}`"))),
        }
    }
}

#[derive(Clone)]
pub struct ScopedExecutor {
    pool: PgPool,
    binding: PartitionBinding,
    base_search_path: Vec<String>,
    statement_timeout: Option<Duration>,
}

impl fmt::Debug for ScopedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedExecutor")
            .field("binding", &self.binding)
            .field("base_search_path", &self.base_search_path)
            .field("statement_timeout", &self.statement_timeout)
            .finish_non_exhaustive()
    }
}

impl ScopedExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            binding: PartitionBinding::default(),
            base_search_path: Vec::new(),
            statement_timeout: None,
        }
    }

    pub fn from_config(pool: PgPool, config: &crate::config::DatabaseConfig) -> Self {
        Self {
            pool,
            binding: config.binding,
            base_search_path: config.base_search_path.clone(),
            statement_timeout: config.statement_timeout,
        }
    }

    pub fn with_binding(mut self, binding: PartitionBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_base_search_path<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_search_path = schemas.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn binding(&self) -> PartitionBinding {
        self.binding
    }

    /// Entry point for callers holding an optional context. An absent context fails
    /// before a connection is acquired.
    pub async fn run_in<T, F>(&self, context: Option<&TenantContext>, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let context = context::require(context)?;
        self.run(context, op).await
    }

    #[instrument(skip(self, op), fields(tenant_id = %context.id(), partition = %context.partition()))]
    pub async fn run<T, F>(&self, context: &TenantContext, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.execute(context, None, op).await
    }

    /// Like [`run`](Self::run), but aborts the operation once `deadline` elapses. The
    /// deadline also caps the server-side statement timeout, and an expired operation's
    /// connection is closed rather than reused.
    pub async fn run_with_deadline<T, F>(
        &self,
        context: &TenantContext,
        deadline: Duration,
        op: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.execute(context, Some(deadline), op).await
    }

    pub async fn health(&self) -> HealthStatus {
        match sqlx::query_scalar::<_, i32>("select 1")
            .fetch_one(&self.pool)
            .await
        {
            Ok(_) => HealthStatus::Up,
            Err(err) => HealthStatus::Down(err.to_string()),
        }
    }

    async fn execute<T, F>(
        &self,
        context: &TenantContext,
        deadline: Option<Duration>,
        op: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut conn = BoundConnection::new(self.pool.acquire().await?, context);
        metrics::incr(&metrics().partition_bindings_total);

        let binding = Binding {
            search_path: self.search_path_for(context),
            tenant_id: context.id().to_string(),
            statement_timeout: effective_timeout(self.statement_timeout, deadline),
        };

        match self.binding {
            PartitionBinding::Transaction => {
                let outcome = with_deadline(deadline, async {
                    let mut tx = conn.begin().await?;
                    binding.apply(&mut *tx, true).await?;
                    match op(&mut *tx).await {
                        Ok(value) => {
                            tx.commit().await?;
                            Ok(value)
                        }
                        Err(err) => {
                            if let Err(rollback) = tx.rollback().await {
                                tracing::warn!(
                                    target: "tenantry::executor",
                                    error = %rollback,
                                    "rollback after failed operation did not complete"
                                );
                            }
                            Err(err)
                        }
                    }
                })
                .await;
                if matches!(outcome, Err(Error::DeadlineExceeded)) {
                    conn.discard("operation exceeded its deadline");
                } else {
                    conn.release();
                }
                outcome
            }
            PartitionBinding::Session => {
                let outcome = with_deadline(deadline, async {
                    binding.apply(&mut **conn, false).await?;
                    op(&mut **conn).await
                })
                .await;
                if matches!(outcome, Err(Error::DeadlineExceeded)) {
                    conn.discard("operation exceeded its deadline");
                    return outcome;
                }
                match Executor::execute(&mut **conn, sqlx::raw_sql(RESET_SESSION_SQL)).await {
                    Ok(_) => conn.release(),
                    Err(reset) => {
                        metrics::incr(&metrics().partition_reset_failures_total);
                        conn.discard(reset);
                    }
                }
                outcome
            }
        }
    }

    fn search_path_for(&self, context: &TenantContext) -> String {
        std::iter::once(context.partition().as_str())
            .chain(self.base_search_path.iter().map(String::as_str))
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

struct Binding {
    search_path: String,
    tenant_id: String,
    statement_timeout: Option<Duration>,
}

impl Binding {
    async fn apply(&self, conn: &mut PgConnection, is_local: bool) -> Result<()> {
        sqlx::query(
            "select set_config('search_path', $1, $3), set_config('app.current_tenant', $2, $3)",
        )
        .bind(&self.search_path)
        .bind(&self.tenant_id)
        .bind(is_local)
        .execute(&mut *conn)
        .await?;

        if let Some(timeout) = self.statement_timeout {
            sqlx::query("select set_config('statement_timeout', $1, $2)")
                .bind(format!("{}ms", timeout.as_millis().max(1)))
                .bind(is_local)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

fn effective_timeout(configured: Option<Duration>, deadline: Option<Duration>) -> Option<Duration> {
    match (configured, deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(Error::DeadlineExceeded)),
        None => fut.await,
    }
}

/// A pooled connection that may still carry a partition binding. Unless
/// [`release`](Self::release) is called once the binding is gone, dropping the guard
/// closes the connection instead of returning it to the pool. This covers callers that
/// drop an in-flight operation.
struct BoundConnection {
    conn: PoolConnection<Postgres>,
    context: TenantContext,
    cleared: bool,
}

impl BoundConnection {
    fn new(conn: PoolConnection<Postgres>, context: &TenantContext) -> Self {
        Self {
            conn,
            context: context.clone(),
            cleared: false,
        }
    }

    fn release(&mut self) {
        self.cleared = true;
    }

    fn discard(&mut self, reason: impl fmt::Display) {
        self.cleared = true;
        self.conn.close_on_drop();
        metrics::incr(&metrics().connections_discarded_total);
        tracing::error!(
            target: "tenantry::executor",
            tenant_id = %self.context.id(),
            partition = %self.context.partition(),
            reason = %reason,
            "discarding connection: partition binding could not be cleared and may leak to the next borrower"
        );
    }
}

impl Deref for BoundConnection {
    type Target = PoolConnection<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for BoundConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for BoundConnection {
    fn drop(&mut self) {
        if !self.cleared {
            self.conn.close_on_drop();
            metrics::incr(&metrics().connections_discarded_total);
            tracing::warn!(
                target: "tenantry::executor",
                tenant_id = %self.context.id(),
                partition = %self.context.partition(),
                "operation dropped while bound; closing its connection"
            );
        }
    }
}
