use std::collections::HashSet;

use crate::{
    Result,
    context::PartitionLocator,
    directory::{NewTenant, Tenant, TenantRow},
};
use indoc::formatdoc;
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let existing_schemas = self.existing_schemas().await?;

        let base_schema = config.base_schema.trim();
        if base_schema.is_empty() {
            plan.push_warning("base schema name is empty; skipping shared tables".to_string());
        } else {
            plan.mark_schema(base_schema);
            self.plan_base_schema(&mut plan, base_schema, existing_schemas.contains(base_schema))
                .await?;
        }

        for partition in &config.partitions {
            self.plan_for_partition(&mut plan, partition, &existing_schemas)
                .await?;
        }

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::raw_sql(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    /// Create one tenant partition and its tables if they are missing.
    pub async fn provision_partition(&self, partition: &PartitionLocator) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let existing_schemas = self.existing_schemas().await?;
        self.plan_for_partition(&mut plan, partition, &existing_schemas)
            .await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    /// Provision the partition, then record the tenant in the directory.
    ///
    /// Provisioning proper belongs to an operator workflow; this covers bootstrap and tests.
    pub async fn register_tenant(&self, base_schema: &str, tenant: &NewTenant) -> Result<Tenant> {
        self.provision_partition(&tenant.partition).await?;
        let sql = format!(
            "insert into {} (id, name, slug, schema_name, subscription_status, created_at)
             values ($1, $2, $3, $4, $5, coalesce($6, now()))
             returning id, name, slug, schema_name, subscription_status, created_at",
            qualified_name(base_schema, "tenants")
        );
        let row: TenantRow = sqlx::query_as(&sql)
            .bind(tenant.id)
            .bind(&tenant.name)
            .bind(&tenant.slug)
            .bind(tenant.partition.as_str())
            .bind(tenant.status.as_str())
            .bind(tenant.created_at)
            .fetch_one(&self.pool)
            .await?;
        Tenant::from_row(row)
    }

    async fn plan_base_schema(
        &self,
        plan: &mut SchemaPlan,
        schema: &str,
        schema_exists: bool,
    ) -> Result<()> {
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };
        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };

        let tenants_exists = existing_tables.contains("tenants");
        ensure_table(plan, schema, &existing_tables, "tenants", build_tenants_table_sql);
        if !tenants_exists {
            plan.push_action(
                format!(
                    "guard partition locator on {}",
                    qualified_name(schema, "tenants")
                ),
                build_tenants_guard_sql(schema),
            );
        }
        ensure_index(
            plan,
            schema,
            &existing_indexes,
            "tenants_resolvable_idx",
            build_tenants_index_sql,
        );

        ensure_table(
            plan,
            schema,
            &existing_tables,
            "user_tenant_lookup",
            build_lookup_table_sql,
        );
        ensure_index(
            plan,
            schema,
            &existing_indexes,
            "user_tenant_lookup_user_idx",
            build_lookup_index_sql,
        );

        ensure_table(
            plan,
            schema,
            &existing_tables,
            "broker_exchanges",
            build_broker_exchanges_table_sql,
        );
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "broker_queues",
            build_broker_queues_table_sql,
        );
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "broker_bindings",
            build_broker_bindings_table_sql,
        );
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "broker_messages",
            build_broker_messages_table_sql,
        );
        ensure_index(
            plan,
            schema,
            &existing_indexes,
            "broker_messages_ready_idx",
            build_broker_messages_index_sql,
        );
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "broker_dead_letters",
            build_broker_dead_letters_table_sql,
        );

        Ok(())
    }

    async fn plan_for_partition(
        &self,
        plan: &mut SchemaPlan,
        partition: &PartitionLocator,
        existing_schemas: &HashSet<String>,
    ) -> Result<()> {
        let schema = partition.as_str();
        if plan.has_schema(schema) {
            plan.push_warning(format!(
                "schema `{}` already planned; skipping duplicate entry",
                schema
            ));
            return Ok(());
        }
        plan.mark_schema(schema);

        let schema_exists = existing_schemas.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };
        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };

        ensure_table(plan, schema, &existing_tables, "users", build_users_table_sql);
        ensure_index(
            plan,
            schema,
            &existing_indexes,
            "users_email_active_key",
            build_users_email_index_sql,
        );

        let cache_exists = existing_tables.contains("user_cache");
        ensure_table(
            plan,
            schema,
            &existing_tables,
            "user_cache",
            build_user_cache_table_sql,
        );
        if !cache_exists {
            plan.push_action(
                format!(
                    "row level security on {}",
                    qualified_name(schema, "user_cache")
                ),
                build_user_cache_policy_sql(schema),
            );
        }

        Ok(())
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    /// Holds the tenant directory, the email lookup index and the durable broker tables.
    pub base_schema: String,
    pub partitions: Vec<PartitionLocator>,
}

impl SchemaConfig {
    pub fn with_base_schema(schema: impl Into<String>) -> Self {
        Self {
            base_schema: schema.into(),
            partitions: Vec::new(),
        }
    }

    pub fn with_partitions<I>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = PartitionLocator>,
    {
        self.partitions.extend(partitions);
        self
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self::with_base_schema("public")
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
    seen_schemas: HashSet<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    fn mark_schema(&mut self, schema: &str) {
        self.seen_schemas.insert(schema.to_lowercase());
    }

    fn has_schema(&self, schema: &str) -> bool {
        self.seen_schemas.contains(&schema.to_lowercase())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_indexes: &HashSet<String>,
    index: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_indexes.contains(index) {
        plan.push_action(
            format!("create index {}", qualified_name(schema, index)),
            build_sql(schema),
        );
    }
}

fn build_tenants_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id uuid primary key,
            name text not null,
            slug text not null unique,
            schema_name text not null unique,
            subscription_status text not null default 'trial'
                check (subscription_status in ('active', 'trial', 'suspended')),
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            deleted_at timestamptz null
        )
        ",
        table = qualified_name(schema, "tenants"),
    )
}

fn build_tenants_guard_sql(schema: &str) -> String {
    formatdoc!(
        r#"
        create or replace function {schema}.tenantry_tenants_guard() returns trigger as $$
        begin
          if NEW.schema_name is distinct from OLD.schema_name then
            raise exception 'tenant % partition locator is immutable', OLD.id;
          end if;
          NEW.updated_at := now();
          return NEW;
        end;
        $$ language plpgsql;

        create trigger tenantry_tenants_guard before update on {table}
          for each row execute function {schema}.tenantry_tenants_guard();
        "#,
        schema = quote_ident(schema),
        table = qualified_name(schema, "tenants"),
    )
}

fn build_tenants_index_sql(schema: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index} on {table} (created_at, id)
            where subscription_status in ('active', 'trial') and deleted_at is null
        ",
        index = quote_ident("tenants_resolvable_idx"),
        table = qualified_name(schema, "tenants"),
    )
}

fn build_lookup_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            email text primary key,
            user_id uuid not null,
            tenant_id uuid not null,
            tenant_slug text not null,
            tenant_schema text not null,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "user_tenant_lookup"),
    )
}

fn build_lookup_index_sql(schema: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index} on {table} (tenant_id, user_id)
        ",
        index = quote_ident("user_tenant_lookup_user_idx"),
        table = qualified_name(schema, "user_tenant_lookup"),
    )
}

fn build_broker_exchanges_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            name text primary key,
            kind text not null default 'topic',
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "broker_exchanges"),
    )
}

fn build_broker_queues_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            name text primary key,
            dead_letter_queue text null,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "broker_queues"),
    )
}

fn build_broker_bindings_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            queue text not null,
            exchange text not null,
            pattern text not null,
            created_at timestamptz not null default now(),
            primary key (queue, exchange, pattern)
        )
        ",
        table = qualified_name(schema, "broker_bindings"),
    )
}

fn build_broker_messages_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id bigserial primary key,
            queue text not null,
            exchange text not null,
            routing_key text not null,
            message_id uuid not null,
            body bytea not null,
            attempts int not null default 0,
            available_at timestamptz not null default now(),
            leased_until timestamptz null,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "broker_messages"),
    )
}

fn build_broker_messages_index_sql(schema: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index} on {table} (queue, available_at, id)
        ",
        index = quote_ident("broker_messages_ready_idx"),
        table = qualified_name(schema, "broker_messages"),
    )
}

fn build_broker_dead_letters_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id bigserial primary key,
            queue text not null,
            source_queue text not null,
            exchange text not null,
            routing_key text not null,
            message_id uuid not null,
            body bytea not null,
            attempts int not null,
            reason text not null,
            first_enqueued_at timestamptz not null,
            dead_lettered_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "broker_dead_letters"),
    )
}

fn build_users_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id uuid primary key,
            email text not null,
            password_hash text not null,
            first_name text not null default '',
            last_name text not null default '',
            status text not null default 'active',
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            deleted_at timestamptz null
        )
        ",
        table = qualified_name(schema, "users"),
    )
}

fn build_users_email_index_sql(schema: &str) -> String {
    formatdoc!(
        "
        create unique index if not exists {index} on {table} (lower(email))
            where deleted_at is null
        ",
        index = quote_ident("users_email_active_key"),
        table = qualified_name(schema, "users"),
    )
}

fn build_user_cache_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            user_id uuid primary key,
            tenant_id uuid not null,
            first_name text not null default '',
            last_name text not null default '',
            email text not null,
            role_name text null,
            last_event_at timestamptz not null,
            deleted_at timestamptz null,
            updated_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "user_cache"),
    )
}

// Enforced for non-owner roles; the owner (and superusers) bypass it.
fn build_user_cache_policy_sql(schema: &str) -> String {
    formatdoc!(
        "
        alter table {table} enable row level security;
        create policy tenantry_tenant_isolation on {table}
            using (tenant_id = nullif(current_setting('app.current_tenant', true), '')::uuid)
            with check (tenant_id = nullif(current_setting('app.current_tenant', true), '')::uuid);
        ",
        table = qualified_name(schema, "user_cache"),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified() {
        assert_eq!(
            qualified_name("public", "tenants"),
            "\"public\".\"tenants\""
        );
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn partition_tables_are_schema_qualified() {
        let sql = build_user_cache_table_sql("tenant_north");
        assert!(sql.contains("\"tenant_north\".\"user_cache\""));
        assert!(sql.contains("last_event_at timestamptz not null"));

        let policy = build_user_cache_policy_sql("tenant_north");
        assert!(policy.contains("app.current_tenant"));
    }

    #[test]
    fn tenants_status_is_constrained() {
        let sql = build_tenants_table_sql("public");
        assert!(sql.contains("check (subscription_status in ('active', 'trial', 'suspended'))"));
        assert!(build_tenants_guard_sql("public").contains("is immutable"));
    }
}
