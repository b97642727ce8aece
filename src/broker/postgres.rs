use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Broker, DeadLetter, Delivery, DeliveryTag, OutboundMessage, QueueSpec, topic_matches};
use crate::metrics::HealthStatus;
use crate::schema::qualified_name;
use crate::{Error, Result};

/// Durable topic exchange on Postgres tables.
///
/// Deliveries are leased with `for update skip locked`, so any number of consumer
/// processes can share a queue; a crashed consumer's lease simply expires.
#[derive(Clone, Debug)]
pub struct PgBroker {
    pool: PgPool,
    lease: Duration,
    exchanges: String,
    queues: String,
    bindings: String,
    messages: String,
    dead_letters: String,
}

type DeliveryRow = (i64, String, String, String, Uuid, Vec<u8>, i32);
type DeadLetterRow = (
    i64,
    String,
    String,
    String,
    String,
    Uuid,
    Vec<u8>,
    i32,
    String,
    DateTime<Utc>,
);

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self::with_schema(pool, "public")
    }

    pub fn with_schema(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            lease: Duration::from_secs(30),
            exchanges: qualified_name(schema, "broker_exchanges"),
            queues: qualified_name(schema, "broker_queues"),
            bindings: qualified_name(schema, "broker_bindings"),
            messages: qualified_name(schema, "broker_messages"),
            dead_letters: qualified_name(schema, "broker_dead_letters"),
        }
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let sql = format!(
            "insert into {} (name) values ($1) on conflict (name) do nothing",
            self.exchanges
        );
        sqlx::query(&sql).bind(name).execute(&self.pool).await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let sql = format!(
            "insert into {} (name, dead_letter_queue) values ($1, $2)
             on conflict (name) do update set dead_letter_queue = excluded.dead_letter_queue",
            self.queues
        );
        sqlx::query(&sql)
            .bind(&spec.name)
            .bind(&spec.dead_letter_queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let sql = format!(
            "insert into {} (queue, exchange, pattern) values ($1, $2, $3)
             on conflict (queue, exchange, pattern) do nothing",
            self.bindings
        );
        sqlx::query(&sql)
            .bind(queue)
            .bind(exchange)
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<usize> {
        let exists_sql = format!("select exists(select 1 from {} where name = $1)", self.exchanges);
        let exists: bool = sqlx::query_scalar(&exists_sql)
            .bind(exchange)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(Error::Broker(format!("exchange `{exchange}` is not declared")));
        }

        let bindings_sql = format!(
            "select queue, pattern from {} where exchange = $1",
            self.bindings
        );
        let bindings: Vec<(String, String)> = sqlx::query_as(&bindings_sql)
            .bind(exchange)
            .fetch_all(&self.pool)
            .await?;
        let mut targets: Vec<String> = bindings
            .into_iter()
            .filter(|(_, pattern)| topic_matches(pattern, &message.routing_key))
            .map(|(queue, _)| queue)
            .collect();
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Ok(0);
        }

        let insert_sql = format!(
            "insert into {} (queue, exchange, routing_key, message_id, body)
             select q, $2, $3, $4, $5 from unnest($1::text[]) as q",
            self.messages
        );
        sqlx::query(&insert_sql)
            .bind(&targets)
            .bind(exchange)
            .bind(&message.routing_key)
            .bind(message.message_id)
            .bind(&message.body)
            .execute(&self.pool)
            .await?;
        Ok(targets.len())
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let sql = format!(
            "update {messages} m
                set attempts = m.attempts + 1,
                    leased_until = now() + make_interval(secs => $3)
              where m.id in (
                    select id from {messages}
                     where queue = $1
                       and available_at <= now()
                       and (leased_until is null or leased_until < now())
                     order by id
                     limit $2
                     for update skip locked)
          returning m.id, m.queue, m.exchange, m.routing_key, m.message_id, m.body, m.attempts",
            messages = self.messages
        );
        let mut rows: Vec<DeliveryRow> = sqlx::query_as(&sql)
            .bind(queue)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .bind(self.lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;
        rows.sort_by_key(|row| row.0);
        Ok(rows
            .into_iter()
            .map(
                |(id, queue, exchange, routing_key, message_id, body, attempts)| Delivery {
                    tag: DeliveryTag(id),
                    queue,
                    exchange,
                    routing_key,
                    message_id,
                    body,
                    attempts: u32::try_from(attempts).unwrap_or(0),
                },
            )
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let sql = format!("delete from {} where id = $1", self.messages);
        sqlx::query(&sql)
            .bind(delivery.tag.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let sql = format!(
            "update {} set leased_until = null,
                           available_at = now() + make_interval(secs => $2)
              where id = $1",
            self.messages
        );
        sqlx::query(&sql)
            .bind(delivery.tag.0)
            .bind(delay.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let sql = format!(
            "with moved as (
                 delete from {messages} where id = $1
                 returning queue, exchange, routing_key, message_id, body, attempts, created_at
             )
             insert into {dead} (queue, source_queue, exchange, routing_key, message_id, body,
                                 attempts, reason, first_enqueued_at)
             select coalesce(q.dead_letter_queue, 'dlq.' || moved.queue), moved.queue,
                    moved.exchange, moved.routing_key, moved.message_id, moved.body,
                    moved.attempts, $2, moved.created_at
               from moved
               left join {queues} q on q.name = moved.queue",
            messages = self.messages,
            dead = self.dead_letters,
            queues = self.queues,
        );
        sqlx::query(&sql)
            .bind(delivery.tag.0)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let sql = format!(
            "select id, queue, source_queue, exchange, routing_key, message_id, body, attempts,
                    reason, dead_lettered_at
               from {}
              where queue = $1 or source_queue = $1
              order by id
              limit $2",
            self.dead_letters
        );
        let rows: Vec<DeadLetterRow> = sqlx::query_as(&sql)
            .bind(queue)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    queue,
                    source_queue,
                    exchange,
                    routing_key,
                    message_id,
                    body,
                    attempts,
                    reason,
                    dead_lettered_at,
                )| DeadLetter {
                    id,
                    queue,
                    source_queue,
                    exchange,
                    routing_key,
                    message_id,
                    body,
                    attempts: u32::try_from(attempts).unwrap_or(0),
                    reason,
                    dead_lettered_at,
                },
            )
            .collect())
    }

    async fn health(&self) -> HealthStatus {
        let sql = format!("select count(*) from {}", self.exchanges);
        match sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await {
            Ok(_) => HealthStatus::Up,
            Err(err) => HealthStatus::Down(err.to_string()),
        }
    }
}
