//! Lease-based queue engine.
//!
//! The engine holds no locks and no in-process state beyond its
//! configuration; every transition runs as one atomic Postgres statement.
//! The claim picks its candidate with `FOR UPDATE SKIP LOCKED`, so two
//! concurrent claims can never receive the same task and losers simply
//! re-match against the remaining pool.

pub(crate) mod predicate;

use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{LeaseTag, QueueStats, RetryPolicy, Task, TaskId};
use crate::telemetry::metrics;

const DEFAULT_TTL: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: RetryPolicy = RetryPolicy::Limited(10);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for opening a queue. All knobs optional.
pub struct QueueOptions {
    name: String,
    ttl: Duration,
    retries: RetryPolicy,
    clean: bool,
    insistent: bool,
    strict: bool,
    seed: Vec<serde_json::Value>,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: DEFAULT_TTL,
            retries: DEFAULT_RETRIES,
            clean: false,
            insistent: false,
            strict: false,
            seed: Vec::new(),
        }
    }

    /// Default lease duration for `get`/`ping` when none is given.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn retries(mut self, retries: RetryPolicy) -> Self {
        self.retries = retries;
        self
    }

    /// Purge the queue's rows when it is opened.
    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Prefer recently-retried tasks over long-idle backlog when claiming.
    pub fn insistent(mut self, insistent: bool) -> Self {
        self.insistent = insistent;
        self
    }

    /// Turn an empty claim into [`Error::Drained`] with a stats snapshot.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Initial batch of payloads inserted when the queue is opened.
    pub fn seed(mut self, items: Vec<serde_json::Value>) -> Self {
        self.seed = items;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::new("mq")
    }
}

/// Read-only view of a queue's effective configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveOptions {
    pub ttl: Duration,
    pub retries: RetryPolicy,
    pub insistent: bool,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Handle to one named queue. Cheap to clone; all state is server-side.
#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
    name: String,
    ttl: Duration,
    retries: RetryPolicy,
    insistent: bool,
    strict: bool,
}

impl Queue {
    /// Open a queue on an existing database handle.
    ///
    /// Performs the one-time per-queue lifecycle work before first use:
    /// purge when `clean` is set, then insert the seed batch.
    pub async fn open(db: &Db, options: QueueOptions) -> Result<Self> {
        let QueueOptions {
            name,
            ttl,
            retries,
            clean,
            insistent,
            strict,
            seed,
        } = options;

        let queue = Self {
            pool: db.pool().clone(),
            name,
            ttl,
            retries,
            insistent,
            strict,
        };

        if clean {
            sqlx::query("DELETE FROM tasks WHERE queue = $1")
                .bind(&queue.name)
                .execute(&queue.pool)
                .await?;
        }
        if !seed.is_empty() {
            queue.add(seed).await?;
        }

        tracing::debug!(queue = %queue.name, "queue ready");
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.name.clone()),
                KeyValue::new("operation", "open"),
            ],
        );
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> EffectiveOptions {
        EffectiveOptions {
            ttl: self.ttl,
            retries: self.retries,
            insistent: self.insistent,
        }
    }

    // -----------------------------------------------------------------------
    // Add
    // -----------------------------------------------------------------------

    /// Insert a batch of payloads as waiting tasks.
    ///
    /// An empty batch is a no-op. Returns the new ids in input order.
    /// `created` values within one batch are staggered by a microsecond
    /// per item so FIFO holds among same-call inserts too.
    pub async fn add<I>(&self, items: I) -> Result<Vec<TaskId>>
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        let now = Utc::now();
        let mut ids: Vec<Uuid> = Vec::new();
        let mut payloads: Vec<serde_json::Value> = Vec::new();
        let mut created: Vec<DateTime<Utc>> = Vec::new();
        for (i, data) in items.into_iter().enumerate() {
            ids.push(Uuid::new_v4());
            payloads.push(data);
            created.push(now + chrono::Duration::microseconds(i as i64));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query(
            "INSERT INTO tasks (id, queue, data, created, expires, tries) \
             SELECT t.id, $1::text, t.data, t.created, 'epoch'::timestamptz, $5::int \
             FROM unnest($2::uuid[], $3::jsonb[], $4::timestamptz[]) AS t(id, data, created)",
        )
        .bind(&self.name)
        .bind(&ids)
        .bind(&payloads)
        .bind(&created)
        .bind(self.retries.initial_tries())
        .execute(&self.pool)
        .await?;

        metrics::tasks_added().add(
            ids.len() as u64,
            &[KeyValue::new("queue", self.name.clone())],
        );
        Ok(ids.into_iter().map(TaskId).collect())
    }

    /// Insert a single payload. Convenience wrapper over [`Queue::add`].
    pub async fn add_one(&self, item: serde_json::Value) -> Result<TaskId> {
        let mut ids = self.add(std::iter::once(item)).await?;
        ids.pop()
            .ok_or_else(|| Error::Other("bulk insert returned no id".into()))
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim one waiting task under the queue's default lease duration.
    pub async fn get(&self) -> Result<Option<Task>> {
        self.get_for(self.ttl).await
    }

    /// Claim one waiting task, leasing it for `lease`.
    ///
    /// Selection and mutation happen in one atomic statement: the winner
    /// gets a fresh tag, `expires = now + lease`, and (when tracked) its
    /// attempt counter bumped; the post-update record is returned. The
    /// claim that brings `tries` up to the limit still succeeds — only
    /// the next attempt sees the task as failed.
    ///
    /// In strict mode an empty claim is an [`Error::Drained`] carrying a
    /// stats snapshot instead of `Ok(None)`.
    pub async fn get_for(&self, lease: Duration) -> Result<Option<Task>> {
        let now = Utc::now();
        let expires = now + lease_span(lease)?;
        let tag = LeaseTag::generate();

        let sql = claim_sql(self.retries, self.insistent);
        let query = sqlx::query_as::<_, TaskRow>(&sql).bind(&self.name).bind(now);
        let row: Option<TaskRow> = match self.retries {
            RetryPolicy::Limited(limit) => {
                query
                    .bind(limit as i32)
                    .bind(tag.0)
                    .bind(expires)
                    .fetch_optional(&self.pool)
                    .await?
            }
            RetryPolicy::Unlimited => {
                query
                    .bind(tag.0)
                    .bind(expires)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new(
                    "operation",
                    if row.is_some() { "get" } else { "get_empty" },
                ),
            ],
        );

        match row {
            Some(row) => {
                let task = row.into_task();
                tracing::debug!(queue = %self.name, id = %task.id, "claimed task");
                Ok(Some(task))
            }
            None if self.strict => {
                let stats = self.stats().await?;
                Err(Error::Drained {
                    queue: self.name.clone(),
                    stats,
                })
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Renew
    // -----------------------------------------------------------------------

    /// Extend a live lease by the queue's default duration.
    pub async fn ping(&self, tag: LeaseTag) -> Result<Option<Task>> {
        self.ping_for(tag, self.ttl).await
    }

    /// Extend a live lease to `now + lease`, leaving `tries` and the tag
    /// untouched. Returns `None` when the tag no longer identifies an
    /// active task — expired, completed, or never issued.
    pub async fn ping_for(&self, tag: LeaseTag, lease: Duration) -> Result<Option<Task>> {
        let now = Utc::now();
        let expires = now + lease_span(lease)?;

        let sql = format!(
            "UPDATE tasks SET expires = $4 WHERE {} AND tag = $3 \
             RETURNING id, data, created, expires, tries, tag",
            predicate::active()
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(now)
            .bind(tag.0)
            .bind(expires)
            .fetch_optional(&self.pool)
            .await?;

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new(
                    "operation",
                    if row.is_some() { "ping" } else { "ping_stale" },
                ),
            ],
        );
        Ok(row.map(TaskRow::into_task))
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    /// Remove the task currently active under `tag`.
    ///
    /// Same liveness predicate as [`Queue::ping_for`]: a consumer whose
    /// lease lapsed cannot retroactively delete a task it no longer owns.
    /// Returns the removed task's id, or `None`.
    pub async fn ack(&self, tag: LeaseTag) -> Result<Option<TaskId>> {
        let now = Utc::now();

        let sql = format!(
            "DELETE FROM tasks WHERE {} AND tag = $3 RETURNING id",
            predicate::active()
        );
        let row: Option<(Uuid,)> = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(now)
            .bind(tag.0)
            .fetch_optional(&self.pool)
            .await?;

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new(
                    "operation",
                    if row.is_some() { "ack" } else { "ack_stale" },
                ),
            ],
        );
        Ok(row.map(|(id,)| TaskId(id)))
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Count of all task records in this queue, regardless of state.
    pub async fn total(&self) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM tasks WHERE queue = $1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Count of tasks a `get` could claim right now.
    pub async fn waiting(&self) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM tasks WHERE {}",
            predicate::waiting(self.retries)
        );
        let query = sqlx::query_as::<_, (i64,)>(&sql)
            .bind(&self.name)
            .bind(Utc::now());
        let (n,) = match self.retries {
            RetryPolicy::Limited(limit) => query.bind(limit as i32).fetch_one(&self.pool).await?,
            RetryPolicy::Unlimited => query.fetch_one(&self.pool).await?,
        };
        Ok(n as u64)
    }

    /// Count of currently leased tasks.
    pub async fn active(&self) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM tasks WHERE {}", predicate::active());
        let (n,): (i64,) = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Count of terminally failed tasks. Structurally zero under
    /// unlimited retries.
    pub async fn failed(&self) -> Result<u64> {
        let RetryPolicy::Limited(limit) = self.retries else {
            return Ok(0);
        };
        let sql = format!("SELECT count(*) FROM tasks WHERE {}", predicate::failed());
        let (n,): (i64,) = sqlx::query_as(&sql)
            .bind(&self.name)
            .bind(Utc::now())
            .bind(limit as i32)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Active/waiting/failed breakdown in one aggregation pass, so the
    /// three numbers are consistent at a single observation instant.
    pub async fn stats(&self) -> Result<QueueStats> {
        let sql = format!(
            "SELECT {} AS state, count(*) FROM tasks WHERE queue = $1 GROUP BY 1",
            predicate::state_case(self.retries)
        );
        let query = sqlx::query_as::<_, (String, i64)>(&sql)
            .bind(&self.name)
            .bind(Utc::now());
        let rows = match self.retries {
            RetryPolicy::Limited(limit) => query.bind(limit as i32).fetch_all(&self.pool).await?,
            RetryPolicy::Unlimited => query.fetch_all(&self.pool).await?,
        };

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.as_str() {
                "active" => stats.active = count as u64,
                "waiting" => stats.waiting = count as u64,
                "failed" => stats.failed = count as u64,
                other => return Err(Error::Other(format!("unknown task state: {other}"))),
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Claim statement
// ---------------------------------------------------------------------------

/// The single atomic find-and-modify at the heart of the engine.
///
/// The inner SELECT picks one claimable row in candidate order and locks
/// it; `SKIP LOCKED` makes concurrent claimants fall through to the next
/// candidate instead of blocking on the same row.
fn claim_sql(retries: RetryPolicy, insistent: bool) -> String {
    let set = match retries {
        RetryPolicy::Limited(_) => "tag = $4, expires = $5, tries = tries + 1",
        RetryPolicy::Unlimited => "tag = $3, expires = $4",
    };
    format!(
        "UPDATE tasks SET {set} \
         WHERE id = (SELECT id FROM tasks WHERE {} ORDER BY {} \
                     FOR UPDATE SKIP LOCKED LIMIT 1) \
         RETURNING id, data, created, expires, tries, tag",
        predicate::waiting(retries),
        predicate::claim_order(insistent),
    )
}

fn lease_span(lease: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(lease)
        .map_err(|e| Error::Other(format!("lease duration out of range: {e}")))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    data: serde_json::Value,
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
    tries: Option<i32>,
    tag: Option<Uuid>,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            id: TaskId(self.id),
            data: self.data,
            created: self.created,
            expires: self.expires,
            tries: self.tries.map(|n| n as u32),
            tag: self.tag.map(LeaseTag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let q = QueueOptions::default();
        assert_eq!(q.name, "mq");
        assert_eq!(q.ttl, Duration::from_secs(30));
        assert_eq!(q.retries, RetryPolicy::Limited(10));
        assert!(!q.clean && !q.insistent && !q.strict);
        assert!(q.seed.is_empty());
    }

    #[test]
    fn claim_sql_increments_tries_only_when_tracked() {
        let limited = claim_sql(RetryPolicy::Limited(10), false);
        assert!(limited.contains("tries = tries + 1"));
        assert!(limited.contains("tries < $3"));

        let unlimited = claim_sql(RetryPolicy::Unlimited, false);
        assert!(!unlimited.contains("tries = tries + 1"));
    }

    #[test]
    fn claim_sql_locks_one_candidate() {
        let sql = claim_sql(RetryPolicy::Limited(10), false);
        assert!(sql.contains("FOR UPDATE SKIP LOCKED LIMIT 1"));
        assert!(sql.contains("ORDER BY expires ASC, created ASC"));

        let insistent = claim_sql(RetryPolicy::Unlimited, true);
        assert!(insistent.contains("ORDER BY expires DESC, created ASC"));
    }

    #[test]
    fn lease_span_rejects_overflow() {
        assert!(lease_span(Duration::from_secs(60)).is_ok());
        assert!(lease_span(Duration::MAX).is_err());
    }
}
