//! Postgres backings for the queue, inbox, idempotency and heartbeat stores.
//!
//! Lease timing uses the database clock (`NOW()`), so every process sharing
//! the database agrees on expiry regardless of local clock skew.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Acquire, PgPool};
use sqlx::postgres::{PgExecutor, PgQueryResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, Result};

use super::heartbeat::{HeartbeatStore, WorkerHeartbeat};
use super::idempotency::{BeginOutcome, IdempotencyRecord, IdempotencyState, IdempotencyStore};
use super::inbox::{InboxRecord, InboxState, ResultInbox};
use super::job::{DlqState, IntentId, Job, JobHandle, JobId, JobState};
use super::queue::{ExecutionQueue, QueueDepth, ensure_replayable, ensure_resolution_state};
use super::result::{EnvelopeId, ResultEnvelope};

const UNIQUE_VIOLATION: &str = "23505";

/// Fails fast when the database is unreachable or the migration has not
/// been applied.
pub async fn verify_schema(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| ExecutionError::Internal(format!("postgres health check failed: {e}")))?;

    let index_exists = sqlx::query_scalar::<_, i32>(
        "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
    )
    .bind("uq_execution_jobs_active_intent")
    .fetch_optional(pool)
    .await?
    .is_some();

    if !index_exists {
        return Err(ExecutionError::Internal(
            "required index uq_execution_jobs_active_intent is missing; run migrations".into(),
        ));
    }
    info!("execution store connected to postgres");
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn interval_secs(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1_000.0
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    intent: Value,
    context_key: String,
    reservation_delta: Value,
    state: String,
    priority: f64,
    available_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    leased_by: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    attempt_count: i32,
    max_attempts: i32,
    last_error: Option<String>,
    job_version: i32,
    parent_job_id: Option<Uuid>,
    dlq_state: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            intent: serde_json::from_value(self.intent)?,
            context_key: self.context_key,
            reservation_delta: serde_json::from_value(self.reservation_delta)?,
            state: JobState::from_str(&self.state)?,
            priority: self.priority,
            available_at: self.available_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            leased_by: self.leased_by,
            lease_until: self.lease_until,
            attempt_count: to_u32(self.attempt_count),
            max_attempts: to_u32(self.max_attempts),
            last_error: self.last_error,
            job_version: to_u32(self.job_version),
            parent_job_id: self.parent_job_id.map(JobId),
            dlq_state: self.dlq_state.as_deref().map(DlqState::from_str).transpose()?,
        })
    }
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(JobRow::into_job).collect()
}

async fn insert_job<'e, E>(executor: E, job: &Job) -> std::result::Result<PgQueryResult, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let intent = serde_json::to_value(&job.intent).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let reservation =
        serde_json::to_value(&job.reservation_delta).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO execution_jobs (
            id, intent_id, intent, context_key, reservation_delta, state, priority,
            available_at, created_at, updated_at, leased_by, lease_until,
            attempt_count, max_attempts, last_error, job_version, parent_job_id, dlq_state
        )
        VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, $8, NOW(), NULL, NULL, $9, $10, $11, $12, $13, NULL)
        "#,
    )
    .bind(job.id.0)
    .bind(job.intent.intent_id.as_str())
    .bind(intent)
    .bind(&job.context_key)
    .bind(reservation)
    .bind(job.priority)
    .bind(job.available_at)
    .bind(job.created_at)
    .bind(to_i32(job.attempt_count))
    .bind(to_i32(job.max_attempts))
    .bind(job.last_error.as_deref())
    .bind(to_i32(job.job_version))
    .bind(job.parent_job_id.map(|id| id.0))
    .execute(executor)
    .await
}

async fn active_job_for_intent<'e, E>(executor: E, intent_id: &IntentId) -> Result<Option<JobId>>
where
    E: PgExecutor<'e>,
{
    let id = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT id FROM execution_jobs
        WHERE intent_id = $1 AND state IN ('queued', 'leased')
        LIMIT 1
        "#,
    )
    .bind(intent_id.as_str())
    .fetch_optional(executor)
    .await?;
    Ok(id.map(JobId))
}

/// Queue backed by the `execution_jobs` table.
#[derive(Clone)]
pub struct PostgresExecutionQueue {
    pool: PgPool,
}

impl fmt::Debug for PostgresExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresExecutionQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresExecutionQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explains a zero-row update on a lease-guarded statement.
    async fn lease_violation(&self, job_id: JobId, worker_id: &str) -> ExecutionError {
        let found = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT state, leased_by FROM execution_jobs WHERE id = $1",
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await;
        match found {
            Ok(None) => ExecutionError::NotFound(format!("job {job_id}")),
            Ok(Some((state, holder))) => ExecutionError::LeaseMismatch(format!(
                "job {job_id} is {state} and leased by {holder:?}, not {worker_id}"
            )),
            Err(err) => err.into(),
        }
    }

    async fn dlq_violation(&self, job_id: JobId) -> ExecutionError {
        let found = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT state, dlq_state FROM execution_jobs WHERE id = $1",
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await;
        match found {
            Ok(None) => ExecutionError::NotFound(format!("job {job_id}")),
            Ok(Some((state, dlq_state))) => ExecutionError::InvalidTransition(format!(
                "job {job_id} is {state} with dlq state {}",
                dlq_state.as_deref().unwrap_or("unset")
            )),
            Err(err) => err.into(),
        }
    }
}

#[async_trait]
impl ExecutionQueue for PostgresExecutionQueue {
    async fn enqueue(&self, job: Job) -> Result<JobHandle> {
        job.validate()?;
        if job.state != JobState::Queued {
            return Err(ExecutionError::Validation(format!(
                "job {} must be enqueued in the queued state, found {}",
                job.id, job.state
            )));
        }
        let intent_id = job.intent.intent_id.clone();

        // Precheck avoids unique-violation noise in the server log for the
        // common duplicate case.
        if let Some(existing) = active_job_for_intent(&self.pool, &intent_id).await? {
            debug!(job = %existing, intent = %intent_id, "enqueue merged into active job");
            return Ok(JobHandle::merged(existing, intent_id));
        }

        match insert_job(&self.pool, &job).await {
            Ok(_) => {
                info!(job = %job.id, intent = %intent_id, priority = job.priority, "job enqueued");
                Ok(JobHandle::accepted(&job))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = active_job_for_intent(&self.pool, &intent_id)
                    .await?
                    .ok_or_else(|| {
                        ExecutionError::Conflict(format!(
                            "intent {intent_id} conflicted but no active job was found"
                        ))
                    })?;
                debug!(job = %existing, intent = %intent_id, "enqueue raced; merged into active job");
                Ok(JobHandle::merged(existing, intent_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn lease(
        &self,
        worker_id: &str,
        batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>> {
        if batch == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE execution_jobs
            SET state = 'leased',
                leased_by = $1,
                lease_until = NOW() + make_interval(secs => $3),
                attempt_count = attempt_count + 1,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM execution_jobs
                WHERE state = 'queued' AND available_at <= NOW()
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(i64::try_from(batch).unwrap_or(i64::MAX))
        .bind(interval_secs(visibility_timeout))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows_to_jobs(rows)?;
        jobs.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(jobs)
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<DateTime<Utc>> {
        let until = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE execution_jobs
            SET lease_until = NOW() + make_interval(secs => $3), updated_at = NOW()
            WHERE id = $1 AND state = 'leased' AND leased_by = $2
            RETURNING lease_until
            "#,
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(interval_secs(visibility_timeout))
        .fetch_optional(&self.pool)
        .await?;
        match until {
            Some(until) => Ok(until),
            None => Err(self.lease_violation(job_id, worker_id).await),
        }
    }

    async fn ack_success(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE execution_jobs
            SET state = 'completed', leased_by = NULL, lease_until = NULL, updated_at = NOW()
            WHERE id = $1 AND state = 'leased' AND leased_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(self.lease_violation(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn release(
        &self,
        job_id: JobId,
        worker_id: &str,
        available_at: DateTime<Utc>,
        reason: &str,
        decrement_attempt: bool,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE execution_jobs
            SET state = 'queued',
                leased_by = NULL,
                lease_until = NULL,
                available_at = $3,
                last_error = $4,
                attempt_count = CASE WHEN $5 THEN GREATEST(attempt_count - 1, 0) ELSE attempt_count END,
                updated_at = NOW()
            WHERE id = $1 AND state = 'leased' AND leased_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(available_at)
        .bind(reason)
        .bind(decrement_attempt)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(self.lease_violation(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        job_id: JobId,
        worker_id: &str,
        dlq_state: DlqState,
        reason: &str,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE execution_jobs
            SET state = 'dlq',
                dlq_state = $3,
                leased_by = NULL,
                lease_until = NULL,
                last_error = $4,
                updated_at = NOW()
            WHERE id = $1 AND state = 'leased' AND leased_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(dlq_state.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(self.lease_violation(job_id, worker_id).await);
        }
        warn!(job = %job_id, dlq_state = %dlq_state, reason, "job moved to dlq");
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE execution_jobs
            SET state = 'queued',
                leased_by = NULL,
                lease_until = NULL,
                available_at = NOW(),
                updated_at = NOW()
            WHERE state = 'leased' AND lease_until <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        let reclaimed = res.rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, "expired job leases requeued");
        }
        Ok(reclaimed)
    }

    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM execution_jobs j
            WHERE j.state = 'completed'
              AND j.updated_at < $1
              AND NOT EXISTS (SELECT 1 FROM execution_jobs c WHERE c.parent_job_id = j.id)
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM execution_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRow::into_job)
            .transpose()
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM execution_jobs WHERE state = 'dlq' ORDER BY updated_at DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows_to_jobs(rows)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM execution_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut depth = QueueDepth::default();
        for (state, count) in counts {
            let count = usize::try_from(count).unwrap_or(0);
            match JobState::from_str(&state)? {
                JobState::Queued => depth.queued = count,
                JobState::Leased => depth.leased = count,
                JobState::Completed => depth.completed = count,
                JobState::Dlq => depth.dlq = count,
            }
        }
        Ok(depth)
    }

    async fn depth_by_context(&self) -> Result<BTreeMap<String, usize>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT context_key, COUNT(*) FROM execution_jobs
            WHERE state IN ('queued', 'leased')
            GROUP BY context_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts
            .into_iter()
            .map(|(ctx, n)| (ctx, usize::try_from(n).unwrap_or(0)))
            .collect())
    }

    async fn replay_dlq(&self, job_id: JobId, actor: &str) -> Result<JobHandle> {
        let mut tx = self.pool.begin().await?;
        let original = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM execution_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ExecutionError::NotFound(format!("job {job_id}")))?
        .into_job()?;

        if original.state != JobState::Dlq {
            return Err(ExecutionError::InvalidTransition(format!(
                "job {job_id} is {}, not in the dlq",
                original.state
            )));
        }
        let intent_id = original.intent.intent_id.clone();

        if original.dlq_state == Some(DlqState::Replayed) {
            let child = sqlx::query_scalar::<_, Uuid>(
                r#"
                SELECT id FROM execution_jobs
                WHERE intent_id = $1 AND parent_job_id = $2 AND state IN ('queued', 'leased')
                "#,
            )
            .bind(intent_id.as_str())
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(child) = child {
                tx.commit().await?;
                debug!(job = %job_id, child = %child, actor, "dlq entry already replayed");
                return Ok(JobHandle::merged(JobId(child), intent_id));
            }
        }
        ensure_replayable(job_id, original.dlq_state)?;

        sqlx::query(
            "UPDATE execution_jobs SET dlq_state = 'replayed', updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id.0)
        .execute(&mut *tx)
        .await?;

        if let Some(active) = active_job_for_intent(&mut *tx, &intent_id).await? {
            tx.commit().await?;
            info!(job = %job_id, active = %active, actor, "dlq replay merged into active job");
            return Ok(JobHandle::merged(active, intent_id));
        }

        let child = original.replay_child(Utc::now());
        // A savepoint keeps the replayed mark when a concurrent enqueue wins
        // the active-intent index.
        let mut savepoint = tx.begin().await?;
        match insert_job(&mut *savepoint, &child).await {
            Ok(_) => savepoint.commit().await?,
            Err(err) if is_unique_violation(&err) => {
                savepoint.rollback().await?;
                let active = active_job_for_intent(&mut *tx, &intent_id)
                    .await?
                    .ok_or_else(|| {
                        ExecutionError::Conflict(format!(
                            "replay of {job_id} conflicted but no active job was found"
                        ))
                    })?;
                tx.commit().await?;
                info!(job = %job_id, active = %active, actor, "dlq replay merged into active job");
                return Ok(JobHandle::merged(active, intent_id));
            }
            Err(err) => return Err(err.into()),
        }
        tx.commit().await?;

        info!(
            job = %job_id,
            child = %child.id,
            version = child.job_version,
            actor,
            "dlq job replayed"
        );
        Ok(JobHandle::accepted(&child))
    }

    async fn resolve_dlq(&self, job_id: JobId, actor: &str, resolution: DlqState) -> Result<Job> {
        ensure_resolution_state(resolution)?;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE execution_jobs
            SET dlq_state = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'dlq' AND dlq_state = 'awaiting_manual_action'
            RETURNING *
            "#,
        )
        .bind(job_id.0)
        .bind(resolution.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                info!(job = %job_id, actor, resolution = %resolution, "dlq job resolved");
                row.into_job()
            }
            None => Err(self.dlq_violation(job_id).await),
        }
    }
}

#[derive(sqlx::FromRow)]
struct InboxRow {
    id: Uuid,
    envelope: Value,
    state: String,
    leased_by: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    delivery_count: i32,
}

impl InboxRow {
    fn into_record(self) -> Result<InboxRecord> {
        Ok(InboxRecord {
            id: EnvelopeId(self.id),
            envelope: serde_json::from_value(self.envelope)?,
            state: InboxState::from_str(&self.state)?,
            leased_by: self.leased_by,
            lease_until: self.lease_until,
            delivery_count: to_u32(self.delivery_count),
        })
    }
}

/// Inbox backed by the `execution_results` table.
#[derive(Clone)]
pub struct PostgresResultInbox {
    pool: PgPool,
}

impl fmt::Debug for PostgresResultInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresResultInbox")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresResultInbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultInbox for PostgresResultInbox {
    async fn append(&self, envelope: ResultEnvelope) -> Result<bool> {
        let body = serde_json::to_value(&envelope)?;
        let res = sqlx::query(
            r#"
            INSERT INTO execution_results (id, job_id, envelope, received_at, state, delivery_count)
            VALUES ($1, $2, $3, $4, 'pending', 0)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(EnvelopeId::new().0)
        .bind(envelope.job_id.0)
        .bind(body)
        .bind(envelope.received_at)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            debug!(job = %envelope.job_id, "duplicate result envelope ignored");
        }
        Ok(res.rows_affected() > 0)
    }

    async fn lease(
        &self,
        consumer: &str,
        batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<InboxRecord>> {
        let rows = sqlx::query_as::<_, InboxRow>(
            r#"
            UPDATE execution_results
            SET state = 'leased',
                leased_by = $1,
                lease_until = NOW() + make_interval(secs => $3),
                delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM execution_results
                WHERE state = 'pending'
                ORDER BY received_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, envelope, state, leased_by, lease_until, delivery_count
            "#,
        )
        .bind(consumer)
        .bind(i64::try_from(batch).unwrap_or(i64::MAX))
        .bind(interval_secs(visibility_timeout))
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(InboxRow::into_record)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.envelope.received_at.cmp(&b.envelope.received_at));
        Ok(records)
    }

    async fn ack(&self, id: EnvelopeId, consumer: &str) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE execution_results
            SET state = 'acked', leased_by = NULL, lease_until = NULL
            WHERE id = $1 AND state = 'leased' AND leased_by = $2
            "#,
        )
        .bind(id.0)
        .bind(consumer)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            return Ok(());
        }
        let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM execution_results WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Err(ExecutionError::LeaseMismatch(format!(
                "envelope {id} is not leased by {consumer}"
            )))
        } else {
            Err(ExecutionError::NotFound(format!("envelope {id}")))
        }
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE execution_results
            SET state = 'pending', leased_by = NULL, lease_until = NULL
            WHERE state = 'leased' AND lease_until <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn prune_acked(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM execution_results WHERE state = 'acked' AND received_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn depth(&self) -> Result<usize> {
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM execution_results WHERE state <> 'acked'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

/// Idempotency records in `execution_idempotency`.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    stale_after: Duration,
}

impl fmt::Debug for PostgresIdempotencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresIdempotencyStore")
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn begin(&self, key: &str) -> Result<BeginOutcome> {
        // A concurrent clear can delete the row between the insert and the
        // read; one retry covers that window.
        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO execution_idempotency (key, state, updated_at, metadata)
                VALUES ($1, 'in_progress', NOW(), 'null'::jsonb)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                return Ok(BeginOutcome::New);
            }

            let existing = sqlx::query_as::<_, (String, DateTime<Utc>, Value, DateTime<Utc>)>(
                "SELECT state, updated_at, metadata, NOW() FROM execution_idempotency WHERE key = $1",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((state, updated_at, metadata, now)) = existing {
                return Ok(match IdempotencyState::from_str(&state)? {
                    IdempotencyState::Done => BeginOutcome::Done(IdempotencyRecord {
                        key: key.to_string(),
                        state: IdempotencyState::Done,
                        updated_at,
                        metadata,
                    }),
                    IdempotencyState::InProgress => BeginOutcome::InProgress {
                        stale: now - updated_at >= self.stale_after,
                        since: updated_at,
                    },
                });
            }
        }
        Err(ExecutionError::Conflict(format!(
            "idempotency key {key} kept changing during begin"
        )))
    }

    async fn complete(&self, key: &str, metadata: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_idempotency (key, state, updated_at, metadata)
            VALUES ($1, 'done', NOW(), $2)
            ON CONFLICT (key) DO UPDATE
            SET state = 'done', updated_at = NOW(), metadata = EXCLUDED.metadata
            "#,
        )
        .bind(key)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_in_progress(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM execution_idempotency WHERE key = $1 AND state = 'in_progress'")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, (String, DateTime<Utc>, Value)>(
            "SELECT state, updated_at, metadata FROM execution_idempotency WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(state, updated_at, metadata)| {
            Ok(IdempotencyRecord {
                key: key.to_string(),
                state: IdempotencyState::from_str(&state)?,
                updated_at,
                metadata,
            })
        })
        .transpose()
    }
}

/// Worker liveness rows in `worker_heartbeats`.
#[derive(Clone)]
pub struct PostgresHeartbeatStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresHeartbeatStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresHeartbeatStore").finish()
    }
}

impl PostgresHeartbeatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HeartbeatStore for PostgresHeartbeatStore {
    async fn beat(&self, worker_id: &str, status: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, updated_at, status)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (worker_id) DO UPDATE
            SET updated_at = NOW(), status = EXCLUDED.status
            "#,
        )
        .bind(worker_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>> {
        let row = sqlx::query_as::<_, (String, DateTime<Utc>, String)>(
            "SELECT worker_id, updated_at, status FROM worker_heartbeats WHERE worker_id = $1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(worker_id, updated_at, status)| WorkerHeartbeat {
            worker_id,
            updated_at,
            status,
        }))
    }

    async fn list(&self) -> Result<Vec<WorkerHeartbeat>> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>, String)>(
            "SELECT worker_id, updated_at, status FROM worker_heartbeats ORDER BY worker_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(worker_id, updated_at, status)| WorkerHeartbeat {
                worker_id,
                updated_at,
                status,
            })
            .collect())
    }
}
