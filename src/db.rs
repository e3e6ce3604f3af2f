use crate::{JobPayload, Profile, ProfilingJob, ProfilingTarget, QueueMessage, QueueStatus};
use anyhow::Error;
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Durable job lifecycle state, the single source of truth for polling
/// clients. The worker and the fallback executor mutate jobs through this
/// interface only; every transition is guarded against terminal rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new pending job. Must succeed before any enqueue attempt.
    async fn create_job(&self, target: &ProfilingTarget) -> Result<Uuid, Error>;

    /// pending -> processing. A miss is logged, not an error.
    async fn start_job(&self, id: Uuid) -> Result<(), Error>;

    /// Progress/phase updates, accepted only while processing.
    async fn set_progress(&self, id: Uuid, progress: i16, phase: &str) -> Result<(), Error>;

    /// processing -> completed, progress pinned to 100.
    async fn complete_job(&self, id: Uuid, result: &Profile) -> Result<(), Error>;

    /// pending|processing -> failed. Idempotent: the first error wins.
    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), Error>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ProfilingJob>, Error>;
}

/// Long-lived profile archive, keyed by target so re-profiling the same
/// person overwrites rather than duplicates.
#[async_trait]
pub trait ProfileArchive: Send + Sync {
    async fn upsert(&self, profile: &Profile) -> Result<(), Error>;
}

/// Producer side of the durable queue.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    /// Requeues messages locked by a previous run. Called once on dispatcher
    /// startup; combined with the status guards on the job rows this yields
    /// at-least-once delivery without double-completing jobs.
    pub(crate) async fn reset_locked_messages(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE profiling_queue \
                SET status = $1, locked_at = NULL \
            WHERE status = $2",
        )
        .bind(QueueStatus::Queued)
        .bind(QueueStatus::Locked)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!(
                requeued = result.rows_affected(),
                "Requeued messages from an interrupted run"
            );
        }

        Ok(result.rows_affected())
    }

    /// Claims up to `limit` queued messages, oldest first. SKIP LOCKED keeps
    /// concurrent dispatcher instances from claiming the same rows.
    pub(crate) async fn claim_messages(&self, limit: i64) -> Result<Vec<QueueMessage>, Error> {
        debug!("Claiming up to {} queued messages", limit);
        Ok(sqlx::query_as::<_, QueueMessage>(
            "UPDATE profiling_queue \
                SET status = $1, locked_at = now(), attempts = attempts + 1 \
            WHERE id IN ( \
                SELECT id FROM profiling_queue \
                WHERE status = $2 \
                ORDER BY enqueued_at \
                LIMIT $3 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, job_id, payload, attempts",
        )
        .bind(QueueStatus::Locked)
        .bind(QueueStatus::Queued)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?)
    }

    /// The job record holds the outcome, so a handled message is simply gone.
    pub(crate) async fn delete_message(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM profiling_queue WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Dead-letters a message that cannot be processed (undecodable payload
    /// or attempts exhausted). The row is kept for inspection.
    pub(crate) async fn mark_message_dead(&self, id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE profiling_queue SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(QueueStatus::Dead)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for DbHandle {
    async fn create_job(&self, target: &ProfilingTarget) -> Result<Uuid, Error> {
        let id = Uuid::new_v4();
        debug!(job_id = %id, "Creating job for {}", target.display_name());
        sqlx::query("INSERT INTO profiling_jobs (id, status, target) VALUES ($1, 'PENDING', $2)")
            .bind(id)
            .bind(serde_json::to_value(target)?)
            .execute(&*self.pool)
            .await?;

        Ok(id)
    }

    async fn start_job(&self, id: Uuid) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE profiling_jobs \
                SET status = 'PROCESSING', started_at = now() \
            WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(job_id = %id, "start_job matched no pending row");
        }

        Ok(())
    }

    async fn set_progress(&self, id: Uuid, progress: i16, phase: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE profiling_jobs \
                SET progress = $2, current_phase = $3 \
            WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(id)
        .bind(progress)
        .bind(phase)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn complete_job(&self, id: Uuid, result: &Profile) -> Result<(), Error> {
        let outcome = sqlx::query(
            "UPDATE profiling_jobs \
                SET status = 'COMPLETED', \
                progress = 100, \
                current_phase = NULL, \
                result = $2, \
                completed_at = now() \
            WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(id)
        .bind(serde_json::to_value(result)?)
        .execute(&*self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            warn!(job_id = %id, "complete_job matched no processing row");
        }

        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), Error> {
        let outcome = sqlx::query(
            "UPDATE profiling_jobs \
                SET status = 'FAILED', \
                error = $2, \
                completed_at = now() \
            WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(id)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            warn!(job_id = %id, "fail_job matched no live row");
        }

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProfilingJob>, Error> {
        Ok(sqlx::query_as::<_, ProfilingJob>(
            "SELECT id, status, progress, current_phase, target, result, error, \
                    created_at, started_at, completed_at \
            FROM profiling_jobs \
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }
}

#[async_trait]
impl ProfileArchive for DbHandle {
    async fn upsert(&self, profile: &Profile) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO profiles (target_id, payload, overall_score, completeness, metadata, updated_at) \
            VALUES ($1, $2, $3, $4, $5, now()) \
            ON CONFLICT (target_id) DO UPDATE \
                SET payload = EXCLUDED.payload, \
                overall_score = EXCLUDED.overall_score, \
                completeness = EXCLUDED.completeness, \
                metadata = EXCLUDED.metadata, \
                updated_at = now()",
        )
        .bind(&profile.target_id)
        .bind(serde_json::to_value(profile)?)
        .bind(profile.overall_score as i16)
        .bind(profile.completeness as i16)
        .bind(json!({
            "agents_used": profile.agents_used,
            "elapsed_ms": profile.elapsed_ms,
            "generated_at": profile.generated_at,
        }))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DurableQueue for DbHandle {
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), Error> {
        debug!(job_id = %payload.job_id(), "Enqueueing job message");
        sqlx::query("INSERT INTO profiling_queue (job_id, payload) VALUES ($1, $2)")
            .bind(payload.job_id())
            .bind(serde_json::to_value(payload)?)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
