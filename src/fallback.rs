//! Best-effort in-process execution for jobs whose durable enqueue failed.
//!
//! The submission handler still returns a job_id immediately; the work runs
//! detached from the request on a bounded pool, through the exact same
//! `execute_job` path as the queue workers. What is lost relative to the
//! queue path is only redelivery: if this process dies mid-run, the job
//! stays processing.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::worker::{execute_job, WorkerContext};
use crate::ProfilingTarget;

pub struct FallbackExecutor {
    ctx: WorkerContext,
    permits: Arc<Semaphore>,
}

impl FallbackExecutor {
    /// `max_concurrent` bounds how many fallback orchestrations may run in
    /// the request-handling process at once; excess submissions wait for a
    /// permit instead of piling up unbounded.
    pub fn new(ctx: WorkerContext, max_concurrent: usize) -> Self {
        FallbackExecutor {
            ctx,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Fire-and-forget: the caller's HTTP response does not wait on this.
    pub fn spawn(&self, job_id: Uuid, target: ProfilingTarget) {
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();

        tokio::spawn(
            async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    // Closed only at shutdown; the job stays pending.
                    Err(_) => return,
                };
                debug!("Running job on the fallback executor");
                execute_job(&ctx, job_id, &target).await;
            }
            .instrument(info_span!("fallback", job_id = %job_id)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStore;
    use crate::orchestrator::Orchestrator;
    use crate::testing::{MemoryArchive, MemoryJobStore, SlowAgent, StaticAgent};
    use crate::JobStatus;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn target() -> ProfilingTarget {
        ProfilingTarget {
            id: Some("t-1".into()),
            nome: "Mario".into(),
            cognome: "Draghi".into(),
            email: None,
            telefono: None,
            citta: None,
            professione: None,
            note: None,
            consenso_profilazione: true,
            data_consenso: Some(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()),
        }
    }

    fn context(agents: Vec<Arc<dyn crate::agents::Agent>>) -> (WorkerContext, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let ctx = WorkerContext {
            store: store.clone(),
            archive: Arc::new(MemoryArchive::new()),
            orchestrator: Arc::new(Orchestrator::new(agents, Duration::from_secs(5))),
        };
        (ctx, store)
    }

    async fn wait_terminal(store: &MemoryJobStore, id: Uuid) -> JobStatus {
        for _ in 0..200 {
            let job = store.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn detached_execution_reaches_terminal_state() {
        let (ctx, store) = context(vec![Arc::new(StaticAgent::new("identity", 80))]);
        let executor = FallbackExecutor::new(ctx, 2);

        let id = store.create_job(&target()).await.unwrap();
        executor.spawn(id, target());

        assert_eq!(wait_terminal(&store, id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn pool_bound_queues_rather_than_drops() {
        let (ctx, store) =
            context(vec![Arc::new(SlowAgent::new("identity", Duration::from_millis(50)))]);
        let executor = FallbackExecutor::new(ctx, 1);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = store.create_job(&target()).await.unwrap();
            executor.spawn(id, target());
            ids.push(id);
        }

        for id in ids {
            assert_eq!(wait_terminal(&store, id).await, JobStatus::Completed);
        }
    }
}
