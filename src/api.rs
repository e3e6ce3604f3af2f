//! HTTP surface: job submission, status polling, plan introspection.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{DurableQueue, JobStore};
use crate::fallback::FallbackExecutor;
use crate::orchestrator::{OrchestrationPlan, Orchestrator};
use crate::ratelimit::{client_identifier, RateLimitProfile, RateLimiter};
use crate::{JobPayload, JobStatus, ProfilingTarget};

/// Everything the handlers need, cloned per request.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DurableQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub limiter: Arc<RateLimiter>,
    pub fallback: Arc<FallbackExecutor>,
    pub submit_limit: RateLimitProfile,
    pub poll_limit: RateLimitProfile,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("rate limit exceeded")]
    RateLimited {
        reset_at: DateTime<Utc>,
        retry_after_secs: i64,
    },

    #[error("job not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            ApiError::RateLimited {
                reset_at,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "rate limit exceeded",
                    "reset_at": reset_at,
                    "retry_after_secs": retry_after_secs,
                }),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "job not found" })),
            ApiError::Internal(err) => {
                // Internals stay in the logs, never in the response body.
                error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: i16,
    pub current_phase: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/profiling/jobs", post(submit_job))
        .route("/api/profiling/jobs/:id", get(job_status))
        .route("/api/profiling/plan", get(orchestration_plan))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn serve(
    ctx: AppContext,
    addr: SocketAddr,
    cancel_token: CancellationToken,
) -> Result<(), anyhow::Error> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await?;

    info!("API stopped.");
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn submit_job(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(mut target): Json<ProfilingTarget>,
) -> Result<Json<SubmitResponse>, ApiError> {
    enforce_limit(&ctx.limiter, &headers, ctx.submit_limit)?;
    validate_target(&target)?;

    if target.id.is_none() {
        target.id = Some(Uuid::new_v4().to_string());
    }

    let job_id = ctx.store.create_job(&target).await?;

    let payload = JobPayload::ProfilingV1 {
        job_id,
        target: target.clone(),
    };

    if let Err(err) = ctx.queue.enqueue(&payload).await {
        // A compensating path exists, so this is a warning, not an error.
        warn!(job_id = %job_id, error = %err, "Enqueue failed, handing job to the fallback executor");
        ctx.fallback.spawn(job_id, target);
    }

    Ok(Json(SubmitResponse { job_id }))
}

async fn job_status(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    enforce_limit(&ctx.limiter, &headers, ctx.poll_limit)?;

    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::Validation("malformed job id".to_string()))?;

    let job = ctx.store.get_job(id).await?.ok_or(ApiError::NotFound)?;

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status,
        progress: job.progress,
        current_phase: job.current_phase,
        result: job.result,
        error: job.error,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
    }))
}

async fn orchestration_plan(State(ctx): State<AppContext>) -> Json<OrchestrationPlan> {
    Json(ctx.orchestrator.plan())
}

fn enforce_limit(
    limiter: &RateLimiter,
    headers: &HeaderMap,
    profile: RateLimitProfile,
) -> Result<(), ApiError> {
    let identifier = client_identifier(headers);
    let decision = limiter.check(&identifier, profile);

    if !decision.allowed {
        return Err(ApiError::RateLimited {
            reset_at: decision.reset_at,
            retry_after_secs: (decision.reset_at - Utc::now()).num_seconds().max(0),
        });
    }

    Ok(())
}

fn validate_target(target: &ProfilingTarget) -> Result<(), ApiError> {
    if target.nome.trim().is_empty() {
        return Err(ApiError::Validation("nome is required".to_string()));
    }
    if target.cognome.trim().is_empty() {
        return Err(ApiError::Validation("cognome is required".to_string()));
    }
    if !target.consenso_profilazione {
        return Err(ApiError::Validation(
            "profiling requires explicit consent (consenso_profilazione)".to_string(),
        ));
    }
    if target.data_consenso.is_none() {
        return Err(ApiError::Validation(
            "data_consenso is required when consent is granted".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        CollectingQueue, CountingAgent, MemoryArchive, MemoryJobStore, RejectingQueue,
        StaticAgent,
    };
    use crate::worker::WorkerContext;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn target() -> ProfilingTarget {
        ProfilingTarget {
            id: None,
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

    fn context(
        queue: Arc<dyn DurableQueue>,
        agents: Vec<Arc<dyn crate::agents::Agent>>,
    ) -> (AppContext, Arc<MemoryJobStore>, Arc<MemoryArchive>) {
        let store = Arc::new(MemoryJobStore::new());
        let archive = Arc::new(MemoryArchive::new());
        let orchestrator = Arc::new(Orchestrator::new(agents, Duration::from_secs(5)));
        let worker_ctx = WorkerContext {
            store: store.clone(),
            archive: archive.clone(),
            orchestrator: orchestrator.clone(),
        };

        let ctx = AppContext {
            store: store.clone(),
            queue,
            orchestrator,
            limiter: Arc::new(RateLimiter::new()),
            fallback: Arc::new(FallbackExecutor::new(worker_ctx, 2)),
            submit_limit: RateLimitProfile::strict(),
            poll_limit: RateLimitProfile::lenient(),
        };

        (ctx, store, archive)
    }

    #[tokio::test]
    async fn submission_enqueues_and_leaves_job_pending() {
        let queue = Arc::new(CollectingQueue::new());
        let (ctx, store, _) = context(queue.clone(), vec![]);

        let response = submit_job(State(ctx), HeaderMap::new(), Json(target()))
            .await
            .unwrap();
        let job_id = response.0.job_id;

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let messages = queue.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].job_id(), job_id);
    }

    #[tokio::test]
    async fn submission_without_consent_is_rejected_before_any_work() {
        let agent = Arc::new(CountingAgent::new("identity"));
        let queue = Arc::new(CollectingQueue::new());
        let (ctx, _, _) = context(queue.clone(), vec![agent.clone()]);

        let mut no_consent = target();
        no_consent.consenso_profilazione = false;

        let result = submit_job(State(ctx), HeaderMap::new(), Json(no_consent)).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
        assert!(queue.messages().is_empty());
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn missing_consent_date_is_rejected() {
        let (ctx, _, _) = context(Arc::new(CollectingQueue::new()), vec![]);

        let mut no_date = target();
        no_date.data_consenso = None;

        let result = submit_job(State(ctx), HeaderMap::new(), Json(no_date)).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn submissions_hit_the_strict_limit() {
        let (mut ctx, _, _) = context(Arc::new(CollectingQueue::new()), vec![]);
        ctx.submit_limit = RateLimitProfile {
            max_requests: 1,
            window_ms: 60_000,
        };

        submit_job(State(ctx.clone()), HeaderMap::new(), Json(target()))
            .await
            .unwrap();

        let denied = submit_job(State(ctx), HeaderMap::new(), Json(target())).await;
        assert!(matches!(denied, Err(ApiError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn enqueue_failure_falls_back_and_still_reaches_terminal_state() {
        let (ctx, store, archive) = context(
            Arc::new(RejectingQueue),
            vec![Arc::new(StaticAgent::new("identity", 80))],
        );

        let response = submit_job(State(ctx), HeaderMap::new(), Json(target()))
            .await
            .unwrap();
        let job_id = response.0.job_id;

        let mut status = JobStatus::Pending;
        for _ in 0..200 {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            status = job.status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(archive.len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_id_is_not_found_and_garbage_is_rejected() {
        let (ctx, _, _) = context(Arc::new(CollectingQueue::new()), vec![]);

        let missing = job_status(
            State(ctx.clone()),
            HeaderMap::new(),
            Path(Uuid::new_v4().to_string()),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound)));

        let garbage = job_status(State(ctx), HeaderMap::new(), Path("not-a-uuid".into())).await;
        assert!(matches!(garbage, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn plan_endpoint_makes_no_agent_calls() {
        let agent = Arc::new(CountingAgent::new("identity"));
        let (ctx, _, _) = context(Arc::new(CollectingQueue::new()), vec![agent.clone()]);

        let plan = orchestration_plan(State(ctx)).await;
        assert_eq!(plan.0.steps.len(), 1);
        assert_eq!(agent.calls(), 0);
    }
}
