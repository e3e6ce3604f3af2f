use async_channel::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::db::{JobStore, ProfileArchive};
use crate::orchestrator::Orchestrator;
use crate::{JobPayload, ProfilingTarget, ProgressUpdate, QueueMessage};

/// Worker -> dispatcher notifications.
#[derive(Debug)]
pub enum WorkMessage {
    MessageDone {
        message_id: i64,
    },
    MessageDead {
        message_id: i64,
        job_id: Uuid,
        reason: String,
    },
}

/// Everything a worker slot needs to turn a message into job transitions.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub archive: Arc<dyn ProfileArchive>,
    pub orchestrator: Arc<Orchestrator>,
}

pub async fn start(
    ctx: WorkerContext,
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<QueueMessage>,
    send_to_dispatcher: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            message = recv_from_queue.recv() => {
                match message {
                    Err(err) => {
                        error!(message = "Error receiving message by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(message) => {
                        let message_id = message.id;
                        // In case when we can't send a response, there is no
                        // one left to notify, so just panic.
                        match serde_json::from_value::<JobPayload>(message.payload.clone()) {
                            Err(err) => {
                                send_to_dispatcher.send(WorkMessage::MessageDead {
                                    message_id,
                                    job_id: message.job_id,
                                    reason: format!("unrecognized job payload: {err}"),
                                }).unwrap();
                            },
                            Ok(JobPayload::ProfilingV1 { job_id, target }) => {
                                execute_job(&ctx, job_id, &target).await;
                                send_to_dispatcher.send(WorkMessage::MessageDone { message_id }).unwrap();
                            }
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

/// Runs one job to a terminal state. Shared by the queue worker and the
/// fallback executor, so both paths are indistinguishable to a polling
/// client. Errors never escape: a failed job ends up recorded as FAILED and
/// cannot take the worker slot (or sibling jobs) down with it.
#[instrument(skip_all, fields(job_id = %job_id))]
pub async fn execute_job(ctx: &WorkerContext, job_id: Uuid, target: &ProfilingTarget) {
    if let Err(err) = ctx.store.start_job(job_id).await {
        // Leaving the job pending lets a redelivery retry it later.
        error!(error = %err, "Could not mark job processing, leaving it pending");
        return;
    }

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let progress_writer = {
        let store = ctx.store.clone();
        tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                if let Err(err) = store.set_progress(job_id, update.progress, &update.phase).await {
                    warn!(error = %err, "Progress update failed");
                }
            }
        })
    };

    let outcome = ctx
        .orchestrator
        .profile_target(target, Some(progress_tx))
        .await;

    // The sender is gone once the orchestrator returns; drain before writing
    // the terminal state so no stale progress lands afterwards.
    if let Err(err) = progress_writer.await {
        warn!(error = %err, "Progress writer aborted");
    }

    match outcome {
        Ok(profile) => {
            if let Err(err) = ctx.archive.upsert(&profile).await {
                // The job record still carries the result; the archive copy
                // is caught up on the next re-profiling of this target.
                warn!(error = %err, "Archiving profile failed");
            }
            if let Err(err) = ctx.store.complete_job(job_id, &profile).await {
                error!(error = %err, "Completed job could not be recorded, job may stay processing");
            } else {
                info!(
                    completeness = profile.completeness,
                    score = profile.overall_score,
                    "Job completed"
                );
            }
        }
        Err(err) => {
            warn!(error = %err, "Job failed");
            if let Err(store_err) = ctx.store.fail_job(job_id, &err.to_string()).await {
                error!(error = %store_err, "Failed job could not be recorded, job may stay processing");
            }
        }
    }
}
