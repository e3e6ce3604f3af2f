//! The durable-queue dispatcher: claims queued messages from Postgres and
//! fans them out to a pool of worker slots.

use anyhow::Error;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::db::{DbHandle, JobStore};
use crate::worker::{self, WorkMessage, WorkerContext};
use crate::QueueMessage;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker slots pulling from the queue in parallel.
    pub workers: u16,
    /// How often to look for new messages when idle.
    pub poll_interval: Duration,
    /// Claims beyond this many mean the message keeps killing its worker;
    /// it is dead-lettered instead of redelivered again.
    pub max_attempts: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            workers: 3,
            poll_interval: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    handle: DbHandle,
    ctx: WorkerContext,
    config: DispatcherConfig,
) -> Result<(), Error> {
    let (send_to_dispatcher, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_pool, recv_from_pool) =
        async_channel::bounded::<QueueMessage>(config.workers as usize);

    let mut workers = vec![];
    for _ in 0..config.workers {
        let ctx = ctx.clone();
        let send_to_dispatcher = send_to_dispatcher.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_pool = recv_from_pool.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(ctx, cancel_token, recv_from_pool, send_to_dispatcher).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = i64::from(config.workers);

    // Messages locked by a crashed run get redelivered.
    handle.reset_locked_messages().await?;

    let mut poll = tokio::time::interval(config.poll_interval);

    loop {
        if free_workers > 0 {
            let messages = handle.claim_messages(free_workers).await?;
            for message in messages {
                if message.attempts > config.max_attempts {
                    warn!(
                        message_id = message.id,
                        job_id = %message.job_id,
                        attempts = message.attempts,
                        "Message exceeded max attempts, dead-lettering"
                    );
                    handle.mark_message_dead(message.id).await?;
                    ctx.store
                        .fail_job(message.job_id, "profiling retries exhausted")
                        .await?;
                    continue;
                }
                send_to_pool.send(message).await?;
                free_workers -= 1;
            }
        }

        // Waiting for something else to happen to continue...
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Dispatcher Cancelled");
                break;
            },
            // Look for new work even if no worker reports back
            _ = poll.tick() => {},
            // Handle responses from workers
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::MessageDone { message_id }) => {
                        debug!(message = "Message handled", message_id);
                        free_workers += 1;
                        if let Err(err) = handle.delete_message(message_id).await {
                            // The job outcome is already recorded; a leftover
                            // LOCKED row is requeued on the next restart and
                            // bounced off the terminal-state guards.
                            error!(message = "Failed to delete handled message", error = ?err);
                        }
                    },
                    Some(WorkMessage::MessageDead { message_id, job_id, reason }) => {
                        warn!(message = "Message dead-lettered", message_id, job_id = %job_id, reason = %reason);
                        free_workers += 1;
                        if let Err(err) = handle.mark_message_dead(message_id).await {
                            error!(message = "Failed to dead-letter message", error = ?err);
                        }
                        if let Err(err) = ctx.store.fail_job(job_id, &reason).await {
                            error!(message = "Failed to record job failure", error = ?err);
                        }
                    },
                }
            },
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Dispatcher stopped.");

    Ok(())
}
