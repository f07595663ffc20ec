//! Inbox job queue
//!
//! An in-process, at-least-once queue between the HTTP edge and the inbox
//! processor. A fixed pool of workers drains a bounded channel. Jobs that
//! fail with a retryable error are re-enqueued after an exponential backoff
//! until the attempt budget runs out. Jobs are not ordered relative to
//! each other.

use super::inbox::{DeliveryEnvelope, InboxOutcome, InboxProcessor};
use crate::config::QueueConfig;
use crate::error::{AppError, FederationError};
use crate::metrics::{INBOX_QUEUE_DEPTH, INBOX_QUEUE_RETRIES_TOTAL};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Consumer of queued deliveries
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: DeliveryEnvelope) -> Result<InboxOutcome, FederationError>;
}

#[async_trait]
impl DeliveryHandler for InboxProcessor {
    async fn handle(&self, envelope: DeliveryEnvelope) -> Result<InboxOutcome, FederationError> {
        self.process(envelope).await
    }
}

struct InboxJob {
    envelope: DeliveryEnvelope,
    attempt: u32,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before attempt `attempt + 1`
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Handle for enqueueing deliveries
#[derive(Clone)]
pub struct InboxQueue {
    sender: mpsc::Sender<InboxJob>,
}

impl InboxQueue {
    /// Create the channel and spawn `config.workers` workers
    pub fn start(handler: Arc<dyn DeliveryHandler>, config: &QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let policy = RetryPolicy::from_config(config);

        for worker_id in 0..config.workers.max(1) {
            tokio::spawn(run_worker(
                worker_id,
                receiver.clone(),
                sender.downgrade(),
                handler.clone(),
                policy,
            ));
        }

        tracing::info!(
            workers = config.workers,
            capacity = config.capacity,
            max_attempts = policy.max_attempts,
            "Inbox queue started"
        );

        Self { sender }
    }

    /// Queue a delivery, waiting for room when the channel is full
    pub async fn enqueue(&self, envelope: DeliveryEnvelope) -> Result<(), AppError> {
        self.sender
            .send(InboxJob {
                envelope,
                attempt: 1,
            })
            .await
            .map_err(|_| AppError::Unavailable("inbox queue is closed".to_string()))?;
        INBOX_QUEUE_DEPTH.inc();
        Ok(())
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<InboxJob>>>,
    retry_sender: mpsc::WeakSender<InboxJob>,
    handler: Arc<dyn DeliveryHandler>,
    policy: RetryPolicy,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            tracing::debug!(worker_id, "Inbox queue closed, worker exiting");
            break;
        };
        INBOX_QUEUE_DEPTH.dec();

        let key_id = job.envelope.signature_params.key_id.clone();
        match handler.handle(job.envelope.clone()).await {
            Ok(outcome) => {
                tracing::debug!(worker_id, key_id = %key_id, ?outcome, "Inbox job finished");
            }
            Err(e) if e.is_retryable() && job.attempt < policy.max_attempts => {
                let delay = policy.backoff(job.attempt);
                tracing::warn!(
                    worker_id,
                    key_id = %key_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Inbox job failed, retrying"
                );
                INBOX_QUEUE_RETRIES_TOTAL.with_label_values(&["retry"]).inc();

                let Some(sender) = retry_sender.upgrade() else {
                    tracing::error!(key_id = %key_id, "Inbox queue closed before retry");
                    continue;
                };
                let retry = InboxJob {
                    envelope: job.envelope,
                    attempt: job.attempt + 1,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(retry).await.is_ok() {
                        INBOX_QUEUE_DEPTH.inc();
                    }
                });
            }
            Err(e) => {
                let result = if e.is_retryable() { "exhausted" } else { "permanent" };
                INBOX_QUEUE_RETRIES_TOTAL.with_label_values(&[result]).inc();
                tracing::error!(
                    worker_id,
                    key_id = %key_id,
                    attempt = job.attempt,
                    error = %e,
                    "Giving up on inbox job"
                );
            }
        }
    }
}
