//! Worker pool around a shared [`VerificationEngine`].
//!
//! N named OS threads pull requests from one bounded channel and answer over
//! oneshot channels. The engine is immutable; model instances serialise their
//! own inference, so independent requests run in parallel.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{ImageSource, VerificationEngine};
use crate::types::VerificationResult;

/// Queued requests allowed per worker before senders wait.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker pool has shut down")]
    ChannelClosed,
}

/// Messages sent from callers to the worker threads.
enum ServiceRequest {
    Verify {
        reference: ImageSource,
        probe: ImageSource,
        threshold: f32,
        reply: oneshot::Sender<VerificationResult>,
    },
    VerifyEnrolled {
        references: Vec<ImageSource>,
        probe: ImageSource,
        threshold: f32,
        reply: oneshot::Sender<VerificationResult>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ServiceRequest>,
    workers: usize,
    default_threshold: f32,
}

impl EngineHandle {
    /// Verify `probe` against one reference. `None` uses the engine's default threshold.
    pub async fn verify(
        &self,
        reference: ImageSource,
        probe: ImageSource,
        threshold: Option<f32>,
    ) -> Result<VerificationResult, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServiceRequest::Verify {
                reference,
                probe,
                threshold: threshold.unwrap_or(self.default_threshold),
                reply,
            })
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;
        rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    /// Verify `probe` against several references of the same person.
    pub async fn verify_enrolled(
        &self,
        references: Vec<ImageSource>,
        probe: ImageSource,
        threshold: Option<f32>,
    ) -> Result<VerificationResult, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServiceRequest::VerifyEnrolled {
                references,
                probe,
                threshold: threshold.unwrap_or(self.default_threshold),
                reply,
            })
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;
        rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Spawn `workers` threads sharing `engine`. Threads exit once every handle is dropped.
pub fn spawn_workers(engine: Arc<VerificationEngine>, workers: usize) -> Result<EngineHandle, ServiceError> {
    if workers == 0 {
        return Err(ServiceError::NoWorkers);
    }

    let (tx, rx) = mpsc::channel::<ServiceRequest>(workers * QUEUE_DEPTH_PER_WORKER);
    let rx = Arc::new(Mutex::new(rx));
    let default_threshold = engine.default_threshold();

    for i in 0..workers {
        let rx = Arc::clone(&rx);
        let engine = Arc::clone(&engine);
        std::thread::Builder::new()
            .name(format!("facegate-worker-{i}"))
            .spawn(move || {
                tracing::debug!(worker = i, "worker started");
                loop {
                    // Only one idle worker waits on the channel at a time.
                    let next = {
                        let mut guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        guard.blocking_recv()
                    };
                    let Some(request) = next else {
                        break;
                    };
                    handle(&engine, request);
                }
                tracing::debug!(worker = i, "worker exiting");
            })?;
    }

    tracing::info!(workers, "verification workers started");
    Ok(EngineHandle { tx, workers, default_threshold })
}

fn handle(engine: &VerificationEngine, request: ServiceRequest) {
    match request {
        ServiceRequest::Verify { reference, probe, threshold, reply } => {
            let result = engine.verify(&reference, &probe, threshold);
            let _ = reply.send(result);
        }
        ServiceRequest::VerifyEnrolled { references, probe, threshold, reply } => {
            let result = engine.verify_enrolled(&references, &probe, threshold);
            let _ = reply.send(result);
        }
    }
}
