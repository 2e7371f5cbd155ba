//! Concurrency scheduler: admits triggers and feeds runs to a worker pool.
//!
//! `submit` is the synchronous, fast half. It reserves a queue slot, asks
//! the guard for an atomic admission and enqueues the new run, all before
//! any stage executes. Workers pull runs in FIFO order and drive each one
//! inside its own task, so a panic or ledger error in one run cannot take
//! down the worker or the intake path.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::controller::PipelineController;
use super::guard::LoopGuard;
use super::ledger::{FailureInfo, RunLedger, RunPatch};
use super::models::{Admission, RejectReason, Run, RunState, Trigger};
use crate::errors::WatchmanError;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Runs executing concurrently.
    pub workers: usize,
    /// Admitted runs waiting for a worker before `Backpressure`.
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 100,
        }
    }
}

/// Immediate acknowledgement returned to the trigger source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted { run_id: i64 },
    Rejected { reason: RejectReason },
    /// Queue full (or shutting down). No run was created.
    Backpressure,
}

pub struct Scheduler {
    guard: LoopGuard,
    sender: std::sync::Mutex<Option<mpsc::Sender<Run>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker pool. Must be called from within a tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        guard: LoopGuard,
        controller: Arc<PipelineController>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Run>(config.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let controller = Arc::clone(&controller);
                tokio::spawn(worker_loop(worker_id, rx, controller))
            })
            .collect();

        tracing::info!(
            workers = config.workers.max(1),
            queue_depth = config.queue_depth.max(1),
            "scheduler started"
        );

        Self {
            guard,
            sender: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(workers),
        }
    }

    pub async fn submit(&self, trigger: Trigger) -> Result<SubmitOutcome, WatchmanError> {
        // Prefix rules never create a run, so they are answered even under load.
        if self.guard.check_self_generated(&trigger).is_some() {
            return match self.guard.admit(&trigger).await? {
                Admission::Rejected(reason) => Ok(SubmitOutcome::Rejected { reason }),
                Admission::Accepted(run) => Ok(SubmitOutcome::Accepted { run_id: run.id }),
            };
        }

        let sender = {
            let guard = self.sender.lock().map_err(|_| WatchmanError::LockPoisoned)?;
            guard.as_ref().cloned()
        };
        let Some(sender) = sender else {
            return self.overflow(&trigger).await;
        };

        // Reserve the slot before admission so a full queue never leaves an
        // admitted run without a worker.
        let Ok(permit) = sender.try_reserve() else {
            return self.overflow(&trigger).await;
        };

        match self.guard.admit(&trigger).await? {
            Admission::Accepted(run) => {
                let run_id = run.id;
                permit.send(run);
                Ok(SubmitOutcome::Accepted { run_id })
            }
            Admission::Rejected(reason) => Ok(SubmitOutcome::Rejected { reason }),
        }
    }

    /// No queue slot: a trigger the guard would reject anyway keeps its
    /// rejection reason, anything else is backpressure.
    async fn overflow(&self, trigger: &Trigger) -> Result<SubmitOutcome, WatchmanError> {
        if let Some(reason) = self.guard.known_rejection(trigger).await? {
            return Ok(SubmitOutcome::Rejected { reason });
        }
        tracing::warn!(repo = %trigger.repo, commit = %trigger.commit_sha, "no queue slot, answering backpressure");
        Ok(SubmitOutcome::Backpressure)
    }

    /// Stop accepting triggers, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => e.into_inner().take(),
        };
        drop(sender);

        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(e) => e.into_inner().drain(..).collect(),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Run>>>,
    controller: Arc<PipelineController>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(run) = next else {
            tracing::debug!(worker_id, "queue closed, worker exiting");
            break;
        };
        run_isolated(worker_id, Arc::clone(&controller), run).await;
    }
}

async fn run_isolated(worker_id: usize, controller: Arc<PipelineController>, run: Run) {
    let run_id = run.id;
    let ledger = controller.ledger().clone();
    // Time spent queued does not count against the lease.
    if let Err(e) = ledger.renew_lease(run_id).await {
        tracing::warn!(worker_id, run_id, error = %e, "could not renew lease at pickup");
    }
    let handle = tokio::spawn(async move { controller.drive(run).await });

    match handle.await {
        Ok(Ok(run)) => {
            tracing::debug!(worker_id, run_id, state = %run.state, "run finished");
        }
        Ok(Err(e)) => {
            tracing::error!(worker_id, run_id, error = %e, "run aborted by ledger error");
            mark_failed(&ledger, run_id, "internal_error", &e.to_string()).await;
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "Run panicked".to_string()
            } else {
                format!("Run task cancelled: {}", join_err)
            };
            tracing::error!(worker_id, run_id, error = %join_err, "run task crashed");
            mark_failed(&ledger, run_id, "panic", &message).await;
        }
    }
}

/// Best-effort move to `failed` for a run whose driver died mid-flight.
async fn mark_failed(ledger: &RunLedger, run_id: i64, kind: &str, message: &str) {
    match ledger.get(run_id).await {
        Ok(Some(run)) if run.state.is_terminal() => {}
        Ok(None) => tracing::error!(run_id, "crashed run vanished from the ledger"),
        Ok(Some(_)) => {
            let patch = RunPatch {
                failure: Some(FailureInfo {
                    stage: None,
                    kind: kind.to_string(),
                    message: message.to_string(),
                }),
                ..Default::default()
            };
            if let Err(e) = ledger.transition(run_id, RunState::Failed, patch).await {
                tracing::error!(run_id, error = %e, "could not mark crashed run as failed");
            }
        }
        Err(e) => tracing::error!(run_id, error = %e, "could not load crashed run"),
    }
}
