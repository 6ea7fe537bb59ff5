//! Background reconciliation jobs.
//!
//! Mutations on the orchestrator return once a job is queued. The queue
//! keeps at most one job per tenant (a newer job supersedes the running
//! one), bounds how many jobs touch the platform at once, and gives each
//! job a deadline. The outcome goes to the job's `finish` callback, which
//! records it as the tenant's deployment status.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

struct Slot {
    id: u64,
    operation: &'static str,
    handle: AbortHandle,
}

struct Shared {
    permits: Semaphore,
    job_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    idle: Notify,
}

impl Shared {
    fn release(&self, tenant_id: &str, id: u64) {
        let mut slots = self.slots.lock().expect("slots lock");
        if slots.get(tenant_id).is_some_and(|s| s.id == id) {
            slots.remove(tenant_id);
        }
        if slots.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded, per-tenant-exclusive job runner.
#[derive(Clone)]
pub struct ReconcileQueue {
    shared: Arc<Shared>,
}

impl ReconcileQueue {
    pub fn new(max_concurrent: usize, job_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                permits: Semaphore::new(max_concurrent.max(1)),
                job_timeout,
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue `work` for `tenant_id`, aborting any job still running for it.
    ///
    /// `finish` receives the outcome: the work's own result, or
    /// [`OrchestratorError::Timeout`] when it overran the deadline. It is
    /// not called for a job that was superseded or aborted by shutdown.
    pub fn submit<W, F, FF>(
        &self,
        tenant_id: &str,
        operation: &'static str,
        work: W,
        finish: F,
    ) -> OrchestratorResult<()>
    where
        W: Future<Output = OrchestratorResult<()>> + Send + 'static,
        F: FnOnce(OrchestratorResult<()>) -> FF + Send + 'static,
        FF: Future<Output = ()> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let tenant = tenant_id.to_string();

        // Held across spawn so the job cannot release its slot before it is recorded.
        let mut slots = self.shared.slots.lock().expect("slots lock");
        let handle = tokio::spawn(async move {
            let outcome = match shared.permits.acquire().await {
                Ok(_permit) => {
                    debug!(tenant_id = %tenant, operation, job = id, "job started");
                    match timeout(shared.job_timeout, work).await {
                        Ok(result) => result,
                        Err(_) => Err(OrchestratorError::Timeout {
                            operation: operation.to_string(),
                            seconds: shared.job_timeout.as_secs(),
                        }),
                    }
                }
                Err(_) => Err(OrchestratorError::ShuttingDown),
            };
            match &outcome {
                Ok(()) => debug!(tenant_id = %tenant, operation, job = id, "job finished"),
                Err(e) => warn!(tenant_id = %tenant, operation, job = id, error = %e, "job failed"),
            }
            finish(outcome).await;
            shared.release(&tenant, id);
        });

        let slot = Slot {
            id,
            operation,
            handle: handle.abort_handle(),
        };
        if let Some(previous) = slots.insert(tenant_id.to_string(), slot) {
            previous.handle.abort();
            info!(
                tenant_id = %tenant_id,
                superseded = previous.operation,
                by = operation,
                "superseding running job"
            );
        }
        Ok(())
    }

    /// Whether a job is queued or running for `tenant_id`.
    pub fn is_active(&self, tenant_id: &str) -> bool {
        self.shared
            .slots
            .lock()
            .expect("slots lock")
            .contains_key(tenant_id)
    }

    pub fn active_count(&self) -> usize {
        self.shared.slots.lock().expect("slots lock").len()
    }

    /// Wait until no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Abort every job and refuse new ones.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.permits.close();
        let mut slots = self.shared.slots.lock().expect("slots lock");
        let aborted = slots.len();
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
        drop(slots);
        self.shared.idle.notify_waiters();
        if aborted > 0 {
            info!(aborted, "reconcile queue shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn recorder() -> (
        mpsc::UnboundedSender<OrchestratorResult<()>>,
        mpsc::UnboundedReceiver<OrchestratorResult<()>>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn job_outcome_reaches_finish() {
        let queue = ReconcileQueue::new(2, Duration::from_secs(5));
        let (tx, mut rx) = recorder();

        queue
            .submit("acme", "deploy", async { Ok(()) }, move |r| async move {
                let _ = tx.send(r);
            })
            .unwrap();

        assert!(rx.recv().await.unwrap().is_ok());
        queue.wait_idle().await;
        assert!(!queue.is_active("acme"));
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_job_times_out() {
        let queue = ReconcileQueue::new(1, Duration::from_secs(2));
        let (tx, mut rx) = recorder();

        queue
            .submit(
                "acme",
                "deploy",
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                move |r| async move {
                    let _ = tx.send(r);
                },
            )
            .unwrap();

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome, Err(OrchestratorError::Timeout { seconds: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_job_supersedes_older() {
        let queue = ReconcileQueue::new(4, Duration::from_secs(600));
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

        let first = tx.clone();
        queue
            .submit(
                "acme",
                "deploy",
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                move |_| async move {
                    let _ = first.send("deploy");
                },
            )
            .unwrap();
        tokio::task::yield_now().await;

        queue
            .submit("acme", "remove", async { Ok(()) }, move |_| async move {
                let _ = tx.send("remove");
            })
            .unwrap();

        assert_eq!(rx.recv().await, Some("remove"));
        queue.wait_idle().await;
        // The superseded job's sender is dropped with its task.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let queue = ReconcileQueue::new(2, Duration::from_secs(600));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            queue
                .submit(
                    &format!("tenant-{i}"),
                    "update",
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    |_| async {},
                )
                .unwrap();
        }

        queue.wait_idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_and_refuses() {
        let queue = ReconcileQueue::new(1, Duration::from_secs(600));
        queue
            .submit(
                "acme",
                "deploy",
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                |_| async {},
            )
            .unwrap();
        assert!(queue.is_active("acme"));

        queue.shutdown();
        assert_eq!(queue.active_count(), 0);
        let err = queue
            .submit("acme", "deploy", async { Ok(()) }, |_| async {})
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ShuttingDown));
    }
}
