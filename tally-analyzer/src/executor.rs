//! Asynchronous work executor for report generation.
//!
//! Callers enqueue *dependency chains* of report ids; a single worker task
//! eventually generates each report by delegating to [`ReportGenerator`].
//! Reports within a chain run strictly in the submitted order and iteration
//! stops at the first failure: the remaining reports of a failed chain are
//! put into the `TERMINATED` state with a diagnostic. Chains are serviced
//! FIFO. The executor records outcomes in the report store; querying the
//! store is how callers learn the fate of an enqueued report.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tally_wire::report::{ReportId, ReportState};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::ReportError;
use crate::generator::ReportGenerator;
use crate::store::ReportStore;

/// Enqueues are refused once the queue holds this many chains.
const MAX_QUEUE_SIZE: usize = 50_000;

pub struct ReportExecutor {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    report_store: Arc<ReportStore>,
    report_generator: ReportGenerator,
    queue: Mutex<QueueState>,
    /// Wakes the worker after an enqueue or at shutdown.
    worker_notifier: Notify,
    /// Broadcasts the worker's idleness to `wait_until_idle` callers.
    idle: watch::Sender<bool>,
}

struct QueueState {
    chains: VecDeque<Vec<ReportId>>,
    shut_down: bool,
}

impl ReportExecutor {
    pub fn new(report_store: Arc<ReportStore>, report_generator: ReportGenerator) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                report_store,
                report_generator,
                queue: Mutex::new(QueueState {
                    chains: VecDeque::new(),
                    shut_down: false,
                }),
                worker_notifier: Notify::new(),
                idle,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker task. Must be invoked exactly once; call
    /// [`shutdown`] to stop it.
    ///
    /// [`shutdown`]: ReportExecutor::shutdown
    pub fn start(&self) {
        // The worker flips this back to true once it finds the queue empty.
        self.inner.idle.send_replace(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run().await });
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
    }

    /// Enqueues a dependency chain of report ids.
    ///
    /// Every id must be complete (allocated by the report store). Rejects
    /// empty chains with `InvalidArgument` and both a full queue and a
    /// shutting-down executor with `Aborted`.
    pub fn enqueue(&self, report_id_chain: Vec<ReportId>) -> Result<(), ReportError> {
        if report_id_chain.is_empty() {
            error!("report_id_chain is empty");
            return Err(ReportError::InvalidArgument(
                "report_id_chain is empty".to_string(),
            ));
        }
        for report_id in &report_id_chain {
            // Incomplete ids were never registered with the report store;
            // the worker could not even record their failure.
            if !report_id.is_complete() {
                let message = format!("not a complete report id: {report_id}");
                error!("{message}");
                return Err(ReportError::InvalidArgument(message));
            }
        }

        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if queue.shut_down {
                error!("shutting down, not enqueuing");
                return Err(ReportError::Aborted(
                    "shutting down, not enqueuing".to_string(),
                ));
            }
            if queue.chains.len() >= MAX_QUEUE_SIZE {
                error!("work queue too long");
                return Err(ReportError::Aborted(
                    "cannot enqueue reports: queue too long".to_string(),
                ));
            }
            queue.chains.push_back(report_id_chain);
            // Anyone calling wait_until_idle after this point must wait for
            // the chain just enqueued.
            self.inner.idle.send_replace(false);
        }
        self.inner.worker_notifier.notify_one();
        Ok(())
    }

    /// Blocks until the queue is empty and the worker is waiting for new
    /// work. Returns immediately if the worker was never started.
    pub async fn wait_until_idle(&self) {
        let mut receiver = self.inner.idle.subscribe();
        // An error means the executor is being torn down, which is as idle
        // as it gets.
        let _ = receiver.wait_for(|idle| *idle).await;
    }

    /// Stops the worker after the chain it is currently processing, then
    /// waits for it to exit.
    pub async fn shutdown(&self) {
        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.shut_down = true;
        }
        self.inner.worker_notifier.notify_one();
        let handle = self
            .worker
            .lock()
            .ok()
            .and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        while let Some(chain) = self.wait_and_take_first().await {
            self.process_dependency_chain(&chain).await;
        }
    }

    /// Waits until the queue is non-empty or shutdown was requested. Pops
    /// and returns the head chain, or `None` at shutdown.
    async fn wait_and_take_first(&self) -> Option<Vec<ReportId>> {
        loop {
            {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if queue.shut_down {
                    return None;
                }
                if let Some(chain) = queue.chains.pop_front() {
                    return Some(chain);
                }
                self.idle.send_replace(true);
            }
            self.worker_notifier.notified().await;
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.queue
            .lock()
            .map(|queue| queue.shut_down)
            .unwrap_or(true)
    }

    async fn process_dependency_chain(&self, chain: &[ReportId]) {
        let mut chain_failed = false;
        for report_id in chain {
            // Cooperative cancellation at id boundaries, never mid-report.
            if self.is_shutting_down() {
                info!("shutting down, abandoning the current dependency chain");
                return;
            }
            if chain_failed {
                let message = format!(
                    "skipping report generation for report_id={report_id} because an earlier \
                     report in its dependency chain failed"
                );
                error!("{message}");
                self.end_report(report_id, false, message).await;
            } else {
                chain_failed = !self.process_report_id(report_id).await;
            }
        }
    }

    /// Drives one report through generation, transitioning its state as it
    /// goes. Returns false on any failure.
    async fn process_report_id(&self, report_id: &ReportId) -> bool {
        let metadata = match self.report_store.get_metadata(report_id).await {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(%report_id, "get_metadata failed: {err}");
                self.end_report(
                    report_id,
                    false,
                    "unable to fetch metadata for report".to_string(),
                )
                .await;
                return false;
            }
        };

        match metadata.state {
            ReportState::WaitingToStart => {
                if let Err(err) = self.report_store.start_dependent_report(report_id).await {
                    error!(%report_id, "start_dependent_report failed: {err}");
                    self.end_report(
                        report_id,
                        false,
                        "unable to start dependent report".to_string(),
                    )
                    .await;
                    return false;
                }
            }
            ReportState::InProgress => {}
            state => {
                // Already terminal; finding such a report in a chain is a
                // scheduler or executor bug.
                error!(%report_id, ?state, "unexpected report state in dependency chain");
                return false;
            }
        }

        let result = self.report_generator.generate_report(report_id).await;
        let (success, message) = match &result {
            Ok(()) => (true, String::new()),
            Err(err) => (false, err.to_string()),
        };
        self.end_report(report_id, success, message).await && success
    }

    async fn end_report(&self, report_id: &ReportId, success: bool, message: String) -> bool {
        if let Err(err) = self.report_store.end_report(report_id, success, message).await {
            error!(%report_id, "end_report failed: {err}");
            return false;
        }
        true
    }
}

/// Last-resort cleanup; the graceful path is [`ReportExecutor::shutdown`].
impl Drop for ReportExecutor {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.shut_down = true;
        }
        self.inner.worker_notifier.notify_one();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
    }
}
