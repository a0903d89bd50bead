// ── Task processor ──
//
// Bounded pool for slow, retryable bus reads. Tasks never touch the
// apartment; they report back by enqueuing a model event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::bus::BusQuery;
use crate::engine::EventQueue;
use crate::error::BusError;
use crate::event::{EventPayload, ModelEvent, ModelEventKind};
use crate::model::Dsuid;
use crate::scanner;

/// Work item for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Read one device again and merge it.
    DeviceRescan { node: Dsuid, bus_addr: u16 },
    /// Read a device's binary input configuration again.
    BinaryInputResync { node: Dsuid, bus_addr: u16 },
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Self::DeviceRescan { .. } => "device_rescan",
            Self::BinaryInputResync { .. } => "binary_input_resync",
        }
    }

    async fn run(self, bus: &dyn BusQuery) -> Result<ModelEvent, BusError> {
        match self {
            Self::DeviceRescan { node, bus_addr } => {
                let result = scanner::fetch_device(bus, node, bus_addr).await?;
                Ok(ModelEvent::new(ModelEventKind::ScanApplied)
                    .with_source(node)
                    .with_payload(EventPayload::Scan(Box::new(result))))
            }
            Self::BinaryInputResync { node, bus_addr } => {
                let (device, inputs) = scanner::fetch_binary_inputs(bus, node, bus_addr).await?;
                Ok(ModelEvent::new(ModelEventKind::BinaryInputsReady)
                    .with_source(node)
                    .with_payload(EventPayload::BinaryInputs { device, inputs }))
            }
        }
    }
}

pub struct TaskProcessor {
    bus: Arc<dyn BusQuery>,
    queue: Arc<EventQueue>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    retries: u32,
    retry_delay: Duration,
}

impl TaskProcessor {
    pub fn new(
        bus: Arc<dyn BusQuery>,
        queue: Arc<EventQueue>,
        workers: usize,
        retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            bus,
            queue,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            retries: retries.max(1),
            retry_delay,
        }
    }

    /// Queue a task. At most `workers` tasks talk to the bus at once.
    pub fn schedule(&self, task: Task) {
        if self.tracker.is_closed() {
            debug!(task = task.name(), "task processor closed, dropping task");
            return;
        }
        let bus = Arc::clone(&self.bus);
        let queue = Arc::clone(&self.queue);
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let (retries, retry_delay) = (self.retries, self.retry_delay);

        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            for attempt in 1..=retries {
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    result = task.run(bus.as_ref()) => result,
                };
                match result {
                    Ok(event) => {
                        queue.enqueue(event);
                        return;
                    }
                    Err(e) => {
                        warn!(task = task.name(), attempt, error = %e, "task attempt failed");
                    }
                }
                if attempt < retries {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
            warn!(task = task.name(), ?task, "giving up on task");
        });
    }

    /// Number of tasks queued or running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting tasks, cancel running ones and wait for them.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}
