// ── Engine ──
//
// Owns the apartment, the model event queue and the background tasks:
// the dispatcher (sole writer of the apartment), meter maintenance and
// the task processor. Collaborators are passed in through the builder.

mod dispatch;
mod maintenance;
mod queue;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusModify, BusQuery};
use crate::config::EngineConfig;
use crate::error::{BusError, CoreError};
use crate::event::{EventPayload, ModelEvent, ModelEventKind};
use crate::model::{Apartment, Dsuid, ShadingAttributes, ZoneId};
use crate::persistence::{JsonFilePersistence, ModelPersistence};
use crate::scanner::{self, ScanDepth, ScanResult};
use crate::sink::EventSink;
use crate::tasks::TaskProcessor;

pub use queue::EventQueue;

// ── Builder ─────────────────────────────────────────────────────────

pub struct EngineBuilder {
    config: EngineConfig,
    query: Option<Arc<dyn BusQuery>>,
    modify: Option<Arc<dyn BusModify>>,
    sink: Option<Arc<dyn EventSink>>,
    persistence: Option<Arc<dyn ModelPersistence>>,
}

impl EngineBuilder {
    /// Use one client for both bus interfaces.
    pub fn bus<B>(mut self, bus: Arc<B>) -> Self
    where
        B: BusQuery + BusModify + 'static,
    {
        self.query = Some(Arc::clone(&bus) as Arc<dyn BusQuery>);
        self.modify = Some(bus as Arc<dyn BusModify>);
        self
    }

    pub fn query(mut self, query: Arc<dyn BusQuery>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn modify(mut self, modify: Arc<dyn BusModify>) -> Self {
        self.modify = Some(modify);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Overrides the JSON snapshot derived from `snapshot_path`.
    pub fn persistence(mut self, persistence: Arc<dyn ModelPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> Result<Engine, CoreError> {
        let query = self.query.ok_or_else(|| CoreError::Config {
            message: "no bus query client configured".into(),
        })?;
        let modify = self.modify.ok_or_else(|| CoreError::Config {
            message: "no bus modify client configured".into(),
        })?;
        let sink = self.sink.ok_or_else(|| CoreError::Config {
            message: "no event sink configured".into(),
        })?;
        let persistence = self.persistence.or_else(|| {
            self.config
                .snapshot_path
                .as_ref()
                .map(|path| Arc::new(JsonFilePersistence::new(path)) as Arc<dyn ModelPersistence>)
        });

        let queue = Arc::new(EventQueue::new());
        let tasks = TaskProcessor::new(
            Arc::clone(&query),
            Arc::clone(&queue),
            self.config.task_workers,
            self.config.task_retries,
            self.config.task_retry_delay,
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                query,
                modify,
                sink,
                persistence,
                apartment: RwLock::new(Apartment::new()),
                queue,
                tasks,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        })
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Handle to a running synchronization engine.
///
/// Cheaply cloneable. Any clone may enqueue events, request scans or
/// read the apartment; only the dispatcher task writes to it.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    query: Arc<dyn BusQuery>,
    modify: Arc<dyn BusModify>,
    sink: Arc<dyn EventSink>,
    persistence: Option<Arc<dyn ModelPersistence>>,
    apartment: RwLock<Apartment>,
    queue: Arc<EventQueue>,
    tasks: TaskProcessor,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            query: None,
            modify: None,
            sink: None,
            persistence: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Restore the last snapshot, if any, and spawn the dispatcher and
    /// meter-maintenance tasks.
    pub async fn start(&self) -> Result<(), CoreError> {
        if let Some(persistence) = self.inner.persistence.clone() {
            let restored = tokio::task::spawn_blocking(move || persistence.load())
                .await
                .map_err(|e| CoreError::Internal(format!("snapshot load task failed: {e}")))??;
            if let Some(apartment) = restored {
                info!(
                    devices = apartment.devices().count(),
                    nodes = apartment.nodes().count(),
                    "restored apartment snapshot"
                );
                *self.inner.apartment.write() = apartment;
            }
        }

        let mut handles = self.inner.task_handles.lock();
        handles.push(tokio::spawn(dispatch::dispatcher_task(self.clone())));
        handles.push(tokio::spawn(maintenance::maintenance_task(self.clone())));
        info!("engine started");
        Ok(())
    }

    /// Stop all background work. The dispatcher releases pending
    /// coalesced events and writes a final snapshot before exiting.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.shutdown().await;

        let handles: Vec<_> = self.inner.task_handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        debug!("engine stopped");
    }

    // ── Queue ────────────────────────────────────────────────────────

    /// Hand an event to the dispatcher. Non-blocking, callable anywhere.
    pub fn enqueue(&self, event: ModelEvent) {
        self.inner.queue.enqueue(event);
    }

    /// Block until everything enqueued so far has been applied.
    /// Returns `false` on timeout.
    pub async fn pending_changes_barrier(&self, timeout: Duration) -> bool {
        self.inner.queue.barrier(timeout).await
    }

    pub fn is_initializing(&self) -> bool {
        self.inner.queue.is_initializing()
    }

    // ── Scans ────────────────────────────────────────────────────────

    /// Bring one node in line with the bus. The merge happens on the
    /// dispatcher; use [`pending_changes_barrier`](Self::pending_changes_barrier)
    /// to wait for it.
    pub async fn scan_node(&self, node: Dsuid) -> Result<ScanDepth, CoreError> {
        let initializing = self.is_initializing();
        let fetched = scanner::fetch_node(self.inner.query.as_ref(), node, |digest| {
            initializing
                || !self
                    .inner
                    .apartment
                    .read()
                    .node(node)
                    .is_ok_and(|n| n.digest_matches(digest))
        })
        .await;
        let depth = self.submit_scan(node, fetched)?;
        Ok(depth.unwrap_or(ScanDepth::Full))
    }

    pub async fn scan_zone(&self, node: Dsuid, zone: ZoneId) -> Result<(), CoreError> {
        let fetched = scanner::fetch_zone(self.inner.query.as_ref(), node, zone).await;
        self.submit_scan(node, fetched).map(|_| ())
    }

    pub async fn scan_clusters(&self, node: Dsuid) -> Result<(), CoreError> {
        let fetched = scanner::fetch_clusters(self.inner.query.as_ref(), node).await;
        self.submit_scan(node, fetched).map(|_| ())
    }

    pub async fn scan_device_on_bus(&self, node: Dsuid, bus_addr: u16) -> Result<(), CoreError> {
        let fetched = scanner::fetch_device(self.inner.query.as_ref(), node, bus_addr).await;
        self.submit_scan(node, fetched).map(|_| ())
    }

    fn submit_scan(
        &self,
        node: Dsuid,
        fetched: Result<ScanResult, BusError>,
    ) -> Result<Option<ScanDepth>, CoreError> {
        let (result, outcome) = match fetched {
            Ok(result) => (result, Ok(())),
            Err(e) => (ScanResult::Failed { node }, Err(CoreError::from(e))),
        };
        let depth = result.depth();
        self.enqueue(
            ModelEvent::new(ModelEventKind::ScanApplied)
                .with_source(node)
                .with_payload(EventPayload::Scan(Box::new(result))),
        );
        outcome.map(|()| depth)
    }

    // ── Auto-cluster maintenance ─────────────────────────────────────

    /// Schedule a cluster consistency check for one device.
    pub fn consistency_check(&self, device: Dsuid) {
        self.enqueue(ModelEvent::new(ModelEventKind::AutoClusterMaintenance).with_source(device));
    }

    /// Schedule merging of identical automatic clusters.
    pub fn join_identical_clusters(&self) {
        self.enqueue(ModelEvent::new(ModelEventKind::AutoClusterCleanup));
    }

    /// Record new shading attributes for a device; cluster membership
    /// follows once the change is applied.
    pub fn set_device_attributes(&self, device: Dsuid, attributes: ShadingAttributes) {
        self.enqueue(ModelEvent::attributes_changed(device, attributes));
    }

    // ── Read access ──────────────────────────────────────────────────

    /// Run `f` against the current apartment under the read lock.
    pub fn with_apartment<R>(&self, f: impl FnOnce(&Apartment) -> R) -> R {
        f(&self.inner.apartment.read())
    }

    pub fn apartment_snapshot(&self) -> Apartment {
        self.inner.apartment.read().clone()
    }
}
