// ── Meter maintenance ──
//
// Periodic discovery and revalidation of bus nodes. Each cycle lists
// the bus members, waits for them to be applied, scans every present
// node and ends the initializing phase once every node is valid.

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Engine;
use crate::event::{EventPayload, ModelEvent, ModelEventKind};
use crate::model::Dsuid;

pub(super) async fn maintenance_task(engine: Engine) {
    let cancel = engine.inner.cancel.clone();
    let mut interval = tokio::time::interval(engine.config().meter_sync_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = maintenance_cycle(&engine) => {}
                }
            }
        }
    }
    debug!("meter maintenance stopped");
}

async fn maintenance_cycle(engine: &Engine) {
    let barrier_timeout = engine.config().barrier_timeout;

    let members = match engine.inner.query.bus_members().await {
        Ok(members) => members,
        Err(e) => {
            warn!(error = %e, "bus member enumeration failed");
            return;
        }
    };
    for member in members {
        engine.enqueue(
            ModelEvent::new(ModelEventKind::NodeDiscovered)
                .with_source(member.dsuid)
                .with_payload(EventPayload::Member(member.member_type)),
        );
    }
    if !engine.pending_changes_barrier(barrier_timeout).await {
        warn!("timed out waiting for node discovery to apply");
        return;
    }

    let present: Vec<Dsuid> = engine.with_apartment(|apt| {
        apt.nodes().filter(|n| n.present).map(|n| n.dsuid).collect()
    });
    for node in present {
        match engine.scan_node(node).await {
            Ok(depth) => debug!(%node, %depth, "node scanned"),
            Err(e) => warn!(%node, error = %e, "node scan failed"),
        }
    }
    if !engine.pending_changes_barrier(barrier_timeout).await {
        warn!("timed out waiting for node scans to apply");
        return;
    }

    if engine.is_initializing() {
        let all_valid = engine.with_apartment(|apt| apt.nodes().filter(|n| n.present).all(|n| n.valid));
        if all_valid && engine.inner.queue.finish_initialization() {
            info!("initial bus scan complete");
            engine.enqueue(ModelEvent::new(ModelEventKind::ModelReady));
            engine.enqueue(ModelEvent::new(ModelEventKind::AutoClusterCleanup));
        }
    }
}
