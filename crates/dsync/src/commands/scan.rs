//! `dsync scan`: one initial scan, then a JSON summary of the model.

use serde_json::json;

use dsync_core::{Apartment, SystemEvent};

use crate::cli::{GlobalOpts, ScanArgs};
use crate::error::CliError;

pub async fn handle(args: &ScanArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (engine, mut events) = super::start_engine(global, &args.bus).await?;

    let ready = tokio::time::timeout(args.timeout, async {
        while let Ok(event) = events.recv().await {
            if matches!(*event, SystemEvent::ModelReady) {
                return true;
            }
        }
        false
    })
    .await;
    let settled = matches!(ready, Ok(true)) && engine.pending_changes_barrier(args.timeout).await;

    let summary = engine.with_apartment(summarize);
    engine.shutdown().await;

    if !settled {
        return Err(CliError::Timeout {
            what: "the initial bus scan".into(),
            seconds: args.timeout.as_secs(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn summarize(apartment: &Apartment) -> serde_json::Value {
    let nodes: Vec<_> = apartment
        .nodes()
        .map(|n| {
            json!({
                "dsuid": n.dsuid,
                "name": n.name,
                "valid": n.valid,
                "devices": n.devices.len(),
            })
        })
        .collect();
    let zones: Vec<_> = apartment
        .zones()
        .filter(|z| !z.id.is_broadcast())
        .map(|z| json!({ "id": z.id, "devices": z.devices }))
        .collect();
    let devices: Vec<_> = apartment
        .devices()
        .map(|d| {
            json!({
                "dsuid": d.dsuid,
                "name": d.name,
                "zone": d.zone,
                "present": d.present,
                "groups": d.groups.iter().collect::<Vec<_>>(),
            })
        })
        .collect();
    let clusters: Vec<_> = apartment
        .clusters()
        .filter(|c| c.is_configured())
        .map(|c| {
            json!({
                "id": c.id,
                "location": c.location,
                "protection": c.protection,
                "members": apartment.cluster_members(c.id),
            })
        })
        .collect();

    json!({
        "nodes": nodes,
        "zones": zones,
        "devices": devices,
        "clusters": clusters,
    })
}
