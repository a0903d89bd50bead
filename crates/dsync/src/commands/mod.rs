//! Command handlers and the engine wiring they share.

pub mod config_cmd;
pub mod run;
pub mod scan;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dsync_config::Config;
use dsync_core::{BroadcastSink, Engine, MemoryBus, SystemEvent};
use tokio::sync::broadcast;

use crate::cli::{BusArgs, GlobalOpts};
use crate::error::CliError;

pub fn config_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(dsync_config::config_path)
}

pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(dsync_config::load_config_from(&config_path(global))?)
}

fn load_topology(path: &Path) -> Result<MemoryBus, CliError> {
    let json = std::fs::read_to_string(path).map_err(|e| CliError::Topology {
        path: path.display().to_string(),
        source: e.into(),
    })?;
    MemoryBus::from_json(&json).map_err(|e| CliError::Topology {
        path: path.display().to_string(),
        source: e.into(),
    })
}

/// Build a started engine over the in-memory bus.
pub async fn start_engine(
    global: &GlobalOpts,
    bus_args: &BusArgs,
) -> Result<(Engine, broadcast::Receiver<Arc<SystemEvent>>), CliError> {
    let config = load_config(global)?;
    let topology = bus_args
        .topology
        .clone()
        .or(config.bus.topology.clone())
        .ok_or_else(|| CliError::NoTopology {
            path: config_path(global).display().to_string(),
        })?;

    let bus = Arc::new(load_topology(&topology)?);
    let sink = Arc::new(BroadcastSink::new());
    let events = sink.subscribe();
    let engine = Engine::builder(config.engine.to_engine_config()?)
        .bus(bus)
        .sink(sink)
        .build()?;
    engine.start().await?;
    tracing::info!(topology = %topology.display(), "engine started on in-memory bus");
    Ok((engine, events))
}
