//! Model synchronization and event coalescing for a field-bus home
//! automation server.
//!
//! The crate keeps an in-memory model of an apartment (nodes, zones,
//! groups, devices and the shading clusters) in step with the bus:
//!
//! - **[`Engine`]**: owns the apartment and a single dispatcher task that
//!   applies [`ModelEvent`]s in FIFO order. Bus scans, snapshot writes and
//!   slow device reads all report back through that queue, so the
//!   apartment only ever has one writer.
//!
//! - **Scanner** ([`scanner`]): reads nodes, zones, clusters and devices
//!   over [`BusQuery`] and merges them into the model. A node whose digest
//!   is unchanged gets a quick scan; anything else a full one.
//!
//! - **Coalescer** ([`coalescer`]): folds repeated scene calls and button
//!   clicks from the same origin into one [`SystemEvent`] per user action.
//!
//! - **Auto clusters** ([`clusters`]): keeps shading devices in exactly one
//!   automatic cluster that matches their direction and wind class, and
//!   mirrors every membership change back to the bus through [`BusModify`].
//!
//! [`MemoryBus`] is an in-process bus for tests and the demo binary.

pub mod bus;
pub mod clusters;
pub mod coalescer;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod persistence;
pub mod scanner;
pub mod scene;
pub mod sink;
pub mod tasks;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bus::{BusModify, BusQuery, BusTopology, MemoryBus};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EventQueue};
pub use error::{BusError, CoreError};
pub use event::{EventPayload, ModelEvent, ModelEventKind, SystemEvent};
pub use persistence::{JsonFilePersistence, ModelPersistence};
pub use scanner::ScanDepth;
pub use scene::ClickType;
pub use sink::{BroadcastSink, EventSink};

pub use model::{
    Apartment, BusNode, CardinalDirection, Cluster, Device, Dsuid, GroupId, ShadingAttributes,
    WindProtectionClass, Zone, ZoneId,
};
