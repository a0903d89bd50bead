// ── Dispatcher ──
//
// The single consumer of the model event queue and the only writer of
// the apartment. Each event is applied under the write lock; bus
// writes, outward events and pool tasks are collected and carried out
// after the lock is released, also when the handler fails part way. No
// error leaves `dispatch`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::Engine;
use crate::bus::{BusMirror, ClusterSpec};
use crate::clusters;
use crate::coalescer::{ButtonPress, Coalescer, Fired, SceneCall};
use crate::error::CoreError;
use crate::event::{EventPayload, ModelEvent, ModelEventKind, SystemEvent};
use crate::model::{Apartment, Dsuid, GroupId, SensorReading, ZoneHeating, ZoneId};
use crate::scanner::{self, ScanOutcome};
use crate::scene::{self, ClickType};
use crate::tasks::Task;

// Device configuration classes and indices reported with config changes.
const CONFIG_CLASS_FUNCTION: u8 = 0x03;
const CONFIG_CLASS_SENSOR_EVENT: u8 = 0x06;
const FUNCTION_MODE: u8 = 0x00;
const FUNCTION_BUTTON_MODE: u8 = 0x01;
const FUNCTION_LT_MODE: u8 = 0x1e;

// ── Loop ────────────────────────────────────────────────────────────

pub(super) async fn dispatcher_task(engine: Engine) {
    let cancel = engine.inner.cancel.clone();
    let queue = Arc::clone(&engine.inner.queue);
    let mut dispatcher = Dispatcher::new(engine);

    loop {
        let wait = dispatcher.wait_time(Instant::now());
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = queue.pop(wait) => {
                if let Some((seq, event)) = next {
                    dispatcher.dispatch(event).await;
                    queue.mark_processed(seq);
                }
                dispatcher.housekeeping().await;
            }
        }
    }
    dispatcher.finish().await;
}

/// Side effects collected while the apartment is locked.
#[derive(Debug, Default)]
struct Effects {
    events: Vec<SystemEvent>,
    mirrors: Vec<BusMirror>,
    tasks: Vec<Task>,
    dirty: bool,
    save: bool,
}

impl Effects {
    fn absorb(&mut self, outcome: ScanOutcome) {
        self.events.extend(outcome.events);
        self.mirrors.extend(outcome.mirrors);
        self.tasks.extend(
            outcome
                .binary_input_resync
                .into_iter()
                .map(|(node, bus_addr)| Task::BinaryInputResync { node, bus_addr }),
        );
        self.dirty |= outcome.dirty;
    }
}

struct Dispatcher {
    engine: Engine,
    coalescer: Coalescer,
    save_at: Option<Instant>,
}

impl Dispatcher {
    fn new(engine: Engine) -> Self {
        let config = engine.config();
        let coalescer = Coalescer::new(config.scene_window, config.button_window);
        Self {
            engine,
            coalescer,
            save_at: None,
        }
    }

    /// How long to block on the queue before something else is due.
    fn wait_time(&self, now: Instant) -> Duration {
        [self.coalescer.next_deadline(), self.save_at]
            .into_iter()
            .flatten()
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.engine.config().event_timeout, Duration::min)
    }

    async fn dispatch(&mut self, event: ModelEvent) {
        let kind = event.kind;
        if let Err(e) = event.check_arity() {
            warn!(error = %e, "dropping model event");
            return;
        }
        trace!(%kind, source = ?event.source, "dispatching model event");

        let initializing = self.engine.is_initializing();
        let (effects, result) = {
            let mut apartment = self.engine.inner.apartment.write();
            let mut ctx = Context {
                apartment: &mut *apartment,
                coalescer: &mut self.coalescer,
                initializing,
                now: Instant::now(),
                effects: Effects::default(),
            };
            let result = ctx.apply(event);
            (ctx.effects, result)
        };
        // Effects gathered before a failure are committed too.
        if let Err(e) = result {
            warn!(%kind, error = %e, "model event failed");
        }
        self.commit(effects).await;
    }

    async fn commit(&mut self, effects: Effects) {
        for mirror in &effects.mirrors {
            if let Err(e) = mirror.apply(self.engine.inner.modify.as_ref()).await {
                warn!(error = %e, ?mirror, "bus write failed, model keeps the change");
            }
        }
        for task in effects.tasks {
            self.engine.inner.tasks.schedule(task);
        }
        for event in effects.events {
            self.engine.inner.sink.publish(event);
        }
        if effects.dirty {
            self.engine.enqueue(ModelEvent::topology_dirty());
        }
        if effects.save && self.engine.inner.persistence.is_some() && self.save_at.is_none() {
            self.save_at = Some(Instant::now() + self.engine.config().save_delay);
        }
    }

    /// Release due coalesced events and write a due snapshot.
    async fn housekeeping(&mut self) {
        let now = Instant::now();
        let fired = self.coalescer.sweep(now);
        self.publish_fired(fired);

        if self.save_at.is_some_and(|at| at <= now) {
            self.save().await;
        }
    }

    fn publish_fired(&self, fired: Vec<Fired>) {
        if fired.is_empty() {
            return;
        }
        let events: Vec<_> = {
            let apartment = self.engine.inner.apartment.read();
            fired.into_iter().map(|f| outward(&apartment, f)).collect()
        };
        for event in events {
            self.engine.inner.sink.publish(event);
        }
    }

    async fn save(&mut self) {
        let Some(persistence) = self.engine.inner.persistence.clone() else {
            self.save_at = None;
            return;
        };
        let snapshot = self.engine.apartment_snapshot();
        let result = tokio::task::spawn_blocking(move || persistence.save(&snapshot))
            .await
            .map_err(|e| CoreError::Internal(format!("snapshot task failed: {e}")))
            .and_then(|r| r);

        match result {
            Ok(()) => self.save_at = None,
            Err(e) => {
                let retry = self.engine.config().save_retry_delay;
                error!(error = %e, retry_in = ?retry, "snapshot write failed");
                self.save_at = Some(Instant::now() + retry);
            }
        }
    }

    /// Final flush on shutdown.
    async fn finish(&mut self) {
        let fired = self.coalescer.drain();
        self.publish_fired(fired);
        if self.save_at.is_some() {
            self.save().await;
        }
        debug!("dispatcher stopped");
    }
}

// ── Outward events ──────────────────────────────────────────────────

/// Resolve a node-local bus address; unknown devices keep the raw id.
fn resolve_device(apartment: &Apartment, node: Dsuid, bus_addr: u16) -> Dsuid {
    apartment
        .device_by_bus_addr(node, bus_addr)
        .map_or_else(|_| Dsuid::new(u128::from(bus_addr)), |d| d.dsuid)
}

fn resolve_origin(apartment: &Apartment, node: Dsuid, bus_addr: u16) -> Dsuid {
    if bus_addr == 0 {
        Dsuid::NULL
    } else {
        resolve_device(apartment, node, bus_addr)
    }
}

fn outward(apartment: &Apartment, fired: Fired) -> SystemEvent {
    match fired {
        Fired::Scene(call) => SystemEvent::CallScene {
            zone: call.zone,
            group: call.group,
            scene: call.scene,
            origin_device: resolve_origin(apartment, call.source, call.origin_device),
            origin: call.origin,
            forced: call.forced,
            token: call.token,
        },
        Fired::Button { press, hold_count } => SystemEvent::ButtonClick {
            device: resolve_device(apartment, press.source, press.device),
            button_index: press.button_index,
            click_type: press.click,
            hold_count,
        },
    }
}

// ── Handlers ────────────────────────────────────────────────────────

struct Context<'a> {
    apartment: &'a mut Apartment,
    coalescer: &'a mut Coalescer,
    initializing: bool,
    now: Instant,
    effects: Effects,
}

fn unexpected_payload(kind: ModelEventKind) -> CoreError {
    CoreError::MalformedEvent {
        kind: kind.name(),
        reason: "unexpected payload".into(),
    }
}

fn param_u32(event: &ModelEvent, index: usize) -> Result<u32, CoreError> {
    let raw = event.param(index)?;
    u32::try_from(raw).map_err(|_| CoreError::MalformedEvent {
        kind: event.kind.name(),
        reason: format!("parameter {index} out of range: {raw}"),
    })
}

fn opt_param_u8(event: &ModelEvent, index: usize) -> Result<Option<u8>, CoreError> {
    if event.params.len() > index {
        event.param_u8(index).map(Some)
    } else {
        Ok(None)
    }
}

impl Context<'_> {
    fn apply(&mut self, mut event: ModelEvent) -> Result<(), CoreError> {
        match event.kind {
            ModelEventKind::CallSceneGroup => self.call_scene_group(&event),
            ModelEventKind::UndoSceneGroup => self.undo_scene_group(&event),
            ModelEventKind::BlinkGroup => {
                let (zone, group) = (event.zone_param(0)?, event.group_param(1)?);
                let origin = event.param_u16(2)?;
                let origin_device = resolve_origin(self.apartment, event.source_or_null(), origin);
                self.effects.events.push(SystemEvent::Blink {
                    zone,
                    group,
                    origin_device,
                });
                Ok(())
            }
            ModelEventKind::CallSceneDevice => self.call_scene_device(&event),
            ModelEventKind::BlinkDevice => {
                let device = self.device_at(&event, 0)?;
                self.effects.events.push(SystemEvent::DeviceBlink { device });
                Ok(())
            }
            ModelEventKind::ButtonClickDevice => self.button_click(&event),
            ModelEventKind::NewDevice | ModelEventKind::DeviceChanged => {
                let node = event.require_source()?;
                let index = usize::from(event.kind == ModelEventKind::NewDevice);
                let bus_addr = event.param_u16(index)?;
                debug!(%node, bus_addr, "device rescan requested");
                self.effects.tasks.push(Task::DeviceRescan { node, bus_addr });
                Ok(())
            }
            ModelEventKind::LostDevice => self.lost_device(&event),
            ModelEventKind::DeviceConfigChanged => self.device_config_changed(&event),
            ModelEventKind::DeviceAttributesChanged => {
                let device = event.require_source()?;
                let EventPayload::Attributes(attributes) = event.take_payload()? else {
                    return Err(unexpected_payload(event.kind));
                };
                self.apartment.device_mut(device)?.shading = attributes;
                self.effects.dirty = true;
                if !self.initializing {
                    let mirrors = clusters::consistency_check(self.apartment, device)?;
                    self.effects.mirrors.extend(mirrors);
                }
                Ok(())
            }
            ModelEventKind::DeviceSensorValue => self.device_sensor_value(&event),
            ModelEventKind::DeviceBinaryInputEvent => self.binary_input_event(&event),
            ModelEventKind::ZoneSensorValue => self.zone_sensor_value(&event),
            ModelEventKind::TopologyDirty => {
                self.effects.save = true;
                Ok(())
            }
            ModelEventKind::Barrier => Ok(()),
            ModelEventKind::NodeDiscovered => self.node_discovered(&mut event),
            ModelEventKind::NodeReady => {
                let node = event.require_source()?;
                let n = self.apartment.node_mut(node)?;
                n.present = true;
                n.connected = true;
                self.effects.events.push(SystemEvent::NodeReady { node });
                Ok(())
            }
            ModelEventKind::LostNode => self.lost_node(&event),
            ModelEventKind::BusReady => {
                info!("bus ready, revalidating every node");
                let nodes: Vec<Dsuid> = self.apartment.nodes().map(|n| n.dsuid).collect();
                for node in nodes {
                    self.apartment.node_mut(node)?.valid = false;
                }
                Ok(())
            }
            ModelEventKind::BusDown => {
                warn!("bus down");
                let nodes: Vec<Dsuid> = self.apartment.nodes().map(|n| n.dsuid).collect();
                for node in nodes {
                    self.apartment.node_mut(node)?.connected = false;
                }
                Ok(())
            }
            ModelEventKind::MeteringValues => {
                let node = event.require_source()?;
                let power = param_u32(&event, 0)?;
                let energy = u64::from(param_u32(&event, 1)?);
                let n = self.apartment.node_mut(node)?;
                n.power_consumption = power;
                n.update_energy(energy);
                self.effects.events.push(SystemEvent::MeteringValues {
                    node,
                    power,
                    energy: n.energy_meter_value,
                });
                Ok(())
            }
            ModelEventKind::HeatingControllerState => {
                let node = event.require_source()?;
                let zone = event.zone_param(0)?;
                let state = event.param_u8(1)?;
                let heating = &mut self.apartment.zone_mut(zone)?.heating;
                if heating.controller == Some(node) {
                    heating.state = state;
                    self.effects
                        .events
                        .push(SystemEvent::HeatingControllerState { zone, node, state });
                } else {
                    debug!(%node, %zone, "heating state from a node that is not the controller");
                }
                Ok(())
            }
            ModelEventKind::ClusterConfigLock => {
                let id = event.group_param(0)?;
                let cluster = self.apartment.cluster_mut(id)?;
                cluster.configuration_locked = event.param(1)? != 0;
                self.effects
                    .mirrors
                    .push(BusMirror::UpdateCluster(ClusterSpec::from(&*cluster)));
                self.effects.dirty = true;
                Ok(())
            }
            ModelEventKind::ClusterLockedScenes => {
                let id = event.group_param(0)?;
                let scenes = (1..event.params.len())
                    .map(|i| event.param_u8(i))
                    .collect::<Result<Vec<_>, _>>()?;
                let cluster = self.apartment.cluster_mut(id)?;
                if cluster.configuration_locked {
                    return Err(CoreError::PermissionDenied {
                        operation: format!("change locked scenes of cluster {id}"),
                    });
                }
                cluster.locked_scenes = scenes;
                self.effects
                    .mirrors
                    .push(BusMirror::UpdateCluster(ClusterSpec::from(&*cluster)));
                self.effects.dirty = true;
                Ok(())
            }
            ModelEventKind::AutoClusterMaintenance => {
                let device = event.require_source()?;
                let mirrors = clusters::consistency_check(self.apartment, device)?;
                self.effects.dirty |= !mirrors.is_empty();
                self.effects.mirrors.extend(mirrors);
                Ok(())
            }
            ModelEventKind::AutoClusterCleanup => self.cluster_cleanup(),
            ModelEventKind::ModelReady => {
                info!("apartment model ready");
                self.effects.events.push(SystemEvent::ModelReady);
                Ok(())
            }
            ModelEventKind::ScanApplied => {
                let EventPayload::Scan(result) = event.take_payload()? else {
                    return Err(unexpected_payload(event.kind));
                };
                let outcome = scanner::apply(self.apartment, *result)?;
                let to_check = if self.initializing {
                    Vec::new()
                } else {
                    outcome.devices_to_check.clone()
                };
                self.effects.absorb(outcome);
                self.check_devices(&to_check);
                Ok(())
            }
            ModelEventKind::BinaryInputsReady => {
                let EventPayload::BinaryInputs { device, inputs } = event.take_payload()? else {
                    return Err(unexpected_payload(event.kind));
                };
                let outcome = scanner::apply_binary_inputs(self.apartment, device, inputs)?;
                self.effects.absorb(outcome);
                Ok(())
            }
        }
    }

    fn device_at(&self, event: &ModelEvent, index: usize) -> Result<Dsuid, CoreError> {
        let bus_addr = event.param_u16(index)?;
        self.apartment
            .device_by_bus_addr(event.source_or_null(), bus_addr)
            .map(|d| d.dsuid)
    }

    // ── Scenes ───────────────────────────────────────────────────────

    fn call_scene_group(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let call = SceneCall {
            source: event.source_or_null(),
            zone: event.zone_param(0)?,
            group: event.group_param(1)?,
            origin_device: event.param_u16(2)?,
            scene: event.param_u8(3)?,
            origin: opt_param_u8(event, 4)?.unwrap_or(0),
            forced: event.opt_param(5).is_some_and(|f| f != 0),
            token: event
                .opt_param(6)
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(0),
        };

        self.effects.events.push(SystemEvent::CallSceneBus {
            zone: call.zone,
            group: call.group,
            scene: call.scene,
            origin_device: resolve_origin(self.apartment, call.source, call.origin_device),
        });
        let fired = self.coalescer.on_scene(call, self.now);
        self.effects
            .events
            .extend(fired.into_iter().map(|f| outward(self.apartment, f)));

        if scene::is_remembered(call.scene) {
            self.remember_scene(call.zone, call.group, call.scene)?;
        }
        Ok(())
    }

    /// Zones a scene call applies to; zone 0 means every zone.
    fn target_zones(&self, zone: ZoneId) -> Result<Vec<ZoneId>, CoreError> {
        if zone.is_broadcast() {
            Ok(self.apartment.zones().map(|z| z.id).collect())
        } else {
            self.apartment.zone(zone).map(|z| vec![z.id])
        }
    }

    fn remember_scene(&mut self, zone: ZoneId, group: GroupId, scene: u8) -> Result<(), CoreError> {
        for id in self.target_zones(zone)? {
            let z = self.apartment.zone_mut(id)?;
            if group.is_broadcast() {
                for g in z.groups.values_mut() {
                    g.set_last_called_scene(scene);
                }
            } else if !group.is_cluster() {
                z.allocate_group(group).set_last_called_scene(scene);
            }
        }
        if group.is_cluster() {
            self.apartment.cluster_mut(group)?.last_called_scene = scene;
        }
        for device in self.apartment.devices_in_group(zone, group) {
            self.apartment.device_mut(device)?.set_last_called_scene(scene);
        }
        Ok(())
    }

    fn undo_scene_group(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let zone = event.zone_param(0)?;
        let group = event.group_param(1)?;
        let origin = event.param_u16(2)?;
        let scene = opt_param_u8(event, 3)?;

        for id in self.target_zones(zone)? {
            let z = self.apartment.zone_mut(id)?;
            if group.is_broadcast() {
                for g in z.groups.values_mut() {
                    g.undo_scene(scene);
                }
            } else if let Some(g) = z.group_mut(group) {
                g.undo_scene(scene);
            }
        }
        for device in self.apartment.devices_in_group(zone, group) {
            self.apartment.device_mut(device)?.undo_scene(scene);
        }

        self.effects.events.push(SystemEvent::UndoScene {
            zone,
            group,
            scene,
            origin_device: resolve_origin(self.apartment, event.source_or_null(), origin),
        });
        Ok(())
    }

    fn call_scene_device(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let device = self.device_at(event, 0)?;
        let scene = event.param_u8(1)?;
        if scene::is_remembered(scene) {
            self.apartment.device_mut(device)?.set_last_called_scene(scene);
        }
        self.effects
            .events
            .push(SystemEvent::DeviceCallScene { device, scene });
        Ok(())
    }

    fn button_click(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let press = ButtonPress {
            source: event.source_or_null(),
            device: event.param_u16(0)?,
            button_index: event.param_u8(1)?,
            click: ClickType::from_code(event.param_u8(2)?),
        };
        self.effects.events.push(SystemEvent::ButtonClickBus {
            device: resolve_device(self.apartment, press.source, press.device),
            button_index: press.button_index,
            click_type: press.click,
        });
        let fired = self.coalescer.on_button(press, self.now);
        self.effects
            .events
            .extend(fired.into_iter().map(|f| outward(self.apartment, f)));
        Ok(())
    }

    // ── Devices ──────────────────────────────────────────────────────

    fn lost_device(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let node = event.require_source()?;
        let bus_addr = event.param_u16(1)?;
        let id = self.apartment.device_by_bus_addr(node, bus_addr)?.dsuid;
        self.apartment.detach_device(id)?;
        let device = self.apartment.device_mut(id)?;
        device.present = false;
        device.connected = false;
        info!(%node, device = %id, "device lost");
        self.effects.events.push(SystemEvent::DeviceRemoved {
            device: id,
            zone: device.zone,
        });
        self.effects.dirty = true;
        Ok(())
    }

    fn device_config_changed(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let id = self.device_at(event, 0)?;
        let class = event.param_u8(1)?;
        let index = event.param_u8(2)?;
        let value = event.param_u8(3)?;
        let device = self.apartment.device_mut(id)?;

        match (class, index) {
            (CONFIG_CLASS_FUNCTION, FUNCTION_MODE) => device.output_mode = value,
            (CONFIG_CLASS_FUNCTION, FUNCTION_BUTTON_MODE) => {
                device.button.button_id = value & 0x0f;
                device.button.active_group = (value >> 4) & 0x0f;
            }
            (CONFIG_CLASS_FUNCTION, FUNCTION_LT_MODE) => device.button.input_mode = value,
            (CONFIG_CLASS_SENSOR_EVENT, _) => {
                if let Some(node) = device.node {
                    self.effects.tasks.push(Task::BinaryInputResync {
                        node,
                        bus_addr: device.bus_addr,
                    });
                }
                return Ok(());
            }
            _ => {
                trace!(device = %id, class, index, "config change not tracked");
                return Ok(());
            }
        }
        self.effects.dirty = true;
        Ok(())
    }

    fn device_sensor_value(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let id = self.device_at(event, 0)?;
        let index = event.param_u8(1)?;
        let value = f64::from(event.param(2)?);
        let sensor = self
            .apartment
            .device_mut(id)?
            .sensors
            .iter_mut()
            .find(|s| s.index == index)
            .ok_or_else(|| CoreError::not_found("device sensor", format!("{id}/{index}")))?;
        sensor.value = Some(value);
        sensor.updated_at = Some(Utc::now());
        self.effects.events.push(SystemEvent::DeviceSensorValue {
            device: id,
            sensor_index: index,
            value,
        });
        Ok(())
    }

    fn binary_input_event(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let id = self.device_at(event, 0)?;
        let index = event.param_u8(1)?;
        let input_type = event.param_u8(2)?;
        let state = event.param(3)? != 0;
        let input = self
            .apartment
            .device_mut(id)?
            .binary_inputs
            .iter_mut()
            .find(|b| b.index == index)
            .ok_or_else(|| CoreError::not_found("binary input", format!("{id}/{index}")))?;
        input.state = Some(state);
        self.effects.events.push(SystemEvent::DeviceBinaryInput {
            device: id,
            index,
            input_type,
            state,
        });
        Ok(())
    }

    fn zone_sensor_value(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let zone = event.zone_param(0)?;
        let group = event.group_param(1)?;
        let sensor_type = event.param_u8(2)?;
        let value = f64::from(event.param(3)?);
        let reading = SensorReading {
            value,
            measured_at: Utc::now(),
        };
        if self
            .apartment
            .zone_mut(zone)?
            .update_sensor(sensor_type, reading)
        {
            self.effects.events.push(SystemEvent::ZoneSensorValue {
                zone,
                group,
                sensor_type,
                value,
            });
        }
        Ok(())
    }

    // ── Nodes ────────────────────────────────────────────────────────

    fn node_discovered(&mut self, event: &mut ModelEvent) -> Result<(), CoreError> {
        let node = event.require_source()?;
        let member_type = match event.payload.take() {
            Some(EventPayload::Member(member_type)) => Some(member_type),
            Some(_) => return Err(unexpected_payload(event.kind)),
            None => None,
        };
        let n = self.apartment.allocate_node(node);
        if !n.present {
            info!(%node, "bus node discovered");
            n.valid = false;
            self.effects.dirty = true;
        }
        n.present = true;
        n.connected = true;
        if let Some(member_type) = member_type {
            n.member_type = member_type;
        }
        Ok(())
    }

    fn lost_node(&mut self, event: &ModelEvent) -> Result<(), CoreError> {
        let node = event.require_source()?;
        let n = self.apartment.node_mut(node)?;
        n.present = false;
        n.connected = false;
        n.valid = false;
        let devices = n.devices.clone();
        for id in devices {
            if let Ok(device) = self.apartment.device_mut(id) {
                device.connected = false;
            }
        }
        for zone in self.apartment.zones_mut() {
            if zone.heating.controller == Some(node) {
                zone.heating = ZoneHeating::default();
            }
        }
        warn!(%node, "bus node lost");
        self.effects.events.push(SystemEvent::NodeLost { node });
        self.effects.dirty = true;
        Ok(())
    }

    // ── Clusters ─────────────────────────────────────────────────────

    fn cluster_cleanup(&mut self) -> Result<(), CoreError> {
        let mirrors = clusters::join_identical_clusters(self.apartment)?;
        self.effects.mirrors.extend(mirrors);
        let candidates: Vec<Dsuid> = self
            .apartment
            .devices()
            .filter(|d| scanner::wants_cluster_check(d))
            .map(|d| d.dsuid)
            .collect();
        self.check_devices(&candidates);
        self.effects.dirty |= !self.effects.mirrors.is_empty();
        Ok(())
    }

    /// Run consistency checks, logging and skipping devices that fail.
    fn check_devices(&mut self, devices: &[Dsuid]) {
        for device in devices {
            match clusters::consistency_check(self.apartment, *device) {
                Ok(mirrors) => {
                    self.effects.dirty |= !mirrors.is_empty();
                    self.effects.mirrors.extend(mirrors);
                }
                Err(e) => warn!(%device, error = %e, "cluster check failed"),
            }
        }
    }
}
