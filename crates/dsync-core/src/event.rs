// ── Model and system events ──
//
// `ModelEvent` is what travels through the dispatcher queue: a kind
// tag, a short list of integer parameters, optional strings, an optional
// typed payload and the id of the bus node that raised it.
//
// `SystemEvent` is what leaves the engine through the event sink once
// a model event has been applied (and, for scene and button traffic,
// coalesced).

use serde::Serialize;
use strum::{Display, IntoStaticStr};

use crate::error::CoreError;
use crate::model::{BinaryInput, Dsuid, GroupId, MemberType, ShadingAttributes, ZoneId};
use crate::scanner::ScanResult;
use crate::scene::ClickType;

// ── ModelEventKind ──────────────────────────────────────────────────

/// Type tag of a [`ModelEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum ModelEventKind {
    /// `zone, group, origin_device, scene[, origin, forced, token]`
    CallSceneGroup,
    /// `zone, group, origin_device[, scene]`
    UndoSceneGroup,
    /// `zone, group, origin_device`
    BlinkGroup,
    /// `device, scene`
    CallSceneDevice,
    /// `device`
    BlinkDevice,
    /// `device, button_index, click_type`
    ButtonClickDevice,
    /// `zone, device`
    NewDevice,
    /// `zone, device`
    LostDevice,
    /// `device`
    DeviceChanged,
    /// `device, config_class, config_index, value`
    DeviceConfigChanged,
    /// Payload: [`EventPayload::Attributes`]; source is the device.
    DeviceAttributesChanged,
    /// `device, sensor_index, value`
    DeviceSensorValue,
    /// `device, input_index, input_type, state`
    DeviceBinaryInputEvent,
    /// `zone, group, sensor_type, value`
    ZoneSensorValue,
    /// Topology changed; schedules a snapshot write. Barriers may
    /// target one already at the queue tail.
    TopologyDirty,
    /// Queue synchronization marker; applies nothing.
    Barrier,
    /// Payload: [`EventPayload::Member`]
    NodeDiscovered,
    NodeReady,
    LostNode,
    BusReady,
    BusDown,
    /// `power, energy`
    MeteringValues,
    /// `zone, state`
    HeatingControllerState,
    /// `cluster, locked`
    ClusterConfigLock,
    /// `cluster, scene...`
    ClusterLockedScenes,
    /// Source is the device to re-check.
    AutoClusterMaintenance,
    AutoClusterCleanup,
    ModelReady,
    /// Payload: [`EventPayload::Scan`]
    ScanApplied,
    /// Payload: [`EventPayload::BinaryInputs`]
    BinaryInputsReady,
}

impl ModelEventKind {
    /// Accepted parameter count as `(min, max)`; `None` means unbounded.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::CallSceneGroup => (4, Some(7)),
            Self::UndoSceneGroup => (3, Some(4)),
            Self::BlinkGroup => (3, Some(3)),
            Self::CallSceneDevice | Self::NewDevice | Self::LostDevice | Self::MeteringValues => {
                (2, Some(2))
            }
            Self::HeatingControllerState | Self::ClusterConfigLock => (2, Some(2)),
            Self::BlinkDevice | Self::DeviceChanged => (1, Some(1)),
            Self::ButtonClickDevice | Self::DeviceSensorValue => (3, Some(3)),
            Self::DeviceConfigChanged
            | Self::DeviceBinaryInputEvent
            | Self::ZoneSensorValue => (4, Some(4)),
            Self::ClusterLockedScenes => (1, None),
            Self::DeviceAttributesChanged
            | Self::TopologyDirty
            | Self::Barrier
            | Self::NodeDiscovered
            | Self::NodeReady
            | Self::LostNode
            | Self::BusReady
            | Self::BusDown
            | Self::AutoClusterMaintenance
            | Self::AutoClusterCleanup
            | Self::ModelReady
            | Self::ScanApplied
            | Self::BinaryInputsReady => (0, Some(0)),
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

// ── Payload ─────────────────────────────────────────────────────────

/// Typed attachment carried by some model events.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Scan(Box<ScanResult>),
    BinaryInputs { device: Dsuid, inputs: Vec<BinaryInput> },
    Attributes(ShadingAttributes),
    Member(MemberType),
}

// ── ModelEvent ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ModelEvent {
    pub kind: ModelEventKind,
    pub params: Vec<i32>,
    pub strings: Vec<String>,
    pub payload: Option<EventPayload>,
    pub source: Option<Dsuid>,
}

impl ModelEvent {
    pub fn new(kind: ModelEventKind) -> Self {
        Self {
            kind,
            params: Vec::new(),
            strings: Vec::new(),
            payload: None,
            source: None,
        }
    }

    pub fn with_params(mut self, params: impl Into<Vec<i32>>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_strings(mut self, strings: Vec<String>) -> Self {
        self.strings = strings;
        self
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_source(mut self, source: Dsuid) -> Self {
        self.source = Some(source);
        self
    }

    // ── Convenience constructors ─────────────────────────────────────

    pub fn topology_dirty() -> Self {
        Self::new(ModelEventKind::TopologyDirty)
    }

    pub fn barrier() -> Self {
        Self::new(ModelEventKind::Barrier)
    }

    pub fn call_scene_group(
        source: Dsuid,
        zone: ZoneId,
        group: GroupId,
        origin_device: u16,
        scene: u8,
    ) -> Self {
        Self::new(ModelEventKind::CallSceneGroup)
            .with_source(source)
            .with_params([
                i32::from(zone.0),
                i32::from(group.0),
                i32::from(origin_device),
                i32::from(scene),
            ])
    }

    pub fn button_click(source: Dsuid, device: u16, button_index: u8, click: ClickType) -> Self {
        Self::new(ModelEventKind::ButtonClickDevice)
            .with_source(source)
            .with_params([
                i32::from(device),
                i32::from(button_index),
                i32::from(click.code()),
            ])
    }

    pub fn attributes_changed(device: Dsuid, attributes: ShadingAttributes) -> Self {
        Self::new(ModelEventKind::DeviceAttributesChanged)
            .with_source(device)
            .with_payload(EventPayload::Attributes(attributes))
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn is_topology_dirty(&self) -> bool {
        self.kind == ModelEventKind::TopologyDirty
    }

    /// Whether a barrier can wait on this event instead of queueing its own.
    pub fn is_sync_marker(&self) -> bool {
        matches!(self.kind, ModelEventKind::TopologyDirty | ModelEventKind::Barrier)
    }

    fn malformed(&self, reason: impl Into<String>) -> CoreError {
        CoreError::MalformedEvent {
            kind: self.kind.name(),
            reason: reason.into(),
        }
    }

    /// Reject events whose parameter count does not fit their kind.
    pub fn check_arity(&self) -> Result<(), CoreError> {
        let (min, max) = self.kind.arity();
        let got = self.params.len();
        let fits = got >= min && max.is_none_or(|max| got <= max);
        if fits {
            return Ok(());
        }
        let expected = match max {
            Some(max) if max == min => format!("{min}"),
            Some(max) => format!("{min} to {max}"),
            None => format!("at least {min}"),
        };
        Err(self.malformed(format!("expected {expected} parameters, got {got}")))
    }

    pub fn param(&self, index: usize) -> Result<i32, CoreError> {
        self.params
            .get(index)
            .copied()
            .ok_or_else(|| self.malformed(format!("missing parameter {index}")))
    }

    pub fn opt_param(&self, index: usize) -> Option<i32> {
        self.params.get(index).copied()
    }

    pub fn param_u8(&self, index: usize) -> Result<u8, CoreError> {
        let raw = self.param(index)?;
        u8::try_from(raw).map_err(|_| self.malformed(format!("parameter {index} out of range: {raw}")))
    }

    pub fn param_u16(&self, index: usize) -> Result<u16, CoreError> {
        let raw = self.param(index)?;
        u16::try_from(raw).map_err(|_| self.malformed(format!("parameter {index} out of range: {raw}")))
    }

    pub fn zone_param(&self, index: usize) -> Result<ZoneId, CoreError> {
        self.param_u16(index).map(ZoneId)
    }

    pub fn group_param(&self, index: usize) -> Result<GroupId, CoreError> {
        self.param_u8(index).map(GroupId)
    }

    /// Source node; loopback events carry none and resolve to the null id.
    pub fn source_or_null(&self) -> Dsuid {
        self.source.unwrap_or(Dsuid::NULL)
    }

    pub fn require_source(&self) -> Result<Dsuid, CoreError> {
        self.source.ok_or_else(|| self.malformed("missing source id"))
    }

    pub fn take_payload(&mut self) -> Result<EventPayload, CoreError> {
        let kind = self.kind.name();
        self.payload.take().ok_or(CoreError::MalformedEvent {
            kind,
            reason: "missing payload".into(),
        })
    }
}

// ── SystemEvent ─────────────────────────────────────────────────────

/// A finished, externally visible event handed to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SystemEvent {
    /// Coalesced scene call, one per logical user action.
    CallScene {
        zone: ZoneId,
        group: GroupId,
        scene: u8,
        origin_device: Dsuid,
        origin: u8,
        forced: bool,
        token: u32,
    },
    /// Raw scene call as seen on the bus.
    CallSceneBus {
        zone: ZoneId,
        group: GroupId,
        scene: u8,
        origin_device: Dsuid,
    },
    UndoScene {
        zone: ZoneId,
        group: GroupId,
        scene: Option<u8>,
        origin_device: Dsuid,
    },
    Blink {
        zone: ZoneId,
        group: GroupId,
        origin_device: Dsuid,
    },
    /// Coalesced button click.
    ButtonClick {
        device: Dsuid,
        button_index: u8,
        #[serde(serialize_with = "serialize_click")]
        click_type: ClickType,
        hold_count: Option<u32>,
    },
    /// Raw button click as seen on the bus.
    ButtonClickBus {
        device: Dsuid,
        button_index: u8,
        #[serde(serialize_with = "serialize_click")]
        click_type: ClickType,
    },
    DeviceCallScene {
        device: Dsuid,
        scene: u8,
    },
    DeviceBlink {
        device: Dsuid,
    },
    DeviceAdded {
        device: Dsuid,
        zone: ZoneId,
    },
    DeviceRemoved {
        device: Dsuid,
        zone: ZoneId,
    },
    /// A device was (re)discovered and can be read out.
    DeviceReady {
        device: Dsuid,
        zone: ZoneId,
    },
    NodeReady {
        node: Dsuid,
    },
    NodeLost {
        node: Dsuid,
    },
    ModelReady,
    DeviceSensorValue {
        device: Dsuid,
        sensor_index: u8,
        value: f64,
    },
    DeviceBinaryInput {
        device: Dsuid,
        index: u8,
        input_type: u8,
        state: bool,
    },
    ZoneSensorValue {
        zone: ZoneId,
        group: GroupId,
        sensor_type: u8,
        value: f64,
    },
    HeatingConflict {
        zone: ZoneId,
        controller: Dsuid,
        rejected: Dsuid,
    },
    HeatingControllerState {
        zone: ZoneId,
        node: Dsuid,
        state: u8,
    },
    MeteringValues {
        node: Dsuid,
        power: u32,
        energy: u64,
    },
}

fn serialize_click<S: serde::Serializer>(click: &ClickType, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(click)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn arity_is_checked_per_kind() {
        let ok = ModelEvent::call_scene_group(Dsuid::new(1), ZoneId(1), GroupId(1), 0, 5);
        assert!(ok.check_arity().is_ok());

        let short = ModelEvent::new(ModelEventKind::CallSceneGroup).with_params([1, 1, 0]);
        let err = short.check_arity().unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed call_scene_group event: expected 4 to 7 parameters, got 3"
        );

        let extra = ModelEvent::new(ModelEventKind::NewDevice).with_params([1, 2, 3]);
        assert!(extra.check_arity().is_err());

        let open = ModelEvent::new(ModelEventKind::ClusterLockedScenes).with_params([16, 5, 6, 7]);
        assert!(open.check_arity().is_ok());
    }

    #[test]
    fn out_of_range_parameters_are_malformed() {
        let event = ModelEvent::new(ModelEventKind::BlinkDevice).with_params([-4]);
        assert!(matches!(
            event.param_u16(0),
            Err(CoreError::MalformedEvent { .. })
        ));
    }

    #[test]
    fn system_events_serialize_tagged() {
        let event = SystemEvent::ButtonClick {
            device: Dsuid::new(2),
            button_index: 0,
            click_type: ClickType::Tip2,
            hold_count: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "button_click");
        assert_eq!(json["click_type"], "2T");
    }
}
