// ── Deferred event coalescer ──
//
// Turns bursts of raw scene calls and button clicks into one outward
// event per user action. Pure state machine: callers pass the current
// instant and get back whatever became final.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::model::{Dsuid, GroupId, ZoneId};
use crate::scene::{self, ClickType, SceneFamily};

// ── Inputs and outputs ──────────────────────────────────────────────

/// A raw group scene call as reported by a bus node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneCall {
    pub source: Dsuid,
    pub zone: ZoneId,
    pub group: GroupId,
    /// Bus address of the device that triggered the call, 0 if unknown.
    pub origin_device: u16,
    pub scene: u8,
    pub origin: u8,
    pub forced: bool,
    pub token: u32,
}

/// A raw button click as reported by a bus node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonPress {
    pub source: Dsuid,
    pub device: u16,
    pub button_index: u8,
    pub click: ClickType,
}

/// A final event released by the coalescer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired {
    Scene(SceneCall),
    Button {
        press: ButtonPress,
        hold_count: Option<u32>,
    },
}

// ── Pending entries ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum DeferredEvent {
    Scene {
        call: SceneCall,
        touched_at: Instant,
        fired: bool,
    },
    Button {
        press: ButtonPress,
        touched_at: Instant,
        repeat_count: u32,
    },
}

impl DeferredEvent {
    fn same_scene_key(&self, call: &SceneCall) -> bool {
        match self {
            Self::Scene { call: pending, .. } => {
                pending.source == call.source
                    && pending.zone == call.zone
                    && pending.group == call.group
                    && (call.origin_device == 0 || pending.origin_device == call.origin_device)
            }
            Self::Button { .. } => false,
        }
    }

    fn exact_scene_key(&self, call: &SceneCall) -> bool {
        matches!(self, Self::Scene { call: pending, .. }
            if pending.source == call.source
                && pending.zone == call.zone
                && pending.group == call.group
                && pending.origin_device == call.origin_device)
    }

    fn same_button_key(&self, press: &ButtonPress) -> bool {
        matches!(self, Self::Button { press: pending, .. }
            if pending.source == press.source
                && pending.device == press.device
                && pending.button_index == press.button_index)
    }

    /// Emit what a forced expiry of this entry has to report, if anything.
    fn flush(self) -> Option<Fired> {
        match self {
            Self::Scene { fired: true, .. } => None,
            Self::Scene { call, .. } => Some(Fired::Scene(call)),
            Self::Button {
                press,
                repeat_count,
                ..
            } => Some(button_fired(press, repeat_count)),
        }
    }
}

fn button_fired(press: ButtonPress, repeat_count: u32) -> Fired {
    Fired::Button {
        press,
        hold_count: (repeat_count > 0).then_some(repeat_count),
    }
}

// ── Coalescer ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Coalescer {
    scene_window: Duration,
    button_window: Duration,
    pending: Vec<DeferredEvent>,
}

impl Coalescer {
    pub fn new(scene_window: Duration, button_window: Duration) -> Self {
        Self {
            scene_window,
            button_window,
            pending: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed a raw scene call. Returns events that became final as a
    /// direct consequence (flushed entries and passthrough calls).
    pub fn on_scene(&mut self, call: SceneCall, now: Instant) -> Vec<Fired> {
        let family = scene::family(call.scene);
        let passthrough = match family {
            SceneFamily::Other => true,
            SceneFamily::TipSequence => call.source.is_null() || call.group.is_broadcast(),
            SceneFamily::Dimming => false,
        };

        if passthrough {
            trace!(scene = call.scene, zone = %call.zone, group = %call.group, "scene passthrough");
            let mut fired = self.flush_where(|e| {
                matches!(e, DeferredEvent::Scene { call: p, .. }
                    if p.source == call.source && p.origin_device == call.origin_device)
            });
            fired.push(Fired::Scene(call));
            return fired;
        }

        let matching = self.pending.iter_mut().find(|e| e.same_scene_key(&call));
        if let Some(DeferredEvent::Scene {
            call: pending,
            touched_at,
            fired,
        }) = matching
        {
            let pending_family = scene::family(pending.scene);
            match family {
                SceneFamily::Dimming
                    if pending_family == SceneFamily::Dimming && pending.scene == call.scene =>
                {
                    *touched_at = now;
                    return Vec::new();
                }
                SceneFamily::TipSequence
                    if pending_family == SceneFamily::TipSequence
                        && !*fired
                        && (pending.scene == call.scene
                            || scene::is_successor(pending.scene, call.scene)) =>
                {
                    trace!(from = pending.scene, to = call.scene, "scene refined in place");
                    pending.scene = call.scene;
                    pending.forced |= call.forced;
                    pending.token = call.token;
                    return Vec::new();
                }
                _ => {}
            }
        }

        let fired = self.flush_where(|e| e.exact_scene_key(&call));
        self.pending.push(DeferredEvent::Scene {
            call,
            touched_at: now,
            fired: false,
        });
        fired
    }

    /// Feed a raw button click.
    pub fn on_button(&mut self, press: ButtonPress, now: Instant) -> Vec<Fired> {
        if press.source.is_null() {
            return vec![button_fired(press, 0)];
        }

        let matching = self.pending.iter_mut().find(|e| e.same_button_key(&press));
        if let Some(DeferredEvent::Button {
            press: pending,
            touched_at,
            repeat_count,
        }) = matching
        {
            let merged = match (pending.click, press.click) {
                (ClickType::HoldStart | ClickType::HoldRepeat, ClickType::HoldRepeat)
                | (ClickType::HoldStart | ClickType::HoldRepeat, ClickType::HoldEnd) => {
                    *repeat_count += 1;
                    true
                }
                (current, incoming) => current.is_upgraded_by(incoming),
            };
            if merged {
                pending.click = press.click;
                *touched_at = now;
                return Vec::new();
            }
        }

        let fired = self.flush_where(|e| e.same_button_key(&press));
        self.pending.push(DeferredEvent::Button {
            press,
            touched_at: now,
            repeat_count: 0,
        });
        fired
    }

    /// Evaluate every pending entry against `now`.
    ///
    /// Tip-sequence entries fire once their window elapses and are
    /// dropped. Dimming entries fire on the first sweep after they were
    /// opened and stay alive until their window elapses without a tick.
    /// Button entries fire when due or when the hold has ended.
    pub fn sweep(&mut self, now: Instant) -> Vec<Fired> {
        let mut out = Vec::new();
        let scene_window = self.scene_window;
        let button_window = self.button_window;

        self.pending.retain_mut(|entry| match entry {
            DeferredEvent::Scene {
                call,
                touched_at,
                fired,
            } => {
                let due = now.saturating_duration_since(*touched_at) >= scene_window;
                if scene::is_dim_sequence(call.scene) {
                    if !*fired {
                        out.push(Fired::Scene(*call));
                        *fired = true;
                    }
                    !due
                } else if due {
                    if !*fired {
                        out.push(Fired::Scene(*call));
                    }
                    false
                } else {
                    true
                }
            }
            DeferredEvent::Button {
                press,
                touched_at,
                repeat_count,
            } => {
                let due = now.saturating_duration_since(*touched_at) >= button_window
                    || press.click == ClickType::HoldEnd;
                if due {
                    out.push(button_fired(*press, *repeat_count));
                }
                !due
            }
        });
        out
    }

    /// Earliest instant at which `sweep` may release something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|entry| match entry {
                DeferredEvent::Scene {
                    call,
                    touched_at,
                    fired,
                } => {
                    if scene::is_dim_sequence(call.scene) && !*fired {
                        *touched_at
                    } else {
                        *touched_at + self.scene_window
                    }
                }
                DeferredEvent::Button {
                    press, touched_at, ..
                } => {
                    if press.click == ClickType::HoldEnd {
                        *touched_at
                    } else {
                        *touched_at + self.button_window
                    }
                }
            })
            .min()
    }

    /// Force-expire everything, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<Fired> {
        self.pending
            .drain(..)
            .filter_map(DeferredEvent::flush)
            .collect()
    }

    fn flush_where(&mut self, pred: impl Fn(&DeferredEvent) -> bool) -> Vec<Fired> {
        let (flushed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|e| pred(e));
        self.pending = kept;
        flushed.into_iter().filter_map(DeferredEvent::flush).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{DEC, INC, OFF_A1, ON_A1, SCENE_1, SCENE_2, SCENE_3, STOP};
    use pretty_assertions::assert_eq;

    const WINDOW: Duration = Duration::from_secs(2);
    const NODE: Dsuid = Dsuid::new(0xa);

    fn coalescer() -> Coalescer {
        Coalescer::new(WINDOW, WINDOW)
    }

    fn call(scene: u8) -> SceneCall {
        SceneCall {
            source: NODE,
            zone: ZoneId(1),
            group: GroupId(1),
            origin_device: 7,
            scene,
            origin: 0,
            forced: false,
            token: 0,
        }
    }

    fn press(click: ClickType) -> ButtonPress {
        ButtonPress {
            source: NODE,
            device: 12,
            button_index: 0,
            click,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn area_off_followed_by_second_press_fires_once() {
        let mut c = coalescer();
        let t0 = Instant::now();
        assert!(c.on_scene(call(OFF_A1), t0).is_empty());
        assert!(c.on_scene(call(SCENE_2), t0 + ms(300)).is_empty());
        assert!(c.sweep(t0 + ms(500)).is_empty());

        let fired = c.sweep(t0 + ms(300) + WINDOW);
        assert_eq!(fired, vec![Fired::Scene(call(SCENE_2))]);
        assert!(c.is_idle());
    }

    #[test]
    fn tip_sequence_reports_the_last_code() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(SCENE_1), t0);
        c.on_scene(call(SCENE_2), t0 + ms(200));
        c.on_scene(call(SCENE_3), t0 + ms(400));
        let fired = c.sweep(t0 + ms(400) + WINDOW);
        assert_eq!(fired, vec![Fired::Scene(call(SCENE_3))]);
    }

    #[test]
    fn refinement_keeps_the_first_deadline() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(SCENE_1), t0);
        assert!(c.sweep(t0 + ms(1500)).is_empty());
        assert!(c.on_scene(call(SCENE_2), t0 + ms(1500)).is_empty());
        assert_eq!(c.next_deadline(), Some(t0 + WINDOW));

        let fired = c.sweep(t0 + ms(2100));
        assert_eq!(fired, vec![Fired::Scene(call(SCENE_2))]);
    }

    #[test]
    fn unrelated_tip_code_flushes_the_pending_entry() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(ON_A1), t0);
        let fired = c.on_scene(call(SCENE_3), t0 + ms(100));
        assert_eq!(fired, vec![Fired::Scene(call(ON_A1))]);
        assert_eq!(c.pending_count(), 1);
    }

    #[test]
    fn dimming_fires_on_first_tick_and_retires_after_silence() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(INC), t0);
        assert_eq!(c.sweep(t0), vec![Fired::Scene(call(INC))]);

        for i in 1..10 {
            assert!(c.on_scene(call(INC), t0 + ms(i * 100)).is_empty());
            assert!(c.sweep(t0 + ms(i * 100)).is_empty());
        }
        assert_eq!(c.pending_count(), 1);
        assert!(c.sweep(t0 + ms(900) + WINDOW).is_empty());
        assert!(c.is_idle());
    }

    #[test]
    fn direction_change_while_dimming_opens_a_new_entry() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(INC), t0);
        c.sweep(t0);
        assert!(c.on_scene(call(DEC), t0 + ms(100)).is_empty());
        assert_eq!(c.sweep(t0 + ms(100)), vec![Fired::Scene(call(DEC))]);
    }

    #[test]
    fn passthrough_codes_emit_immediately() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(SCENE_1), t0);
        let fired = c.on_scene(call(STOP), t0 + ms(50));
        assert_eq!(
            fired,
            vec![Fired::Scene(call(SCENE_1)), Fired::Scene(call(STOP))]
        );
        assert!(c.is_idle());
    }

    #[test]
    fn loopback_and_broadcast_calls_pass_through() {
        let mut c = coalescer();
        let t0 = Instant::now();
        let mut loopback = call(SCENE_1);
        loopback.source = Dsuid::NULL;
        assert_eq!(c.on_scene(loopback, t0).len(), 1);

        let mut broadcast = call(SCENE_1);
        broadcast.group = GroupId::BROADCAST;
        assert_eq!(c.on_scene(broadcast, t0).len(), 1);
        assert!(c.is_idle());
    }

    #[test]
    fn hold_sequence_reports_hold_count() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_button(press(ClickType::HoldStart), t0);
        c.on_button(press(ClickType::HoldRepeat), t0 + ms(500));
        c.on_button(press(ClickType::HoldRepeat), t0 + ms(1000));
        assert!(c.sweep(t0 + ms(1100)).is_empty());
        c.on_button(press(ClickType::HoldEnd), t0 + ms(1200));

        let fired = c.sweep(t0 + ms(1200));
        assert_eq!(
            fired,
            vec![Fired::Button {
                press: press(ClickType::HoldEnd),
                hold_count: Some(3),
            }]
        );
    }

    #[test]
    fn click_upgrades_in_place() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_button(press(ClickType::Tip1), t0);
        c.on_button(press(ClickType::Tip2), t0 + ms(300));
        c.on_button(press(ClickType::Tip3), t0 + ms(600));
        let fired = c.sweep(t0 + ms(600) + WINDOW);
        assert_eq!(
            fired,
            vec![Fired::Button {
                press: press(ClickType::Tip3),
                hold_count: None,
            }]
        );
    }

    #[test]
    fn downgrade_flushes_previous_click() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_button(press(ClickType::Tip2), t0);
        let fired = c.on_button(press(ClickType::Tip1), t0 + ms(100));
        assert_eq!(fired.len(), 1);
        assert_eq!(c.pending_count(), 1);
    }

    #[test]
    fn next_deadline_tracks_the_earliest_entry() {
        let mut c = coalescer();
        let t0 = Instant::now();
        assert!(c.next_deadline().is_none());
        c.on_scene(call(SCENE_1), t0);
        c.on_button(press(ClickType::Tip1), t0 + ms(500));
        assert_eq!(c.next_deadline(), Some(t0 + WINDOW));
    }

    #[test]
    fn drain_releases_unfired_entries() {
        let mut c = coalescer();
        let t0 = Instant::now();
        c.on_scene(call(INC), t0);
        c.sweep(t0);
        c.on_scene(call(SCENE_1), t0);
        let mut other = call(SCENE_1);
        other.group = GroupId(2);
        c.on_scene(other, t0);
        assert_eq!(c.drain().len(), 2);
        assert!(c.is_idle());
    }
}
