// ── Scene and click classification ──
//
// Scene numbers and button click codes as they travel on the bus, plus
// the small lookup functions the coalescer uses to decide how a code
// participates in a press sequence.

use serde::{Deserialize, Serialize};
use strum::Display;

// ── Scene numbers ───────────────────────────────────────────────────

pub const OFF: u8 = 0x00;
pub const OFF_A1: u8 = 0x01;
pub const OFF_A2: u8 = 0x02;
pub const OFF_A3: u8 = 0x03;
pub const OFF_A4: u8 = 0x04;
pub const SCENE_1: u8 = 0x05;
pub const ON_A1: u8 = 0x06;
pub const ON_A2: u8 = 0x07;
pub const ON_A3: u8 = 0x08;
pub const ON_A4: u8 = 0x09;
pub const DIM_AREA: u8 = 0x0a;
pub const DEC: u8 = 0x0b;
pub const INC: u8 = 0x0c;
pub const MIN: u8 = 0x0d;
pub const MAX: u8 = 0x0e;
pub const STOP: u8 = 0x0f;
pub const SCENE_2: u8 = 0x11;
pub const SCENE_3: u8 = 0x12;
pub const SCENE_4: u8 = 0x13;
pub const SCENE_12: u8 = 0x14;
pub const SCENE_13: u8 = 0x15;
pub const SCENE_14: u8 = 0x16;
pub const SCENE_22: u8 = 0x17;
pub const SCENE_23: u8 = 0x18;
pub const SCENE_24: u8 = 0x19;
pub const SCENE_32: u8 = 0x1a;
pub const SCENE_33: u8 = 0x1b;
pub const SCENE_34: u8 = 0x1c;
pub const SCENE_42: u8 = 0x1d;
pub const SCENE_43: u8 = 0x1e;
pub const SCENE_44: u8 = 0x1f;
pub const OFF_E1: u8 = 0x20;
pub const ON_E1: u8 = 0x21;
pub const OFF_E2: u8 = 0x22;
pub const ON_E2: u8 = 0x23;
pub const OFF_E3: u8 = 0x24;
pub const ON_E3: u8 = 0x25;
pub const OFF_E4: u8 = 0x26;
pub const ON_E4: u8 = 0x27;
pub const AUTO_OFF: u8 = 0x28;
pub const DEC_A1: u8 = 0x2a;
pub const INC_A1: u8 = 0x2b;
pub const DEC_A2: u8 = 0x2c;
pub const INC_A2: u8 = 0x2d;
pub const DEC_A3: u8 = 0x2e;
pub const INC_A3: u8 = 0x2f;
pub const DEC_A4: u8 = 0x30;
pub const INC_A4: u8 = 0x31;
pub const LOCAL_OFF: u8 = 0x32;
pub const LOCAL_ON: u8 = 0x33;
pub const STOP_A1: u8 = 0x34;
pub const STOP_A2: u8 = 0x35;
pub const STOP_A3: u8 = 0x36;
pub const STOP_A4: u8 = 0x37;
pub const ENERGY_OVERLOAD: u8 = 0x42;
pub const BELL: u8 = 0x49;

pub const MAX_SCENE_NUMBER: u8 = 127;

// ── Classification ──────────────────────────────────────────────────

/// How the coalescer treats a scene code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneFamily {
    /// Numbered short-press codes that may be followed by a longer press.
    TipSequence,
    /// Continuous increase/decrease codes.
    Dimming,
    /// Everything else is reported as-is.
    Other,
}

pub fn family(scene: u8) -> SceneFamily {
    if is_tip_sequence(scene) {
        SceneFamily::TipSequence
    } else if is_dim_sequence(scene) {
        SceneFamily::Dimming
    } else {
        SceneFamily::Other
    }
}

pub fn is_tip_sequence(scene: u8) -> bool {
    matches!(
        scene,
        SCENE_1
            | ON_A1..=ON_A4
            | SCENE_2..=SCENE_44
            | ON_E1
            | ON_E2
            | ON_E3
            | ON_E4
            | OFF..=OFF_A4
            | OFF_E1
            | OFF_E2
            | OFF_E3
            | OFF_E4
    )
}

pub fn is_dim_sequence(scene: u8) -> bool {
    matches!(scene, DIM_AREA | DEC | INC | DEC_A1..=INC_A4)
}

/// Scenes whose call is recorded as "last called" on groups and devices.
pub fn is_remembered(scene: u8) -> bool {
    scene <= MAX_SCENE_NUMBER
        && !matches!(
            scene,
            DIM_AREA
                | DEC
                | INC
                | STOP
                | DEC_A1..=INC_A4
                | LOCAL_OFF
                | LOCAL_ON
                | STOP_A1..=STOP_A4
                | ENERGY_OVERLOAD
                | BELL
        )
}

/// The scene a further press of the same button leads to.
pub fn next_scene(scene: u8) -> u8 {
    match scene {
        OFF => SCENE_1,
        SCENE_1 => SCENE_2,
        SCENE_2 => SCENE_3,
        SCENE_3 => SCENE_4,
        SCENE_4 => SCENE_2,
        ON_E1 | SCENE_14 => SCENE_12,
        SCENE_12 => SCENE_13,
        SCENE_13 => SCENE_14,
        ON_E2 | SCENE_24 => SCENE_22,
        SCENE_22 => SCENE_23,
        SCENE_23 => SCENE_24,
        ON_E3 | SCENE_34 => SCENE_32,
        SCENE_32 => SCENE_33,
        SCENE_33 => SCENE_34,
        ON_E4 | SCENE_44 => SCENE_42,
        SCENE_42 => SCENE_43,
        SCENE_43 => SCENE_44,
        _ => OFF,
    }
}

/// The scene one press earlier in the same sequence.
pub fn previous_scene(scene: u8) -> u8 {
    match scene {
        SCENE_1 => SCENE_4,
        SCENE_2 => SCENE_1,
        SCENE_3 => SCENE_2,
        SCENE_4 => SCENE_3,
        ON_E1 => SCENE_14,
        SCENE_12 => ON_E1,
        SCENE_13 => SCENE_12,
        SCENE_14 => SCENE_13,
        ON_E2 => SCENE_24,
        SCENE_22 => ON_E2,
        SCENE_23 => SCENE_22,
        SCENE_24 => SCENE_23,
        ON_E3 => SCENE_34,
        SCENE_32 => ON_E3,
        SCENE_33 => SCENE_32,
        SCENE_34 => SCENE_33,
        ON_E4 => SCENE_44,
        SCENE_42 => ON_E4,
        SCENE_43 => SCENE_42,
        SCENE_44 => SCENE_43,
        _ => OFF,
    }
}

/// Whether `incoming` refines the pending tip-sequence code `pending`.
pub fn is_successor(pending: u8, incoming: u8) -> bool {
    let through_off = matches!(
        (pending, incoming),
        (OFF, SCENE_2)
            | (OFF_E1, SCENE_12)
            | (OFF_E2, SCENE_22)
            | (OFF_E3, SCENE_32)
            | (OFF_E4, SCENE_42)
    );
    let area_on = matches!(pending, ON_A1..=ON_A4)
        && matches!(incoming, SCENE_2 | SCENE_12 | SCENE_22 | SCENE_32 | SCENE_42);
    let area_off = matches!(pending, OFF_A1..=OFF_A4) && (SCENE_2..=SCENE_44).contains(&incoming);

    // Both tables fall back to OFF for codes outside a sequence; such
    // fallbacks are not transitions.
    let follows = (pending != OFF && previous_scene(incoming) == pending)
        || (incoming != OFF && next_scene(pending) == incoming);

    through_off || area_on || area_off || follows
}

// ── Click types ─────────────────────────────────────────────────────

/// Button click code reported with a button event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ClickType {
    #[strum(serialize = "1T")]
    Tip1,
    #[strum(serialize = "2T")]
    Tip2,
    #[strum(serialize = "3T")]
    Tip3,
    #[strum(serialize = "4T")]
    Tip4,
    #[strum(serialize = "HS")]
    HoldStart,
    #[strum(serialize = "HR")]
    HoldRepeat,
    #[strum(serialize = "HE")]
    HoldEnd,
    #[strum(serialize = "1C")]
    Click1,
    #[strum(serialize = "2C")]
    Click2,
    #[strum(serialize = "3C")]
    Click3,
    #[strum(serialize = "1P")]
    ShortLong,
    #[strum(serialize = "L0")]
    LocalOff,
    #[strum(serialize = "L1")]
    LocalOn,
    #[strum(serialize = "2P")]
    ShortShortLong,
    #[strum(serialize = "LS")]
    LocalStop,
    #[strum(serialize = "?")]
    Other(u8),
}

impl ClickType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Tip1,
            0x01 => Self::Tip2,
            0x02 => Self::Tip3,
            0x03 => Self::Tip4,
            0x04 => Self::HoldStart,
            0x05 => Self::HoldRepeat,
            0x06 => Self::HoldEnd,
            0x07 => Self::Click1,
            0x08 => Self::Click2,
            0x09 => Self::Click3,
            0x0a => Self::ShortLong,
            0x0b => Self::LocalOff,
            0x0c => Self::LocalOn,
            0x0d => Self::ShortShortLong,
            0x0e => Self::LocalStop,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Tip1 => 0x00,
            Self::Tip2 => 0x01,
            Self::Tip3 => 0x02,
            Self::Tip4 => 0x03,
            Self::HoldStart => 0x04,
            Self::HoldRepeat => 0x05,
            Self::HoldEnd => 0x06,
            Self::Click1 => 0x07,
            Self::Click2 => 0x08,
            Self::Click3 => 0x09,
            Self::ShortLong => 0x0a,
            Self::LocalOff => 0x0b,
            Self::LocalOn => 0x0c,
            Self::ShortShortLong => 0x0d,
            Self::LocalStop => 0x0e,
            Self::Other(code) => code,
        }
    }

    pub fn is_holding(self) -> bool {
        matches!(self, Self::HoldStart | Self::HoldRepeat)
    }

    /// Whether `incoming` is a more specific reading of the same press
    /// sequence than `self`.
    pub fn is_upgraded_by(self, incoming: Self) -> bool {
        matches!(
            (self, incoming),
            (Self::Tip1, Self::Tip2)
                | (Self::Tip2, Self::Tip3)
                | (Self::Tip3, Self::Tip4)
                | (Self::Click1 | Self::Click2, Self::Click3)
                | (Self::Click1, Self::Tip2 | Self::Tip3)
                | (Self::Click2, Self::Tip3)
                | (Self::Click3, Self::Tip4)
                | (Self::Click1, Self::ShortLong)
                | (Self::Click2, Self::ShortShortLong)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families() {
        assert_eq!(family(SCENE_1), SceneFamily::TipSequence);
        assert_eq!(family(OFF_A3), SceneFamily::TipSequence);
        assert_eq!(family(SCENE_33), SceneFamily::TipSequence);
        assert_eq!(family(INC), SceneFamily::Dimming);
        assert_eq!(family(INC_A4), SceneFamily::Dimming);
        assert_eq!(family(STOP), SceneFamily::Other);
        assert_eq!(family(MAX), SceneFamily::Other);
        assert_eq!(family(LOCAL_OFF), SceneFamily::Other);
    }

    #[test]
    fn sequence_tables_are_inverse_inside_a_family() {
        for scene in [SCENE_2, SCENE_3, SCENE_4, SCENE_13, SCENE_14, SCENE_23, SCENE_44] {
            assert_eq!(next_scene(previous_scene(scene)), scene, "scene {scene:#x}");
        }
        assert_eq!(next_scene(OFF), SCENE_1);
        assert_eq!(next_scene(ON_E3), SCENE_32);
        assert_eq!(previous_scene(SCENE_42), ON_E4);
        assert_eq!(next_scene(STOP), OFF);
    }

    #[test]
    fn successors() {
        assert!(is_successor(OFF_A1, SCENE_2));
        assert!(is_successor(OFF_A2, SCENE_34));
        assert!(is_successor(ON_A3, SCENE_32));
        assert!(is_successor(OFF, SCENE_2));
        assert!(is_successor(OFF_E2, SCENE_22));
        assert!(is_successor(SCENE_1, SCENE_2));
        assert!(is_successor(SCENE_3, SCENE_4));
        assert!(!is_successor(SCENE_2, SCENE_1));
        assert!(!is_successor(OFF_A1, OFF));
    }

    #[test]
    fn remembered_scenes_exclude_dimming_and_local() {
        assert!(is_remembered(SCENE_2));
        assert!(is_remembered(OFF));
        assert!(!is_remembered(INC));
        assert!(!is_remembered(STOP_A2));
        assert!(!is_remembered(LOCAL_ON));
        assert!(!is_remembered(BELL));
        assert!(!is_remembered(200));
    }

    #[test]
    fn click_codes() {
        for code in 0..=0x0e {
            assert_eq!(ClickType::from_code(code).code(), code);
        }
        assert_eq!(ClickType::from_code(0x42), ClickType::Other(0x42));
        assert_eq!(ClickType::Tip3.to_string(), "3T");
        assert!(ClickType::Click1.is_upgraded_by(ClickType::Tip3));
        assert!(ClickType::Click2.is_upgraded_by(ClickType::ShortShortLong));
        assert!(!ClickType::Tip2.is_upgraded_by(ClickType::Tip1));
    }
}
