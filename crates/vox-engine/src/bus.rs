//! Bus data
//!
//! Buses form their own tree, separate from the playable-node tree. Each bus
//! keeps the playable nodes routed to it (leaves), its ducking targets and
//! the duck offsets other buses currently apply to it.
//!
//! ```text
//!            Master (top-level, always mixing)
//!            ├── Music   ◀──── ducked by Dialogue (-12 dB)
//!            │   └── leaves: [music_loop]
//!            └── Dialogue ──── duck_targets: [Music]
//!                └── leaves: [vo_line_1, vo_line_2]
//! ```

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

use vox_core::{FadeCurve, NodeId};

// ═══════════════════════════════════════════════════════════════════════════════
// DUCKING TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Which volume a duck offset is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DuckScope {
    /// Voice volume of everything routed through the target
    #[default]
    Voice = 0,
    /// The target bus's own mix volume
    Bus = 1,
}

impl DuckScope {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => DuckScope::Bus,
            _ => DuckScope::Voice,
        }
    }
}

/// Ducking state of a source bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DuckState {
    #[default]
    Off = 0,
    On = 1,
    /// Last voice stopped; waiting for the recovery delay
    Pending = 2,
}

/// One bus ducked by this bus
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DuckTarget {
    pub target: NodeId,
    /// Offset applied while ducking (dB, <= 0)
    pub duck_db: f32,
    /// Time to reach the duck offset (ms)
    pub fade_in_ms: f32,
    /// Time to return to zero once ducking ends (ms)
    pub fade_out_ms: f32,
    pub curve: FadeCurve,
    pub scope: DuckScope,
}

impl DuckTarget {
    pub fn new(target: NodeId, duck_db: f32) -> Self {
        Self {
            target,
            duck_db: duck_db.min(0.0),
            fade_in_ms: 0.0,
            fade_out_ms: 0.0,
            curve: FadeCurve::Linear,
            scope: DuckScope::Voice,
        }
    }

    pub fn with_fades(mut self, fade_in_ms: f32, fade_out_ms: f32) -> Self {
        self.fade_in_ms = fade_in_ms.max(0.0);
        self.fade_out_ms = fade_out_ms.max(0.0);
        self
    }

    pub fn with_curve(mut self, curve: FadeCurve) -> Self {
        self.curve = curve;
        self
    }

    pub fn with_scope(mut self, scope: DuckScope) -> Self {
        self.scope = scope;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIXING ATTRIBUTES
// ═══════════════════════════════════════════════════════════════════════════════

/// Panner configured on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum PannerType {
    #[default]
    Default = 0,
    Direct = 1,
    Balance = 2,
}

impl PannerType {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => PannerType::Direct,
            2 => PannerType::Balance,
            _ => PannerType::Default,
        }
    }
}

/// Send from a bus to an auxiliary bus
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuxSend {
    pub bus: NodeId,
    pub level_db: f32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUS DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// Bus-specific node data
#[derive(Debug, Clone, Default)]
pub struct BusData {
    /// Playable nodes routed directly to this bus
    pub leaves: Vec<NodeId>,
    /// Effect plugin ids in insert order
    pub effects: SmallVec<[u32; 2]>,
    /// Channel configuration (0 = same as parent)
    pub channel_config: u32,
    pub panner: PannerType,
    pub aux_sends: SmallVec<[AuxSend; 2]>,
    pub duck_targets: Vec<DuckTarget>,
    /// Delay between the last voice stopping and un-ducking (ms)
    pub recovery_ms: f32,
    /// Per-bus floor for summed duck offsets; engine default otherwise
    pub max_duck_attenuation_db: Option<f32>,
    pub duck_state: DuckState,
    /// Offsets applied to this bus, per scope, keyed by source bus
    pub ducked: [BTreeMap<NodeId, f32>; 2],
    /// Voices currently playing through this bus (any depth)
    pub active_voices: u32,
    /// Cached mixing predicate
    pub mixing: bool,
}

impl BusData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duck_target(mut self, target: DuckTarget) -> Self {
        self.duck_targets.push(target);
        self
    }

    pub fn with_recovery_ms(mut self, ms: f32) -> Self {
        self.recovery_ms = ms.max(0.0);
        self
    }

    pub fn with_effect(mut self, fx_id: u32) -> Self {
        self.effects.push(fx_id);
        self
    }

    pub fn with_max_duck_attenuation(mut self, db: f32) -> Self {
        self.max_duck_attenuation_db = Some(db.min(0.0));
        self
    }

    /// Summed duck offset for a scope, clamped to the attenuation floor
    pub fn ducked_offset(&self, scope: DuckScope, default_floor: f32) -> f32 {
        let floor = self.max_duck_attenuation_db.unwrap_or(default_floor);
        let sum: f32 = self.ducked[scope as usize].values().sum();
        sum.max(floor)
    }

    pub fn set_duck_offset(&mut self, scope: DuckScope, source: NodeId, value: f32) {
        self.ducked[scope as usize].insert(source, value);
    }

    pub fn duck_offset_from(&self, scope: DuckScope, source: NodeId) -> f32 {
        self.ducked[scope as usize]
            .get(&source)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn remove_duck_source(&mut self, scope: DuckScope, source: NodeId) {
        self.ducked[scope as usize].remove(&source);
    }

    /// Check whether any source currently ducks this bus
    pub fn is_ducked(&self) -> bool {
        self.ducked.iter().any(|m| !m.is_empty())
    }
}

/// Mixing-bus predicate.
///
/// A bus physically mixes its inputs when it processes the signal (effects,
/// channel change, panner, aux sends), carries bus-level RTPCs, or is a
/// top-level bus. Anything else is a pass-through control bus whose
/// volume folds into the voices below it.
pub fn is_mixing_bus(bus: &BusData, has_bus_level_rtpc: bool, is_top_level: bool) -> bool {
    is_top_level
        || !bus.effects.is_empty()
        || bus.channel_config != 0
        || bus.panner != PannerType::Default
        || !bus.aux_sends.is_empty()
        || has_bus_level_rtpc
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
