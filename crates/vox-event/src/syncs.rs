//! Game Syncs: States, Switches and RTPCs
//!
//! Wwise-style global states, per-object switches and real-time parameters
//! that feed parameter resolution on the audio thread.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use vox_core::{FadeCurve, GameObjectId, INVALID_GAME_OBJECT};

// ═══════════════════════════════════════════════════════════════════════════════
// STATE GROUP
// ═══════════════════════════════════════════════════════════════════════════════

/// State group definition
///
/// States are global; one state per group is active at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateGroup {
    pub id: u32,
    pub name: String,
    /// Available states (id → name)
    pub states: HashMap<u32, String>,
    pub default_state: u32,
    /// Property transition time when the state changes (ms)
    pub transition_ms: f32,
}

impl StateGroup {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            states: HashMap::new(),
            default_state: 0,
            transition_ms: 0.0,
        }
    }

    /// Add a state; the first one becomes the default
    pub fn add_state(&mut self, state_id: u32, name: impl Into<String>) {
        self.states.insert(state_id, name.into());
        if self.states.len() == 1 {
            self.default_state = state_id;
        }
    }

    pub fn with_state(mut self, state_id: u32, name: impl Into<String>) -> Self {
        self.add_state(state_id, name);
        self
    }

    pub fn with_transition_ms(mut self, ms: f32) -> Self {
        self.transition_ms = ms.max(0.0);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SWITCH GROUP
// ═══════════════════════════════════════════════════════════════════════════════

/// Switch group definition; switches are set per game object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchGroup {
    pub id: u32,
    pub name: String,
    pub switches: HashMap<u32, String>,
    pub default_switch: u32,
}

impl SwitchGroup {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            switches: HashMap::new(),
            default_switch: 0,
        }
    }

    pub fn add_switch(&mut self, switch_id: u32, name: impl Into<String>) {
        self.switches.insert(switch_id, name.into());
        if self.switches.len() == 1 {
            self.default_switch = switch_id;
        }
    }

    pub fn with_switch(mut self, switch_id: u32, name: impl Into<String>) -> Self {
        self.add_switch(switch_id, name);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RTPC DEFINITION
// ═══════════════════════════════════════════════════════════════════════════════

/// RTPC (game parameter) definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpcDefinition {
    pub id: u32,
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl RtpcDefinition {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            min: 0.0,
            max: 1.0,
            default: 0.0,
        }
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_default(mut self, default: f32) -> Self {
        self.default = default;
        self
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min.min(self.max), self.max.max(self.min))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RTPC CURVE
// ═══════════════════════════════════════════════════════════════════════════════

/// RTPC curve point: RTPC value (x) → property offset (y)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RtpcCurvePoint {
    pub x: f32,
    pub y: f32,
    /// Shape of the segment towards the next point
    pub shape: FadeCurve,
}

/// Piecewise RTPC mapping curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpcCurve {
    /// Points sorted by `x`
    pub points: Vec<RtpcCurvePoint>,
}

impl RtpcCurve {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Straight line from `(x0, y0)` to `(x1, y1)`
    pub fn linear(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        let mut curve = Self::new();
        curve.add_point(x0, y0, FadeCurve::Linear);
        curve.add_point(x1, y1, FadeCurve::Linear);
        curve
    }

    pub fn add_point(&mut self, x: f32, y: f32, shape: FadeCurve) {
        self.points.push(RtpcCurvePoint { x, y, shape });
        self.points.sort_by(|a, b| a.x.total_cmp(&b.x));
    }

    /// Evaluate the curve, clamping outside its range
    pub fn evaluate(&self, x: f32) -> f32 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return 0.0;
        };
        if x <= first.x {
            return first.y;
        }
        if x >= last.x {
            return last.y;
        }

        for pair in self.points.windows(2) {
            let (p0, p1) = (&pair[0], &pair[1]);
            if x >= p0.x && x <= p1.x {
                let span = p1.x - p0.x;
                if span <= f32::EPSILON {
                    return p1.y;
                }
                let t = (x - p0.x) / span;
                return p0.shape.interpolate(p0.y, p1.y, t);
            }
        }
        last.y
    }
}

impl Default for RtpcCurve {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RTPC VALUE (with interpolation state)
// ═══════════════════════════════════════════════════════════════════════════════

/// RTPC value ramping linearly to its target over a number of samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtpcValue {
    pub current: f32,
    pub target: f32,
    remaining_frames: u64,
}

impl RtpcValue {
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            remaining_frames: 0,
        }
    }

    pub fn set_target(&mut self, target: f32, interpolation_frames: u64) {
        self.target = target;
        self.remaining_frames = interpolation_frames;
        if interpolation_frames == 0 {
            self.current = target;
        }
    }

    pub fn update(&mut self, frames: u64) {
        if self.remaining_frames == 0 || frames >= self.remaining_frames {
            self.current = self.target;
            self.remaining_frames = 0;
            return;
        }
        let step = frames as f32 / self.remaining_frames as f32;
        self.current += (self.target - self.current) * step;
        self.remaining_frames -= frames;
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        self.remaining_frames == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GAME SYNCS (audio thread view)
// ═══════════════════════════════════════════════════════════════════════════════

/// Current state/switch/RTPC values
#[derive(Debug, Default)]
pub struct GameSyncs {
    state_groups: HashMap<u32, StateGroup>,
    switch_groups: HashMap<u32, SwitchGroup>,
    rtpc_definitions: HashMap<u32, RtpcDefinition>,
    current_states: HashMap<u32, u32>,
    current_switches: HashMap<(GameObjectId, u32), u32>,
    global_rtpcs: HashMap<u32, RtpcValue>,
    object_rtpcs: HashMap<(GameObjectId, u32), RtpcValue>,
}

impl GameSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_state_group(&mut self, group: StateGroup) {
        self.state_groups.insert(group.id, group);
    }

    pub fn register_switch_group(&mut self, group: SwitchGroup) {
        self.switch_groups.insert(group.id, group);
    }

    pub fn register_rtpc(&mut self, rtpc: RtpcDefinition) {
        self.rtpc_definitions.insert(rtpc.id, rtpc);
    }

    pub fn state_group(&self, group_id: u32) -> Option<&StateGroup> {
        self.state_groups.get(&group_id)
    }

    /// Set a state; returns the previous state when it changed
    pub fn set_state(&mut self, group_id: u32, state_id: u32) -> Option<u32> {
        let previous = self.state(group_id);
        if previous == state_id {
            return None;
        }
        self.current_states.insert(group_id, state_id);
        Some(previous)
    }

    /// Current state, falling back to the group default
    pub fn state(&self, group_id: u32) -> u32 {
        self.current_states.get(&group_id).copied().unwrap_or_else(|| {
            self.state_groups
                .get(&group_id)
                .map_or(0, |g| g.default_state)
        })
    }

    pub fn set_switch(&mut self, game_object: GameObjectId, group_id: u32, switch_id: u32) {
        self.current_switches
            .insert((game_object, group_id), switch_id);
    }

    /// Switch for a game object, falling back to the group default
    pub fn switch(&self, game_object: GameObjectId, group_id: u32) -> u32 {
        self.current_switches
            .get(&(game_object, group_id))
            .copied()
            .unwrap_or_else(|| {
                self.switch_groups
                    .get(&group_id)
                    .map_or(0, |g| g.default_switch)
            })
    }

    fn rtpc_default(&self, rtpc_id: u32) -> f32 {
        self.rtpc_definitions
            .get(&rtpc_id)
            .map_or(0.0, |d| d.default)
    }

    /// Set an RTPC globally (`INVALID_GAME_OBJECT`) or on one object
    pub fn set_rtpc(
        &mut self,
        rtpc_id: u32,
        value: f32,
        game_object: GameObjectId,
        interpolation_frames: u64,
    ) {
        let value = self
            .rtpc_definitions
            .get(&rtpc_id)
            .map_or(value, |d| d.clamp(value));
        let start = self.rtpc(rtpc_id, game_object);
        let entry = if game_object == INVALID_GAME_OBJECT {
            self.global_rtpcs
                .entry(rtpc_id)
                .or_insert_with(|| RtpcValue::new(start))
        } else {
            self.object_rtpcs
                .entry((game_object, rtpc_id))
                .or_insert_with(|| RtpcValue::new(start))
        };
        entry.set_target(value, interpolation_frames);
    }

    /// Reset an RTPC to its default
    pub fn reset_rtpc(&mut self, rtpc_id: u32, game_object: GameObjectId, interpolation_frames: u64) {
        let default = self.rtpc_default(rtpc_id);
        let entry = if game_object == INVALID_GAME_OBJECT {
            self.global_rtpcs.get_mut(&rtpc_id)
        } else {
            self.object_rtpcs.get_mut(&(game_object, rtpc_id))
        };
        if let Some(value) = entry {
            value.set_target(default, interpolation_frames);
        }
    }

    /// Effective RTPC value: object override, then global, then default
    pub fn rtpc(&self, rtpc_id: u32, game_object: GameObjectId) -> f32 {
        if game_object != INVALID_GAME_OBJECT {
            if let Some(v) = self.object_rtpcs.get(&(game_object, rtpc_id)) {
                return v.current;
            }
        }
        self.global_rtpcs
            .get(&rtpc_id)
            .map_or_else(|| self.rtpc_default(rtpc_id), |v| v.current)
    }

    /// Advance RTPC interpolations
    pub fn update(&mut self, frames: u64) {
        for v in self.global_rtpcs.values_mut() {
            v.update(frames);
        }
        for v in self.object_rtpcs.values_mut() {
            v.update(frames);
        }
    }

    /// Forget everything tied to a game object
    pub fn unregister_game_object(&mut self, game_object: GameObjectId) {
        self.current_switches.retain(|(go, _), _| *go != game_object);
        self.object_rtpcs.retain(|(go, _), _| *go != game_object);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_state_defaults_and_changes() {
        let mut syncs = GameSyncs::new();
        syncs.register_state_group(
            StateGroup::new(1, "GameState")
                .with_state(10, "Menu")
                .with_state(11, "Playing"),
        );
        assert_eq!(syncs.state(1), 10);
        assert_eq!(syncs.set_state(1, 11), Some(10));
        assert_eq!(syncs.set_state(1, 11), None, "no change, no transition");
        assert_eq!(syncs.state(1), 11);
    }

    #[test]
    fn test_switch_per_object() {
        let mut syncs = GameSyncs::new();
        syncs.register_switch_group(
            SwitchGroup::new(2, "Surface")
                .with_switch(1, "Grass")
                .with_switch(2, "Stone"),
        );
        syncs.set_switch(100, 2, 2);
        assert_eq!(syncs.switch(100, 2), 2);
        assert_eq!(syncs.switch(200, 2), 1);

        syncs.unregister_game_object(100);
        assert_eq!(syncs.switch(100, 2), 1);
    }

    #[test]
    fn test_rtpc_interpolation_and_override() {
        let mut syncs = GameSyncs::new();
        syncs.register_rtpc(RtpcDefinition::new(5, "Speed").with_range(0.0, 100.0).with_default(10.0));
        assert_eq!(syncs.rtpc(5, 0), 10.0);

        syncs.set_rtpc(5, 50.0, INVALID_GAME_OBJECT, 1000);
        syncs.update(500);
        assert_relative_eq!(syncs.rtpc(5, 0), 30.0, epsilon = 1e-4);
        syncs.update(500);
        assert_eq!(syncs.rtpc(5, 0), 50.0);

        syncs.set_rtpc(5, 500.0, 9, 0);
        assert_eq!(syncs.rtpc(5, 9), 100.0, "clamped to definition range");
        assert_eq!(syncs.rtpc(5, 8), 50.0, "other objects see the global value");

        syncs.reset_rtpc(5, 9, 0);
        assert_eq!(syncs.rtpc(5, 9), 10.0);
    }

    #[test]
    fn test_rtpc_curve_shapes() {
        let mut curve = RtpcCurve::linear(0.0, 0.0, 100.0, -24.0);
        assert_eq!(curve.evaluate(-5.0), 0.0);
        assert_eq!(curve.evaluate(200.0), -24.0);
        assert_relative_eq!(curve.evaluate(50.0), -12.0, epsilon = 1e-4);

        curve.add_point(50.0, -6.0, FadeCurve::Constant);
        assert_relative_eq!(curve.evaluate(25.0), -3.0, epsilon = 1e-4);
        assert_eq!(curve.evaluate(75.0), -6.0, "constant holds start of segment");
        assert!(RtpcCurve::new().evaluate(1.0) == 0.0);
    }
}
