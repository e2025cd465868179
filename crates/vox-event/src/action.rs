//! Action Types
//!
//! Typed descriptors for everything the control thread can ask of the audio
//! thread. An action names a target node (or a playing ID through its record),
//! an optional delay, and an optional transition.

use serde::{Deserialize, Serialize};
use vox_core::{FadeCurve, GameObjectId, NodeId, PlayingId, TimeBase};

// ═══════════════════════════════════════════════════════════════════════════════
// ACTION TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Action type; the discriminant doubles as the command ring record tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActionType {
    /// Play a node
    #[default]
    Play = 0,
    /// Play the next element of a continuous container chain
    PlayAndContinue = 1,
    /// Stop voices (or pending plays) matching the target
    Stop = 2,
    /// Pause voices and pending actions
    Pause = 3,
    /// Resume voices and pending actions
    Resume = 4,
    /// Finish the current loop and refuse further continuation
    Break = 5,
    /// Silence a node for a game object (or globally)
    Mute = 6,
    /// Undo a mute
    Unmute = 7,
    /// Set RTPC value
    SetRtpc = 8,
    /// Reset RTPC to default
    ResetRtpc = 9,
    /// Set switch group value for a game object
    SetSwitch = 10,
    /// Set state group value
    SetState = 11,
    /// Seek playing voices
    Seek = 12,
    /// Internal: end a bus's ducking recovery period
    DuckRecovery = 13,
}

impl ActionType {
    /// Convert from u8 index; unknown tags are rejected
    #[inline]
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => ActionType::Play,
            1 => ActionType::PlayAndContinue,
            2 => ActionType::Stop,
            3 => ActionType::Pause,
            4 => ActionType::Resume,
            5 => ActionType::Break,
            6 => ActionType::Mute,
            7 => ActionType::Unmute,
            8 => ActionType::SetRtpc,
            9 => ActionType::ResetRtpc,
            10 => ActionType::SetSwitch,
            11 => ActionType::SetState,
            12 => ActionType::Seek,
            13 => ActionType::DuckRecovery,
            _ => return None,
        })
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ActionType::Play => "Play",
            ActionType::PlayAndContinue => "PlayAndContinue",
            ActionType::Stop => "Stop",
            ActionType::Pause => "Pause",
            ActionType::Resume => "Resume",
            ActionType::Break => "Break",
            ActionType::Mute => "Mute",
            ActionType::Unmute => "Unmute",
            ActionType::SetRtpc => "SetRTPC",
            ActionType::ResetRtpc => "ResetRTPC",
            ActionType::SetSwitch => "SetSwitch",
            ActionType::SetState => "SetState",
            ActionType::Seek => "Seek",
            ActionType::DuckRecovery => "DuckRecovery",
        }
    }

    /// Check if this action starts a voice
    #[inline]
    pub fn is_play_action(&self) -> bool {
        matches!(self, ActionType::Play | ActionType::PlayAndContinue)
    }

    /// Internal actions are never paused or cleared by user filters
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, ActionType::DuckRecovery)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACTION SCOPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Which game objects an action affects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActionScope {
    /// Only the posting game object
    #[default]
    GameObject = 0,
    /// Every game object
    Global = 1,
}

impl ActionScope {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => ActionScope::Global,
            _ => ActionScope::GameObject,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEEK POSITION
// ═══════════════════════════════════════════════════════════════════════════════

/// Seek target; absolute and relative positions are mutually exclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SeekPosition {
    /// Absolute position in samples
    Samples(u64),
    /// Fraction of the source duration (0.0 - 1.0)
    Percent(f32),
}

impl SeekPosition {
    /// Resolve against a source duration
    pub fn to_samples(self, duration_samples: u64) -> u64 {
        match self {
            SeekPosition::Samples(s) => s.min(duration_samples),
            SeekPosition::Percent(p) => {
                (duration_samples as f64 * p.clamp(0.0, 1.0) as f64) as u64
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSITION SPEC
// ═══════════════════════════════════════════════════════════════════════════════

/// Requested fade for an action
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub duration_ms: f32,
    pub curve: FadeCurve,
}

impl TransitionSpec {
    pub const NONE: Self = Self {
        duration_ms: 0.0,
        curve: FadeCurve::Linear,
    };

    pub fn new(duration_ms: f32, curve: FadeCurve) -> Self {
        Self {
            duration_ms: duration_ms.max(0.0),
            curve,
        }
    }

    pub fn samples(&self, time: &TimeBase) -> u64 {
        time.ms_to_samples(self.duration_ms as f64)
    }

    #[inline]
    pub fn is_instant(&self) -> bool {
        self.duration_ms <= 0.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Complete action definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action ID (authoring side; 0 for ad-hoc actions)
    pub id: u32,
    pub action_type: ActionType,
    /// Target node; `NodeId::NONE` means "everything in scope"
    pub target: NodeId,
    pub scope: ActionScope,
    /// Delay before execution (ms)
    pub delay_ms: f32,
    pub transition: TransitionSpec,
    /// Resume clears the whole pause count instead of one level
    pub is_master_resume: bool,
    /// State/switch group
    pub group_id: u32,
    /// State/switch value
    pub value_id: u32,
    pub rtpc_id: u32,
    pub rtpc_value: f32,
    pub seek: Option<SeekPosition>,
}

impl Action {
    pub fn new(action_type: ActionType, target: NodeId) -> Self {
        Self {
            id: 0,
            action_type,
            target,
            scope: ActionScope::GameObject,
            delay_ms: 0.0,
            transition: TransitionSpec::NONE,
            is_master_resume: false,
            group_id: 0,
            value_id: 0,
            rtpc_id: 0,
            rtpc_value: 0.0,
            seek: None,
        }
    }

    pub fn play(target: NodeId) -> Self {
        Self::new(ActionType::Play, target)
    }

    pub fn stop(target: NodeId) -> Self {
        Self::new(ActionType::Stop, target)
    }

    pub fn pause(target: NodeId) -> Self {
        Self::new(ActionType::Pause, target)
    }

    pub fn resume(target: NodeId) -> Self {
        Self::new(ActionType::Resume, target)
    }

    pub fn break_playback(target: NodeId) -> Self {
        Self::new(ActionType::Break, target)
    }

    pub fn mute(target: NodeId) -> Self {
        Self::new(ActionType::Mute, target)
    }

    pub fn unmute(target: NodeId) -> Self {
        Self::new(ActionType::Unmute, target)
    }

    pub fn seek(target: NodeId, position: SeekPosition) -> Self {
        let mut action = Self::new(ActionType::Seek, target);
        action.seek = Some(position);
        action
    }

    pub fn set_rtpc(rtpc_id: u32, value: f32) -> Self {
        let mut action = Self::new(ActionType::SetRtpc, NodeId::NONE);
        action.rtpc_id = rtpc_id;
        action.rtpc_value = value;
        action
    }

    pub fn reset_rtpc(rtpc_id: u32) -> Self {
        let mut action = Self::new(ActionType::ResetRtpc, NodeId::NONE);
        action.rtpc_id = rtpc_id;
        action
    }

    pub fn set_switch(group_id: u32, switch_id: u32) -> Self {
        let mut action = Self::new(ActionType::SetSwitch, NodeId::NONE);
        action.group_id = group_id;
        action.value_id = switch_id;
        action
    }

    pub fn set_state(group_id: u32, state_id: u32) -> Self {
        let mut action = Self::new(ActionType::SetState, NodeId::NONE);
        action.group_id = group_id;
        action.value_id = state_id;
        action.scope = ActionScope::Global;
        action
    }

    pub fn duck_recovery(bus: NodeId) -> Self {
        let mut action = Self::new(ActionType::DuckRecovery, bus);
        action.scope = ActionScope::Global;
        action
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn with_delay_ms(mut self, ms: f32) -> Self {
        self.delay_ms = ms.max(0.0);
        self
    }

    pub fn with_fade(mut self, ms: f32, curve: FadeCurve) -> Self {
        self.transition = TransitionSpec::new(ms, curve);
        self
    }

    pub fn with_scope(mut self, scope: ActionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn global(self) -> Self {
        self.with_scope(ActionScope::Global)
    }

    pub fn master_resume(mut self) -> Self {
        self.is_master_resume = true;
        self
    }

    /// Delay converted to samples
    pub fn delay_samples(&self, time: &TimeBase) -> u64 {
        time.ms_to_samples(self.delay_ms as f64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACTION RECORD
// ═══════════════════════════════════════════════════════════════════════════════

/// An action bound to the context it was posted in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    pub game_object: GameObjectId,
    /// Playing ID the action belongs to (Play) or filters on (others; 0 = any)
    pub playing_id: PlayingId,
    pub custom_param: u64,
}

impl ActionRecord {
    pub fn new(action: Action, game_object: GameObjectId, playing_id: PlayingId) -> Self {
        Self {
            action,
            game_object,
            playing_id,
            custom_param: 0,
        }
    }

    pub fn with_custom_param(mut self, custom_param: u64) -> Self {
        self.custom_param = custom_param;
        self
    }

    /// Game object filter implied by the scope
    #[inline]
    pub fn scoped_game_object(&self) -> Option<GameObjectId> {
        match self.action.scope {
            ActionScope::Global => None,
            ActionScope::GameObject => Some(self.game_object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_tags() {
        for index in 0..=13u8 {
            let ty = ActionType::from_index(index).unwrap();
            assert_eq!(ty as u8, index);
        }
        assert_eq!(ActionType::from_index(200), None);
        assert!(ActionType::PlayAndContinue.is_play_action());
        assert!(!ActionType::Stop.is_play_action());
    }

    #[test]
    fn test_builder() {
        let action = Action::play(NodeId(10))
            .with_delay_ms(250.0)
            .with_fade(100.0, FadeCurve::Sine)
            .global();
        assert_eq!(action.target, NodeId(10));
        assert_eq!(action.delay_ms, 250.0);
        assert_eq!(action.transition.curve, FadeCurve::Sine);
        assert_eq!(action.scope, ActionScope::Global);

        let time = TimeBase::new(48_000, 480);
        assert_eq!(action.delay_samples(&time), 12_000);
        assert_eq!(action.transition.samples(&time), 4_800);
    }

    #[test]
    fn test_seek_position_resolution() {
        assert_eq!(SeekPosition::Percent(0.5).to_samples(1000), 500);
        assert_eq!(SeekPosition::Percent(2.0).to_samples(1000), 1000);
        assert_eq!(SeekPosition::Samples(5000).to_samples(1000), 1000);
    }

    #[test]
    fn test_scoped_game_object() {
        let rec = ActionRecord::new(Action::stop(NodeId(1)), 7, 0);
        assert_eq!(rec.scoped_game_object(), Some(7));
        let rec = ActionRecord::new(Action::stop(NodeId(1)).global(), 7, 0);
        assert_eq!(rec.scoped_game_object(), None);
    }
}
