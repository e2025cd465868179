//! Nodes and the node arena
//!
//! Playable nodes (sounds, containers) and buses share one [`Node`] type over
//! a closed set of categories. Nodes live in a generational arena; the
//! hierarchy addresses them by [`NodeHandle`] internally and by [`NodeId`]
//! at its API. A removed slot never resolves again through a stale handle.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vox_core::{GameObjectId, KillPolicy, NodeId};
use vox_event::RtpcCurve;

use crate::bus::BusData;
use crate::containers::ContainerData;
use crate::lower::codec::{CodecId, MediaData, PCM_CODEC, SourceType};
use crate::props::{PropBundle, PropId, PropSet};

// ═══════════════════════════════════════════════════════════════════════════════
// CATEGORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Node category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeCategory {
    Sound = 0,
    Container = 1,
    Bus = 2,
    AuxBus = 3,
}

impl NodeCategory {
    #[inline]
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(NodeCategory::Sound),
            1 => Some(NodeCategory::Container),
            2 => Some(NodeCategory::Bus),
            3 => Some(NodeCategory::AuxBus),
            _ => None,
        }
    }

    #[inline]
    pub fn is_bus(&self) -> bool {
        matches!(self, NodeCategory::Bus | NodeCategory::AuxBus)
    }

    #[inline]
    pub fn is_playable(&self) -> bool {
        !self.is_bus()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTACHED DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// RTPC → property mapping attached to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpcBinding {
    pub rtpc_id: u32,
    pub prop: PropId,
    pub curve: RtpcCurve,
}

impl RtpcBinding {
    pub fn new(rtpc_id: u32, prop: PropId, curve: RtpcCurve) -> Self {
        Self {
            rtpc_id,
            prop,
            curve,
        }
    }
}

/// Per-state property offsets for one state group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateProps {
    pub group_id: u32,
    pub per_state: HashMap<u32, PropBundle>,
}

impl StateProps {
    pub fn new(group_id: u32) -> Self {
        Self {
            group_id,
            per_state: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state_id: u32, props: PropBundle) -> Self {
        self.per_state.insert(state_id, props);
        self
    }

    /// Offset for `prop` under `state_id` (0 when the state sets nothing)
    pub fn value(&self, state_id: u32, prop: PropId) -> f32 {
        self.per_state
            .get(&state_id)
            .and_then(|b| b.get(prop))
            .unwrap_or(0.0)
    }

    /// Properties touched by any state of the group
    pub fn props(&self) -> PropSet {
        self.per_state
            .values()
            .fold(PropSet::EMPTY, |acc, b| acc.union(b.keys()))
    }
}

/// Instance limiting settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceLimit {
    /// Maximum audible instances (0 = unlimited)
    pub max_instances: u16,
    pub kill_policy: KillPolicy,
    /// Excess voices go virtual instead of being killed
    pub use_virtual: bool,
    /// Count per game object instead of globally
    pub per_game_object: bool,
}

impl InstanceLimit {
    pub fn new(max_instances: u16) -> Self {
        Self {
            max_instances,
            kill_policy: KillPolicy::KillOldest,
            use_virtual: false,
            per_game_object: false,
        }
    }

    pub fn with_policy(mut self, policy: KillPolicy) -> Self {
        self.kill_policy = policy;
        self
    }

    pub fn with_virtual(mut self, use_virtual: bool) -> Self {
        self.use_virtual = use_virtual;
        self
    }

    pub fn per_game_object(mut self) -> Self {
        self.per_game_object = true;
        self
    }
}

/// Lazily allocated activity counters
#[derive(Debug, Clone, Default)]
pub struct ActivityChunk {
    /// Voices of this node or its descendants currently alive
    pub play_count: u32,
    /// Voices that reached the mixer (connected)
    pub activity_count: u32,
    pub per_game_object: HashMap<GameObjectId, u32>,
}

impl ActivityChunk {
    pub fn is_idle(&self) -> bool {
        self.play_count == 0 && self.activity_count == 0
    }
}

/// Leaf sound data
#[derive(Debug, Clone)]
pub struct SoundData {
    pub codec: CodecId,
    pub source_type: SourceType,
    pub media: Option<MediaData>,
    /// Loop count (0 = infinite)
    pub loop_count: u16,
}

impl SoundData {
    pub fn new(media: MediaData) -> Self {
        Self {
            codec: PCM_CODEC,
            source_type: SourceType::Bank,
            media: Some(media),
            loop_count: 1,
        }
    }

    /// Sound with a codec but no media attached yet
    pub fn unloaded(codec: CodecId) -> Self {
        Self {
            codec,
            source_type: SourceType::Bank,
            media: None,
            loop_count: 1,
        }
    }

    pub fn with_loop_count(mut self, loop_count: u16) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn with_codec(mut self, codec: CodecId) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }
}

/// Category-specific payload
#[derive(Debug, Clone)]
pub enum NodeData {
    Sound(SoundData),
    Container(ContainerData),
    Bus(BusData),
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE
// ═══════════════════════════════════════════════════════════════════════════════

/// Playable node or bus
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub category: NodeCategory,
    /// Actor-mixer parent (playable) or parent bus (bus)
    pub parent: Option<NodeId>,
    /// Actor-mixer children (playable) or child buses (bus)
    pub children: Vec<NodeId>,
    /// Explicit output bus; unset means "inherit from the parent"
    pub output_bus: Option<NodeId>,
    pub ref_count: u32,
    pub props: PropBundle,
    /// Overridable properties this node sets instead of inheriting
    pub override_mask: PropSet,
    pub rtpcs: Vec<RtpcBinding>,
    pub state_props: Vec<StateProps>,
    pub limit: Option<InstanceLimit>,
    pub activity: Option<Box<ActivityChunk>>,
    pub data: NodeData,
}

impl Node {
    fn with_data(id: NodeId, category: NodeCategory, data: NodeData) -> Self {
        Self {
            id,
            category,
            parent: None,
            children: Vec::new(),
            output_bus: None,
            ref_count: 1,
            props: PropBundle::new(),
            override_mask: PropSet::EMPTY,
            rtpcs: Vec::new(),
            state_props: Vec::new(),
            limit: None,
            activity: None,
            data,
        }
    }

    pub fn sound(id: NodeId, sound: SoundData) -> Self {
        Self::with_data(id, NodeCategory::Sound, NodeData::Sound(sound))
    }

    pub fn container(id: NodeId, container: ContainerData) -> Self {
        Self::with_data(id, NodeCategory::Container, NodeData::Container(container))
    }

    pub fn bus(id: NodeId, bus: BusData) -> Self {
        Self::with_data(id, NodeCategory::Bus, NodeData::Bus(bus))
    }

    pub fn aux_bus(id: NodeId, bus: BusData) -> Self {
        Self::with_data(id, NodeCategory::AuxBus, NodeData::Bus(bus))
    }

    pub fn with_prop(mut self, prop: PropId, value: f32) -> Self {
        self.props.set(prop, value);
        self
    }

    /// Set an overridable property and mark it overridden
    pub fn with_override(mut self, prop: PropId, value: f32) -> Self {
        self.props.set(prop, value);
        self.override_mask.insert(prop);
        self
    }

    pub fn with_rtpc(mut self, binding: RtpcBinding) -> Self {
        self.rtpcs.push(binding);
        self
    }

    pub fn with_state_props(mut self, state_props: StateProps) -> Self {
        self.state_props.push(state_props);
        self
    }

    pub fn with_limit(mut self, limit: InstanceLimit) -> Self {
        self.limit = Some(limit);
        self
    }

    #[inline]
    pub fn is_bus(&self) -> bool {
        self.category.is_bus()
    }

    pub fn bus_data(&self) -> Option<&BusData> {
        match &self.data {
            NodeData::Bus(b) => Some(b),
            _ => None,
        }
    }

    pub fn bus_data_mut(&mut self) -> Option<&mut BusData> {
        match &mut self.data {
            NodeData::Bus(b) => Some(b),
            _ => None,
        }
    }

    pub fn sound_data(&self) -> Option<&SoundData> {
        match &self.data {
            NodeData::Sound(s) => Some(s),
            _ => None,
        }
    }

    pub fn sound_data_mut(&mut self) -> Option<&mut SoundData> {
        match &mut self.data {
            NodeData::Sound(s) => Some(s),
            _ => None,
        }
    }

    pub fn container_data(&self) -> Option<&ContainerData> {
        match &self.data {
            NodeData::Container(c) => Some(c),
            _ => None,
        }
    }

    /// Activity counters, allocated on first use
    pub fn activity_mut(&mut self) -> &mut ActivityChunk {
        self.activity.get_or_insert_with(Default::default)
    }

    pub fn play_count(&self) -> u32 {
        self.activity.as_ref().map_or(0, |a| a.play_count)
    }

    /// Any RTPC bound to a bus-level property
    pub fn has_bus_level_rtpc(&self) -> bool {
        self.rtpcs.iter().any(|b| b.prop.is_bus_level())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARENA
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable generational handle to a node slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(thunderdome::Index);

/// Node storage
#[derive(Debug)]
pub struct NodeArena {
    nodes: thunderdome::Arena<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            nodes: thunderdome::Arena::new(),
        }
    }

    pub fn insert(&mut self, node: Node) -> NodeHandle {
        NodeHandle(self.nodes.insert(node))
    }

    #[inline]
    pub fn get(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle.0)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle.0)
    }

    /// Free a slot; the handle (and any copy of it) stops resolving
    pub fn remove(&mut self, handle: NodeHandle) -> Option<Node> {
        self.nodes.remove(handle.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter().map(|(i, n)| (NodeHandle(i), n))
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_never_resolves() {
        let mut arena = NodeArena::new();
        let a = arena.insert(Node::bus(NodeId(1), BusData::new()));
        assert_eq!(arena.get(a).map(|n| n.id), Some(NodeId(1)));

        arena.remove(a);
        let b = arena.insert(Node::bus(NodeId(2), BusData::new()));
        assert!(arena.get(a).is_none(), "reused slot must not alias");
        assert_eq!(arena.get(b).map(|n| n.id), Some(NodeId(2)));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_activity_chunk_is_lazy() {
        let mut node = Node::bus(NodeId(3), BusData::new());
        assert!(node.activity.is_none());
        assert_eq!(node.play_count(), 0);
        node.activity_mut().play_count += 2;
        assert_eq!(node.play_count(), 2);
    }

    #[test]
    fn test_state_props_lookup() {
        let sp = StateProps::new(9)
            .with_state(1, PropBundle::new().with(PropId::Volume, -6.0))
            .with_state(2, PropBundle::new().with(PropId::Lpf, 30.0));
        assert_eq!(sp.value(1, PropId::Volume), -6.0);
        assert_eq!(sp.value(2, PropId::Volume), 0.0);
        assert!(sp.props().contains(PropId::Lpf));
    }
}
