//! Hierarchical parameter resolution
//!
//! A query builds a [`ResolutionChain`] once (the node and its ancestors,
//! innermost first, cut short at an optional stop node) and folds every
//! layer over it iteratively:
//!
//! ```text
//!   value(node, prop) = base ⊕ RTPC curves ⊕ state offsets ⊕ SIS(go) ⊕ SIS(global)
//!
//!   additive prop     Σ value(n) over the chain
//!   overridable prop  value(first n with the override bit, else the chain root)
//! ```
//!
//! Routing folds pass-through buses into whatever sits below them: a voice
//! absorbs every bus between its output bus and the first mixing bus, and a
//! mixing bus absorbs the pass-through buses up to the next mixing bus. Each
//! volume is therefore applied exactly once, whichever buses mix.

use std::collections::HashMap;

use smallvec::SmallVec;

use vox_core::{GameObjectId, NodeId};
use vox_event::GameSyncs;

use crate::bus::DuckScope;
use crate::hierarchy::Hierarchy;
use crate::node::Node;
use crate::props::{PropId, PropSet, PropValues};

/// Deepest chain resolved
const MAX_CHAIN: usize = 64;

/// Inputs a resolution reads besides the hierarchy
#[derive(Clone, Copy)]
pub struct ResolveCtx<'a> {
    pub syncs: &'a GameSyncs,
    pub game_object: GameObjectId,
    /// Engine-wide floor for summed duck offsets
    pub duck_floor_db: f32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Node plus ancestors, innermost first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionChain {
    nodes: SmallVec<[NodeId; 8]>,
}

impl ResolutionChain {
    /// Walk up from `start`, excluding `stop_at` and everything above it
    pub fn build(hierarchy: &Hierarchy, start: NodeId, stop_at: Option<NodeId>) -> Self {
        let mut nodes = SmallVec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            if Some(id) == stop_at || nodes.len() >= MAX_CHAIN {
                break;
            }
            let Some(node) = hierarchy.node(id) else {
                break;
            };
            nodes.push(id);
            current = node.parent;
        }
        Self { nodes }
    }

    #[inline]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn root(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PER-NODE VALUES
// ═══════════════════════════════════════════════════════════════════════════════

/// Modulation layered on top of a node's base value
fn modulation(hierarchy: &Hierarchy, node: &Node, ctx: &ResolveCtx<'_>, prop: PropId) -> f32 {
    let rtpc: f32 = node
        .rtpcs
        .iter()
        .filter(|b| b.prop == prop)
        .map(|b| b.curve.evaluate(ctx.syncs.rtpc(b.rtpc_id, ctx.game_object)))
        .sum();
    let mut sis = hierarchy.global_sis(node.id).and_then(|b| b.get(prop)).unwrap_or(0.0);
    if ctx.game_object != vox_core::INVALID_GAME_OBJECT {
        sis += hierarchy.sis_value(node.id, ctx.game_object, prop);
    }
    rtpc + hierarchy.state_value(node.id, prop) + sis
}

/// Contribution of one node to an additive property
fn additive_value(hierarchy: &Hierarchy, node: &Node, ctx: &ResolveCtx<'_>, prop: PropId) -> f32 {
    node.props.get(prop).unwrap_or(0.0) + modulation(hierarchy, node, ctx, prop)
}

/// Value of an overridable property at the node that owns it
fn owned_value(hierarchy: &Hierarchy, node: &Node, ctx: &ResolveCtx<'_>, prop: PropId) -> f32 {
    node.props.get(prop).unwrap_or_else(|| prop.default_value()) + modulation(hierarchy, node, ctx, prop)
}

/// Resolve `requested` properties of `node` over its chain.
///
/// `stop_at` truncates the chain so a caller walking an ancestor chain
/// separately does not count it twice.
pub fn get_audio_parameters(
    hierarchy: &Hierarchy,
    node: NodeId,
    ctx: &ResolveCtx<'_>,
    requested: PropSet,
    stop_at: Option<NodeId>,
) -> PropValues {
    let chain = ResolutionChain::build(hierarchy, node, stop_at);
    resolve_chain(hierarchy, &chain, ctx, requested)
}

pub fn resolve_chain(
    hierarchy: &Hierarchy,
    chain: &ResolutionChain,
    ctx: &ResolveCtx<'_>,
    requested: PropSet,
) -> PropValues {
    let mut values = PropValues::defaults();
    let nodes: SmallVec<[&Node; 8]> = chain.nodes().iter().filter_map(|id| hierarchy.node(*id)).collect();
    let Some(root) = nodes.last().copied() else {
        return values;
    };

    for prop in requested.iter() {
        if prop.is_additive() {
            let sum: f32 = nodes
                .iter()
                .map(|n| additive_value(hierarchy, n, ctx, prop))
                .sum();
            values.set(prop, prop.default_value() + sum);
        } else {
            let owner = nodes
                .iter()
                .find(|n| n.override_mask.contains(prop))
                .copied()
                .unwrap_or(root);
            values.set(prop, owned_value(hierarchy, owner, ctx, prop));
        }
    }
    values
}

/// Gain of one bus as applied to what passes through it (dB)
fn bus_volume(hierarchy: &Hierarchy, bus: NodeId, ctx: &ResolveCtx<'_>) -> f32 {
    let Some(node) = hierarchy.node(bus) else {
        return 0.0;
    };
    additive_value(hierarchy, node, ctx, PropId::Volume) + additive_value(hierarchy, node, ctx, PropId::BusVolume)
}

fn duck_offset(hierarchy: &Hierarchy, bus: NodeId, scope: DuckScope, floor: f32) -> f32 {
    hierarchy
        .node(bus)
        .and_then(|n| n.bus_data())
        .map_or(0.0, |b| b.ducked_offset(scope, floor))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTING
// ═══════════════════════════════════════════════════════════════════════════════

/// Structural routing of a bus chain, valid for one graph generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusRoute {
    /// Pass-through buses folded into whatever feeds this route
    pub folded: SmallVec<[NodeId; 4]>,
    /// First mixing bus at or above the start
    pub mix_bus: Option<NodeId>,
}

/// Split the chain above `bus` into pass-through buses and the first mixing bus
pub fn route_from(hierarchy: &Hierarchy, bus: NodeId) -> BusRoute {
    let mut route = BusRoute::default();
    for id in hierarchy.bus_chain(bus) {
        if hierarchy.is_mixing(id) {
            route.mix_bus = Some(id);
            break;
        }
        route.folded.push(id);
    }
    route
}

/// Resolved parameters of one voice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub values: PropValues,
    /// Total voice volume including folded buses and voice-scope ducking (dB)
    pub volume_db: f32,
    /// Bus whose input the voice is mixed into
    pub mix_bus: Option<NodeId>,
}

/// Resolved parameters of one mixing bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusParams {
    /// Bus gain including folded pass-through parents and bus-scope ducking (dB)
    pub volume_db: f32,
    /// Next mixing bus, `None` for the final output
    pub output: Option<NodeId>,
}

/// Per-generation cache of bus routes
#[derive(Debug, Default)]
pub struct RouteCache {
    generation: Option<u64>,
    voice_routes: HashMap<NodeId, BusRoute>,
    bus_routes: HashMap<NodeId, BusRoute>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sync(&mut self, hierarchy: &Hierarchy) {
        if self.generation != Some(hierarchy.generation()) {
            self.voice_routes.clear();
            self.bus_routes.clear();
            self.generation = Some(hierarchy.generation());
        }
    }

    /// Route of a voice whose output bus is `bus`
    pub fn voice_route(&mut self, hierarchy: &Hierarchy, bus: NodeId) -> &BusRoute {
        self.sync(hierarchy);
        self.voice_routes
            .entry(bus)
            .or_insert_with(|| route_from(hierarchy, bus))
    }

    /// Route above a mixing bus (its pass-through parents and next mixing bus)
    pub fn bus_route(&mut self, hierarchy: &Hierarchy, bus: NodeId) -> &BusRoute {
        self.sync(hierarchy);
        self.bus_routes.entry(bus).or_insert_with(|| {
            match hierarchy.node(bus).and_then(|n| n.parent) {
                Some(parent) => route_from(hierarchy, parent),
                None => BusRoute::default(),
            }
        })
    }

    #[inline]
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }
}

/// Parameters of a voice playing `node`
pub fn voice_params(
    hierarchy: &Hierarchy,
    cache: &mut RouteCache,
    node: NodeId,
    ctx: &ResolveCtx<'_>,
) -> VoiceParams {
    let values = get_audio_parameters(hierarchy, node, ctx, PropSet::VOICE, None);
    let mut volume_db = values.get(PropId::Volume) + values.get(PropId::MakeUpGain);
    let mut mix_bus = None;

    if let Some(bus) = hierarchy.effective_output_bus(node) {
        let route = cache.voice_route(hierarchy, bus).clone();
        for folded in &route.folded {
            volume_db += bus_volume(hierarchy, *folded, ctx);
        }
        mix_bus = route.mix_bus;
        // Voice-scope ducks reach everything routed through the ducked bus
        for id in hierarchy.bus_chain(bus) {
            volume_db += duck_offset(hierarchy, id, DuckScope::Voice, ctx.duck_floor_db);
        }
    }

    VoiceParams {
        values,
        volume_db,
        mix_bus,
    }
}

/// Parameters of a mixing bus
pub fn bus_params(hierarchy: &Hierarchy, cache: &mut RouteCache, bus: NodeId, ctx: &ResolveCtx<'_>) -> BusParams {
    let route = cache.bus_route(hierarchy, bus).clone();
    let mut volume_db = bus_volume(hierarchy, bus, ctx)
        + duck_offset(hierarchy, bus, DuckScope::Bus, ctx.duck_floor_db);
    for folded in &route.folded {
        volume_db += bus_volume(hierarchy, *folded, ctx)
            + duck_offset(hierarchy, *folded, DuckScope::Bus, ctx.duck_floor_db);
    }
    BusParams {
        volume_db,
        output: route.mix_bus,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusData;
    use crate::containers::ContainerData;
    use crate::lower::codec::MediaData;
    use crate::node::{RtpcBinding, SoundData};
    use approx::assert_relative_eq;
    use vox_event::{RtpcCurve, RtpcDefinition};

    fn sound(id: u32) -> Node {
        Node::sound(NodeId(id), SoundData::new(MediaData::constant(0.0, 16, 1)))
    }

    /// Container 20 (-3 dB, priority 80 override) ← Sound 21 (-2 dB)
    /// Master 1 (-1 dB) ← Music 2 (-4 dB, pass-through); 20 → Music
    fn graph() -> Hierarchy {
        let mut h = Hierarchy::new();
        h.add_node(Node::bus(NodeId(1), BusData::new()).with_prop(PropId::Volume, -1.0))
            .unwrap();
        h.add_node(Node::bus(NodeId(2), BusData::new()).with_prop(PropId::Volume, -4.0))
            .unwrap();
        h.add_child(NodeId(1), NodeId(2)).unwrap();
        h.add_node(
            Node::container(NodeId(20), ContainerData::sequence())
                .with_prop(PropId::Volume, -3.0)
                .with_override(PropId::Priority, 80.0),
        )
        .unwrap();
        h.add_node(sound(21).with_prop(PropId::Volume, -2.0)).unwrap();
        h.add_child(NodeId(20), NodeId(21)).unwrap();
        h.set_output_bus(NodeId(20), Some(NodeId(2))).unwrap();
        h
    }

    fn ctx(syncs: &GameSyncs) -> ResolveCtx<'_> {
        ResolveCtx {
            syncs,
            game_object: 7,
            duck_floor_db: -96.0,
        }
    }

    #[test]
    fn test_additive_and_override_resolution() {
        let h = graph();
        let syncs = GameSyncs::new();
        let values = get_audio_parameters(&h, NodeId(21), &ctx(&syncs), PropSet::VOICE, None);
        assert_relative_eq!(values.get(PropId::Volume), -5.0);
        assert_relative_eq!(values.get(PropId::Priority), 80.0);

        // A child override wins over the ancestor
        let mut h = h;
        if let Some(n) = h.node_mut(NodeId(21)) {
            n.props.set(PropId::Priority, 10.0);
            n.override_mask.insert(PropId::Priority);
        }
        let values = get_audio_parameters(&h, NodeId(21), &ctx(&syncs), PropSet::VOICE, None);
        assert_relative_eq!(values.get(PropId::Priority), 10.0);
    }

    #[test]
    fn test_stop_node_truncates_chain() {
        let h = graph();
        let chain = ResolutionChain::build(&h, NodeId(21), Some(NodeId(20)));
        assert_eq!(chain.nodes(), &[NodeId(21)]);

        let syncs = GameSyncs::new();
        let values = get_audio_parameters(
            &h,
            NodeId(21),
            &ctx(&syncs),
            PropSet::of(&[PropId::Volume]),
            Some(NodeId(20)),
        );
        assert_relative_eq!(values.get(PropId::Volume), -2.0);
        assert_relative_eq!(values.get(PropId::Pitch), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rtpc_state_and_sis_layers() {
        let mut h = graph();
        let mut syncs = GameSyncs::new();
        syncs.register_rtpc(RtpcDefinition::new(3, "distance").with_range(0.0, 100.0));
        syncs.set_rtpc(3, 50.0, 7, 0);
        h.add_rtpc(
            NodeId(21),
            RtpcBinding::new(3, PropId::Volume, RtpcCurve::linear(0.0, 0.0, 100.0, -10.0)),
        )
        .unwrap();
        h.set_state_value(NodeId(20), PropId::Volume, -1.0);
        h.set_sis(NodeId(21), 7, PropId::Volume, -0.5);
        h.set_sis(NodeId(21), 8, PropId::Volume, -40.0);

        let values = get_audio_parameters(&h, NodeId(21), &ctx(&syncs), PropSet::VOICE, None);
        // -2 -3 base, -5 rtpc, -1 state, -0.5 sis (object 8's override ignored)
        assert_relative_eq!(values.get(PropId::Volume), -11.5, epsilon = 1e-4);
    }

    #[test]
    fn test_pass_through_bus_folds_into_voice() {
        let h = graph();
        let syncs = GameSyncs::new();
        let mut cache = RouteCache::new();

        let voice = voice_params(&h, &mut cache, NodeId(21), &ctx(&syncs));
        assert_eq!(voice.mix_bus, Some(NodeId(1)));
        assert_relative_eq!(voice.volume_db, -9.0, epsilon = 1e-5);

        let master = bus_params(&h, &mut cache, NodeId(1), &ctx(&syncs));
        assert_relative_eq!(master.volume_db, -1.0);
        assert_eq!(master.output, None);
    }

    #[test]
    fn test_mixing_flip_keeps_total_gain() {
        let mut h = graph();
        let syncs = GameSyncs::new();
        let mut cache = RouteCache::new();
        let before = voice_params(&h, &mut cache, NodeId(21), &ctx(&syncs)).volume_db
            + bus_params(&h, &mut cache, NodeId(1), &ctx(&syncs)).volume_db;

        h.add_effect(NodeId(2), 99).unwrap();
        let voice = voice_params(&h, &mut cache, NodeId(21), &ctx(&syncs));
        assert_eq!(voice.mix_bus, Some(NodeId(2)), "route rebuilt for new generation");
        let music = bus_params(&h, &mut cache, NodeId(2), &ctx(&syncs));
        assert_eq!(music.output, Some(NodeId(1)));
        let master = bus_params(&h, &mut cache, NodeId(1), &ctx(&syncs));
        let after = voice.volume_db + music.volume_db + master.volume_db;
        assert_relative_eq!(before, after, epsilon = 1e-5);
    }

    #[test]
    fn test_duck_offsets_apply_by_scope() {
        let mut h = graph();
        if let Some(b) = h.node_mut(NodeId(2)).and_then(|n| n.bus_data_mut()) {
            b.set_duck_offset(DuckScope::Voice, NodeId(99), -12.0);
        }
        if let Some(b) = h.node_mut(NodeId(1)).and_then(|n| n.bus_data_mut()) {
            b.set_duck_offset(DuckScope::Bus, NodeId(99), -6.0);
        }
        let syncs = GameSyncs::new();
        let mut cache = RouteCache::new();
        let voice = voice_params(&h, &mut cache, NodeId(21), &ctx(&syncs));
        assert_relative_eq!(voice.volume_db, -21.0, epsilon = 1e-5);
        let master = bus_params(&h, &mut cache, NodeId(1), &ctx(&syncs));
        assert_relative_eq!(master.volume_db, -7.0, epsilon = 1e-5);
    }
}
