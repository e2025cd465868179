//! Node Hierarchy & Bus Graph
//!
//! Two trees over the same node arena:
//!
//! ```text
//!   actor-mixer tree            bus tree
//!   ────────────────            ────────
//!   Container A                 Master ◀── top-level set
//!   ├── Sound 1 ──output_bus──▶ ├── Music
//!   └── Sound 2                 └── SFX
//! ```
//!
//! A node has at most one parent in each tree. Buses without a bus parent
//! form the master set. Every structural error is detected before anything
//! is mutated, so a rejected call leaves the graph untouched.
//!
//! Reference counting: a node starts with one reference (the registry).
//! Adding a child or routing a leaf to a bus takes a reference on the parent
//! or bus. When the count reaches zero the node is detached from both trees,
//! removed from the index and its arena slot is freed. Destruction runs on an
//! explicit worklist, so a parent released by its last child's removal is
//! handled in the same pass without recursion.
//!
//! Any change that can alter the mixing graph (topology, mixing-bus flips,
//! aux sends) bumps `generation`; the lower engine rebuilds its derived
//! graph between frames whenever the generation moved.

use std::collections::{BTreeSet, HashMap};

use vox_core::{GameObjectId, INVALID_GAME_OBJECT, NodeId, VoxError, VoxResult};

use crate::bus::{AuxSend, DuckTarget, PannerType, is_mixing_bus};
use crate::node::{Node, NodeArena, NodeHandle, RtpcBinding};
use crate::props::{PropBundle, PropId};

/// Deepest chain walked before a walk is considered corrupt
const MAX_DEPTH: usize = 256;

/// Node and bus chains a playing voice was counted on
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivityChains {
    pub nodes: Vec<NodeId>,
    pub buses: Vec<NodeId>,
}

/// Buses whose voice count crossed zero
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivityChange {
    /// Buses whose first voice just started
    pub became_active: Vec<NodeId>,
    /// Buses whose last voice just stopped
    pub became_idle: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct Hierarchy {
    arena: NodeArena,
    index: HashMap<NodeId, NodeHandle>,
    master_buses: BTreeSet<NodeId>,
    generation: u64,
    last_bank_unloaded: bool,
    /// Scoped instance overrides per (node, game object); object 0 = every object
    sis: HashMap<(NodeId, GameObjectId), PropBundle>,
    /// Values driven by state transitions per node
    state_values: HashMap<NodeId, PropBundle>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Lookup
    // ───────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).and_then(|h| self.arena.get(*h))
    }

    /// Mutable access for properties and attached data.
    ///
    /// Structural fields (`parent`, `children`, `output_bus`, bus leaves)
    /// must only change through the hierarchy methods.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let handle = *self.index.get(&id)?;
        self.arena.get_mut(handle)
    }

    fn require(&self, id: NodeId) -> VoxResult<&Node> {
        self.node(id).ok_or(VoxError::IdNotFound(id.0 as u64))
    }

    fn require_bus(&self, id: NodeId) -> VoxResult<&Node> {
        let node = self.require(id)?;
        if !node.is_bus() {
            return Err(VoxError::InvalidConfig(format!("{} is not a bus", id)));
        }
        Ok(node)
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Graph generation; moves on every mixing-relevant change
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn last_bank_unloaded(&self) -> bool {
        self.last_bank_unloaded
    }

    pub fn master_buses(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.master_buses.iter().copied()
    }

    #[inline]
    pub fn is_top_level(&self, bus: NodeId) -> bool {
        self.master_buses.contains(&bus)
    }

    /// Ids of every bus, in id order
    pub fn bus_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .arena
            .iter()
            .filter(|(_, n)| n.is_bus())
            .map(|(_, n)| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Copy of a node's children, safe to iterate while the graph changes
    pub fn children_snapshot(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Structure
    // ───────────────────────────────────────────────────────────────────────

    /// Register a node. It starts detached; buses join the master set.
    pub fn add_node(&mut self, mut node: Node) -> VoxResult<()> {
        if self.index.contains_key(&node.id) {
            return Err(VoxError::DuplicateUniqueId(node.id.0));
        }
        node.parent = None;
        node.output_bus = None;
        node.children.clear();
        if let Some(bus) = node.bus_data_mut() {
            bus.leaves.clear();
        }

        let id = node.id;
        let is_bus = node.is_bus();
        let handle = self.arena.insert(node);
        self.index.insert(id, handle);
        if is_bus {
            self.master_buses.insert(id);
            self.last_bank_unloaded = false;
            self.refresh_mixing(id);
            self.generation += 1;
        }
        Ok(())
    }

    /// Check whether `ancestor` sits above `node` in its tree
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.node(node).and_then(|n| n.parent);
        for _ in 0..MAX_DEPTH {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.node(id).and_then(|n| n.parent),
                None => return false,
            }
        }
        true
    }

    /// Attach `child` under `parent` in the tree matching their category
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> VoxResult<()> {
        if parent == child {
            return Err(VoxError::CannotAddItselfAsAChild(child));
        }
        let parent_node = self.require(parent)?;
        let child_node = self.require(child)?;
        if parent_node.is_bus() != child_node.is_bus() {
            return Err(VoxError::InvalidConfig(format!(
                "{} and {} belong to different trees",
                parent, child
            )));
        }
        match child_node.parent {
            Some(p) if p == parent => return Err(VoxError::AlreadyConnected(child)),
            Some(p) => {
                return Err(VoxError::ChildAlreadyHasAParent { child, parent: p });
            }
            None => {}
        }
        if self.is_ancestor(child, parent) {
            return Err(VoxError::WouldCreateCycle {
                from: child,
                to: parent,
            });
        }

        let child_is_bus = child_node.is_bus();
        if let Some(p) = self.node_mut(parent) {
            p.children.push(child);
            p.ref_count += 1;
        }
        if let Some(c) = self.node_mut(child) {
            c.parent = Some(parent);
        }
        if child_is_bus {
            self.master_buses.remove(&child);
            self.refresh_mixing(child);
        }
        self.generation += 1;
        Ok(())
    }

    /// Detach `child` from `parent`, dropping the reference it held
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> VoxResult<()> {
        let child_node = self.require(child)?;
        if child_node.parent != Some(parent) {
            return Err(VoxError::IdNotFound(child.0 as u64));
        }
        let child_is_bus = child_node.is_bus();

        if let Some(c) = self.node_mut(child) {
            c.parent = None;
        }
        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|c| *c != child);
        }
        if child_is_bus {
            self.master_buses.insert(child);
            self.refresh_mixing(child);
        }
        self.generation += 1;
        self.release(parent);
        Ok(())
    }

    /// Route a playable node to a bus, or clear its explicit routing
    pub fn set_output_bus(&mut self, node: NodeId, bus: Option<NodeId>) -> VoxResult<()> {
        let current = self.require(node)?;
        if current.is_bus() {
            return Err(VoxError::InvalidConfig(format!(
                "{} is a bus; use add_child",
                node
            )));
        }
        let previous = current.output_bus;
        if previous == bus {
            return match bus {
                Some(b) => Err(VoxError::AlreadyConnected(b)),
                None => Ok(()),
            };
        }
        if let Some(b) = bus {
            self.require_bus(b)?;
        }

        if let Some(n) = self.node_mut(node) {
            n.output_bus = bus;
        }
        if let Some(data) = bus.and_then(|b| self.node_mut(b)).and_then(|n| {
            n.ref_count += 1;
            n.bus_data_mut()
        }) {
            data.leaves.push(node);
        }
        self.generation += 1;
        if let Some(old) = previous {
            if let Some(data) = self.node_mut(old).and_then(|n| n.bus_data_mut()) {
                data.leaves.retain(|l| *l != node);
            }
            self.release(old);
        }
        Ok(())
    }

    pub fn add_ref(&mut self, id: NodeId) -> VoxResult<u32> {
        let node = self
            .node_mut(id)
            .ok_or(VoxError::IdNotFound(id.0 as u64))?;
        node.ref_count += 1;
        Ok(node.ref_count)
    }

    /// Drop one reference; destroys the node at zero. Returns `true` if it was destroyed.
    pub fn release(&mut self, id: NodeId) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        node.ref_count = node.ref_count.saturating_sub(1);
        if node.ref_count > 0 {
            return false;
        }
        self.destroy(id);
        true
    }

    fn destroy(&mut self, id: NodeId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(handle) = self.index.remove(&id) else {
                continue;
            };
            let Some(node) = self.arena.remove(handle) else {
                continue;
            };
            log::debug!("Destroying node {}", id);

            // Parent and bus lose the reference this node held
            let mut owners = Vec::with_capacity(2);
            if let Some(p) = node.parent {
                if let Some(pn) = self.node_mut(p) {
                    pn.children.retain(|c| *c != id);
                }
                owners.push(p);
            }
            if let Some(b) = node.output_bus {
                if let Some(data) = self.node_mut(b).and_then(|n| n.bus_data_mut()) {
                    data.leaves.retain(|l| *l != id);
                }
                owners.push(b);
            }
            for owner in owners {
                if let Some(on) = self.node_mut(owner) {
                    on.ref_count = on.ref_count.saturating_sub(1);
                    if on.ref_count == 0 {
                        work.push(owner);
                    }
                }
            }

            // Orphan whatever hung below it
            for child in &node.children {
                let mut promoted = false;
                if let Some(cn) = self.node_mut(*child) {
                    cn.parent = None;
                    promoted = cn.is_bus();
                }
                if promoted {
                    self.master_buses.insert(*child);
                    self.refresh_mixing(*child);
                }
            }
            if let Some(bus) = node.bus_data() {
                for leaf in &bus.leaves {
                    if let Some(ln) = self.node_mut(*leaf) {
                        ln.output_bus = None;
                    }
                }
                for target in &bus.duck_targets {
                    if let Some(data) = self.node_mut(target.target).and_then(|n| n.bus_data_mut()) {
                        data.remove_duck_source(target.scope, id);
                    }
                }
            }

            self.sis.retain(|(n, _), _| *n != id);
            self.state_values.remove(&id);
            self.generation += 1;

            if self.master_buses.remove(&id) && self.master_buses.is_empty() {
                self.last_bank_unloaded = true;
                log::info!("Last top-level bus {} removed; last bank unloaded", id);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Routing queries
    // ───────────────────────────────────────────────────────────────────────

    /// Bus a playable node outputs to: its own routing or the nearest ancestor's
    pub fn effective_output_bus(&self, node: NodeId) -> Option<NodeId> {
        let mut current = Some(node);
        for _ in 0..MAX_DEPTH {
            let n = self.node(current?)?;
            if n.is_bus() {
                return Some(n.id);
            }
            if let Some(bus) = n.output_bus {
                return Some(bus);
            }
            current = n.parent;
        }
        None
    }

    /// The bus and its ancestors, innermost first
    pub fn bus_chain(&self, bus: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(bus);
        while let Some(id) = current {
            if chain.len() >= MAX_DEPTH || self.node(id).is_none() {
                break;
            }
            chain.push(id);
            current = self.node(id).and_then(|n| n.parent);
        }
        chain
    }

    /// Node and its actor-mixer ancestors, innermost first
    pub fn node_chain(&self, node: NodeId) -> Vec<NodeId> {
        self.bus_chain(node)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Mixing attributes
    // ───────────────────────────────────────────────────────────────────────

    /// Recompute the mixing-bus predicate; bumps the generation on a flip
    fn refresh_mixing(&mut self, bus: NodeId) -> bool {
        let top = self.master_buses.contains(&bus);
        let Some(node) = self.node_mut(bus) else {
            return false;
        };
        let has_bus_rtpc = node.has_bus_level_rtpc();
        let Some(data) = node.bus_data_mut() else {
            return false;
        };
        let mixing = is_mixing_bus(data, has_bus_rtpc, top);
        if mixing == data.mixing {
            return false;
        }
        data.mixing = mixing;
        self.generation += 1;
        log::debug!("Bus {} mixing = {}", bus, mixing);
        true
    }

    #[inline]
    pub fn is_mixing(&self, bus: NodeId) -> bool {
        self.node(bus)
            .and_then(|n| n.bus_data())
            .is_some_and(|b| b.mixing)
    }

    fn edit_bus(&mut self, bus: NodeId, f: impl FnOnce(&mut crate::bus::BusData)) -> VoxResult<bool> {
        self.require_bus(bus)?;
        if let Some(data) = self.node_mut(bus).and_then(|n| n.bus_data_mut()) {
            f(data);
        }
        Ok(self.refresh_mixing(bus))
    }

    /// Insert an effect; returns whether the bus flipped its mixing status
    pub fn add_effect(&mut self, bus: NodeId, fx_id: u32) -> VoxResult<bool> {
        self.edit_bus(bus, |b| b.effects.push(fx_id))
    }

    pub fn remove_effect(&mut self, bus: NodeId, fx_id: u32) -> VoxResult<bool> {
        self.edit_bus(bus, |b| b.effects.retain(|f| *f != fx_id))
    }

    pub fn set_panner(&mut self, bus: NodeId, panner: PannerType) -> VoxResult<bool> {
        self.edit_bus(bus, |b| b.panner = panner)
    }

    pub fn set_channel_config(&mut self, bus: NodeId, channel_config: u32) -> VoxResult<bool> {
        self.edit_bus(bus, |b| b.channel_config = channel_config)
    }

    pub fn add_aux_send(&mut self, bus: NodeId, send: AuxSend) -> VoxResult<bool> {
        self.require_bus(send.bus)?;
        if send.bus == bus || self.is_ancestor(send.bus, bus) {
            return Err(VoxError::WouldCreateCycle {
                from: bus,
                to: send.bus,
            });
        }
        let flipped = self.edit_bus(bus, |b| {
            b.aux_sends.retain(|s| s.bus != send.bus);
            b.aux_sends.push(send);
        })?;
        self.generation += 1;
        Ok(flipped)
    }

    pub fn remove_aux_send(&mut self, bus: NodeId, aux: NodeId) -> VoxResult<bool> {
        let flipped = self.edit_bus(bus, |b| b.aux_sends.retain(|s| s.bus != aux))?;
        self.generation += 1;
        Ok(flipped)
    }

    /// Attach an RTPC binding; bus-level bindings can make a bus mixing
    pub fn add_rtpc(&mut self, node: NodeId, binding: RtpcBinding) -> VoxResult<bool> {
        let n = self
            .node_mut(node)
            .ok_or(VoxError::IdNotFound(node.0 as u64))?;
        n.rtpcs.push(binding);
        let is_bus = n.is_bus();
        Ok(is_bus && self.refresh_mixing(node))
    }

    pub fn remove_rtpc(&mut self, node: NodeId, rtpc_id: u32) -> VoxResult<bool> {
        let n = self
            .node_mut(node)
            .ok_or(VoxError::IdNotFound(node.0 as u64))?;
        n.rtpcs.retain(|b| b.rtpc_id != rtpc_id);
        let is_bus = n.is_bus();
        Ok(is_bus && self.refresh_mixing(node))
    }

    /// Register (or replace) a duck target of `source`
    pub fn add_duck_target(&mut self, source: NodeId, target: DuckTarget) -> VoxResult<()> {
        self.require_bus(source)?;
        self.require_bus(target.target)?;
        if source == target.target {
            return Err(VoxError::CannotAddItselfAsAChild(source));
        }
        if let Some(data) = self.node_mut(source).and_then(|n| n.bus_data_mut()) {
            data.duck_targets.retain(|t| t.target != target.target);
            data.duck_targets.push(target);
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Activity
    // ───────────────────────────────────────────────────────────────────────

    /// Chains a voice of `node` is counted on right now
    pub fn activity_chains(&self, node: NodeId) -> ActivityChains {
        ActivityChains {
            nodes: self.node_chain(node),
            buses: self
                .effective_output_bus(node)
                .map(|bus| self.bus_chain(bus))
                .unwrap_or_default(),
        }
    }

    fn adjust_activity(&mut self, chains: &ActivityChains, game_object: GameObjectId, started: bool) -> ActivityChange {
        let mut change = ActivityChange::default();

        for id in &chains.nodes {
            if let Some(n) = self.node_mut(*id) {
                let chunk = n.activity_mut();
                let per_go = chunk.per_game_object.entry(game_object).or_insert(0);
                if started {
                    chunk.play_count += 1;
                    chunk.activity_count += 1;
                    *per_go += 1;
                } else {
                    chunk.play_count = chunk.play_count.saturating_sub(1);
                    chunk.activity_count = chunk.activity_count.saturating_sub(1);
                    *per_go = per_go.saturating_sub(1);
                    if *per_go == 0 {
                        chunk.per_game_object.remove(&game_object);
                    }
                }
                if n.activity.as_ref().is_some_and(|a| a.is_idle()) {
                    n.activity = None;
                }
            }
        }

        for id in &chains.buses {
            if let Some(data) = self.node_mut(*id).and_then(|n| n.bus_data_mut()) {
                if started {
                    data.active_voices += 1;
                    if data.active_voices == 1 {
                        change.became_active.push(*id);
                    }
                } else if data.active_voices > 0 {
                    data.active_voices -= 1;
                    if data.active_voices == 0 {
                        change.became_idle.push(*id);
                    }
                }
            }
        }
        change
    }

    /// Count a voice starting on `node` through both trees.
    ///
    /// The returned chains must be handed back to [`Self::voice_stopped`],
    /// so that a reroute or release in between cannot unbalance the counts.
    pub fn voice_started(&mut self, node: NodeId, game_object: GameObjectId) -> (ActivityChains, ActivityChange) {
        let chains = self.activity_chains(node);
        let change = self.adjust_activity(&chains, game_object, true);
        (chains, change)
    }

    /// Undo a start on exactly the chains it was counted on; nodes destroyed
    /// since are skipped
    pub fn voice_stopped(&mut self, chains: &ActivityChains, game_object: GameObjectId) -> ActivityChange {
        self.adjust_activity(chains, game_object, false)
    }

    /// Voices playing `node` on `game_object`
    pub fn instances_on(&self, node: NodeId, game_object: GameObjectId) -> u32 {
        self.node(node)
            .and_then(|n| n.activity.as_ref())
            .and_then(|a| a.per_game_object.get(&game_object).copied())
            .unwrap_or(0)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Overlays
    // ───────────────────────────────────────────────────────────────────────

    pub fn set_sis(&mut self, node: NodeId, game_object: GameObjectId, prop: PropId, value: f32) {
        self.sis.entry((node, game_object)).or_default().set(prop, value);
    }

    pub fn clear_sis(&mut self, node: NodeId, game_object: GameObjectId, prop: PropId) {
        if let Some(bundle) = self.sis.get_mut(&(node, game_object)) {
            bundle.remove(prop);
            if bundle.is_empty() {
                self.sis.remove(&(node, game_object));
            }
        }
    }

    /// Scoped override of `node` for `game_object`, if any
    pub fn sis(&self, node: NodeId, game_object: GameObjectId) -> Option<&PropBundle> {
        self.sis.get(&(node, game_object))
    }

    /// Global scoped override of `node`
    pub fn global_sis(&self, node: NodeId) -> Option<&PropBundle> {
        self.sis.get(&(node, INVALID_GAME_OBJECT))
    }

    pub fn sis_value(&self, node: NodeId, game_object: GameObjectId, prop: PropId) -> f32 {
        self.sis(node, game_object)
            .and_then(|b| b.get(prop))
            .unwrap_or(0.0)
    }

    pub fn set_state_value(&mut self, node: NodeId, prop: PropId, value: f32) {
        self.state_values.entry(node).or_default().set(prop, value);
    }

    pub fn state_value(&self, node: NodeId, prop: PropId) -> f32 {
        self.state_values
            .get(&node)
            .and_then(|b| b.get(prop))
            .unwrap_or(0.0)
    }

    pub fn state_values(&self, node: NodeId) -> Option<&PropBundle> {
        self.state_values.get(&node)
    }

    /// Nodes carrying state-driven properties for `group_id`
    pub fn nodes_with_state_group(&self, group_id: u32) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .arena
            .iter()
            .filter(|(_, n)| n.state_props.iter().any(|sp| sp.group_id == group_id))
            .map(|(_, n)| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Forget every scoped override of a game object
    pub fn unregister_game_object(&mut self, game_object: GameObjectId) {
        self.sis.retain(|(_, go), _| *go != game_object);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusData;
    use crate::lower::codec::MediaData;
    use crate::node::SoundData;

    fn sound(id: u32) -> Node {
        Node::sound(NodeId(id), SoundData::new(MediaData::constant(0.0, 16, 1)))
    }

    fn bus(id: u32) -> Node {
        Node::bus(NodeId(id), BusData::new())
    }

    /// Master(1) ← Music(2), Sound 10 → Music
    fn small_graph() -> Hierarchy {
        let mut h = Hierarchy::new();
        h.add_node(bus(1)).unwrap();
        h.add_node(bus(2)).unwrap();
        h.add_node(sound(10)).unwrap();
        h.add_child(NodeId(1), NodeId(2)).unwrap();
        h.set_output_bus(NodeId(10), Some(NodeId(2))).unwrap();
        h
    }

    #[test]
    fn test_structural_errors_leave_graph_unmodified() {
        let mut h = small_graph();
        h.add_node(bus(3)).unwrap();
        let generation = h.generation();

        assert!(matches!(
            h.add_child(NodeId(2), NodeId(2)),
            Err(VoxError::CannotAddItselfAsAChild(_))
        ));
        assert!(matches!(
            h.add_child(NodeId(1), NodeId(2)),
            Err(VoxError::AlreadyConnected(_))
        ));
        assert!(matches!(
            h.add_child(NodeId(3), NodeId(2)),
            Err(VoxError::ChildAlreadyHasAParent { .. })
        ));
        assert!(matches!(
            h.add_child(NodeId(2), NodeId(1)),
            Err(VoxError::WouldCreateCycle { .. })
        ));
        assert!(matches!(
            h.add_node(bus(2)),
            Err(VoxError::DuplicateUniqueId(2))
        ));

        assert_eq!(h.generation(), generation, "rejected calls must not mutate");
        assert_eq!(h.node(NodeId(2)).and_then(|n| n.parent), Some(NodeId(1)));
        assert_eq!(h.children_snapshot(NodeId(3)), Vec::<NodeId>::new());
    }

    #[test]
    fn test_master_set_tracks_top_level_buses() {
        let mut h = small_graph();
        assert_eq!(h.master_buses().collect::<Vec<_>>(), vec![NodeId(1)]);
        assert!(h.is_mixing(NodeId(1)), "top-level buses mix");
        assert!(!h.is_mixing(NodeId(2)));

        h.remove_child(NodeId(1), NodeId(2)).unwrap();
        assert!(h.is_top_level(NodeId(2)));
        assert!(h.is_mixing(NodeId(2)));
    }

    #[test]
    fn test_release_destroys_and_detaches() {
        let mut h = small_graph();
        // Music holds: registry + leaf 10
        assert_eq!(h.node(NodeId(2)).map(|n| n.ref_count), Some(2));

        assert!(!h.release(NodeId(2)), "leaf still holds a reference");
        assert!(h.release(NodeId(10)), "sound dies with its registry ref");
        assert!(!h.contains(NodeId(10)));
        assert!(!h.contains(NodeId(2)), "bus freed once its last leaf left");
        assert_eq!(h.children_snapshot(NodeId(1)), Vec::<NodeId>::new());
        assert_eq!(h.node(NodeId(1)).map(|n| n.ref_count), Some(1));
    }

    #[test]
    fn test_last_bank_unloaded() {
        let mut h = small_graph();
        h.release(NodeId(10));
        assert!(!h.last_bank_unloaded());
        assert!(h.release(NodeId(2)));
        assert!(!h.last_bank_unloaded());
        assert!(h.release(NodeId(1)));
        assert!(h.last_bank_unloaded());
        assert!(h.is_empty());
    }

    #[test]
    fn test_effect_flips_mixing_and_bumps_generation() {
        let mut h = small_graph();
        let generation = h.generation();
        assert!(h.add_effect(NodeId(2), 77).unwrap());
        assert!(h.is_mixing(NodeId(2)));
        assert!(h.generation() > generation);

        let generation = h.generation();
        assert!(!h.add_effect(NodeId(2), 78).unwrap(), "already mixing");
        assert_eq!(h.generation(), generation);
        assert!(!h.remove_effect(NodeId(2), 77).unwrap());
        assert!(h.remove_effect(NodeId(2), 78).unwrap());
        assert!(!h.is_mixing(NodeId(2)));
    }

    #[test]
    fn test_activity_reports_zero_crossings() {
        let mut h = small_graph();
        let (chains, first) = h.voice_started(NodeId(10), 5);
        assert_eq!(first.became_active, vec![NodeId(2), NodeId(1)]);
        let (_, second) = h.voice_started(NodeId(10), 5);
        assert!(second.became_active.is_empty());
        assert_eq!(h.instances_on(NodeId(10), 5), 2);

        h.voice_stopped(&chains, 5);
        let last = h.voice_stopped(&chains, 5);
        assert_eq!(last.became_idle, vec![NodeId(2), NodeId(1)]);
        assert!(h.node(NodeId(10)).is_some_and(|n| n.activity.is_none()));
    }

    #[test]
    fn test_stop_after_reroute_releases_original_bus() {
        let mut h = small_graph();
        h.add_node(bus(3)).unwrap();
        let (chains, _) = h.voice_started(NodeId(10), 5);
        h.set_output_bus(NodeId(10), Some(NodeId(3))).unwrap();

        let change = h.voice_stopped(&chains, 5);
        assert_eq!(change.became_idle, vec![NodeId(2), NodeId(1)]);
        let active = |h: &Hierarchy, id: u32| {
            h.node(NodeId(id))
                .and_then(|n| n.bus_data())
                .map_or(0, |b| b.active_voices)
        };
        assert_eq!(active(&h, 2), 0);
        assert_eq!(active(&h, 3), 0, "new bus never counted the voice");
    }

    #[test]
    fn test_effective_output_bus_inherits_from_parent() {
        let mut h = small_graph();
        h.add_node(Node::container(NodeId(20), crate::containers::ContainerData::sequence()))
            .unwrap();
        h.add_node(sound(21)).unwrap();
        h.add_child(NodeId(20), NodeId(21)).unwrap();
        assert_eq!(h.effective_output_bus(NodeId(21)), None);
        h.set_output_bus(NodeId(20), Some(NodeId(1))).unwrap();
        assert_eq!(h.effective_output_bus(NodeId(21)), Some(NodeId(1)));
        assert!(matches!(
            h.set_output_bus(NodeId(20), Some(NodeId(1))),
            Err(VoxError::AlreadyConnected(_))
        ));
    }
}
