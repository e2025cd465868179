//! Containers
//!
//! Random, sequence and switch containers pick which child plays:
//! - **Random**: weighted roll avoiding the last N picks, or a shuffled deck
//! - **Sequence**: playlist order, restarting or ping-ponging at the end
//! - **Switch**: every child mapped to the game object's current switch
//!
//! In *step* mode a container picks one child per play. In *continuous* mode
//! it keeps producing children (with a transition between them) until its
//! loop count runs out; see [`crate::continuation`].
//!
//! Selection state lives per (container, game object) in [`ContainerStates`],
//! with one seeded RNG so runs are reproducible.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use vox_core::{GameObjectId, NodeId};
use vox_event::GameSyncs;

use crate::continuation::{ChildKind, ContinuationSource, HistoryEntry};
use crate::hierarchy::Hierarchy;
use crate::node::NodeCategory;

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContainerKind {
    #[default]
    Random = 0,
    Sequence = 1,
    Switch = 2,
}

impl ContainerKind {
    #[inline]
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ContainerKind::Random),
            1 => Some(ContainerKind::Sequence),
            2 => Some(ContainerKind::Switch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum PlayMode {
    #[default]
    Step = 0,
    Continuous = 1,
}

/// Transition between consecutive children in continuous mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContinuousTransition {
    /// Next child starts when the current one ends
    #[default]
    Disabled = 0,
    CrossfadeAmp = 1,
    CrossfadePower = 2,
    /// Silence of `transition_ms` between children
    Delay = 3,
    /// Next child starts on the exact sample the current one ends
    SampleAccurate = 4,
}

impl ContinuousTransition {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => ContinuousTransition::CrossfadeAmp,
            2 => ContinuousTransition::CrossfadePower,
            3 => ContinuousTransition::Delay,
            4 => ContinuousTransition::SampleAccurate,
            _ => ContinuousTransition::Disabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RandomMode {
    /// Weighted roll, avoiding recent picks
    #[default]
    Standard = 0,
    /// Every child once before any repeats
    Shuffle = 1,
}

/// What a step sequence does after its last child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SequenceEnd {
    #[default]
    Restart = 0,
    Reverse = 1,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTAINER DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// Container-specific node data; the playlist is the node's children
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerData {
    pub kind: ContainerKind,
    pub play_mode: PlayMode,
    pub transition: ContinuousTransition,
    pub transition_ms: f32,
    /// Playlist repetitions in continuous mode (0 = infinite)
    pub loop_count: u16,
    pub random_mode: RandomMode,
    pub avoid_repeat_count: u32,
    /// Per-child weights; children not listed weigh 1.0
    pub weights: Vec<(NodeId, f32)>,
    pub sequence_end: SequenceEnd,
    pub switch_group: u32,
    pub switch_map: Vec<(u32, Vec<NodeId>)>,
    pub default_switch: u32,
}

impl ContainerData {
    pub fn random() -> Self {
        Self {
            kind: ContainerKind::Random,
            loop_count: 1,
            ..Default::default()
        }
    }

    pub fn sequence() -> Self {
        Self {
            kind: ContainerKind::Sequence,
            loop_count: 1,
            ..Default::default()
        }
    }

    pub fn switch(group: u32) -> Self {
        Self {
            kind: ContainerKind::Switch,
            loop_count: 1,
            switch_group: group,
            ..Default::default()
        }
    }

    /// Continuous playback with the given child transition
    pub fn continuous(mut self, transition: ContinuousTransition, transition_ms: f32) -> Self {
        self.play_mode = PlayMode::Continuous;
        self.transition = transition;
        self.transition_ms = transition_ms.max(0.0);
        self
    }

    pub fn with_loop_count(mut self, loop_count: u16) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn with_random_mode(mut self, mode: RandomMode) -> Self {
        self.random_mode = mode;
        self
    }

    pub fn with_avoid_repeat(mut self, count: u32) -> Self {
        self.avoid_repeat_count = count;
        self
    }

    pub fn with_weight(mut self, child: NodeId, weight: f32) -> Self {
        self.weights.retain(|(c, _)| *c != child);
        self.weights.push((child, weight.max(0.0)));
        self
    }

    pub fn with_sequence_end(mut self, end: SequenceEnd) -> Self {
        self.sequence_end = end;
        self
    }

    pub fn with_switch_target(mut self, switch_id: u32, child: NodeId) -> Self {
        match self.switch_map.iter_mut().find(|(s, _)| *s == switch_id) {
            Some((_, targets)) => targets.push(child),
            None => self.switch_map.push((switch_id, vec![child])),
        }
        self
    }

    pub fn with_default_switch(mut self, switch_id: u32) -> Self {
        self.default_switch = switch_id;
        self
    }

    pub fn weight_of(&self, child: NodeId) -> f32 {
        self.weights
            .iter()
            .find(|(c, _)| *c == child)
            .map_or(1.0, |(_, w)| *w)
    }

    /// Targets for a switch, falling back to the default switch
    pub fn targets_for(&self, switch_id: u32) -> &[NodeId] {
        let lookup = |id: u32| {
            self.switch_map
                .iter()
                .find(|(s, _)| *s == id)
                .map(|(_, t)| t.as_slice())
        };
        lookup(switch_id)
            .or_else(|| lookup(self.default_switch))
            .unwrap_or(&[])
    }

    #[inline]
    pub fn is_continuous(&self) -> bool {
        self.play_mode == PlayMode::Continuous && self.kind != ContainerKind::Switch
    }

    /// Another pass over the playlist is allowed after `loops_done` passes
    #[inline]
    fn loops_again(&self, loops_done: u16) -> bool {
        self.loop_count == 0 || loops_done + 1 < self.loop_count
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SELECTION STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Playback state of one container for one game object
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    /// Recent picks, oldest first
    pub history: Vec<NodeId>,
    pub shuffle_deck: Vec<NodeId>,
    /// Next step position for sequences
    pub cursor: usize,
    pub reversing: bool,
}

impl SelectionState {
    fn remember(&mut self, child: NodeId, keep: usize) {
        self.history.push(child);
        while self.history.len() > keep {
            self.history.remove(0);
        }
    }

    fn select_weighted(
        &mut self,
        data: &ContainerData,
        children: &[NodeId],
        rng: &mut StdRng,
    ) -> Option<NodeId> {
        // Never avoid every child
        let keep = (data.avoid_repeat_count as usize).min(children.len().saturating_sub(1));
        let recent = &self.history[self.history.len().saturating_sub(keep)..];
        let available: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|c| !recent.contains(c))
            .collect();

        let total: f32 = available.iter().map(|c| data.weight_of(*c)).sum();
        let pick = if total <= 0.0 {
            available.first().copied()
        } else {
            let mut roll = rng.random::<f32>() * total;
            let mut chosen = available.last().copied();
            for child in &available {
                roll -= data.weight_of(*child);
                if roll <= 0.0 {
                    chosen = Some(*child);
                    break;
                }
            }
            chosen
        }?;

        self.remember(pick, keep.max(1));
        Some(pick)
    }

    fn select_shuffle(&mut self, children: &[NodeId], rng: &mut StdRng) -> Option<NodeId> {
        self.shuffle_deck.retain(|c| children.contains(c));
        if self.shuffle_deck.is_empty() {
            self.shuffle_deck = children.to_vec();
            // Fisher-Yates
            for i in (1..self.shuffle_deck.len()).rev() {
                let j = rng.random_range(0..=i);
                self.shuffle_deck.swap(i, j);
            }
            // Don't repeat the previous deck's last pick first
            if self.shuffle_deck.len() > 1 && self.history.last() == self.shuffle_deck.last() {
                let last = self.shuffle_deck.len() - 1;
                self.shuffle_deck.swap(0, last);
            }
        }
        let pick = self.shuffle_deck.pop()?;
        self.remember(pick, 1);
        Some(pick)
    }

    fn select_sequence_step(&mut self, data: &ContainerData, children: &[NodeId]) -> Option<NodeId> {
        let n = children.len();
        if n == 0 {
            return None;
        }
        self.cursor = self.cursor.min(n - 1);
        let pick = children[self.cursor];
        match data.sequence_end {
            SequenceEnd::Restart => self.cursor = (self.cursor + 1) % n,
            SequenceEnd::Reverse if n == 1 => {}
            SequenceEnd::Reverse => {
                if self.reversing {
                    if self.cursor == 0 {
                        self.reversing = false;
                        self.cursor = 1;
                    } else {
                        self.cursor -= 1;
                    }
                } else if self.cursor + 1 == n {
                    self.reversing = true;
                    self.cursor = n - 2;
                } else {
                    self.cursor += 1;
                }
            }
        }
        Some(pick)
    }
}

/// Selection state for every (container, game object) pair
#[derive(Debug)]
pub struct ContainerStates {
    states: HashMap<(NodeId, GameObjectId), SelectionState>,
    rng: StdRng,
}

impl ContainerStates {
    pub fn new(seed: u64) -> Self {
        Self {
            states: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn state_and_rng(&mut self, container: NodeId, game_object: GameObjectId) -> (&mut SelectionState, &mut StdRng) {
        (
            self.states.entry((container, game_object)).or_default(),
            &mut self.rng,
        )
    }

    pub fn reset(&mut self, container: NodeId, game_object: GameObjectId) {
        self.states.remove(&(container, game_object));
    }

    pub fn remove_game_object(&mut self, game_object: GameObjectId) {
        self.states.retain(|(_, go), _| *go != game_object);
    }

    pub fn remove_container(&mut self, container: NodeId) {
        self.states.retain(|(c, _), _| *c != container);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SELECTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Container selection for one game object, as seen by the continuation search
pub struct ContainerSelector<'a> {
    pub hierarchy: &'a Hierarchy,
    pub states: &'a mut ContainerStates,
    pub syncs: &'a GameSyncs,
    pub game_object: GameObjectId,
}

impl<'a> ContainerSelector<'a> {
    pub fn new(
        hierarchy: &'a Hierarchy,
        states: &'a mut ContainerStates,
        syncs: &'a GameSyncs,
        game_object: GameObjectId,
    ) -> Self {
        Self {
            hierarchy,
            states,
            syncs,
            game_object,
        }
    }

    fn container(&self, id: NodeId) -> Option<(&'a ContainerData, &'a [NodeId])> {
        let node = self.hierarchy.node(id)?;
        Some((node.container_data()?, node.children.as_slice()))
    }

    fn pick_random(&mut self, id: NodeId, data: &ContainerData, children: &[NodeId]) -> Option<NodeId> {
        let (state, rng) = self.states.state_and_rng(id, self.game_object);
        match data.random_mode {
            RandomMode::Standard => state.select_weighted(data, children, rng),
            RandomMode::Shuffle => state.select_shuffle(children, rng),
        }
    }
}

impl ContinuationSource for ContainerSelector<'_> {
    fn child_kind(&self, node: NodeId) -> ChildKind {
        let Some(n) = self.hierarchy.node(node) else {
            return ChildKind::Leaf;
        };
        match (n.category, n.container_data()) {
            (NodeCategory::Container, Some(data)) if data.kind == ContainerKind::Switch => {
                ChildKind::Switch
            }
            (NodeCategory::Container, Some(data)) if data.is_continuous() => ChildKind::Continuous,
            (NodeCategory::Container, Some(_)) => ChildKind::Step,
            _ => ChildKind::Leaf,
        }
    }

    fn next_child(&mut self, container: NodeId, last: Option<&HistoryEntry>) -> Option<HistoryEntry> {
        let (data, children) = self.container(container)?;
        let n = children.len() as u32;
        if n == 0 {
            return None;
        }
        let mut loops_done = last.map_or(0, |e| e.loops_done);

        match data.kind {
            ContainerKind::Sequence => {
                let mut position = last.map_or(0, |e| e.position + 1);
                if position >= n {
                    if !data.loops_again(loops_done) {
                        return None;
                    }
                    position = 0;
                    loops_done += 1;
                }
                Some(HistoryEntry {
                    container,
                    child: children[position as usize],
                    position,
                    played: position + 1,
                    loops_done,
                })
            }
            ContainerKind::Random => {
                let mut played = last.map_or(0, |e| e.played);
                if played >= n {
                    if !data.loops_again(loops_done) {
                        return None;
                    }
                    played = 0;
                    loops_done += 1;
                }
                let child = self.pick_random(container, data, children)?;
                let position = children.iter().position(|c| *c == child).unwrap_or(0) as u32;
                Some(HistoryEntry {
                    container,
                    child,
                    position,
                    played: played + 1,
                    loops_done,
                })
            }
            ContainerKind::Switch => None,
        }
    }

    fn select_step(&mut self, container: NodeId) -> Option<NodeId> {
        let (data, children) = self.container(container)?;
        match data.kind {
            ContainerKind::Random => self.pick_random(container, data, children),
            ContainerKind::Sequence => {
                let (state, _) = self.states.state_and_rng(container, self.game_object);
                state.select_sequence_step(data, children)
            }
            ContainerKind::Switch => self.switch_targets(container).first().copied(),
        }
    }

    fn switch_targets(&self, container: NodeId) -> Vec<NodeId> {
        let Some((data, _)) = self.container(container) else {
            return Vec::new();
        };
        let current = self.syncs.switch(self.game_object, data.switch_group);
        data.targets_for(current).to_vec()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().map(|r| NodeId(*r)).collect()
    }

    #[test]
    fn test_sequence_step_restart_and_reverse() {
        let children = ids(&[1, 2, 3]);
        let data = ContainerData::sequence();
        let mut state = SelectionState::default();
        let picks: Vec<u32> = (0..5)
            .filter_map(|_| state.select_sequence_step(&data, &children))
            .map(|c| c.0)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2]);

        let data = ContainerData::sequence().with_sequence_end(SequenceEnd::Reverse);
        let mut state = SelectionState::default();
        let picks: Vec<u32> = (0..7)
            .filter_map(|_| state.select_sequence_step(&data, &children))
            .map(|c| c.0)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 2, 1, 2, 3]);
    }

    #[test]
    fn test_shuffle_plays_each_child_once_per_deck() {
        let children = ids(&[1, 2, 3, 4]);
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = SelectionState::default();
        let mut deck: Vec<u32> = (0..4)
            .filter_map(|_| state.select_shuffle(&children, &mut rng))
            .map(|c| c.0)
            .collect();
        deck.sort_unstable();
        assert_eq!(deck, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_weighted_avoids_recent_picks() {
        let children = ids(&[1, 2, 3]);
        let data = ContainerData::random().with_avoid_repeat(2);
        let mut rng = StdRng::seed_from_u64(42);
        let mut state = SelectionState::default();
        let mut prev: Vec<NodeId> = Vec::new();
        for _ in 0..50 {
            let pick = state.select_weighted(&data, &children, &mut rng).unwrap();
            let window = &prev[prev.len().saturating_sub(2)..];
            assert!(!window.contains(&pick), "{:?} repeated within {:?}", pick, window);
            prev.push(pick);
        }
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let children = ids(&[1, 2]);
        let data = ContainerData::random().with_weight(NodeId(2), 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = SelectionState::default();
        for _ in 0..20 {
            assert_eq!(
                state.select_weighted(&data, &children, &mut rng),
                Some(NodeId(1))
            );
        }
    }

    #[test]
    fn test_switch_targets_fall_back_to_default() {
        let data = ContainerData::switch(5)
            .with_switch_target(1, NodeId(10))
            .with_switch_target(2, NodeId(20))
            .with_switch_target(2, NodeId(21))
            .with_default_switch(1);
        assert_eq!(data.targets_for(2), &[NodeId(20), NodeId(21)]);
        assert_eq!(data.targets_for(99), &[NodeId(10)]);
        assert!(!data.is_continuous());
    }

    #[test]
    fn test_loop_count_allows_extra_passes() {
        let data = ContainerData::sequence().with_loop_count(2);
        assert!(data.loops_again(0));
        assert!(!data.loops_again(1));
        let infinite = ContainerData::sequence().with_loop_count(0);
        assert!(infinite.loops_again(1000));
    }
}
