//! Continuation search for chained playback
//!
//! A chained voice carries a [`ContinuationList`] (containers still being
//! walked, innermost last) and a [`PlayHistory`] (where each of those
//! containers currently is). When the next element is needed the list is
//! walked from the tail:
//!
//! ```text
//!   [Seq A] [Rnd B]           ask B for its next child
//!        │      └── none  →   pop B and its history, ask A
//!        └── child C (container, continuous) → push C, ask C
//!   [Seq A] [Rnd B] [MultiPlay{winner}] → splice winner branch, continue
//! ```
//!
//! [`next_decision`] is pure apart from the selection source it is handed,
//! so the search is testable without building a voice.

use smallvec::{SmallVec, smallvec};

use vox_core::{FadeCurve, NodeId};

use crate::containers::ContinuousTransition;

// ═══════════════════════════════════════════════════════════════════════════════
// LIST & HISTORY
// ═══════════════════════════════════════════════════════════════════════════════

/// One entry of a continuation list
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationItem {
    /// A continuous container still producing children
    Container(NodeId),
    /// Parallel switch branches; at most one keeps the chain going
    MultiPlay {
        branches: Vec<ContinuationList>,
        winner: Option<usize>,
    },
}

/// Remaining continuation items, innermost last
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContinuationList {
    pub items: Vec<ContinuationItem>,
}

impl ContinuationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_container(container: NodeId) -> Self {
        Self {
            items: vec![ContinuationItem::Container(container)],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Innermost container still being walked
    pub fn innermost_container(&self) -> Option<NodeId> {
        self.items.iter().rev().find_map(|item| match item {
            ContinuationItem::Container(id) => Some(*id),
            ContinuationItem::MultiPlay { .. } => None,
        })
    }

    /// Drop every item that refers to `node`
    pub fn remove_node(&mut self, node: NodeId) -> usize {
        let before = self.items.len();
        self.items
            .retain(|item| !matches!(item, ContinuationItem::Container(id) if *id == node));
        for item in &mut self.items {
            if let ContinuationItem::MultiPlay { branches, .. } = item {
                for branch in branches {
                    branch.remove_node(node);
                }
            }
        }
        before - self.items.len()
    }
}

/// Where a container is within its playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub container: NodeId,
    /// Child chosen last
    pub child: NodeId,
    /// Index of that child in the container's playlist
    pub position: u32,
    /// Children played in the current loop
    pub played: u32,
    /// Completed loops
    pub loops_done: u16,
}

/// Play history, one entry per container being walked
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayHistory {
    entries: SmallVec<[HistoryEntry; 4]>,
}

impl PlayHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, container: NodeId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.container == container)
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        match self.entries.iter_mut().find(|e| e.container == entry.container) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, container: NodeId) {
        self.entries.retain(|e| e.container != container);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// How a node behaves when the chain reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Plays as a single voice
    Leaf,
    /// Container that picks one child per play
    Step,
    /// Container that keeps producing children
    Continuous,
    /// Switch container; plays every node mapped to the current switch
    Switch,
}

/// Container selection logic consulted by the search
pub trait ContinuationSource {
    fn child_kind(&self, node: NodeId) -> ChildKind;

    /// Next child of a continuous container, given where it was
    fn next_child(&mut self, container: NodeId, last: Option<&HistoryEntry>) -> Option<HistoryEntry>;

    /// One child of a step container
    fn select_step(&mut self, container: NodeId) -> Option<NodeId>;

    /// Nodes mapped to the current switch of a switch container
    fn switch_targets(&self, container: NodeId) -> Vec<NodeId>;
}

/// Outcome of a continuation search
#[derive(Debug, Clone, PartialEq)]
pub enum NextDecision {
    Next {
        /// Node that carries the chain forward
        node: NodeId,
        /// Nodes started alongside it without a continuation
        also: SmallVec<[NodeId; 2]>,
        history: PlayHistory,
        list: ContinuationList,
    },
    End,
}

/// Resolve a node picked by the chain down to something playable.
///
/// Either yields the node that carries the chain, pushes a new item to walk,
/// or reports that the node produced nothing and the search moves on.
fn resolve(
    mut node: NodeId,
    list: &mut ContinuationList,
    also: &mut SmallVec<[NodeId; 2]>,
    source: &mut impl ContinuationSource,
) -> Resolved {
    loop {
        match source.child_kind(node) {
            ChildKind::Leaf => return Resolved::Carrier(node),
            ChildKind::Step => match source.select_step(node) {
                Some(child) => node = child,
                None => return Resolved::Nothing,
            },
            ChildKind::Continuous => {
                list.items.push(ContinuationItem::Container(node));
                return Resolved::Descend;
            }
            ChildKind::Switch => {
                let mut branches = Vec::new();
                for target in source.switch_targets(node) {
                    if source.child_kind(target) == ChildKind::Continuous {
                        branches.push(ContinuationList::for_container(target));
                    } else {
                        also.push(target);
                    }
                }
                if !branches.is_empty() {
                    list.items.push(ContinuationItem::MultiPlay {
                        branches,
                        winner: Some(0),
                    });
                    return Resolved::Descend;
                }
                if also.is_empty() {
                    return Resolved::Nothing;
                }
                // Leaf-only switch: the first target carries the chain
                let carrier = also.remove(0);
                return Resolved::Carrier(carrier);
            }
        }
    }
}

enum Resolved {
    Carrier(NodeId),
    Descend,
    Nothing,
}

/// Upper bound on search steps; looping containers of empty children never resolve
const MAX_SEARCH_STEPS: usize = 1024;

/// Find the next element to play after the current one.
///
/// Walks `list` from the tail with backtracking. A container with no next
/// child is popped together with its history entry; a multi-play item is
/// replaced by its winning branch, and ends the chain when it has none.
pub fn next_decision(
    history: &PlayHistory,
    list: &ContinuationList,
    source: &mut impl ContinuationSource,
) -> NextDecision {
    let mut history = history.clone();
    let mut list = list.clone();
    let mut also: SmallVec<[NodeId; 2]> = smallvec![];

    for _ in 0..MAX_SEARCH_STEPS {
        let Some(tail) = list.items.last().cloned() else {
            return NextDecision::End;
        };

        match tail {
            ContinuationItem::MultiPlay { branches, winner } => {
                list.items.pop();
                match winner.and_then(|w| branches.into_iter().nth(w)) {
                    Some(branch) => list.items.extend(branch.items),
                    None => return NextDecision::End,
                }
            }
            ContinuationItem::Container(container) => {
                match source.next_child(container, history.entry(container)) {
                    Some(entry) => {
                        history.record(entry);
                        match resolve(entry.child, &mut list, &mut also, source) {
                            Resolved::Carrier(node) => {
                                return NextDecision::Next {
                                    node,
                                    also,
                                    history,
                                    list,
                                };
                            }
                            Resolved::Descend | Resolved::Nothing => {}
                        }
                    }
                    None => {
                        history.remove(container);
                        list.items.pop();
                    }
                }
            }
        }
    }
    log::warn!("Continuation search gave up after {} steps", MAX_SEARCH_STEPS);
    NextDecision::End
}

// ═══════════════════════════════════════════════════════════════════════════════
// CROSSFADE TIMING
// ═══════════════════════════════════════════════════════════════════════════════

/// When and how the next element starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NextTiming {
    /// Start when the current voice terminates, after `delay_ms`
    OnTermination { delay_ms: f32 },
    /// Schedule at voice start: next begins `delay_ms` in, fading over `fade_ms`
    Scheduled {
        delay_ms: f32,
        fade_ms: f32,
        curve: FadeCurve,
    },
}

/// Timing for the element after one lasting `current_len_ms`.
///
/// Crossfades are clamped to half the current length so no more than two
/// instances overlap; below `min_crossfade_ms` the next element just starts
/// when the current one ends.
pub fn crossfade_plan(
    mode: ContinuousTransition,
    requested_ms: f32,
    current_len_ms: f32,
    min_crossfade_ms: f32,
) -> NextTiming {
    let requested_ms = requested_ms.max(0.0);
    let current_len_ms = current_len_ms.max(0.0);
    match mode {
        ContinuousTransition::Disabled => NextTiming::OnTermination { delay_ms: 0.0 },
        ContinuousTransition::Delay => NextTiming::OnTermination {
            delay_ms: requested_ms,
        },
        ContinuousTransition::SampleAccurate => NextTiming::Scheduled {
            delay_ms: current_len_ms,
            fade_ms: 0.0,
            curve: FadeCurve::Linear,
        },
        ContinuousTransition::CrossfadeAmp | ContinuousTransition::CrossfadePower => {
            let curve = if mode == ContinuousTransition::CrossfadePower {
                FadeCurve::Sine
            } else {
                FadeCurve::Linear
            };
            let fade_ms = requested_ms.min(current_len_ms / 2.0);
            if fade_ms < min_crossfade_ms {
                NextTiming::Scheduled {
                    delay_ms: current_len_ms,
                    fade_ms: 0.0,
                    curve,
                }
            } else {
                NextTiming::Scheduled {
                    delay_ms: current_len_ms - fade_ms,
                    fade_ms,
                    curve,
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
