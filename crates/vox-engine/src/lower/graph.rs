//! Mixing graph
//!
//! Mixing buses are the vertices; a bus feeds its next mixing bus above it
//! and every aux bus it sends to. Buses are grouped into depth levels with a
//! topological sort so every input of a bus is rendered before the bus itself:
//!
//! ```text
//!   level 0   [sfx] [voice-fx] [music]      leaves, no bus inputs
//!   level 1   [reverb-aux]                  fed by sfx + voice-fx sends
//!   level 2   [master]
//! ```
//!
//! Buses within one level are independent. A cycle (possible through aux
//! sends) never deadlocks: the unresolved buses go into a final level and
//! [`MixGraph::has_cycles`] reports it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use vox_core::NodeId;

use crate::hierarchy::Hierarchy;
use crate::resolve::route_from;

/// How one bus feeds another
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeKind {
    Output,
    Aux { level_db: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Default)]
pub struct MixGraph {
    /// Mixing buses grouped by depth, inputs first
    levels: Vec<Vec<NodeId>>,
    edges: Vec<MixEdge>,
    depth: HashMap<NodeId, usize>,
    generation: Option<u64>,
    has_cycles: bool,
    rebuild_count: u64,
}

impl MixGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the hierarchy changed since the last rebuild
    #[inline]
    pub fn needs_rebuild(&self, generation: u64) -> bool {
        self.generation != Some(generation)
    }

    pub fn rebuild(&mut self, hierarchy: &Hierarchy) {
        let buses: Vec<NodeId> = hierarchy
            .bus_ids()
            .into_iter()
            .filter(|id| hierarchy.is_mixing(*id))
            .collect();

        self.edges.clear();
        for &bus in &buses {
            let Some(node) = hierarchy.node(bus) else {
                continue;
            };
            if let Some(to) = node.parent.and_then(|p| route_from(hierarchy, p).mix_bus) {
                self.edges.push(MixEdge {
                    from: bus,
                    to,
                    kind: EdgeKind::Output,
                });
            }
            if let Some(data) = node.bus_data() {
                for send in &data.aux_sends {
                    if let Some(to) = route_from(hierarchy, send.bus).mix_bus {
                        self.edges.push(MixEdge {
                            from: bus,
                            to,
                            kind: EdgeKind::Aux {
                                level_db: send.level_db,
                            },
                        });
                    }
                }
            }
        }

        // Kahn's algorithm, depth = longest path from a leaf bus
        let mut in_degree: HashMap<NodeId, usize> = buses.iter().map(|id| (*id, 0)).collect();
        let mut depth: HashMap<NodeId, usize> = buses.iter().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            if let Some(deg) = in_degree.get_mut(&edge.to) {
                *deg += 1;
            }
        }

        let mut queue: VecDeque<NodeId> = buses
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut resolved = 0;

        while let Some(current) = queue.pop_front() {
            resolved += 1;
            let current_depth = depth.get(&current).copied().unwrap_or(0);
            for edge in self.edges.iter().filter(|e| e.from == current) {
                if let Some(d) = depth.get_mut(&edge.to) {
                    *d = (*d).max(current_depth + 1);
                }
                if let Some(deg) = in_degree.get_mut(&edge.to) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(edge.to);
                    }
                }
            }
        }

        self.has_cycles = resolved < buses.len();
        let max_depth = depth.values().copied().max().unwrap_or(0);
        if self.has_cycles {
            let last = max_depth + 1;
            for (id, deg) in &in_degree {
                if *deg > 0 {
                    depth.insert(*id, last);
                }
            }
            log::warn!(
                "MixGraph: {} buses in a routing cycle",
                buses.len() - resolved
            );
        }

        let mut grouped: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        for (id, d) in &depth {
            grouped.entry(*d).or_default().push(*id);
        }
        self.levels = grouped
            .into_values()
            .map(|mut level| {
                level.sort();
                level
            })
            .collect();
        self.depth = depth;
        self.generation = Some(hierarchy.generation());
        self.rebuild_count += 1;

        log::debug!(
            "MixGraph: compiled {} buses into {} levels, {} edges",
            buses.len(),
            self.levels.len(),
            self.edges.len()
        );
    }

    #[inline]
    pub fn levels(&self) -> &[Vec<NodeId>] {
        &self.levels
    }

    #[inline]
    pub fn edges(&self) -> &[MixEdge] {
        &self.edges
    }

    /// Edges leaving `bus`
    pub fn outputs(&self, bus: NodeId) -> impl Iterator<Item = &MixEdge> + '_ {
        self.edges.iter().filter(move |e| e.from == bus)
    }

    #[inline]
    pub fn depth(&self, bus: NodeId) -> Option<usize> {
        self.depth.get(&bus).copied()
    }

    #[inline]
    pub fn contains(&self, bus: NodeId) -> bool {
        self.depth.contains_key(&bus)
    }

    #[inline]
    pub fn has_cycles(&self) -> bool {
        self.has_cycles
    }

    #[inline]
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
