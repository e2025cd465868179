//! Voice limiters
//!
//! A limiter is a priority-ordered set of voices bounded by a maximum
//! count. `update_flags` walks the sorted set: the first `max` voices stay
//! audible, the rest are virtualized when the owning node allows it or
//! killed otherwise. Equal priorities are broken by the kill policy: with
//! kill-oldest the newer voice is kept, with kill-newest the older one.
//!
//! Limiters exist globally, per node and per (node, game object). The
//! registry combines their verdicts in a configurable order; a voice ends
//! with the harshest verdict any of its limiters gave it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use smallvec::SmallVec;

use vox_core::{GameObjectId, KillPolicy, LimiterArbitration, NodeId};

use crate::node::InstanceLimit;
use crate::pbi::PbiId;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Scope of a limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LimiterKey {
    Global,
    Node(NodeId),
    NodeGameObject(NodeId, GameObjectId),
}

/// Why a voice was forced out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KickReason {
    NodeLimit,
    GlobalLimit,
    ExplicitStop,
}

/// Outcome for one voice after a limiter pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterVerdict {
    Audible,
    Virtual(KickReason),
    Kill(KickReason),
}

impl LimiterVerdict {
    fn severity(&self) -> u8 {
        match self {
            LimiterVerdict::Audible => 0,
            LimiterVerdict::Virtual(_) => 1,
            LimiterVerdict::Kill(_) => 2,
        }
    }

    /// Harsher of two verdicts; the first wins ties
    pub fn worst(self, other: LimiterVerdict) -> LimiterVerdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LimiterEntry {
    pbi: PbiId,
    priority: f32,
    /// Admission order
    order: u64,
    can_virtualize: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIMITER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Limiter {
    pub key: LimiterKey,
    /// 0 = unlimited
    pub max_instances: u16,
    pub policy: KillPolicy,
    entries: Vec<LimiterEntry>,
}

impl Limiter {
    pub fn new(key: LimiterKey, max_instances: u16, policy: KillPolicy) -> Self {
        Self {
            key,
            max_instances,
            policy,
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, pbi: PbiId) -> bool {
        self.entries.iter().any(|e| e.pbi == pbi)
    }

    fn add(&mut self, entry: LimiterEntry) {
        if !self.contains(entry.pbi) {
            self.entries.push(entry);
        }
    }

    fn remove(&mut self, pbi: PbiId) {
        self.entries.retain(|e| e.pbi != pbi);
    }

    fn reason(&self) -> KickReason {
        match self.key {
            LimiterKey::Global => KickReason::GlobalLimit,
            _ => KickReason::NodeLimit,
        }
    }

    fn compare(policy: KillPolicy, a: &LimiterEntry, b: &LimiterEntry) -> Ordering {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| match policy {
                KillPolicy::KillOldest => b.order.cmp(&a.order),
                KillPolicy::KillNewest => a.order.cmp(&b.order),
            })
    }

    /// Rank candidates and give each a verdict.
    ///
    /// `excluded` voices were already pushed out elsewhere and neither take
    /// a slot nor receive a verdict here.
    fn update_flags(&mut self, excluded: &BTreeSet<PbiId>) -> Vec<(PbiId, LimiterVerdict)> {
        let policy = self.policy;
        self.entries.sort_by(|a, b| Self::compare(policy, a, b));

        let max = match self.max_instances {
            0 => usize::MAX,
            n => n as usize,
        };
        let reason = self.reason();
        let mut audible = 0;
        self.entries
            .iter()
            .filter(|e| !excluded.contains(&e.pbi))
            .map(|e| {
                let verdict = if audible < max {
                    audible += 1;
                    LimiterVerdict::Audible
                } else if e.can_virtualize {
                    LimiterVerdict::Virtual(reason)
                } else {
                    LimiterVerdict::Kill(reason)
                };
                (e.pbi, verdict)
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Limiter a voice joins, with the limit that created it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterScope {
    pub key: LimiterKey,
    pub limit: InstanceLimit,
}

impl LimiterScope {
    pub fn for_node(node: NodeId, game_object: GameObjectId, limit: InstanceLimit) -> Self {
        let key = if limit.per_game_object {
            LimiterKey::NodeGameObject(node, game_object)
        } else {
            LimiterKey::Node(node)
        };
        Self { key, limit }
    }
}

#[derive(Debug)]
pub struct LimiterRegistry {
    global: Limiter,
    global_virtualize: bool,
    limiters: BTreeMap<LimiterKey, Limiter>,
    arbitration: LimiterArbitration,
    order: u64,
}

impl LimiterRegistry {
    pub fn new(max_voices: u16, policy: KillPolicy, arbitration: LimiterArbitration) -> Self {
        Self {
            global: Limiter::new(LimiterKey::Global, max_voices, policy),
            global_virtualize: false,
            limiters: BTreeMap::new(),
            arbitration,
            order: 0,
        }
    }

    /// Let the global limiter virtualize instead of killing
    pub fn with_global_virtualize(mut self, virtualize: bool) -> Self {
        self.global_virtualize = virtualize;
        self
    }

    #[inline]
    pub fn limiter(&self, key: LimiterKey) -> Option<&Limiter> {
        match key {
            LimiterKey::Global => Some(&self.global),
            _ => self.limiters.get(&key),
        }
    }

    /// Node-scoped limiters currently alive
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Count a voice into the global limiter and every scope it falls under
    pub fn register(&mut self, pbi: PbiId, priority: f32, scopes: &[LimiterScope]) -> SmallVec<[LimiterKey; 3]> {
        self.order += 1;
        let order = self.order;
        let mut keys = SmallVec::new();

        self.global.add(LimiterEntry {
            pbi,
            priority,
            order,
            can_virtualize: self.global_virtualize,
        });
        keys.push(LimiterKey::Global);

        for scope in scopes {
            let limiter = self.limiters.entry(scope.key).or_insert_with(|| {
                Limiter::new(scope.key, scope.limit.max_instances, scope.limit.kill_policy)
            });
            limiter.add(LimiterEntry {
                pbi,
                priority,
                order,
                can_virtualize: scope.limit.use_virtual,
            });
            keys.push(scope.key);
        }
        keys
    }

    /// Remove a voice from its limiters; empty node limiters are dropped
    pub fn unregister(&mut self, pbi: PbiId, keys: &[LimiterKey]) {
        for key in keys {
            match key {
                LimiterKey::Global => self.global.remove(pbi),
                _ => {
                    let now_empty = self.limiters.get_mut(key).is_some_and(|l| {
                        l.remove(pbi);
                        l.is_empty()
                    });
                    if now_empty {
                        self.limiters.remove(key);
                    }
                }
            }
        }
    }

    pub fn set_priority(&mut self, pbi: PbiId, priority: f32) {
        let limiters = std::iter::once(&mut self.global).chain(self.limiters.values_mut());
        for limiter in limiters {
            for entry in limiter.entries.iter_mut().filter(|e| e.pbi == pbi) {
                entry.priority = priority;
            }
        }
    }

    /// Run every limiter and combine verdicts.
    ///
    /// Voices killed by the first stage do not occupy slots in the second.
    pub fn update(&mut self) -> BTreeMap<PbiId, LimiterVerdict> {
        let mut verdicts: BTreeMap<PbiId, LimiterVerdict> = BTreeMap::new();
        let merge = |verdicts: &mut BTreeMap<PbiId, LimiterVerdict>, list: Vec<(PbiId, LimiterVerdict)>| {
            for (pbi, v) in list {
                let entry = verdicts.entry(pbi).or_insert(LimiterVerdict::Audible);
                *entry = entry.worst(v);
            }
        };

        let killed = |verdicts: &BTreeMap<PbiId, LimiterVerdict>| -> BTreeSet<PbiId> {
            verdicts
                .iter()
                .filter(|(_, v)| !matches!(v, LimiterVerdict::Audible))
                .map(|(p, _)| *p)
                .collect()
        };

        match self.arbitration {
            LimiterArbitration::NodeFirst => {
                for limiter in self.limiters.values_mut() {
                    let excluded = killed(&verdicts);
                    merge(&mut verdicts, limiter.update_flags(&excluded));
                }
                let excluded = killed(&verdicts);
                merge(&mut verdicts, self.global.update_flags(&excluded));
            }
            LimiterArbitration::GlobalFirst => {
                merge(&mut verdicts, self.global.update_flags(&BTreeSet::new()));
                for limiter in self.limiters.values_mut() {
                    let excluded = killed(&verdicts);
                    merge(&mut verdicts, limiter.update_flags(&excluded));
                }
            }
        }
        verdicts
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn node_scope(max: u16, policy: KillPolicy, virt: bool) -> LimiterScope {
        LimiterScope::for_node(
            NodeId(1),
            1,
            InstanceLimit::new(max).with_policy(policy).with_virtual(virt),
        )
    }

    #[test]
    fn test_priority_wins() {
        let mut reg = LimiterRegistry::new(0, KillPolicy::KillOldest, LimiterArbitration::NodeFirst);
        let scope = [node_scope(1, KillPolicy::KillOldest, false)];
        reg.register(PbiId(1), 80.0, &scope);
        reg.register(PbiId(2), 20.0, &scope);
        let v = reg.update();
        assert_eq!(v[&PbiId(1)], LimiterVerdict::Audible);
        assert_eq!(v[&PbiId(2)], LimiterVerdict::Kill(KickReason::NodeLimit));
    }

    #[test]
    fn test_tie_break_follows_policy() {
        let mut reg = LimiterRegistry::new(0, KillPolicy::KillOldest, LimiterArbitration::NodeFirst);
        let oldest = [node_scope(1, KillPolicy::KillOldest, false)];
        reg.register(PbiId(1), 50.0, &oldest);
        reg.register(PbiId(2), 50.0, &oldest);
        let v = reg.update();
        assert_eq!(v[&PbiId(1)], LimiterVerdict::Kill(KickReason::NodeLimit));
        assert_eq!(v[&PbiId(2)], LimiterVerdict::Audible);

        let mut reg = LimiterRegistry::new(0, KillPolicy::KillOldest, LimiterArbitration::NodeFirst);
        let newest = [node_scope(1, KillPolicy::KillNewest, false)];
        reg.register(PbiId(1), 50.0, &newest);
        reg.register(PbiId(2), 50.0, &newest);
        let v = reg.update();
        assert_eq!(v[&PbiId(1)], LimiterVerdict::Audible);
        assert_eq!(v[&PbiId(2)], LimiterVerdict::Kill(KickReason::NodeLimit));
    }

    #[test]
    fn test_virtualize_when_allowed() {
        let mut reg = LimiterRegistry::new(0, KillPolicy::KillOldest, LimiterArbitration::NodeFirst);
        let scope = [node_scope(2, KillPolicy::KillNewest, true)];
        for i in 1..=4 {
            reg.register(PbiId(i), 50.0, &scope);
        }
        let v = reg.update();
        let audible = v.values().filter(|v| **v == LimiterVerdict::Audible).count();
        assert_eq!(audible, 2);
        assert_eq!(v[&PbiId(4)], LimiterVerdict::Virtual(KickReason::NodeLimit));

        // Freed capacity devirtualizes the next in line
        reg.unregister(PbiId(1), &[LimiterKey::Global, LimiterKey::Node(NodeId(1))]);
        let v = reg.update();
        assert_eq!(v[&PbiId(3)], LimiterVerdict::Audible);
        assert_eq!(v[&PbiId(4)], LimiterVerdict::Virtual(KickReason::NodeLimit));
    }

    #[test]
    fn test_global_limit_reason() {
        let mut reg = LimiterRegistry::new(1, KillPolicy::KillNewest, LimiterArbitration::NodeFirst);
        reg.register(PbiId(1), 50.0, &[]);
        reg.register(PbiId(2), 50.0, &[]);
        let v = reg.update();
        assert_eq!(v[&PbiId(2)], LimiterVerdict::Kill(KickReason::GlobalLimit));
    }

    #[test]
    fn test_killed_by_node_frees_global_slot() {
        let mut reg = LimiterRegistry::new(2, KillPolicy::KillNewest, LimiterArbitration::NodeFirst);
        let scope = [node_scope(1, KillPolicy::KillNewest, false)];
        reg.register(PbiId(1), 50.0, &scope);
        reg.register(PbiId(2), 50.0, &scope);
        reg.register(PbiId(3), 10.0, &[]);
        let v = reg.update();
        assert_eq!(v[&PbiId(2)], LimiterVerdict::Kill(KickReason::NodeLimit));
        assert_eq!(v[&PbiId(3)], LimiterVerdict::Audible);
    }

    #[test]
    fn test_unregister_drops_empty_limiters() {
        let mut reg = LimiterRegistry::new(0, KillPolicy::KillOldest, LimiterArbitration::GlobalFirst);
        let keys = reg.register(PbiId(1), 50.0, &[node_scope(1, KillPolicy::KillOldest, false)]);
        assert_eq!(reg.len(), 1);
        reg.unregister(PbiId(1), &keys);
        assert!(reg.is_empty());
        assert!(reg.limiter(LimiterKey::Global).is_some_and(|l| l.is_empty()));
    }
}
