//! Pending Action Scheduler
//!
//! Deferred actions wait in one of two ordered maps:
//!
//! ```text
//!   due:    (launch TickTime, seq)       → PendingAction   "not yet due"
//!   paused: (target node, playing, seq)  → PendingAction   "paused while pending"
//! ```
//!
//! Pausing moves an entry from `due` to `paused`; resuming shifts its launch
//! time by the paused duration and moves it back. Bulk resume by node walks
//! only the matching key range. Cancellation removes matches from whichever
//! map holds them and hands each entry back exactly once, so the owning
//! `Arc<Action>` is released once.

use std::collections::BTreeMap;
use std::sync::Arc;

use vox_core::{GameObjectId, NodeId, PlayingId, Tick, TickTime, VoxError, VoxResult};

use crate::action::{Action, ActionType};

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING ACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Action scheduled for future execution
///
/// `X` carries engine-specific payload, e.g. a continuation hand-off.
#[derive(Debug, Clone)]
pub struct PendingAction<X = ()> {
    pub action: Arc<Action>,
    /// Node the action resolves against (usually `action.target`)
    pub target: NodeId,
    pub game_object: GameObjectId,
    pub playing_id: PlayingId,
    pub custom_param: u64,
    /// Sample-accurate launch time
    pub launch: TickTime,
    /// Tick at which the entry was paused
    pub paused_tick: Option<Tick>,
    /// Nested pause depth while in the paused map
    pub pause_count: u32,
    pub extra: X,
}

impl<X> PendingAction<X> {
    pub fn new(
        action: Arc<Action>,
        game_object: GameObjectId,
        playing_id: PlayingId,
        launch: TickTime,
        extra: X,
    ) -> Self {
        Self {
            target: action.target,
            action,
            game_object,
            playing_id,
            custom_param: 0,
            launch,
            paused_tick: None,
            pause_count: 0,
            extra,
        }
    }

    pub fn with_custom_param(mut self, custom_param: u64) -> Self {
        self.custom_param = custom_param;
        self
    }

    #[inline]
    pub fn action_type(&self) -> ActionType {
        self.action.action_type
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused_tick.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Match criteria for cancellation and pause/resume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingFilter {
    pub node: Option<NodeId>,
    pub game_object: Option<GameObjectId>,
    pub playing_id: Option<PlayingId>,
}

impl PendingFilter {
    /// Matches every user-visible entry
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_playing_id(playing_id: PlayingId) -> Self {
        Self {
            playing_id: Some(playing_id),
            ..Default::default()
        }
    }

    pub fn by_node(node: NodeId, game_object: Option<GameObjectId>) -> Self {
        Self {
            node: Some(node),
            game_object,
            playing_id: None,
        }
    }

    pub fn with_game_object(mut self, game_object: Option<GameObjectId>) -> Self {
        self.game_object = game_object;
        self
    }

    pub fn matches<X>(&self, pa: &PendingAction<X>) -> bool {
        if pa.action.action_type.is_internal() {
            return false;
        }
        self.node.is_none_or(|n| n == pa.target)
            && self.game_object.is_none_or(|g| g == pa.game_object)
            && self.playing_id.is_none_or(|p| p == pa.playing_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING ACTION LIST
// ═══════════════════════════════════════════════════════════════════════════════

type DueKey = (TickTime, u64);
type PausedKey = (NodeId, PlayingId, u64);

/// Tick-keyed multimap of deferred actions
#[derive(Debug)]
pub struct PendingActionList<X = ()> {
    due: BTreeMap<DueKey, PendingAction<X>>,
    paused: BTreeMap<PausedKey, PendingAction<X>>,
    next_seq: u64,
    capacity: usize,
}

impl<X> PendingActionList<X> {
    pub fn new(capacity: usize) -> Self {
        Self {
            due: BTreeMap::new(),
            paused: BTreeMap::new(),
            next_seq: 0,
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.due.len() + self.paused.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn paused_len(&self) -> usize {
        self.paused.len()
    }

    /// Earliest launch time still waiting
    pub fn next_launch(&self) -> Option<TickTime> {
        self.due.keys().next().map(|(t, _)| *t)
    }

    fn seq(&mut self) -> u64 {
        let s = self.next_seq;
        self.next_seq += 1;
        s
    }

    /// Schedule an action; fails when the list is at capacity
    pub fn insert(&mut self, pa: PendingAction<X>) -> VoxResult<()> {
        if self.len() >= self.capacity {
            log::warn!("PendingActionList: at capacity ({}), {} dropped", self.capacity, pa.target);
            return Err(VoxError::InsufficientMemory("pending action list full"));
        }
        let seq = self.seq();
        self.due.insert((pa.launch, seq), pa);
        Ok(())
    }

    /// Pop every entry due at or before `now`, in launch order.
    ///
    /// Sub-tick frame offsets are preserved on the returned entries.
    pub fn process_due(&mut self, now: Tick) -> Vec<PendingAction<X>> {
        let later = self.due.split_off(&(TickTime::new(now + 1, 0), 0));
        let due = std::mem::replace(&mut self.due, later);
        due.into_values().collect()
    }

    fn take_where(&mut self, pred: impl Fn(&PendingAction<X>) -> bool) -> Vec<PendingAction<X>> {
        let due_keys: Vec<DueKey> = self
            .due
            .iter()
            .filter(|(_, pa)| pred(*pa))
            .map(|(k, _)| *k)
            .collect();
        let paused_keys: Vec<PausedKey> = self
            .paused
            .iter()
            .filter(|(_, pa)| pred(*pa))
            .map(|(k, _)| *k)
            .collect();

        let mut out = Vec::with_capacity(due_keys.len() + paused_keys.len());
        out.extend(due_keys.iter().filter_map(|k| self.due.remove(k)));
        out.extend(paused_keys.iter().filter_map(|k| self.paused.remove(k)));
        out
    }

    /// Remove every matching entry regardless of type
    pub fn clear(&mut self, filter: &PendingFilter) -> Vec<PendingAction<X>> {
        self.take_where(|pa| filter.matches(pa))
    }

    /// Remove every entry `pred` accepts, internal ones included
    pub fn clear_where(&mut self, pred: impl Fn(&PendingAction<X>) -> bool) -> Vec<PendingAction<X>> {
        self.take_where(pred)
    }

    /// Remove matching deferred plays (a Stop arriving before the play fired)
    pub fn stop_pending(&mut self, filter: &PendingFilter) -> Vec<PendingAction<X>> {
        self.take_where(|pa| pa.action_type().is_play_action() && filter.matches(pa))
    }

    /// Remove matching deferred continuations
    pub fn break_pending(&mut self, filter: &PendingFilter) -> Vec<PendingAction<X>> {
        self.take_where(|pa| pa.action_type() == ActionType::PlayAndContinue && filter.matches(pa))
    }

    /// Remove internal entries targeting `node` (e.g. ducking recovery)
    pub fn clear_internal(&mut self, node: NodeId, action_type: ActionType) -> Vec<PendingAction<X>> {
        self.take_where(|pa| pa.target == node && pa.action_type() == action_type)
    }

    /// Pause matching entries; already paused entries nest one level deeper.
    ///
    /// Returns the number of entries affected.
    pub fn pause(&mut self, filter: &PendingFilter, now: Tick) -> usize {
        let mut affected = 0;
        for pa in self.paused.values_mut().filter(|pa| filter.matches(&**pa)) {
            pa.pause_count += 1;
            affected += 1;
        }

        let keys: Vec<DueKey> = self
            .due
            .iter()
            .filter(|(_, pa)| filter.matches(*pa))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(mut pa) = self.due.remove(&key) {
                pa.paused_tick = Some(now);
                pa.pause_count = 1;
                let seq = self.seq();
                self.paused.insert((pa.target, pa.playing_id, seq), pa);
                affected += 1;
            }
        }
        affected
    }

    /// Resume matching paused entries.
    ///
    /// A master resume clears the whole pause count. Entries whose count
    /// reaches zero go back to the due map with their launch time pushed
    /// back by the paused duration.
    pub fn resume(&mut self, filter: &PendingFilter, master: bool, now: Tick) -> usize {
        let keys: Vec<PausedKey> = match filter.node {
            Some(node) => self
                .paused
                .range((node, 0, 0)..=(node, PlayingId::MAX, u64::MAX))
                .filter(|(_, pa)| filter.matches(*pa))
                .map(|(k, _)| *k)
                .collect(),
            None => self
                .paused
                .iter()
                .filter(|(_, pa)| filter.matches(*pa))
                .map(|(k, _)| *k)
                .collect(),
        };

        let mut resumed = 0;
        for key in keys {
            let Some(pa) = self.paused.get_mut(&key) else {
                continue;
            };
            pa.pause_count = if master {
                0
            } else {
                pa.pause_count.saturating_sub(1)
            };
            if pa.pause_count > 0 {
                continue;
            }
            if let Some(mut pa) = self.paused.remove(&key) {
                let paused_for = pa.paused_tick.take().map_or(0, |t| now.saturating_sub(t));
                pa.launch.tick += paused_for;
                let seq = self.seq();
                self.due.insert((pa.launch, seq), pa);
                resumed += 1;
            }
        }
        resumed
    }

    /// Check whether any entry matches
    pub fn contains(&self, filter: &PendingFilter) -> bool {
        self.due.values().any(|pa| filter.matches(pa))
            || self.paused.values().any(|pa| filter.matches(pa))
    }

    /// Drop everything, returning the entries
    pub fn flush(&mut self) -> Vec<PendingAction<X>> {
        let mut out: Vec<_> = std::mem::take(&mut self.due).into_values().collect();
        out.extend(std::mem::take(&mut self.paused).into_values());
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(action: Action, go: GameObjectId, pid: PlayingId, tick: Tick) -> PendingAction {
        PendingAction::new(Arc::new(action), go, pid, TickTime::new(tick, 0), ())
    }

    #[test]
    fn test_process_due_in_launch_order() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::play(NodeId(1)), 1, 10, 5)).unwrap();
        list.insert(pending(Action::play(NodeId(2)), 1, 11, 3)).unwrap();
        let mut late = pending(Action::play(NodeId(3)), 1, 12, 3);
        late.launch.frame_offset = 100;
        list.insert(late).unwrap();

        assert!(list.process_due(2).is_empty());

        let due = list.process_due(3);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].target, NodeId(2));
        assert_eq!(due[1].launch.frame_offset, 100, "frame offset must survive");

        let due = list.process_due(10);
        assert_eq!(due.len(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_same_tick_keeps_fifo() {
        let mut list = PendingActionList::new(16);
        for pid in 1..=5 {
            list.insert(pending(Action::play(NodeId(1)), 1, pid, 4)).unwrap();
        }
        let ids: Vec<_> = list.process_due(4).iter().map(|p| p.playing_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_capacity_limit() {
        let mut list = PendingActionList::new(1);
        list.insert(pending(Action::play(NodeId(1)), 1, 1, 1)).unwrap();
        assert!(matches!(
            list.insert(pending(Action::play(NodeId(1)), 1, 2, 1)),
            Err(VoxError::InsufficientMemory(_))
        ));
    }

    #[test]
    fn test_clear_by_playing_id_unlinks_from_both_maps() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::play(NodeId(1)), 1, 7, 10)).unwrap();
        list.insert(pending(Action::play(NodeId(2)), 1, 7, 20)).unwrap();
        list.insert(pending(Action::play(NodeId(3)), 1, 8, 20)).unwrap();
        list.pause(&PendingFilter::by_node(NodeId(2), None), 0);
        assert_eq!(list.paused_len(), 1);

        let action = Arc::new(Action::play(NodeId(9)));
        list.insert(PendingAction::new(Arc::clone(&action), 1, 7, TickTime::new(5, 0), ()))
            .unwrap();
        assert_eq!(Arc::strong_count(&action), 2);

        let removed = list.clear(&PendingFilter::by_playing_id(7));
        assert_eq!(removed.len(), 3);
        drop(removed);
        assert_eq!(Arc::strong_count(&action), 1, "action reference released once");
        assert_eq!(list.len(), 1);
        assert_eq!(list.paused_len(), 0);
    }

    #[test]
    fn test_stop_and_break_only_take_their_types() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::play(NodeId(1)), 1, 1, 10)).unwrap();
        list.insert(pending(Action::new(ActionType::PlayAndContinue, NodeId(1)), 1, 1, 10))
            .unwrap();
        list.insert(pending(Action::pause(NodeId(1)), 1, 1, 10)).unwrap();

        let broken = list.break_pending(&PendingFilter::by_node(NodeId(1), None));
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].action_type(), ActionType::PlayAndContinue);

        let stopped = list.stop_pending(&PendingFilter::by_node(NodeId(1), Some(1)));
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].action_type(), ActionType::Play);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_pause_resume_shifts_launch() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::play(NodeId(1)), 1, 1, 10)).unwrap();

        assert_eq!(list.pause(&PendingFilter::all(), 4), 1);
        assert!(list.process_due(100).is_empty(), "paused entries never fire");

        // Nested pause needs two resumes
        assert_eq!(list.pause(&PendingFilter::all(), 6), 1);
        assert_eq!(list.resume(&PendingFilter::all(), false, 8), 0);
        assert_eq!(list.resume(&PendingFilter::all(), false, 14), 1);

        // Paused from tick 4 to 14: launch moves from 10 to 20
        assert_eq!(list.next_launch(), Some(TickTime::new(20, 0)));
        assert!(list.process_due(19).is_empty());
        assert_eq!(list.process_due(20).len(), 1);
    }

    #[test]
    fn test_master_resume_clears_count() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::play(NodeId(5)), 1, 1, 10)).unwrap();
        list.pause(&PendingFilter::all(), 0);
        list.pause(&PendingFilter::all(), 0);
        list.pause(&PendingFilter::all(), 0);
        assert_eq!(list.resume(&PendingFilter::by_node(NodeId(5), None), true, 0), 1);
        assert_eq!(list.paused_len(), 0);
    }

    #[test]
    fn test_clear_where_reaches_internal_and_paused() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::duck_recovery(NodeId(3)), 0, 0, 10)).unwrap();
        list.insert(pending(Action::play(NodeId(3)), 1, 1, 10)).unwrap();
        list.insert(pending(Action::play(NodeId(4)), 1, 2, 10)).unwrap();
        list.pause(&PendingFilter::by_node(NodeId(3), None), 0);

        let removed = list.clear_where(|pa| pa.target == NodeId(3));
        assert_eq!(removed.len(), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.paused_len(), 0);
    }

    #[test]
    fn test_internal_actions_ignore_user_filters() {
        let mut list = PendingActionList::new(16);
        list.insert(pending(Action::duck_recovery(NodeId(3)), 0, 0, 10)).unwrap();
        assert!(list.clear(&PendingFilter::all()).is_empty());
        assert_eq!(list.pause(&PendingFilter::all(), 0), 0);
        assert_eq!(list.clear_internal(NodeId(3), ActionType::DuckRecovery).len(), 1);
    }
}
