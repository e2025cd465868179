//! Transition Manager
//!
//! Value ramps shared by play/stop fades, pause/resume fades, ducking, mute
//! and state changes. A transition interpolates `start → target` over a
//! number of samples with a [`FadeCurve`] and reports its value to each of
//! its users every frame.
//!
//! ## Capacity
//!
//! Two bounded categories are tracked separately:
//! - **Fade**: voice fades and duck fades
//! - **State**: state-driven and scoped-instance (SIS) value changes
//!
//! A request that does nothing (zero duration, or already at the target)
//! never enters the list: it resolves immediately with the target value.
//!
//! Users are plain ids ([`TransitionUser`]), never pointers. A transition
//! whose last user leaves is reclaimed at once, whatever its progress.

use smallvec::SmallVec;

use vox_core::{FadeCurve, GameObjectId, NodeId, VoxError, VoxResult};

use crate::bus::DuckScope;
use crate::pbi::PbiId;
use crate::props::PropId;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionCategory {
    Fade,
    State,
}

/// Which fade ratio of a voice a transition drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FadeKind {
    PlayStop,
    PauseResume,
}

/// Receiver of a transition's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionUser {
    Voice { pbi: PbiId, kind: FadeKind },
    Duck {
        source: NodeId,
        target: NodeId,
        scope: DuckScope,
    },
    Sis {
        node: NodeId,
        game_object: GameObjectId,
        prop: PropId,
    },
    State { node: NodeId, prop: PropId },
}

impl TransitionUser {
    pub fn category(&self) -> TransitionCategory {
        match self {
            TransitionUser::Voice { .. } | TransitionUser::Duck { .. } => TransitionCategory::Fade,
            TransitionUser::Sis { .. } | TransitionUser::State { .. } => TransitionCategory::State,
        }
    }

    #[inline]
    pub fn pbi(&self) -> Option<PbiId> {
        match self {
            TransitionUser::Voice { pbi, .. } => Some(*pbi),
            _ => None,
        }
    }
}

/// Handle to a live transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionId(thunderdome::Index);

/// Ramp description
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionParams {
    pub start: f32,
    pub target: f32,
    pub duration_samples: u64,
    pub curve: FadeCurve,
}

impl TransitionParams {
    pub fn new(start: f32, target: f32, duration_samples: u64, curve: FadeCurve) -> Self {
        Self {
            start,
            target,
            duration_samples,
            curve,
        }
    }

    #[inline]
    pub fn is_noop(&self) -> bool {
        self.duration_samples == 0 || self.start == self.target
    }
}

/// Result of a transition request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddOutcome {
    /// Resolved synchronously; apply this value, the ramp is already over
    Immediate(f32),
    Started(TransitionId),
}

/// One value report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionUpdate {
    pub id: TransitionId,
    pub user: TransitionUser,
    pub value: f32,
    pub terminated: bool,
}

#[derive(Debug, Clone)]
struct Transition {
    params: TransitionParams,
    category: TransitionCategory,
    elapsed: u64,
    current: f32,
    paused: bool,
    users: SmallVec<[TransitionUser; 2]>,
}

impl Transition {
    fn progress(&self) -> f32 {
        if self.params.duration_samples == 0 {
            return 1.0;
        }
        (self.elapsed as f64 / self.params.duration_samples as f64).min(1.0) as f32
    }
}

/// Usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionStats {
    pub fade_in_use: usize,
    pub state_in_use: usize,
    pub fade_peak: usize,
    pub state_peak: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct TransitionManager {
    transitions: thunderdome::Arena<Transition>,
    max_fade: usize,
    max_state: usize,
    stats: TransitionStats,
}

impl TransitionManager {
    pub fn new(max_fade: usize, max_state: usize) -> Self {
        Self {
            transitions: thunderdome::Arena::new(),
            max_fade,
            max_state,
            stats: TransitionStats::default(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    #[inline]
    pub fn stats(&self) -> TransitionStats {
        self.stats
    }

    fn count_mut(&mut self, category: TransitionCategory) -> &mut usize {
        match category {
            TransitionCategory::Fade => &mut self.stats.fade_in_use,
            TransitionCategory::State => &mut self.stats.state_in_use,
        }
    }

    /// Start a transition for `user`.
    ///
    /// No-op ramps resolve immediately without taking a slot. A full
    /// category fails with `InsufficientMemory` and the caller applies its
    /// fallback.
    pub fn add(&mut self, params: TransitionParams, user: TransitionUser) -> VoxResult<AddOutcome> {
        if params.is_noop() {
            return Ok(AddOutcome::Immediate(params.target));
        }
        let category = user.category();
        let (in_use, max) = match category {
            TransitionCategory::Fade => (self.stats.fade_in_use, self.max_fade),
            TransitionCategory::State => (self.stats.state_in_use, self.max_state),
        };
        if in_use >= max {
            log::warn!("{:?} transition list full ({})", category, max);
            return Err(VoxError::InsufficientMemory(match category {
                TransitionCategory::Fade => "fade transitions",
                TransitionCategory::State => "state transitions",
            }));
        }

        let mut users = SmallVec::new();
        users.push(user);
        let id = TransitionId(self.transitions.insert(Transition {
            params,
            category,
            elapsed: 0,
            current: params.start,
            paused: false,
            users,
        }));
        *self.count_mut(category) += 1;
        self.stats.fade_peak = self.stats.fade_peak.max(self.stats.fade_in_use);
        self.stats.state_peak = self.stats.state_peak.max(self.stats.state_in_use);
        Ok(AddOutcome::Started(id))
    }

    fn reclaim(&mut self, id: TransitionId) {
        if let Some(t) = self.transitions.remove(id.0) {
            let count = self.count_mut(t.category);
            *count = count.saturating_sub(1);
        }
    }

    #[inline]
    pub fn contains(&self, id: TransitionId) -> bool {
        self.transitions.contains(id.0)
    }

    /// Current value of a transition
    pub fn value(&self, id: TransitionId) -> Option<f32> {
        self.transitions.get(id.0).map(|t| t.current)
    }

    /// Transition currently driving `user`
    pub fn find_user(&self, user: TransitionUser) -> Option<TransitionId> {
        self.transitions
            .iter()
            .find(|(_, t)| t.users.contains(&user))
            .map(|(i, _)| TransitionId(i))
    }

    /// Detach a user; returns `true` if the transition was reclaimed
    pub fn remove_user(&mut self, id: TransitionId, user: TransitionUser) -> bool {
        let Some(t) = self.transitions.get_mut(id.0) else {
            return false;
        };
        t.users.retain(|u| *u != user);
        if t.users.is_empty() {
            self.reclaim(id);
            return true;
        }
        false
    }

    /// Detach every user matching `pred`; returns what was removed
    pub fn remove_users_where(
        &mut self,
        pred: impl Fn(&TransitionUser) -> bool,
    ) -> Vec<(TransitionId, TransitionUser)> {
        let matches: Vec<(TransitionId, TransitionUser)> = self
            .transitions
            .iter()
            .flat_map(|(i, t)| {
                t.users
                    .iter()
                    .filter(|u| pred(u))
                    .map(move |u| (TransitionId(i), *u))
            })
            .collect();
        for (id, user) in &matches {
            self.remove_user(*id, *user);
        }
        matches
    }

    /// Re-target a running transition from its current value.
    ///
    /// Heading back to where it started (a stop arriving mid fade-in)
    /// only takes as long as the distance already travelled.
    pub fn change_parameter(
        &mut self,
        id: TransitionId,
        target: f32,
        duration_samples: u64,
        curve: FadeCurve,
    ) -> VoxResult<()> {
        let t = self
            .transitions
            .get_mut(id.0)
            .ok_or(VoxError::IdNotFound(id.0.to_bits()))?;
        let reversing = target == t.params.start && target != t.params.target;
        let duration = if reversing {
            let travelled = t.progress() as f64;
            ((duration_samples as f64 * travelled).round() as u64).max(1)
        } else {
            duration_samples
        };
        t.params = TransitionParams::new(t.current, target, duration, curve);
        t.elapsed = 0;
        Ok(())
    }

    pub fn pause(&mut self, id: TransitionId) {
        if let Some(t) = self.transitions.get_mut(id.0) {
            t.paused = true;
        }
    }

    pub fn resume(&mut self, id: TransitionId) {
        if let Some(t) = self.transitions.get_mut(id.0) {
            t.paused = false;
        }
    }

    #[inline]
    pub fn is_paused(&self, id: TransitionId) -> bool {
        self.transitions.get(id.0).is_some_and(|t| t.paused)
    }

    /// Every running transition
    pub fn ids(&self) -> Vec<TransitionId> {
        self.transitions.iter().map(|(i, _)| TransitionId(i)).collect()
    }

    /// Jump to the target and end now
    pub fn terminate(&mut self, id: TransitionId) -> Vec<TransitionUpdate> {
        let Some(t) = self.transitions.get(id.0) else {
            return Vec::new();
        };
        let updates = t
            .users
            .iter()
            .map(|user| TransitionUpdate {
                id,
                user: *user,
                value: t.params.target,
                terminated: true,
            })
            .collect();
        self.reclaim(id);
        updates
    }

    /// Advance every running transition by `frames` samples
    pub fn process(&mut self, frames: u64) -> Vec<TransitionUpdate> {
        let mut updates = Vec::new();
        let mut finished = Vec::new();

        for (index, t) in self.transitions.iter_mut() {
            if t.paused {
                continue;
            }
            t.elapsed = t.elapsed.saturating_add(frames);
            let progress = t.progress();
            t.current = t.params.curve.interpolate(t.params.start, t.params.target, progress);
            let terminated = progress >= 1.0;
            if terminated {
                t.current = t.params.target;
                finished.push(TransitionId(index));
            }
            let id = TransitionId(index);
            updates.extend(t.users.iter().map(|user| TransitionUpdate {
                id,
                user: *user,
                value: t.current,
                terminated,
            }));
        }

        for id in finished {
            self.reclaim(id);
        }
        updates
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn voice(pbi: u64) -> TransitionUser {
        TransitionUser::Voice {
            pbi: PbiId(pbi),
            kind: FadeKind::PlayStop,
        }
    }

    fn started(outcome: AddOutcome) -> TransitionId {
        match outcome {
            AddOutcome::Started(id) => id,
            AddOutcome::Immediate(_) => panic!("expected a running transition"),
        }
    }

    #[test]
    fn test_noop_resolves_synchronously() {
        let mut tm = TransitionManager::new(4, 4);
        let out = tm
            .add(TransitionParams::new(0.0, 1.0, 0, FadeCurve::Linear), voice(1))
            .unwrap();
        assert_eq!(out, AddOutcome::Immediate(1.0));
        let out = tm
            .add(TransitionParams::new(0.5, 0.5, 480, FadeCurve::Linear), voice(1))
            .unwrap();
        assert_eq!(out, AddOutcome::Immediate(0.5));
        assert!(tm.is_empty());
    }

    #[test]
    fn test_capacity_per_category() {
        let mut tm = TransitionManager::new(1, 1);
        tm.add(TransitionParams::new(0.0, 1.0, 100, FadeCurve::Linear), voice(1))
            .unwrap();
        assert!(matches!(
            tm.add(TransitionParams::new(0.0, 1.0, 100, FadeCurve::Linear), voice(2)),
            Err(VoxError::InsufficientMemory(_))
        ));
        let state = TransitionUser::State {
            node: NodeId(1),
            prop: PropId::Volume,
        };
        assert!(tm
            .add(TransitionParams::new(0.0, -6.0, 100, FadeCurve::Linear), state)
            .is_ok());
        assert_eq!(tm.stats().fade_peak, 1);
        assert_eq!(tm.stats().state_peak, 1);
    }

    #[test]
    fn test_process_reaches_target_and_terminates() {
        let mut tm = TransitionManager::new(4, 4);
        let id = started(
            tm.add(TransitionParams::new(0.0, 1.0, 100, FadeCurve::Linear), voice(1))
                .unwrap(),
        );
        let updates = tm.process(50);
        assert_eq!(updates.len(), 1);
        assert_relative_eq!(updates[0].value, 0.5);
        assert!(!updates[0].terminated);

        let updates = tm.process(60);
        assert_eq!(updates[0].value, 1.0);
        assert!(updates[0].terminated);
        assert!(!tm.contains(id));
        assert_eq!(tm.stats().fade_in_use, 0);
    }

    #[test]
    fn test_paused_transition_freezes() {
        let mut tm = TransitionManager::new(4, 4);
        let id = started(
            tm.add(TransitionParams::new(0.0, 1.0, 100, FadeCurve::Linear), voice(1))
                .unwrap(),
        );
        tm.process(25);
        tm.pause(id);
        assert!(tm.process(1000).is_empty());
        tm.resume(id);
        let updates = tm.process(25);
        assert_relative_eq!(updates[0].value, 0.5);
    }

    #[test]
    fn test_reverse_takes_travelled_time() {
        let mut tm = TransitionManager::new(4, 4);
        let id = started(
            tm.add(TransitionParams::new(0.0, 1.0, 100, FadeCurve::Linear), voice(1))
                .unwrap(),
        );
        tm.process(40);
        tm.change_parameter(id, 0.0, 100, FadeCurve::Linear).unwrap();
        let updates = tm.process(20);
        assert_relative_eq!(updates[0].value, 0.2, epsilon = 1e-5);
        let updates = tm.process(20);
        assert!(updates[0].terminated);
        assert_eq!(updates[0].value, 0.0);
    }

    #[test]
    fn test_last_user_leaving_reclaims() {
        let mut tm = TransitionManager::new(4, 4);
        let id = started(
            tm.add(TransitionParams::new(0.0, 1.0, 100, FadeCurve::Linear), voice(1))
                .unwrap(),
        );
        let other = started(
            tm.add(TransitionParams::new(1.0, 0.0, 100, FadeCurve::Linear), voice(2))
                .unwrap(),
        );
        assert!(!tm.remove_user(id, voice(2)), "not a user of that transition");
        assert_eq!(tm.find_user(voice(1)), Some(id));

        let removed = tm.remove_users_where(|u| u.pbi() == Some(PbiId(1)));
        assert_eq!(removed.len(), 1);
        assert!(tm.contains(other));
        assert!(!tm.contains(id));
        assert_eq!(tm.stats().fade_in_use, 1);
    }
}
