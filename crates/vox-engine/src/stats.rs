//! Engine statistics shared with the control thread
//!
//! The audio thread publishes counters once per frame with relaxed stores;
//! readers take a [`EngineStats`] snapshot without touching the engine lock.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the published counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub tick: u64,
    pub active_voices: usize,
    pub virtual_voices: usize,
    pub pending_actions: usize,
    pub fade_transitions: usize,
    pub state_transitions: usize,
    pub fade_transitions_peak: usize,
    pub state_transitions_peak: usize,
    pub graph_rebuilds: u64,
    pub has_cycles: bool,
    pub last_bank_unloaded: bool,
    /// Commands the ring rejected because it was full
    pub rejected_commands: u64,
    pub sources_started: u64,
    pub play_failed: u64,
    /// Sample-accurate groups held back a frame
    pub groups_deferred: u64,
    /// Lower commands dropped with a failed voice
    pub purged_commands: u64,
}

#[derive(Debug, Default)]
pub struct SharedStats {
    tick: AtomicU64,
    active_voices: AtomicUsize,
    virtual_voices: AtomicUsize,
    pending_actions: AtomicUsize,
    fade_transitions: AtomicUsize,
    state_transitions: AtomicUsize,
    fade_transitions_peak: AtomicUsize,
    state_transitions_peak: AtomicUsize,
    graph_rebuilds: AtomicU64,
    has_cycles: AtomicBool,
    last_bank_unloaded: AtomicBool,
    rejected_commands: AtomicU64,
    sources_started: AtomicU64,
    play_failed: AtomicU64,
    groups_deferred: AtomicU64,
    purged_commands: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, stats: &EngineStats) {
        self.tick.store(stats.tick, Ordering::Relaxed);
        self.active_voices.store(stats.active_voices, Ordering::Relaxed);
        self.virtual_voices.store(stats.virtual_voices, Ordering::Relaxed);
        self.pending_actions.store(stats.pending_actions, Ordering::Relaxed);
        self.fade_transitions.store(stats.fade_transitions, Ordering::Relaxed);
        self.state_transitions.store(stats.state_transitions, Ordering::Relaxed);
        self.fade_transitions_peak
            .store(stats.fade_transitions_peak, Ordering::Relaxed);
        self.state_transitions_peak
            .store(stats.state_transitions_peak, Ordering::Relaxed);
        self.graph_rebuilds.store(stats.graph_rebuilds, Ordering::Relaxed);
        self.has_cycles.store(stats.has_cycles, Ordering::Relaxed);
        self.last_bank_unloaded
            .store(stats.last_bank_unloaded, Ordering::Relaxed);
        self.rejected_commands
            .store(stats.rejected_commands, Ordering::Relaxed);
        self.sources_started.store(stats.sources_started, Ordering::Relaxed);
        self.play_failed.store(stats.play_failed, Ordering::Relaxed);
        self.groups_deferred.store(stats.groups_deferred, Ordering::Relaxed);
        self.purged_commands.store(stats.purged_commands, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            tick: self.tick.load(Ordering::Relaxed),
            active_voices: self.active_voices.load(Ordering::Relaxed),
            virtual_voices: self.virtual_voices.load(Ordering::Relaxed),
            pending_actions: self.pending_actions.load(Ordering::Relaxed),
            fade_transitions: self.fade_transitions.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            fade_transitions_peak: self.fade_transitions_peak.load(Ordering::Relaxed),
            state_transitions_peak: self.state_transitions_peak.load(Ordering::Relaxed),
            graph_rebuilds: self.graph_rebuilds.load(Ordering::Relaxed),
            has_cycles: self.has_cycles.load(Ordering::Relaxed),
            last_bank_unloaded: self.last_bank_unloaded.load(Ordering::Relaxed),
            rejected_commands: self.rejected_commands.load(Ordering::Relaxed),
            sources_started: self.sources_started.load(Ordering::Relaxed),
            play_failed: self.play_failed.load(Ordering::Relaxed),
            groups_deferred: self.groups_deferred.load(Ordering::Relaxed),
            purged_commands: self.purged_commands.load(Ordering::Relaxed),
        }
    }

    /// Active voices as of the last frame
    #[inline]
    pub fn active_voices(&self) -> usize {
        self.active_voices.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_matches_published() {
        let shared = SharedStats::new();
        assert_eq!(shared.snapshot(), EngineStats::default());

        let stats = EngineStats {
            tick: 12,
            active_voices: 3,
            virtual_voices: 1,
            fade_transitions_peak: 4,
            has_cycles: true,
            rejected_commands: 2,
            sources_started: 5,
            purged_commands: 1,
            ..Default::default()
        };
        shared.publish(&stats);
        assert_eq!(shared.snapshot(), stats);
        assert_eq!(shared.active_voices(), 3);
    }
}
