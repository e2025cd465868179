//! Lower-engine scheduler
//!
//! Runs once per audio frame, after the upper engine queued its commands:
//!
//! ```text
//!   process_play_commands     Play/PlayPause → allocate a Cbx per voice
//!   process_pending_commands  poll sources; start ready groups together;
//!                             apply Pause/Resume/Seek/StopLooping/Stop
//!   render                    voices (parallel) → mixing buses by depth → output
//! ```
//!
//! Voices sharing a sequence id start in the same frame or not at all: a
//! group waits while any member's format is not ready, and a member whose
//! source fails is purged before the group is reconsidered. Commands queued
//! behind a play that has not started yet keep waiting in order.

use std::collections::{BTreeMap, HashMap, HashSet};

use rayon::prelude::*;

use vox_core::{NodeId, SequenceId, db_to_gain};

use super::cbx::Cbx;
use super::codec::{CodecRegistry, FormatStatus, RenderStatus, SourceContext};
use super::command::{LowerCommand, LowerCommandKind, NO_SEQUENCE};
use super::graph::{EdgeKind, MixGraph};
use crate::hierarchy::Hierarchy;
use crate::pbi::{InitState, PbiId, VoiceRegistry};

/// What happened to a voice inside the lower engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerEvent {
    Started { pbi: PbiId },
    PlayFailed { pbi: PbiId },
    SourceFailed { pbi: PbiId },
    EndReached { pbi: PbiId },
    Stopped { pbi: PbiId },
}

impl LowerEvent {
    #[inline]
    pub fn pbi(&self) -> PbiId {
        match *self {
            LowerEvent::Started { pbi }
            | LowerEvent::PlayFailed { pbi }
            | LowerEvent::SourceFailed { pbi }
            | LowerEvent::EndReached { pbi }
            | LowerEvent::Stopped { pbi } => pbi,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LowerStats {
    pub sources_started: u64,
    pub play_failed: u64,
    /// Groups held back a frame because a member was not ready
    pub groups_deferred: u64,
    /// Commands dropped with a failed voice
    pub purged: u64,
}

pub struct LowerEngine {
    codecs: CodecRegistry,
    queue: Vec<LowerCommand>,
    cbxs: BTreeMap<PbiId, Cbx>,
    graph: MixGraph,
    channels: usize,
    frames: usize,
    parallel: bool,
    bus_buffers: HashMap<NodeId, Vec<f32>>,
    output: Vec<f32>,
    stats: LowerStats,
}

impl LowerEngine {
    pub fn new(codecs: CodecRegistry, channels: u16, frames_per_tick: u32) -> Self {
        let channels = channels.max(1) as usize;
        let frames = frames_per_tick.max(1) as usize;
        Self {
            codecs,
            queue: Vec::new(),
            cbxs: BTreeMap::new(),
            graph: MixGraph::new(),
            channels,
            frames,
            parallel: true,
            bus_buffers: HashMap::new(),
            output: vec![0.0; channels * frames],
            stats: LowerStats::default(),
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    // ───────────────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    #[inline]
    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    #[inline]
    pub fn graph(&self) -> &MixGraph {
        &self.graph
    }

    #[inline]
    pub fn stats(&self) -> LowerStats {
        self.stats
    }

    /// Last rendered frame, interleaved
    #[inline]
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    #[inline]
    pub fn cbx(&self, pbi: PbiId) -> Option<&Cbx> {
        self.cbxs.get(&pbi)
    }

    /// Connection objects, started or not
    #[inline]
    pub fn active_count(&self) -> usize {
        self.cbxs.len()
    }

    #[inline]
    pub fn queued(&self) -> &[LowerCommand] {
        &self.queue
    }

    pub fn enqueue(&mut self, commands: impl IntoIterator<Item = LowerCommand>) {
        self.queue.extend(commands);
    }

    // ───────────────────────────────────────────────────────────────────────
    // Commands
    // ───────────────────────────────────────────────────────────────────────

    fn purge(&mut self, pbi: PbiId) {
        let before = self.queue.len();
        self.queue.retain(|c| c.pbi != pbi);
        self.stats.purged += (before - self.queue.len()) as u64;
        self.cbxs.remove(&pbi);
    }

    fn play_failed(&mut self, pbi: PbiId, events: &mut Vec<LowerEvent>) {
        self.purge(pbi);
        self.stats.play_failed += 1;
        events.push(LowerEvent::PlayFailed { pbi });
    }

    /// Allocate a connection object for every newly queued play
    pub fn process_play_commands(&mut self, voices: &VoiceRegistry) -> Vec<LowerEvent> {
        let mut events = Vec::new();
        let plays: Vec<LowerCommand> = self
            .queue
            .iter()
            .filter(|c| c.is_play() && !self.cbxs.contains_key(&c.pbi))
            .copied()
            .collect();

        for cmd in plays {
            let Some(pbi) = voices.get(cmd.pbi) else {
                self.purge(cmd.pbi);
                continue;
            };
            if pbi.init_state == InitState::Stopped || pbi.flags.was_stopped {
                log::debug!("{}: stopped before its source was created", cmd.pbi);
                self.play_failed(cmd.pbi, &mut events);
                continue;
            }
            let ctx = SourceContext {
                node: pbi.node,
                media: pbi.media.as_ref(),
                loop_count: pbi.loop_count,
            };
            match self.codecs.alloc_codec_src(&ctx, pbi.source_type, pbi.codec) {
                Ok(source) => {
                    self.cbxs
                        .insert(cmd.pbi, Cbx::new(cmd.pbi, pbi.node, cmd.seq, source));
                }
                Err(e) => {
                    log::warn!("{}: source not created: {}", cmd.pbi, e);
                    self.play_failed(cmd.pbi, &mut events);
                }
            }
        }
        events
    }

    /// Start ready voices and apply every command that can run now
    pub fn process_pending_commands(&mut self, voices: &mut VoiceRegistry) -> Vec<LowerEvent> {
        let mut events = Vec::new();
        let mut polled: HashMap<PbiId, FormatStatus> = HashMap::new();
        let mut deferred: HashSet<PbiId> = HashSet::new();

        'scan: loop {
            deferred.clear();
            let mut groups: BTreeMap<(SequenceId, u64), Vec<LowerCommand>> = BTreeMap::new();
            for cmd in self.queue.iter().filter(|c| c.is_play()) {
                if self.cbxs.get(&cmd.pbi).is_none_or(|c| c.is_started()) {
                    continue;
                }
                let key = if cmd.seq == NO_SEQUENCE {
                    (NO_SEQUENCE, cmd.pbi.0)
                } else {
                    (cmd.seq, 0)
                };
                groups.entry(key).or_default().push(*cmd);
            }

            for group in groups.into_values() {
                let mut ready = true;
                for cmd in &group {
                    let status = match polled.get(&cmd.pbi) {
                        Some(status) => *status,
                        None => {
                            let status = self
                                .cbxs
                                .get_mut(&cmd.pbi)
                                .map_or(FormatStatus::Failed, |c| c.try_connect());
                            polled.insert(cmd.pbi, status);
                            status
                        }
                    };
                    match status {
                        FormatStatus::Ready => {}
                        FormatStatus::NotReady => ready = false,
                        FormatStatus::Failed => {
                            log::warn!("{}: source failed to connect", cmd.pbi);
                            self.play_failed(cmd.pbi, &mut events);
                            continue 'scan;
                        }
                    }
                }

                if !ready {
                    self.stats.groups_deferred += 1;
                    deferred.extend(group.iter().map(|c| c.pbi));
                    continue;
                }

                for cmd in &group {
                    self.start_voice(cmd, voices, &mut events);
                }
            }
            break;
        }

        self.apply_commands(&deferred, &mut events);
        events
    }

    fn start_voice(&mut self, cmd: &LowerCommand, voices: &mut VoiceRegistry, events: &mut Vec<LowerEvent>) {
        let Some(pbi) = voices.get_mut(cmd.pbi) else {
            self.purge(cmd.pbi);
            return;
        };
        let Some(cbx) = self.cbxs.get_mut(&cmd.pbi) else {
            return;
        };
        let paused = cmd.kind == LowerCommandKind::PlayPause || pbi.init_state == InitState::Paused;
        cbx.start(paused, pbi.seek, pbi.loop_count, pbi.frame_offset);
        cbx.is_virtual = pbi.flags.is_virtual;
        pbi.on_connected(paused);

        let id = cmd.pbi;
        self.queue.retain(|c| !(c.pbi == id && c.is_play()));
        self.stats.sources_started += 1;
        events.push(LowerEvent::Started { pbi: id });
    }

    fn apply_commands(&mut self, deferred: &HashSet<PbiId>, events: &mut Vec<LowerEvent>) {
        let queue = std::mem::take(&mut self.queue);
        for cmd in queue {
            let waiting = deferred.contains(&cmd.pbi)
                || cmd.is_play()
                || self.cbxs.get(&cmd.pbi).is_some_and(|c| !c.is_started());
            if waiting {
                self.queue.push(cmd);
                continue;
            }
            let Some(cbx) = self.cbxs.get_mut(&cmd.pbi) else {
                continue;
            };
            match cmd.kind {
                LowerCommandKind::Pause => cbx.paused = true,
                LowerCommandKind::Resume => cbx.paused = false,
                LowerCommandKind::StopLooping => cbx.stop_looping(),
                LowerCommandKind::Seek(position) => cbx.seek(position),
                LowerCommandKind::Stop => {
                    self.cbxs.remove(&cmd.pbi);
                    events.push(LowerEvent::Stopped { pbi: cmd.pbi });
                }
                LowerCommandKind::Play | LowerCommandKind::PlayPause => {}
            }
        }
    }

    /// Drop a voice's connection object and queued commands
    pub fn remove_voice(&mut self, pbi: PbiId) -> bool {
        self.queue.retain(|c| c.pbi != pbi);
        self.cbxs.remove(&pbi).is_some()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Mixing
    // ───────────────────────────────────────────────────────────────────────

    pub fn rebuild_graph_if_needed(&mut self, hierarchy: &Hierarchy) -> bool {
        if !self.graph.needs_rebuild(hierarchy.generation()) {
            return false;
        }
        self.graph.rebuild(hierarchy);
        self.bus_buffers.retain(|id, _| self.graph.contains(*id));
        true
    }

    /// Gain, destination bus and virtual flag for the next render
    pub fn set_voice_mix(&mut self, pbi: PbiId, gain: f32, mix_bus: Option<NodeId>, is_virtual: bool) {
        if let Some(cbx) = self.cbxs.get_mut(&pbi) {
            cbx.set_gain(gain);
            // A new destination already carries the gain difference
            if cbx.mix_bus != mix_bus {
                cbx.snap_gain();
            }
            cbx.mix_bus = mix_bus;
            cbx.is_virtual = is_virtual;
        }
    }

    /// Render one frame. `bus_gains` holds the linear gain of each mixing bus.
    pub fn render(&mut self, bus_gains: &HashMap<NodeId, f32>) -> Vec<LowerEvent> {
        let frames = self.frames;
        let channels = self.channels;
        let len = frames * channels;

        let statuses: Vec<(PbiId, RenderStatus)> = if self.parallel {
            self.cbxs
                .par_iter_mut()
                .map(|(id, cbx)| (*id, cbx.render(frames, channels)))
                .collect()
        } else {
            self.cbxs
                .iter_mut()
                .map(|(id, cbx)| (*id, cbx.render(frames, channels)))
                .collect()
        };

        self.output.clear();
        self.output.resize(len, 0.0);
        for level in self.graph.levels() {
            for bus in level {
                let buffer = self.bus_buffers.entry(*bus).or_default();
                buffer.clear();
                buffer.resize(len, 0.0);
            }
        }

        for cbx in self.cbxs.values() {
            if !cbx.is_started() || cbx.is_virtual {
                continue;
            }
            let dest = match cbx.mix_bus.filter(|b| self.graph.contains(*b)) {
                Some(bus) => self.bus_buffers.get_mut(&bus),
                None => None,
            };
            let dest = match dest {
                Some(buffer) => buffer,
                None => &mut self.output,
            };
            mix_into(dest, cbx.buffer(), 1.0);
        }

        for level in self.graph.levels() {
            for bus in level {
                let Some(mut buffer) = self.bus_buffers.remove(bus) else {
                    continue;
                };
                let gain = bus_gains.get(bus).copied().unwrap_or(1.0);
                buffer.iter_mut().for_each(|s| *s *= gain);

                let mut has_output = false;
                for edge in self.graph.outputs(*bus) {
                    let scale = match edge.kind {
                        EdgeKind::Output => {
                            has_output = true;
                            1.0
                        }
                        EdgeKind::Aux { level_db } => db_to_gain(level_db),
                    };
                    if let Some(dest) = self.bus_buffers.get_mut(&edge.to) {
                        mix_into(dest, &buffer, scale);
                    }
                }
                if !has_output {
                    mix_into(&mut self.output, &buffer, 1.0);
                }
                self.bus_buffers.insert(*bus, buffer);
            }
        }

        let mut events = Vec::new();
        for (pbi, status) in statuses {
            match status {
                RenderStatus::Continue => {}
                RenderStatus::EndReached { .. } => {
                    self.remove_voice(pbi);
                    events.push(LowerEvent::EndReached { pbi });
                }
                RenderStatus::Failed => {
                    log::warn!("{}: source failed while rendering", pbi);
                    self.remove_voice(pbi);
                    events.push(LowerEvent::SourceFailed { pbi });
                }
            }
        }
        events
    }
}

#[inline]
fn mix_into(dest: &mut [f32], src: &[f32], scale: f32) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d += *s * scale;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
