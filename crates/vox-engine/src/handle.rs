//! Engine handle and audio thread
//!
//! ```text
//!   game threads ──post──▶ CommandWriter ──ring──▶ CommandReader
//!        │                                              │
//!        └──wake──▶ crossbeam channel ──▶ "vox-audio" thread: engine.tick()
//! ```
//!
//! Actions never take the engine lock; they are encoded into the command
//! ring and picked up on the next tick. Structural edits (adding nodes,
//! loading banks) go through [`EngineHandle::with_engine`], which does lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use vox_core::{
    EngineConfig, FadeCurve, GameObjectId, NodeId, PlayingId, VoxResult, generate_playing_id,
};
use vox_event::{Action, ActionRecord, CommandWriter, NotificationSink, command_ring};

use crate::engine::AudioEngine;
use crate::stats::{EngineStats, SharedStats};

/// Thread-safe front of a running engine
pub struct EngineHandle {
    engine: Arc<Mutex<AudioEngine>>,
    writer: CommandWriter,
    wake: Sender<()>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<SharedStats>,
}

impl EngineHandle {
    /// Build, initialize and start ticking an engine on its own thread
    pub fn start(config: EngineConfig, sink: Arc<dyn NotificationSink>) -> VoxResult<Self> {
        let wait = config.wait_duration();
        let (writer, reader) = command_ring(config.command_queue_bytes);
        let mut engine = AudioEngine::new(config, sink)?;
        engine.attach_queue(reader);
        engine.init()?;

        let stats = engine.shared_stats();
        let engine = Arc::new(Mutex::new(engine));
        let running = Arc::new(AtomicBool::new(true));
        let (wake, wake_rx) = bounded::<()>(1);

        let thread = {
            let engine = Arc::clone(&engine);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("vox-audio".into())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        match wake_rx.recv_timeout(wait) {
                            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = engine.lock().tick() {
                            log::error!("Audio thread: tick failed: {}", e);
                            break;
                        }
                    }
                    log::info!("Audio thread exiting");
                })?
        };

        log::info!("EngineHandle: audio thread started");
        Ok(Self {
            engine,
            writer,
            wake,
            running,
            thread: Some(thread),
            stats,
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Actions
    // ───────────────────────────────────────────────────────────────────────

    /// Queue an action for the next tick
    pub fn post(&self, record: ActionRecord) -> VoxResult<()> {
        self.writer.post(record.tag(), &record.to_bytes())?;
        // A full wake channel already has a tick coming
        let _ = self.wake.try_send(());
        Ok(())
    }

    /// Play `node` on `game_object`; the id is valid even if the ring was full
    pub fn play(&self, node: NodeId, game_object: GameObjectId) -> PlayingId {
        let playing_id = generate_playing_id();
        if let Err(e) = self.post(ActionRecord::new(Action::play(node), game_object, playing_id)) {
            log::warn!("EngineHandle: play of {} rejected ({})", node, e);
        }
        playing_id
    }

    pub fn stop_playing_id(&self, playing_id: PlayingId, fade_ms: f32) -> VoxResult<()> {
        let action = Action::stop(NodeId::NONE)
            .global()
            .with_fade(fade_ms, FadeCurve::Linear);
        self.post(ActionRecord::new(action, 0, playing_id))
    }

    pub fn stop(&self, node: NodeId, game_object: GameObjectId, fade_ms: f32) -> VoxResult<()> {
        let action = Action::stop(node).with_fade(fade_ms, FadeCurve::Linear);
        self.post(ActionRecord::new(action, game_object, 0))
    }

    pub fn pause(&self, node: NodeId, game_object: GameObjectId) -> VoxResult<()> {
        self.post(ActionRecord::new(Action::pause(node), game_object, 0))
    }

    pub fn resume(&self, node: NodeId, game_object: GameObjectId) -> VoxResult<()> {
        self.post(ActionRecord::new(Action::resume(node), game_object, 0))
    }

    pub fn set_state(&self, group_id: u32, state_id: u32) -> VoxResult<()> {
        self.post(ActionRecord::new(Action::set_state(group_id, state_id).global(), 0, 0))
    }

    pub fn set_switch(&self, game_object: GameObjectId, group_id: u32, switch_id: u32) -> VoxResult<()> {
        self.post(ActionRecord::new(Action::set_switch(group_id, switch_id), game_object, 0))
    }

    pub fn set_rtpc(&self, rtpc_id: u32, value: f32, game_object: GameObjectId) -> VoxResult<()> {
        self.post(ActionRecord::new(Action::set_rtpc(rtpc_id, value), game_object, 0))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Structure and stats
    // ───────────────────────────────────────────────────────────────────────

    /// Run `f` with the engine locked (hierarchy edits, bank loads)
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut AudioEngine) -> R) -> R {
        f(&mut self.engine.lock())
    }

    /// Counters as of the last frame the audio thread published
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Remove a node; see [`AudioEngine::remove_node`]
    pub fn remove_node(&self, node: NodeId) -> bool {
        self.with_engine(|engine| engine.remove_node(node))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the audio thread and terminate the engine
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.wake.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Err(e) = self.engine.lock().term() {
            log::warn!("EngineHandle: term failed: {}", e);
        }
        log::info!("EngineHandle: shut down");
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusData;
    use crate::lower::MediaData;
    use crate::node::{Node, SoundData};
    use serial_test::serial;
    use std::time::{Duration, Instant};
    use vox_event::{ChannelSink, NotificationReason};

    fn config() -> EngineConfig {
        EngineConfig {
            sample_rate: 48_000,
            frames_per_tick: 480,
            output_channels: 1,
            audio_thread_wait_ms: 1,
            parallel_voices: false,
            ..Default::default()
        }
    }

    #[test]
    #[serial]
    fn test_play_through_handle_reaches_audio_thread() {
        let (sink, rx) = ChannelSink::unbounded();
        let mut handle = EngineHandle::start(config(), Arc::new(sink)).unwrap();
        handle.with_engine(|engine| {
            let h = engine.hierarchy_mut();
            h.add_node(Node::bus(NodeId(1), BusData::new())).unwrap();
            h.add_node(Node::sound(NodeId(10), SoundData::new(MediaData::constant(0.5, 48_000, 1))))
                .unwrap();
            h.set_output_bus(NodeId(10), Some(NodeId(1))).unwrap();
        });

        let pid = handle.play(NodeId(10), 3);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut played = false;
        while Instant::now() < deadline && !played {
            if let Ok(n) = rx.recv_timeout(Duration::from_millis(50)) {
                played = n.reason == NotificationReason::Play && n.playing_id == pid;
            }
        }
        assert!(played, "play notification never arrived");

        handle.stop_playing_id(pid, 0.0).unwrap();
        handle.shutdown();
        assert!(!handle.is_running());
        assert_eq!(handle.stats().rejected_commands, 0);
    }

    #[test]
    #[serial]
    fn test_shutdown_is_idempotent() {
        let mut handle = EngineHandle::start(config(), Arc::new(vox_event::NullSink)).unwrap();
        handle.shutdown();
        handle.shutdown();
        assert!(!handle.is_running());
    }
}
