//! Engine invariants
//!
//! - Summed ducks never attenuate past the floor
//! - Limited nodes never exceed their audible instance count
//! - A repeated Stop terminates once
//! - Sample-accurate groups start in the same frame
//! - Nested pause / resume returns to full level
//! - Torn ring writes are never executed
//! - Random Stop / Pause / Break storms leave nothing behind

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vox_core::{EngineConfig, FadeCurve, KillPolicy, NodeId, PlayingId};
use vox_engine::bus::{BusData, DuckScope, DuckTarget};
use vox_engine::lower::MediaData;
use vox_engine::node::{InstanceLimit, Node, SoundData};
use vox_engine::AudioEngine;
use vox_event::{Action, ActionRecord, ChannelSink, Notification, NotificationReason, command_ring};

const MASTER: NodeId = NodeId(1);
const SOUND: NodeId = NodeId(10);

fn config() -> EngineConfig {
    EngineConfig {
        sample_rate: 48_000,
        frames_per_tick: 480,
        output_channels: 1,
        parallel_voices: false,
        ..Default::default()
    }
}

fn engine() -> (AudioEngine, Receiver<Notification>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (sink, rx) = ChannelSink::unbounded();
    let mut engine = AudioEngine::new(config(), Arc::new(sink)).unwrap();
    engine.init().unwrap();
    engine
        .hierarchy_mut()
        .add_node(Node::bus(MASTER, BusData::new()))
        .unwrap();
    (engine, rx)
}

fn sound(id: NodeId, media: MediaData) -> Node {
    Node::sound(id, SoundData::new(media).with_loop_count(1))
}

fn add_routed(engine: &mut AudioEngine, node: Node, bus: NodeId) {
    let id = node.id;
    let h = engine.hierarchy_mut();
    h.add_node(node).unwrap();
    h.set_output_bus(id, Some(bus)).unwrap();
}

fn count(rx: &Receiver<Notification>, reason: NotificationReason) -> usize {
    rx.try_iter().filter(|n| n.reason == reason).count()
}

// ═══════════════════════════════════════════════════════════════════════════════
// DUCKING BOUND
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_summed_ducks_respect_floor() {
    const SRC_1: NodeId = NodeId(2);
    const SRC_2: NodeId = NodeId(3);
    const TARGET: NodeId = NodeId(4);

    let (mut engine, _rx) = engine();
    {
        let h = engine.hierarchy_mut();
        for src in [SRC_1, SRC_2] {
            h.add_node(Node::bus(
                src,
                BusData::new().with_duck_target(DuckTarget::new(TARGET, -60.0).with_fades(20.0, 20.0)),
            ))
            .unwrap();
        }
        h.add_node(Node::bus(TARGET, BusData::new().with_max_duck_attenuation(-70.0)))
            .unwrap();
    }
    add_routed(&mut engine, sound(NodeId(11), MediaData::constant(0.5, 9_600, 1)), SRC_1);
    add_routed(&mut engine, sound(NodeId(12), MediaData::constant(0.5, 9_600, 1)), SRC_2);

    engine.play(NodeId(11), 1);
    engine.play(NodeId(12), 1);
    let offset = |engine: &AudioEngine| {
        engine
            .hierarchy()
            .node(TARGET)
            .and_then(|n| n.bus_data())
            .map_or(0.0, |b| b.ducked_offset(DuckScope::Voice, -96.0))
    };

    let mut deepest = 0.0_f32;
    for _ in 0..40 {
        engine.tick().unwrap();
        let value = offset(&engine);
        assert!(value >= -70.0, "offset {} below floor", value);
        deepest = deepest.min(value);
    }
    assert_eq!(deepest, -70.0);
    assert!(engine.voices().is_empty());
    assert_eq!(offset(&engine), 0.0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIMITER CAPACITY
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_node_limit_kills_oldest() {
    let (mut engine, rx) = engine();
    let node = sound(SOUND, MediaData::constant(0.5, 48_000, 1))
        .with_limit(InstanceLimit::new(2).with_policy(KillPolicy::KillOldest));
    add_routed(&mut engine, node, MASTER);

    let mut pids = Vec::new();
    for _ in 0..3 {
        pids.push(engine.play(SOUND, 1));
    }
    engine.tick().unwrap();
    assert_eq!(engine.voices().len(), 2);
    assert!(engine.voices_of(pids[0]).is_empty(), "oldest evicted");

    pids.push(engine.play(SOUND, 1));
    for _ in 0..5 {
        engine.tick().unwrap();
        assert!(engine.voices().len() <= 2);
    }
    assert!(engine.voices_of(pids[1]).is_empty());

    let reasons: Vec<_> = rx.try_iter().map(|n| n.reason).collect();
    assert!(reasons.contains(&NotificationReason::PlayFailedLimit));
    assert!(reasons.contains(&NotificationReason::KickedByNodeLimit));
}

#[test]
fn test_node_limit_virtualizes_excess() {
    let (mut engine, rx) = engine();
    let node = sound(SOUND, MediaData::constant(0.5, 48_000, 1))
        .with_limit(InstanceLimit::new(1).with_virtual(true));
    add_routed(&mut engine, node, MASTER);

    for _ in 0..3 {
        engine.play(SOUND, 1);
    }
    for _ in 0..3 {
        engine.tick().unwrap();
        let audible = engine.voices().iter().filter(|p| !p.flags.is_virtual).count();
        assert_eq!(audible, 1);
    }
    assert_eq!(engine.voices().len(), 3);
    assert_eq!(engine.stats().virtual_voices, 2);
    // One voice at 0.5, virtual voices render nothing
    assert!(engine.output().iter().all(|s| (*s - 0.5).abs() < 1e-5));
    assert_eq!(count(&rx, NotificationReason::VirtualByLimit), 2);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DUPLICATE STOP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_duplicate_stop_terminates_once() {
    let (mut engine, rx) = engine();
    add_routed(&mut engine, sound(SOUND, MediaData::constant(0.5, 48_000, 1)), MASTER);

    let pid = engine.play(SOUND, 1);
    engine.tick().unwrap();
    for _ in 0..2 {
        engine.post(ActionRecord::new(Action::stop(SOUND), 1, pid));
    }
    for _ in 0..3 {
        engine.tick().unwrap();
    }
    assert!(engine.voices().is_empty());
    assert_eq!(count(&rx, NotificationReason::Stopped), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SAMPLE-ACCURATE GROUP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_group_members_start_in_same_frame() {
    const FAST: NodeId = NodeId(20);
    const SLOW: NodeId = NodeId(21);

    let (mut engine, _rx) = engine();
    add_routed(&mut engine, sound(FAST, MediaData::constant(0.25, 48_000, 1)), MASTER);
    add_routed(
        &mut engine,
        sound(SLOW, MediaData::constant(0.25, 48_000, 1).with_prepare_ticks(3)),
        MASTER,
    );

    let pid = engine.play_group(&[FAST, SLOW], 1);
    let mut started_at = None;
    for tick in 0..8 {
        engine.tick().unwrap();
        let connected: Vec<bool> = engine
            .voices_of(pid)
            .into_iter()
            .filter_map(|id| engine.voice(id).map(|p| p.connected))
            .collect();
        assert_eq!(connected.len(), 2);
        assert!(
            connected.iter().all(|c| *c) || connected.iter().all(|c| !*c),
            "group split at tick {}",
            tick
        );
        if started_at.is_none() && connected[0] {
            started_at = Some(tick);
        }
    }
    assert!(started_at.is_some_and(|t| t >= 1), "group started before the slow member was ready");
    assert_eq!(engine.lower().stats().sources_started, 2);
}

// ═══════════════════════════════════════════════════════════════════════════════
// PAUSE ROUND TRIP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_nested_pause_resume_round_trip() {
    let (mut engine, rx) = engine();
    add_routed(&mut engine, sound(SOUND, MediaData::constant(0.5, 96_000, 1)), MASTER);

    let pid = engine.play(SOUND, 1);
    engine.tick().unwrap();
    let voice = engine.voices_of(pid)[0];

    for _ in 0..3 {
        engine.post(ActionRecord::new(
            Action::pause(SOUND).with_fade(30.0, FadeCurve::Linear),
            1,
            pid,
        ));
    }
    for _ in 0..5 {
        engine.tick().unwrap();
    }
    assert!(engine.voice(voice).unwrap().is_paused());
    assert_eq!(engine.voice(voice).unwrap().fade_gain(), 0.0);
    assert!(engine.output().iter().all(|s| *s == 0.0));

    for expect_paused in [true, true, false] {
        engine.post(ActionRecord::new(
            Action::resume(SOUND).with_fade(30.0, FadeCurve::Linear),
            1,
            pid,
        ));
        assert_eq!(engine.voice(voice).unwrap().is_paused(), expect_paused);
    }
    for _ in 0..5 {
        engine.tick().unwrap();
    }
    assert_eq!(engine.voice(voice).unwrap().fade_gain(), 1.0);
    assert!(engine.output().iter().all(|s| (*s - 0.5).abs() < 1e-5));

    let reasons: Vec<_> = rx.try_iter().map(|n| n.reason).collect();
    assert_eq!(reasons.iter().filter(|r| **r == NotificationReason::Paused).count(), 1);
    assert_eq!(reasons.iter().filter(|r| **r == NotificationReason::Resumed).count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMMAND RING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_uncommitted_record_is_not_executed() {
    let (mut engine, _rx) = engine();
    add_routed(&mut engine, sound(SOUND, MediaData::constant(0.5, 48_000, 1)), MASTER);
    let (writer, reader) = command_ring(1024);
    engine.attach_queue(reader);

    let record = ActionRecord::new(Action::play(SOUND), 1, 42);
    let bytes = record.to_bytes();
    let mut span = writer.reserve(record.tag(), bytes.len()).unwrap();
    span.payload_mut()[..4].copy_from_slice(&bytes[..4]);

    engine.tick().unwrap();
    assert!(engine.voices().is_empty(), "torn record dispatched");

    span.payload_mut().copy_from_slice(&bytes);
    span.commit();
    engine.tick().unwrap();
    assert_eq!(engine.voices_of(42).len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// STOP STORM
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_random_action_storm_leaves_no_residue() {
    const NODES: [NodeId; 3] = [NodeId(30), NodeId(31), NodeId(32)];

    let (mut engine, rx) = engine();
    for (i, id) in NODES.iter().enumerate() {
        let frames = 2_400 * (i + 1);
        add_routed(&mut engine, sound(*id, MediaData::constant(0.1, frames, 1)), MASTER);
    }

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut pids: Vec<PlayingId> = Vec::new();
    for _ in 0..400 {
        let node = NODES[rng.random_range(0..NODES.len())];
        let go = rng.random_range(1..4u64);
        let pid = if pids.is_empty() || rng.random_bool(0.5) {
            0
        } else {
            pids[rng.random_range(0..pids.len())]
        };
        let fade = rng.random_range(0.0..40.0f32);
        let action = match rng.random_range(0..7) {
            0 | 1 => {
                pids.push(engine.play(node, go));
                continue;
            }
            2 => Action::play(node).with_delay_ms(rng.random_range(0.0..80.0)),
            3 => Action::stop(node).with_fade(fade, FadeCurve::Linear),
            4 => Action::pause(node).with_fade(fade, FadeCurve::Sine),
            5 => Action::resume(node).with_fade(fade, FadeCurve::Linear),
            _ => Action::break_playback(node),
        };
        engine.post(ActionRecord::new(action, go, pid));
        if rng.random_bool(0.3) {
            engine.tick().unwrap();
        }
    }

    engine.post(ActionRecord::new(Action::stop(NodeId::NONE).global(), 0, 0));
    for _ in 0..10 {
        engine.tick().unwrap();
    }

    assert!(engine.voices().is_empty());
    assert!(engine.pending().is_empty());
    assert_eq!(engine.transitions().stats().fade_in_use, 0);

    // Every started voice ends exactly once
    let mut open: HashMap<(PlayingId, NodeId), i64> = HashMap::new();
    for n in rx.try_iter() {
        let key = (n.playing_id, n.element_id);
        match n.reason {
            NotificationReason::Play => *open.entry(key).or_default() += 1,
            r if r.is_terminal() => *open.entry(key).or_default() -= 1,
            _ => {}
        }
    }
    assert!(open.values().all(|v| *v == 0), "unbalanced voices: {:?}", open);
}
