//! Command Flow Integration Tests
//!
//! Control thread → ring → decode → pending scheduler:
//! - FIFO order per producer under concurrent writers
//! - Deferred actions resolved by tick
//! - Cancellation across the due/paused maps

use std::sync::Arc;
use std::thread;

use vox_core::{NodeId, TickTime, TimeBase};
use vox_event::{
    Action, ActionRecord, ActionType, PendingAction, PendingActionList, PendingFilter,
    command_ring,
};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn drain_records(reader: &mut vox_event::CommandReader) -> Vec<ActionRecord> {
    let mut out = Vec::new();
    reader.drain(|tag, payload| {
        out.push(ActionRecord::decode(tag, payload).expect("committed record decodes"));
    });
    out
}

fn defer(list: &mut PendingActionList, record: &ActionRecord, time: &TimeBase, now: u64) {
    let launch = time.delay_from(now, record.action.delay_samples(time));
    let pa = PendingAction::new(
        Arc::new(record.action.clone()),
        record.game_object,
        record.playing_id,
        launch,
        (),
    );
    list.insert(pa).expect("capacity");
}

// ═══════════════════════════════════════════════════════════════════════════════
// RING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_concurrent_producers_keep_per_producer_order() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 500;

    let (writer, mut reader) = command_ring(4096);
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let writer = writer.clone();
            thread::spawn(move || {
                let mut seq = 0;
                while seq < PER_PRODUCER {
                    let record = ActionRecord::new(Action::play(NodeId(1)), p + 1, seq);
                    if writer.post(record.tag(), &record.to_bytes()).is_ok() {
                        seq += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let mut last_seen = vec![None::<u64>; PRODUCERS as usize];
    let mut received = 0;
    while received < PRODUCERS * PER_PRODUCER {
        for record in drain_records(&mut reader) {
            let slot = &mut last_seen[(record.game_object - 1) as usize];
            let expected = slot.map_or(0, |s| s + 1);
            assert_eq!(record.playing_id, expected, "producer {} out of order", record.game_object);
            *slot = Some(record.playing_id);
            received += 1;
        }
        thread::yield_now();
    }

    for h in handles {
        h.join().unwrap();
    }
    assert!(reader.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_delayed_records_fire_on_their_tick() {
    let time = TimeBase::new(48_000, 480);
    let (writer, mut reader) = command_ring(2048);

    for (delay, pid) in [(50.0, 1), (0.0, 2), (25.0, 3)] {
        let record = ActionRecord::new(Action::play(NodeId(10)).with_delay_ms(delay), 7, pid);
        writer.post(record.tag(), &record.to_bytes()).unwrap();
    }

    let mut list = PendingActionList::new(16);
    let mut immediate = Vec::new();
    for record in drain_records(&mut reader) {
        if record.action.delay_ms > 0.0 {
            defer(&mut list, &record, &time, 0);
        } else {
            immediate.push(record.playing_id);
        }
    }
    assert_eq!(immediate, vec![2]);
    assert_eq!(list.next_launch(), Some(TickTime::new(2, 240)));

    let mut fired = Vec::new();
    for tick in 0..10 {
        for pa in list.process_due(tick) {
            fired.push((tick, pa.playing_id));
        }
    }
    assert_eq!(fired, vec![(2, 3), (5, 1)]);
}

#[test]
fn test_stop_before_delay_cancels_play_only() {
    let time = TimeBase::new(48_000, 480);
    let mut list = PendingActionList::new(16);

    let play = ActionRecord::new(Action::play(NodeId(10)).with_delay_ms(100.0), 7, 1);
    let seek = ActionRecord::new(
        Action::seek(NodeId(10), vox_event::SeekPosition::Percent(0.5)).with_delay_ms(100.0),
        7,
        1,
    );
    defer(&mut list, &play, &time, 0);
    defer(&mut list, &seek, &time, 0);
    list.pause(&PendingFilter::by_playing_id(1), 1);

    let removed = list.stop_pending(&PendingFilter::by_node(NodeId(10), Some(7)));
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].action_type(), ActionType::Play);
    assert_eq!(list.len(), 1);
    assert_eq!(list.paused_len(), 1, "seek stays paused");
}
