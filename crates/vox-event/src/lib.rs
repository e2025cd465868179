//! vox-event: control → audio thread command plumbing
//!
//! Everything that crosses from the game thread into the audio thread:
//! - Typed actions (Play, Stop, Pause, Resume, Break, Mute, Seek, game syncs)
//! - Byte-ring command queue with reserve → write → commit and a writer
//!   in-flight counter
//! - Tick-keyed pending action scheduler with paused re-keying
//! - Game syncs (states, switches, RTPC values and curves)
//! - Notification sink (fire-and-forget)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Game Thread                            Audio Thread           │
//! │   ┌──────────────────┐                 ┌────────────────────┐   │
//! │   │ ActionRecord     │   CommandRing   │ CommandReader      │   │
//! │   │  .encode()       │────(bytes)─────▶│  .begin()/.peek()  │   │
//! │   │ CommandWriter    │  in-flight ctr  │  ActionRecord      │   │
//! │   │  .reserve/commit │                 │   ::decode()       │   │
//! │   └──────────────────┘                 └─────────┬──────────┘   │
//! │                                                  │              │
//! │                               delay > 0 ┌────────▼──────────┐   │
//! │                             ┌───────────│ execute / defer   │   │
//! │                             ▼           └───────────────────┘   │
//! │                   ┌────────────────────┐                        │
//! │                   │ PendingActionList  │  due: (tick, seq)      │
//! │                   │                    │  paused: (node, pid)   │
//! │                   └────────────────────┘                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod notification;
pub mod pending;
pub mod queue;
pub mod record;
pub mod syncs;

// Re-exports
pub use action::{Action, ActionRecord, ActionScope, ActionType, SeekPosition, TransitionSpec};
pub use notification::{ChannelSink, Notification, NotificationReason, NotificationSink, NullSink};
pub use pending::{PendingAction, PendingActionList, PendingFilter};
pub use queue::{
    CommandReader, CommandWriter, RECORD_ALIGN, RECORD_HEADER_SIZE, RecordView, WriteReservation,
    command_ring,
};
pub use record::MAX_RECORD_PAYLOAD;
pub use syncs::{
    GameSyncs, RtpcCurve, RtpcCurvePoint, RtpcDefinition, RtpcValue, StateGroup, SwitchGroup,
};
