//! Notification sink
//!
//! The audio thread reports voice, fade, delay and ducking transitions as
//! flat records. Posting is fire-and-forget: a full or disconnected sink
//! drops the record and bumps a counter, it never blocks the audio thread.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use vox_core::{GameObjectId, NodeId, PlayingId};

// ═══════════════════════════════════════════════════════════════════════════════
// NOTIFICATION REASON
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a notification was posted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NotificationReason {
    Play = 0,
    PlayContinue = 1,
    Stopped = 2,
    StoppedAndContinue = 3,
    Paused = 4,
    Resumed = 5,
    PauseAborted = 6,
    EndReached = 7,
    EndReachedAndContinue = 8,
    DelayStarted = 9,
    DelayEnded = 10,
    DelayAborted = 11,
    FadeStarted = 12,
    FadeCompleted = 13,
    FadeAborted = 14,
    Muted = 15,
    Unmuted = 16,
    Ducked = 17,
    Unducked = 18,
    /// Target not found, source unavailable or stopped before connecting
    PlayFailed = 19,
    /// Refused by a full limiter that could not virtualize
    PlayFailedLimit = 20,
    KickedByNodeLimit = 21,
    KickedByGlobalLimit = 22,
    VirtualByLimit = 23,
    /// Source failed mid-playback; the chain was truncated
    ContinueAborted = 24,
}

impl NotificationReason {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Play => "Play",
            Self::PlayContinue => "PlayContinue",
            Self::Stopped => "Stopped",
            Self::StoppedAndContinue => "StoppedAndContinue",
            Self::Paused => "Paused",
            Self::Resumed => "Resumed",
            Self::PauseAborted => "Pause_Aborted",
            Self::EndReached => "EndReached",
            Self::EndReachedAndContinue => "EndReachedAndContinue",
            Self::DelayStarted => "Delay_Started",
            Self::DelayEnded => "Delay_Ended",
            Self::DelayAborted => "Delay_Aborted",
            Self::FadeStarted => "Fade_Started",
            Self::FadeCompleted => "Fade_Completed",
            Self::FadeAborted => "Fade_Aborted",
            Self::Muted => "Muted",
            Self::Unmuted => "Unmuted",
            Self::Ducked => "Ducked",
            Self::Unducked => "Unducked",
            Self::PlayFailed => "PlayFailed",
            Self::PlayFailedLimit => "PlayFailedLimit",
            Self::KickedByNodeLimit => "KickedByNodeLimit",
            Self::KickedByGlobalLimit => "KickedByGlobalLimit",
            Self::VirtualByLimit => "VirtualByLimit",
            Self::ContinueAborted => "ContinueAborted",
        }
    }

    /// Reasons that end a voice's life
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped
                | Self::EndReached
                | Self::PlayFailed
                | Self::PlayFailedLimit
                | Self::KickedByNodeLimit
                | Self::KickedByGlobalLimit
                | Self::ContinueAborted
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NOTIFICATION
// ═══════════════════════════════════════════════════════════════════════════════

/// One posted record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub reason: NotificationReason,
    pub playing_id: PlayingId,
    pub game_object: GameObjectId,
    pub custom_param: u64,
    /// Node or bus the record is about
    pub element_id: NodeId,
    /// Reason-specific value (fade target, duck offset, tick count...)
    pub extra: f32,
}

impl Notification {
    pub fn new(reason: NotificationReason, element_id: NodeId) -> Self {
        Self {
            reason,
            playing_id: 0,
            game_object: 0,
            custom_param: 0,
            element_id,
            extra: 0.0,
        }
    }

    pub fn with_voice(mut self, playing_id: PlayingId, game_object: GameObjectId, custom_param: u64) -> Self {
        self.playing_id = playing_id;
        self.game_object = game_object;
        self.custom_param = custom_param;
        self
    }

    pub fn with_extra(mut self, extra: f32) -> Self {
        self.extra = extra;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer of notifications; must never block
pub trait NotificationSink: Send + Sync {
    fn post(&self, notification: Notification);

    /// Convenience wrapper taking the flat argument list
    fn post_notification(
        &self,
        reason: NotificationReason,
        playing_id: PlayingId,
        game_object: GameObjectId,
        custom_param: u64,
        element_id: NodeId,
        extra: f32,
    ) {
        self.post(
            Notification::new(reason, element_id)
                .with_voice(playing_id, game_object, custom_param)
                .with_extra(extra),
        );
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    #[inline]
    fn post(&self, _notification: Notification) {}
}

/// Forwards notifications over a crossbeam channel
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<Notification>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Bounded sink; records are dropped once `capacity` are waiting
    pub fn bounded(capacity: usize) -> (Self, Receiver<Notification>) {
        let (tx, rx) = bounded(capacity);
        (Self::from_sender(tx), rx)
    }

    pub fn unbounded() -> (Self, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        (Self::from_sender(tx), rx)
    }

    fn from_sender(tx: Sender<Notification>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Records lost to a full or disconnected channel
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl NotificationSink for ChannelSink {
    fn post(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
