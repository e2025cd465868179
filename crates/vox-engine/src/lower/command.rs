//! Lower-engine commands
//!
//! The voice state machine never touches a connection object directly. It
//! queues commands that the scheduler resolves once the source is ready.

use vox_core::SequenceId;
use vox_event::SeekPosition;

use crate::pbi::PbiId;

/// Sequence id meaning "not part of a sample-accurate group"
pub const NO_SEQUENCE: SequenceId = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LowerCommandKind {
    Play,
    /// Connect and start in the paused state
    PlayPause,
    Pause,
    Resume,
    /// Finish the current loop and end
    StopLooping,
    Seek(SeekPosition),
    Stop,
}

impl LowerCommandKind {
    #[inline]
    pub fn is_play(&self) -> bool {
        matches!(self, LowerCommandKind::Play | LowerCommandKind::PlayPause)
    }
}

/// One queued command for a voice's connection object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowerCommand {
    pub pbi: PbiId,
    /// Voices sharing a non-zero sequence id start in the same frame
    pub seq: SequenceId,
    pub kind: LowerCommandKind,
}

impl LowerCommand {
    pub fn new(pbi: PbiId, kind: LowerCommandKind) -> Self {
        Self {
            pbi,
            seq: NO_SEQUENCE,
            kind,
        }
    }

    pub fn with_seq(mut self, seq: SequenceId) -> Self {
        self.seq = seq;
        self
    }

    #[inline]
    pub fn is_play(&self) -> bool {
        self.kind.is_play()
    }
}
