//! Lower engine
//!
//! Everything below the voice state machine: codecs and their streaming
//! sources, the per-voice connection objects, the command queue the upper
//! engine feeds, and the mixing graph rendered once per frame.

pub mod cbx;
pub mod codec;
pub mod command;
pub mod graph;
pub mod scheduler;

pub use cbx::Cbx;
pub use codec::{
    CodecDescriptor, CodecId, CodecRegistry, FormatStatus, MediaData, MediaFailure, PCM_CODEC,
    PcmSource, RenderStatus, SourceContext, SourceDecoder, SourceType,
};
pub use command::{LowerCommand, LowerCommandKind, NO_SEQUENCE};
pub use graph::{EdgeKind, MixEdge, MixGraph};
pub use scheduler::{LowerEngine, LowerEvent, LowerStats};
