//! vox-engine: voice lifecycle, bus graph and lower-engine mixing
//!
//! - Node hierarchy (actor-mixer tree + bus tree) with reference counting
//! - Parameter resolution along both trees (props, RTPC, states, SIS)
//! - Random / sequence / switch containers and continuous play chains
//! - Playback instances (PBI) with fades, nested pause and seek
//! - Transition manager shared by fades, ducks, states and mutes
//! - Instance limiters (per node, per bus, global) with virtual voices
//! - Bus ducking with delayed recovery
//! - Lower engine: codecs, connection objects, mixing graph and render
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  EngineHandle ──CommandRing──▶ AudioEngine::tick()                │
//! │                                   │                              │
//! │        ┌──────────────────────────┼──────────────────────────┐   │
//! │        ▼                          ▼                          ▼   │
//! │  PendingActionList          VoiceRegistry (PBI)        Hierarchy │
//! │        │                    │        │                   │       │
//! │        │          TransitionManager  LimiterRegistry  Ducking    │
//! │        │                    │                                    │
//! │        └───────────▶ LowerEngine: Cbx ─▶ MixGraph ─▶ output      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod containers;
pub mod continuation;
pub mod ducking;
pub mod engine;
pub mod handle;
pub mod hierarchy;
pub mod limiter;
pub mod loader;
pub mod lower;
pub mod node;
pub mod pbi;
pub mod props;
pub mod resolve;
pub mod stats;
pub mod transition;

// Re-exports
pub use bus::{AuxSend, BusData, DuckScope, DuckState, DuckTarget};
pub use containers::{ContainerData, ContainerStates, ContinuousTransition};
pub use engine::{AudioEngine, ChainHandoff, PendingExtra};
pub use handle::EngineHandle;
pub use hierarchy::Hierarchy;
pub use limiter::{KickReason, LimiterRegistry, LimiterScope, LimiterVerdict};
pub use loader::{HierarchyLoader, LoadReport};
pub use lower::{CodecRegistry, LowerEngine, MediaData, MediaFailure};
pub use node::{InstanceLimit, Node, SoundData, StateProps};
pub use pbi::{Pbi, PbiId};
pub use props::{PropBundle, PropId};
pub use stats::{EngineStats, SharedStats};
pub use transition::TransitionManager;

pub use vox_core::{VoxError, VoxResult};
