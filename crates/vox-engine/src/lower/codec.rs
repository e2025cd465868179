//! Codec registry and streaming sources
//!
//! A codec is identified by `(company, plugin)`. Its descriptor holds the
//! factory functions that build a streaming decoder for a voice. The built-in
//! PCM codec renders straight from in-memory samples and can simulate slow
//! preparation or failures, which is how the scheduler's gating is tested.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vox_core::{NodeId, VoxError, VoxResult};

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecId {
    pub company: u16,
    pub plugin: u16,
}

impl CodecId {
    pub const fn new(company: u16, plugin: u16) -> Self {
        Self { company, plugin }
    }
}

/// Built-in PCM codec
pub const PCM_CODEC: CodecId = CodecId::new(0, 1);

/// Where a source's data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SourceType {
    File = 0,
    #[default]
    Bank = 1,
}

impl SourceType {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => SourceType::File,
            _ => SourceType::Bank,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEDIA
// ═══════════════════════════════════════════════════════════════════════════════

/// Simulated media failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaFailure {
    #[default]
    None,
    /// Connecting the source fails permanently
    OnConnect,
    /// Rendering fails after this many frames
    AfterFrames(u64),
}

/// In-memory interleaved samples shared by every voice playing them
#[derive(Debug, Clone)]
pub struct MediaData {
    pub samples: Arc<[f32]>,
    pub channels: u16,
    /// Ticks the source reports "format not ready" before connecting
    pub prepare_ticks: u32,
    pub failure: MediaFailure,
}

impl MediaData {
    pub fn new(samples: Vec<f32>, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            prepare_ticks: 0,
            failure: MediaFailure::None,
        }
    }

    /// `frames` frames of a constant value
    pub fn constant(value: f32, frames: usize, channels: u16) -> Self {
        let channels = channels.max(1);
        Self::new(vec![value; frames * channels as usize], channels)
    }

    pub fn with_prepare_ticks(mut self, ticks: u32) -> Self {
        self.prepare_ticks = ticks;
        self
    }

    pub fn with_failure(mut self, failure: MediaFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Length of one loop in frames
    #[inline]
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels as usize) as u64
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECODER TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Readiness of a source's format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatStatus {
    Ready,
    /// Try again next tick
    NotReady,
    /// Permanent failure
    Failed,
}

/// Outcome of one render call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Continue,
    /// Source finished after writing `frames` frames
    EndReached { frames: usize },
    Failed,
}

/// What a codec factory gets to build a source
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub node: NodeId,
    pub media: Option<&'a MediaData>,
    /// Loop count (0 = infinite)
    pub loop_count: u16,
}

/// Streaming decoder consumed by the mixing pipeline
pub trait SourceDecoder: Send {
    fn format_status(&mut self) -> FormatStatus;

    /// Length of one loop in frames
    fn duration_frames(&self) -> u64;

    /// Position within the current loop
    fn position(&self) -> u64;

    fn seek(&mut self, frame: u64);

    /// Change the remaining loop count (1 = finish the current loop)
    fn set_loop_count(&mut self, loops: u16);

    /// Render `frames` interleaved frames of `channels` channels into `out`
    fn render(&mut self, out: &mut [f32], channels: usize, frames: usize) -> RenderStatus;

    /// Advance without producing audio (virtual voices)
    fn skip(&mut self, frames: usize) -> RenderStatus;
}

pub type SrcCreateFn = fn(&SourceContext<'_>) -> VoxResult<Box<dyn SourceDecoder>>;

/// Factory functions of one codec
#[derive(Debug, Clone, Copy)]
pub struct CodecDescriptor {
    pub file_src_create: SrcCreateFn,
    pub bank_src_create: SrcCreateFn,
    /// Standalone codec for external file pipelines
    pub file_codec_create: Option<SrcCreateFn>,
    /// Standalone codec for grain-based pipelines
    pub grain_codec_create: Option<SrcCreateFn>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Codec id → descriptor
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: HashMap<CodecId, CodecDescriptor>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in PCM codec
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_codec(PCM_CODEC.company, PCM_CODEC.plugin, PcmSource::descriptor());
        registry
    }

    /// Register (or replace) a codec
    pub fn register_codec(&mut self, company: u16, plugin: u16, descriptor: CodecDescriptor) {
        let id = CodecId::new(company, plugin);
        if self.codecs.insert(id, descriptor).is_some() {
            log::debug!("Codec {}:{} re-registered", company, plugin);
        }
    }

    pub fn is_registered(&self, codec: CodecId) -> bool {
        self.codecs.contains_key(&codec)
    }

    /// Build a streaming decoder for a voice
    pub fn alloc_codec_src(
        &self,
        ctx: &SourceContext<'_>,
        source_type: SourceType,
        codec: CodecId,
    ) -> VoxResult<Box<dyn SourceDecoder>> {
        let Some(descriptor) = self.codecs.get(&codec) else {
            log::error!(
                "Codec {}:{} not registered (node {})",
                codec.company,
                codec.plugin,
                ctx.node
            );
            return Err(VoxError::CodecNotRegistered {
                company: codec.company,
                plugin: codec.plugin,
            });
        };
        match source_type {
            SourceType::File => (descriptor.file_src_create)(ctx),
            SourceType::Bank => (descriptor.bank_src_create)(ctx),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PCM SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory PCM source
#[derive(Debug)]
pub struct PcmSource {
    media: MediaData,
    position: u64,
    /// Remaining loops including the current one (0 = infinite)
    loops_remaining: u16,
    prepare_left: u32,
    rendered: u64,
}

impl PcmSource {
    pub fn new(media: MediaData, loop_count: u16) -> Self {
        Self {
            prepare_left: media.prepare_ticks,
            media,
            position: 0,
            loops_remaining: loop_count,
            rendered: 0,
        }
    }

    pub fn descriptor() -> CodecDescriptor {
        CodecDescriptor {
            file_src_create: Self::create,
            bank_src_create: Self::create,
            file_codec_create: Some(Self::create),
            grain_codec_create: None,
        }
    }

    fn create(ctx: &SourceContext<'_>) -> VoxResult<Box<dyn SourceDecoder>> {
        let media = ctx
            .media
            .ok_or_else(|| VoxError::SourceFailed(format!("no media for node {}", ctx.node)))?;
        Ok(Box::new(PcmSource::new(media.clone(), ctx.loop_count)))
    }

    fn failed_now(&self) -> bool {
        matches!(self.media.failure, MediaFailure::AfterFrames(n) if self.rendered >= n)
    }

    /// Move to the next loop; `false` when the source is done
    fn wrap(&mut self) -> bool {
        match self.loops_remaining {
            0 => {
                self.position = 0;
                true
            }
            1 => false,
            _ => {
                self.loops_remaining -= 1;
                self.position = 0;
                true
            }
        }
    }

    fn advance(&mut self, out: Option<(&mut [f32], usize)>, frames: usize) -> RenderStatus {
        let total = self.media.frames();
        if total == 0 {
            return RenderStatus::EndReached { frames: 0 };
        }
        let src_channels = self.media.channels as usize;
        let mut out = out;

        for frame in 0..frames {
            if self.failed_now() {
                return RenderStatus::Failed;
            }
            if self.position >= total && !self.wrap() {
                return RenderStatus::EndReached { frames: frame };
            }
            if let Some((buf, channels)) = out.as_mut() {
                let base = self.position as usize * src_channels;
                for c in 0..*channels {
                    buf[frame * *channels + c] = self.media.samples[base + c % src_channels];
                }
            }
            self.position += 1;
            self.rendered += 1;
        }
        if self.position >= total && self.loops_remaining == 1 {
            return RenderStatus::EndReached { frames };
        }
        RenderStatus::Continue
    }
}

impl SourceDecoder for PcmSource {
    fn format_status(&mut self) -> FormatStatus {
        if self.media.failure == MediaFailure::OnConnect {
            return FormatStatus::Failed;
        }
        if self.prepare_left > 0 {
            self.prepare_left -= 1;
            return FormatStatus::NotReady;
        }
        FormatStatus::Ready
    }

    fn duration_frames(&self) -> u64 {
        self.media.frames()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, frame: u64) {
        self.position = frame.min(self.media.frames());
    }

    fn set_loop_count(&mut self, loops: u16) {
        self.loops_remaining = loops;
    }

    fn render(&mut self, out: &mut [f32], channels: usize, frames: usize) -> RenderStatus {
        let frames = frames.min(out.len() / channels.max(1));
        self.advance(Some((out, channels)), frames)
    }

    fn skip(&mut self, frames: usize) -> RenderStatus {
        self.advance(None, frames)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
