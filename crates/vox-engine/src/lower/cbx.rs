//! Connection object (Cbx)
//!
//! Connects one voice's streaming decoder to the mixing graph. Owns the
//! voice's render buffer and applies the per-frame gain as a linear ramp
//! from the previous frame's value, so parameter changes never step.

use std::fmt;

use vox_core::{NodeId, SequenceId};
use vox_event::SeekPosition;

use super::codec::{FormatStatus, RenderStatus, SourceDecoder};
use crate::pbi::PbiId;

pub struct Cbx {
    pub pbi: PbiId,
    pub node: NodeId,
    pub seq: SequenceId,
    source: Box<dyn SourceDecoder>,
    ready: bool,
    started: bool,
    pub paused: bool,
    /// Advance without rendering
    pub is_virtual: bool,
    /// Mixing bus this voice feeds, `None` for the final output
    pub mix_bus: Option<NodeId>,
    gain: f32,
    prev_gain: Option<f32>,
    /// Frames of silence before the first rendered frame
    frame_offset: u32,
    buffer: Vec<f32>,
    frames_rendered: u64,
}

impl fmt::Debug for Cbx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cbx")
            .field("pbi", &self.pbi)
            .field("node", &self.node)
            .field("seq", &self.seq)
            .field("ready", &self.ready)
            .field("started", &self.started)
            .field("paused", &self.paused)
            .field("is_virtual", &self.is_virtual)
            .field("gain", &self.gain)
            .finish()
    }
}

impl Cbx {
    pub fn new(pbi: PbiId, node: NodeId, seq: SequenceId, source: Box<dyn SourceDecoder>) -> Self {
        Self {
            pbi,
            node,
            seq,
            source,
            ready: false,
            started: false,
            paused: false,
            is_virtual: false,
            mix_bus: None,
            gain: 1.0,
            prev_gain: None,
            frame_offset: 0,
            buffer: Vec::new(),
            frames_rendered: 0,
        }
    }

    /// Poll the source until its format is known
    pub fn try_connect(&mut self) -> FormatStatus {
        if self.ready {
            return FormatStatus::Ready;
        }
        let status = self.source.format_status();
        self.ready = status == FormatStatus::Ready;
        status
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn start(&mut self, paused: bool, seek: Option<SeekPosition>, loop_count: u16, frame_offset: u32) {
        self.source.set_loop_count(loop_count);
        if let Some(position) = seek {
            self.seek(position);
        }
        self.paused = paused;
        self.frame_offset = frame_offset;
        self.started = true;
    }

    pub fn seek(&mut self, position: SeekPosition) {
        let frame = position.to_samples(self.source.duration_frames());
        self.source.seek(frame);
    }

    pub fn stop_looping(&mut self) {
        self.source.set_loop_count(1);
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.max(0.0);
    }

    /// Apply the current gain flat on the next render instead of ramping to it
    pub fn snap_gain(&mut self) {
        self.prev_gain = None;
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.source.position()
    }

    #[inline]
    pub fn duration_frames(&self) -> u64 {
        self.source.duration_frames()
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    #[inline]
    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Render one frame of `frames` samples into the voice buffer
    pub fn render(&mut self, frames: usize, channels: usize) -> RenderStatus {
        self.buffer.clear();
        self.buffer.resize(frames * channels, 0.0);
        if !self.started || self.paused {
            return RenderStatus::Continue;
        }

        let offset = (self.frame_offset as usize).min(frames);
        self.frame_offset -= offset as u32;
        let todo = frames - offset;
        if todo == 0 {
            return RenderStatus::Continue;
        }

        let status = if self.is_virtual {
            self.source.skip(todo)
        } else {
            self.source
                .render(&mut self.buffer[offset * channels..], channels, todo)
        };
        self.frames_rendered += match status {
            RenderStatus::EndReached { frames } => frames as u64,
            _ => todo as u64,
        };

        let from = self.prev_gain.unwrap_or(self.gain);
        let to = self.gain;
        if !self.is_virtual {
            for (i, frame) in self.buffer[offset * channels..].chunks_mut(channels).enumerate() {
                let g = from + (to - from) * (i + 1) as f32 / todo as f32;
                frame.iter_mut().for_each(|s| *s *= g);
            }
        }
        self.prev_gain = Some(to);
        status
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::codec::{MediaData, PcmSource};

    fn cbx(frames: usize) -> Cbx {
        let media = MediaData::constant(1.0, frames, 1);
        Cbx::new(PbiId(1), NodeId(1), 0, Box::new(PcmSource::new(media, 1)))
    }

    #[test]
    fn test_silent_until_started() {
        let mut c = cbx(100);
        assert_eq!(c.try_connect(), FormatStatus::Ready);
        assert_eq!(c.render(10, 2), RenderStatus::Continue);
        assert!(c.buffer().iter().all(|s| *s == 0.0));
        assert_eq!(c.frames_rendered(), 0);
    }

    #[test]
    fn test_frame_offset_delays_start() {
        let mut c = cbx(100);
        c.try_connect();
        c.start(false, None, 1, 4);
        c.render(10, 1);
        assert_eq!(&c.buffer()[..4], &[0.0; 4]);
        assert!(c.buffer()[4..].iter().all(|s| *s == 1.0));
        assert_eq!(c.frames_rendered(), 6);
    }

    #[test]
    fn test_gain_ramps_between_frames() {
        let mut c = cbx(100);
        c.try_connect();
        c.start(false, None, 1, 0);
        c.set_gain(1.0);
        c.render(4, 1);
        c.set_gain(0.0);
        c.render(4, 1);
        assert_eq!(c.buffer(), &[0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn test_virtual_advances_silently() {
        let mut c = cbx(100);
        c.try_connect();
        c.start(false, None, 1, 0);
        c.is_virtual = true;
        c.render(30, 1);
        assert!(c.buffer().iter().all(|s| *s == 0.0));
        assert_eq!(c.position(), 30);
        c.is_virtual = false;
        c.render(10, 1);
        assert_eq!(c.position(), 40);
        assert!(c.buffer().iter().all(|s| *s == 1.0));
    }

    #[test]
    fn test_end_reached_and_seek() {
        let mut c = cbx(20);
        c.try_connect();
        c.start(false, Some(SeekPosition::Percent(0.5)), 1, 0);
        assert_eq!(c.position(), 10);
        assert_eq!(c.render(16, 1), RenderStatus::EndReached { frames: 10 });
    }
}
