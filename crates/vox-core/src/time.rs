//! Tick-based time for the audio thread
//!
//! One tick is one audio frame of `frames_per_tick` samples. Deferred work is
//! scheduled at a `(tick, frame_offset)` pair so it can start sample-accurately
//! inside the frame it falls into.

use serde::{Deserialize, Serialize};

/// Audio frame counter
pub type Tick = u64;

/// A point in time expressed as a tick plus a sub-tick sample offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TickTime {
    pub tick: Tick,
    pub frame_offset: u32,
}

impl TickTime {
    #[inline]
    pub fn new(tick: Tick, frame_offset: u32) -> Self {
        Self { tick, frame_offset }
    }
}

/// Sample rate plus frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub sample_rate: u32,
    pub frames_per_tick: u32,
}

impl TimeBase {
    pub fn new(sample_rate: u32, frames_per_tick: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frames_per_tick: frames_per_tick.max(1),
        }
    }

    #[inline]
    pub fn ms_to_samples(&self, ms: f64) -> u64 {
        if ms <= 0.0 {
            return 0;
        }
        (ms * self.sample_rate as f64 / 1000.0).round() as u64
    }

    #[inline]
    pub fn samples_to_ms(&self, samples: u64) -> f64 {
        samples as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Duration of one tick in milliseconds
    #[inline]
    pub fn tick_ms(&self) -> f64 {
        self.samples_to_ms(self.frames_per_tick as u64)
    }

    /// Number of whole ticks covering `ms`, rounded up
    #[inline]
    pub fn ms_to_ticks(&self, ms: f64) -> u64 {
        let samples = self.ms_to_samples(ms);
        samples.div_ceil(self.frames_per_tick as u64)
    }

    /// Launch time for work delayed by `delay_samples` from the start of `now`
    #[inline]
    pub fn delay_from(&self, now: Tick, delay_samples: u64) -> TickTime {
        let fpt = self.frames_per_tick as u64;
        TickTime {
            tick: now + delay_samples / fpt,
            frame_offset: (delay_samples % fpt) as u32,
        }
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new(48_000, 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_conversions() {
        let tb = TimeBase::new(48_000, 480);
        assert_eq!(tb.ms_to_samples(10.0), 480);
        assert_eq!(tb.ms_to_ticks(10.0), 1);
        assert_eq!(tb.ms_to_ticks(10.5), 2);
        assert_eq!(tb.ms_to_ticks(0.0), 0);
        assert!((tb.tick_ms() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_delay_splits_into_tick_and_offset() {
        let tb = TimeBase::new(48_000, 480);
        let t = tb.delay_from(100, 1000);
        assert_eq!(t, TickTime::new(102, 40));
        assert!(TickTime::new(1, 5) < TickTime::new(2, 0));
    }
}
