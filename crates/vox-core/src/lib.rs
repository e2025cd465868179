//! vox-core: Shared types for the vox voice engine
//!
//! Foundational pieces used by every vox crate:
//! - Error taxonomy (`VoxError` / `VoxResult`)
//! - Node, playing and game-object identifiers
//! - Tick/sample time base
//! - Fade curves shared by transitions, RTPC curves and crossfades
//! - Engine configuration (serde, JSON)
//! - Bounds-checked binary reader for bank parameter blocks

mod bytes;
mod config;
mod curve;
mod error;
mod ids;
mod time;

pub use bytes::*;
pub use config::*;
pub use curve::*;
pub use error::*;
pub use ids::*;
pub use time::*;

/// Volume floor used when converting silence to decibels
pub const SILENCE_DB: f32 = -96.3;

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f32);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const SILENCE: Self = Self(SILENCE_DB);

    #[inline]
    pub fn from_gain(gain: f32) -> Self {
        if gain <= 0.0 {
            Self::SILENCE
        } else {
            Self((20.0 * gain.log10()).max(SILENCE_DB))
        }
    }

    #[inline]
    pub fn to_gain(self) -> f32 {
        db_to_gain(self.0)
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Convert decibels to linear gain; anything at or below the floor is silent
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    if db <= SILENCE_DB {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decibel_conversion() {
        assert_relative_eq!(Decibels(0.0).to_gain(), 1.0);
        assert_relative_eq!(Decibels(-6.0206).to_gain(), 0.5, epsilon = 1e-4);
        assert_eq!(Decibels::SILENCE.to_gain(), 0.0);
        assert_eq!(Decibels::from_gain(0.0), Decibels::SILENCE);
        assert_relative_eq!(Decibels::from_gain(0.5).0, -6.0206, epsilon = 1e-3);
    }
}
