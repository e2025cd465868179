//! Fade Curve Types
//!
//! Curve shapes shared by fades, ducking, RTPC curves and crossfades.

use serde::{Deserialize, Serialize};
use std::f32::consts::{E, FRAC_PI_2};

/// Fade curve type for value transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum FadeCurve {
    /// Logarithmic curve (fast start, slow end) - 3dB
    Log3 = 0,
    /// Sine quarter period
    Sine = 1,
    /// Logarithmic curve - 1dB
    Log1 = 2,
    /// Inverse S-curve (fast start/end, slow middle)
    InvSCurve = 3,
    /// Linear interpolation (constant rate)
    #[default]
    Linear = 4,
    /// S-curve (slow start/end, fast middle)
    SCurve = 5,
    /// Exponential curve (slow start, fast end) - 1dB
    Exp1 = 6,
    /// Reciprocal sine (slow start)
    SineRecip = 7,
    /// Exponential curve - 3dB
    Exp3 = 8,
    /// Hold the start value until the end
    Constant = 9,
}

impl FadeCurve {
    pub const ALL: [FadeCurve; 10] = [
        FadeCurve::Log3,
        FadeCurve::Sine,
        FadeCurve::Log1,
        FadeCurve::InvSCurve,
        FadeCurve::Linear,
        FadeCurve::SCurve,
        FadeCurve::Exp1,
        FadeCurve::SineRecip,
        FadeCurve::Exp3,
        FadeCurve::Constant,
    ];

    /// Convert from u8 index
    #[inline]
    pub fn from_index(index: u8) -> Self {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(FadeCurve::Linear)
    }

    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            FadeCurve::Log3 => "Log3",
            FadeCurve::Sine => "Sine",
            FadeCurve::Log1 => "Log1",
            FadeCurve::InvSCurve => "InvSCurve",
            FadeCurve::Linear => "Linear",
            FadeCurve::SCurve => "SCurve",
            FadeCurve::Exp1 => "Exp1",
            FadeCurve::SineRecip => "SineRecip",
            FadeCurve::Exp3 => "Exp3",
            FadeCurve::Constant => "Constant",
        }
    }

    /// Evaluate curve at position t (0.0 - 1.0)
    ///
    /// Returns value in range 0.0 - 1.0
    #[inline]
    pub fn evaluate(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => t,

            // y = ln(1 + t*3) / ln(4)
            FadeCurve::Log3 => (1.0 + t * 3.0).ln() / 4.0_f32.ln(),

            // y = sin(t * π/2)
            FadeCurve::Sine => (t * FRAC_PI_2).sin(),

            // y = ln(1 + t) / ln(2)
            FadeCurve::Log1 => (1.0 + t).ln() / 2.0_f32.ln(),

            FadeCurve::InvSCurve => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - 2.0 * (1.0 - t) * (1.0 - t)
                }
            }

            FadeCurve::SCurve => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }

            // y = (e^t - 1) / (e - 1)
            FadeCurve::Exp1 => (E.powf(t) - 1.0) / (E - 1.0),

            // y = 1 - cos(t * π/2)
            FadeCurve::SineRecip => 1.0 - (t * FRAC_PI_2).cos(),

            // y = (e^(t*3) - 1) / (e^3 - 1)
            FadeCurve::Exp3 => (E.powf(t * 3.0) - 1.0) / (E.powi(3) - 1.0),

            FadeCurve::Constant => {
                if t >= 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Interpolate between `from` and `to` at normalized position `t`
    #[inline]
    pub fn interpolate(&self, from: f32, to: f32, t: f32) -> f32 {
        if t >= 1.0 {
            return to;
        }
        from + (to - from) * self.evaluate(t)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EQUAL POWER CROSSFADE
// ═══════════════════════════════════════════════════════════════════════════════

/// Equal power crossfade gains `(outgoing, incoming)` at position `t`
#[inline]
pub fn equal_power_crossfade(t: f32) -> (f32, f32) {
    let angle = t.clamp(0.0, 1.0) * FRAC_PI_2;
    (angle.cos(), angle.sin())
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_boundaries() {
        for curve in FadeCurve::ALL {
            assert!(curve.evaluate(0.0).abs() < 0.001, "{:?} at 0.0", curve);
            assert!((curve.evaluate(1.0) - 1.0).abs() < 0.001, "{:?} at 1.0", curve);

            if curve != FadeCurve::Constant {
                let mid = curve.evaluate(0.5);
                assert!(mid > 0.0 && mid < 1.0, "{:?} at 0.5 = {}", curve, mid);
            }
        }
    }

    #[test]
    fn test_curve_monotonic() {
        for curve in FadeCurve::ALL {
            let mut prev = 0.0;
            for i in 0..=100 {
                let t = i as f32 / 100.0;
                let val = curve.evaluate(t);
                assert!(val >= prev - 0.0001, "{:?}: {} < {} at t={}", curve, val, prev, t);
                prev = val;
            }
        }
    }

    #[test]
    fn test_interpolate_reaches_target_exactly() {
        for curve in FadeCurve::ALL {
            assert_eq!(curve.interpolate(0.25, -12.0, 1.0), -12.0);
            assert_eq!(curve.interpolate(0.25, -12.0, 0.0), 0.25);
        }
        assert!((FadeCurve::Linear.interpolate(0.0, 1.0, 0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_equal_power() {
        for i in 0..=100 {
            let t = i as f32 / 100.0;
            let (a, b) = equal_power_crossfade(t);
            assert!((a * a + b * b - 1.0).abs() < 0.001, "power at t={}", t);
        }
    }

    #[test]
    fn test_from_index() {
        assert_eq!(FadeCurve::from_index(4), FadeCurve::Linear);
        assert_eq!(FadeCurve::from_index(9), FadeCurve::Constant);
        assert_eq!(FadeCurve::from_index(255), FadeCurve::Linear);
    }
}
