//! Engine configuration
//!
//! Loaded from JSON; every field has a default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{VoxError, VoxResult};
use crate::time::TimeBase;

/// Which voice loses when a limiter is full and priorities tie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum KillPolicy {
    /// Keep newer voices, evict the oldest
    #[default]
    KillOldest = 0,
    /// Keep older voices, refuse or evict the newest
    KillNewest = 1,
}

/// Order in which the global and per-node limiters arbitrate in one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum LimiterArbitration {
    /// Per-node limiters first, then the global limit over the survivors
    #[default]
    NodeFirst = 0,
    /// Global limit first, then per-node limiters
    GlobalFirst = 1,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output sample rate (Hz)
    pub sample_rate: u32,
    /// Samples rendered per audio tick
    pub frames_per_tick: u32,
    /// Output channel count (interleaved)
    pub output_channels: u16,
    /// Size of the control → audio command ring (bytes)
    pub command_queue_bytes: usize,
    /// Capacity of the fade transition category
    pub max_fade_transitions: usize,
    /// Capacity of the state transition category
    pub max_state_transitions: usize,
    /// Upper bound on deferred actions
    pub max_pending_actions: usize,
    /// Global voice limit (0 = unlimited)
    pub max_voices: u16,
    /// Tie-break policy of the global limiter
    pub global_kill_policy: KillPolicy,
    /// Cross-limiter arbitration order
    pub limiter_arbitration: LimiterArbitration,
    /// Fade substituted for zero-duration stops (ms)
    pub min_stop_fade_ms: f32,
    /// Crossfades shorter than this fall back to a plain delayed play (ms)
    pub min_crossfade_ms: f32,
    /// Floor for summed ducking attenuation (dB)
    pub max_duck_attenuation_db: f32,
    /// Fallback wake-up period of the audio thread (ms, 0 = one buffer)
    pub audio_thread_wait_ms: u32,
    /// Render independent voices on the rayon pool
    pub parallel_voices: bool,
    /// Seed for container randomization
    pub random_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frames_per_tick: 1024,
            output_channels: 2,
            command_queue_bytes: 64 * 1024,
            max_fade_transitions: 256,
            max_state_transitions: 256,
            max_pending_actions: 4096,
            max_voices: 0,
            global_kill_policy: KillPolicy::KillOldest,
            limiter_arbitration: LimiterArbitration::NodeFirst,
            min_stop_fade_ms: 1.0,
            min_crossfade_ms: 50.0,
            max_duck_attenuation_db: -96.0,
            audio_thread_wait_ms: 0,
            parallel_voices: true,
            random_seed: 0x5EED,
        }
    }
}

impl EngineConfig {
    pub fn time_base(&self) -> TimeBase {
        TimeBase::new(self.sample_rate, self.frames_per_tick)
    }

    /// Audio thread fallback wait, defaulting to one buffer
    pub fn wait_duration(&self) -> std::time::Duration {
        let ms = if self.audio_thread_wait_ms == 0 {
            self.time_base().tick_ms()
        } else {
            self.audio_thread_wait_ms as f64
        };
        std::time::Duration::from_micros((ms * 1000.0).max(100.0) as u64)
    }

    pub fn validate(&self) -> VoxResult<()> {
        if self.sample_rate == 0 {
            return Err(VoxError::InvalidConfig("sample_rate must be > 0".into()));
        }
        if self.frames_per_tick == 0 {
            return Err(VoxError::InvalidConfig("frames_per_tick must be > 0".into()));
        }
        if self.output_channels == 0 {
            return Err(VoxError::InvalidConfig("output_channels must be > 0".into()));
        }
        if self.command_queue_bytes < 256 {
            return Err(VoxError::InvalidConfig(
                "command_queue_bytes must be at least 256".into(),
            ));
        }
        if self.max_duck_attenuation_db > 0.0 {
            return Err(VoxError::InvalidConfig(
                "max_duck_attenuation_db must be <= 0".into(),
            ));
        }
        if self.min_stop_fade_ms < 0.0 || self.min_crossfade_ms < 0.0 {
            return Err(VoxError::InvalidConfig("fade thresholds must be >= 0".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> VoxResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> VoxResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&content)?;
        log::info!("Engine config loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> VoxResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_crossfade_ms, 50.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "sample_rate": 44100, "max_voices": 8 }"#).unwrap();
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.max_voices, 8);
        assert_eq!(config.frames_per_tick, 1024);
        assert_eq!(config.global_kill_policy, KillPolicy::KillOldest);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(EngineConfig::from_json_str(r#"{ "frames_per_tick": 0 }"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{ "max_duck_attenuation_db": 3.0 }"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let config = EngineConfig {
            max_voices: 32,
            limiter_arbitration: LimiterArbitration::GlobalFirst,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.max_voices, 32);
        assert_eq!(loaded.limiter_arbitration, LimiterArbitration::GlobalFirst);
    }

    #[test]
    fn test_wait_duration_defaults_to_one_buffer() {
        let config = EngineConfig {
            sample_rate: 48_000,
            frames_per_tick: 480,
            ..Default::default()
        };
        assert_eq!(config.wait_duration(), std::time::Duration::from_millis(10));
    }
}
