//! Parameter / Property Model
//!
//! Each node carries a sparse bundle of base property values. Resolution
//! layers modulation on top (RTPC curves, state offsets, scoped instance
//! overrides, transitions) and accumulates the result into a dense
//! [`PropValues`] array. A [`PropSet`] bitmask names the properties a caller
//! actually needs so nothing else is computed.
//!
//! Two kinds of properties exist:
//! - **Additive** values sum along the hierarchy (volume, pitch, filters...)
//! - **Overridable** values come from the nearest ancestor that overrides
//!   them; the root always counts as overriding

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTY ID
// ═══════════════════════════════════════════════════════════════════════════════

/// Property identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum PropId {
    /// Voice volume (dB)
    #[default]
    Volume = 0,
    /// Pitch (cents)
    Pitch = 1,
    /// Low-pass amount (0-100)
    Lpf = 2,
    /// High-pass amount (0-100)
    Hpf = 3,
    /// Make-up gain (dB)
    MakeUpGain = 4,
    /// Bus volume applied at the mixing stage (dB)
    BusVolume = 5,
    /// Output bus volume (dB)
    OutputBusVolume = 6,
    UserAuxSend0 = 7,
    UserAuxSend1 = 8,
    UserAuxSend2 = 9,
    UserAuxSend3 = 10,
    /// Base playback priority (0-100)
    Priority = 11,
    /// Priority offset applied at max distance
    PriorityDistanceOffset = 12,
}

/// Number of property ids
pub const PROP_COUNT: usize = 13;

impl PropId {
    pub const ALL: [PropId; PROP_COUNT] = [
        PropId::Volume,
        PropId::Pitch,
        PropId::Lpf,
        PropId::Hpf,
        PropId::MakeUpGain,
        PropId::BusVolume,
        PropId::OutputBusVolume,
        PropId::UserAuxSend0,
        PropId::UserAuxSend1,
        PropId::UserAuxSend2,
        PropId::UserAuxSend3,
        PropId::Priority,
        PropId::PriorityDistanceOffset,
    ];

    #[inline]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PropId::Volume => "Volume",
            PropId::Pitch => "Pitch",
            PropId::Lpf => "LPF",
            PropId::Hpf => "HPF",
            PropId::MakeUpGain => "MakeUpGain",
            PropId::BusVolume => "BusVolume",
            PropId::OutputBusVolume => "OutputBusVolume",
            PropId::UserAuxSend0 => "UserAuxSend0",
            PropId::UserAuxSend1 => "UserAuxSend1",
            PropId::UserAuxSend2 => "UserAuxSend2",
            PropId::UserAuxSend3 => "UserAuxSend3",
            PropId::Priority => "Priority",
            PropId::PriorityDistanceOffset => "PriorityDistanceOffset",
        }
    }

    /// Additive properties sum along the chain; the rest are overridable
    #[inline]
    pub fn is_additive(&self) -> bool {
        !matches!(self, PropId::Priority | PropId::PriorityDistanceOffset)
    }

    /// Value used when nothing in the chain sets the property
    #[inline]
    pub fn default_value(&self) -> f32 {
        match self {
            PropId::Priority => 50.0,
            _ => 0.0,
        }
    }

    /// Properties that only matter on the bus side of the graph
    #[inline]
    pub fn is_bus_level(&self) -> bool {
        matches!(self, PropId::BusVolume | PropId::OutputBusVolume)
    }

    #[inline]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTY SET (bitmask)
// ═══════════════════════════════════════════════════════════════════════════════

/// Set of property ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PropSet(pub u32);

impl PropSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self((1 << PROP_COUNT as u32) - 1);

    /// Properties needed to render a voice
    pub const VOICE: Self = Self(
        (1 << PropId::Volume as u32)
            | (1 << PropId::Pitch as u32)
            | (1 << PropId::Lpf as u32)
            | (1 << PropId::Hpf as u32)
            | (1 << PropId::MakeUpGain as u32)
            | (1 << PropId::Priority as u32)
            | (1 << PropId::PriorityDistanceOffset as u32),
    );

    /// Properties needed to mix a bus
    pub const BUS: Self = Self(
        (1 << PropId::Volume as u32)
            | (1 << PropId::BusVolume as u32)
            | (1 << PropId::OutputBusVolume as u32)
            | (1 << PropId::Lpf as u32)
            | (1 << PropId::Hpf as u32),
    );

    pub fn of(props: &[PropId]) -> Self {
        Self(props.iter().fold(0, |acc, p| acc | p.bit()))
    }

    #[inline]
    pub fn contains(self, prop: PropId) -> bool {
        self.0 & prop.bit() != 0
    }

    #[inline]
    pub fn insert(&mut self, prop: PropId) {
        self.0 |= prop.bit();
    }

    #[inline]
    pub fn remove(&mut self, prop: PropId) {
        self.0 &= !prop.bit();
    }

    #[inline]
    pub fn with(mut self, prop: PropId) -> Self {
        self.insert(prop);
        self
    }

    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = PropId> {
        PropId::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SPARSE BUNDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Sparse property bundle; most nodes set a handful of values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropBundle {
    entries: SmallVec<[(PropId, f32); 4]>,
}

impl PropBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, prop: PropId, value: f32) -> Self {
        self.set(prop, value);
        self
    }

    #[inline]
    pub fn get(&self, prop: PropId) -> Option<f32> {
        self.entries.iter().find(|(p, _)| *p == prop).map(|(_, v)| *v)
    }

    pub fn set(&mut self, prop: PropId, value: f32) {
        match self.entries.iter_mut().find(|(p, _)| *p == prop) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((prop, value)),
        }
    }

    pub fn remove(&mut self, prop: PropId) -> Option<f32> {
        let pos = self.entries.iter().position(|(p, _)| *p == prop)?;
        Some(self.entries.swap_remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropId, f32)> + '_ {
        self.entries.iter().copied()
    }

    /// Properties present in the bundle
    pub fn keys(&self) -> PropSet {
        PropSet(self.entries.iter().fold(0, |acc, (p, _)| acc | p.bit()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DENSE VALUES
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolved property values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropValues {
    values: [f32; PROP_COUNT],
}

impl PropValues {
    /// Every property at its default
    pub fn defaults() -> Self {
        let mut values = [0.0; PROP_COUNT];
        for prop in PropId::ALL {
            values[prop as usize] = prop.default_value();
        }
        Self { values }
    }

    #[inline]
    pub fn get(&self, prop: PropId) -> f32 {
        self.values[prop as usize]
    }

    #[inline]
    pub fn set(&mut self, prop: PropId, value: f32) {
        self.values[prop as usize] = value;
    }

    #[inline]
    pub fn add(&mut self, prop: PropId, value: f32) {
        self.values[prop as usize] += value;
    }

    /// Add every additive value of `bundle` that `mask` requests
    pub fn accumulate(&mut self, bundle: &PropBundle, mask: PropSet) {
        for (prop, value) in bundle.iter() {
            if mask.contains(prop) && prop.is_additive() {
                self.add(prop, value);
            }
        }
    }

    /// Effective priority clamped to the valid range
    pub fn priority(&self) -> f32 {
        self.get(PropId::Priority).clamp(0.0, 100.0)
    }
}

impl Default for PropValues {
    fn default() -> Self {
        Self::defaults()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prop_set_ops() {
        let set = PropSet::of(&[PropId::Volume, PropId::Priority]);
        assert!(set.contains(PropId::Volume));
        assert!(!set.contains(PropId::Pitch));
        assert_eq!(set.iter().count(), 2);
        assert!(PropSet::ALL.contains(PropId::PriorityDistanceOffset));
        assert!(PropSet::VOICE.intersect(PropSet::of(&[PropId::BusVolume])).is_empty());
    }

    #[test]
    fn test_bundle_set_get_remove() {
        let mut bundle = PropBundle::new().with(PropId::Volume, -6.0);
        bundle.set(PropId::Volume, -3.0);
        bundle.set(PropId::Pitch, 100.0);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get(PropId::Volume), Some(-3.0));
        assert_eq!(bundle.remove(PropId::Volume), Some(-3.0));
        assert_eq!(bundle.get(PropId::Volume), None);
        assert!(bundle.keys().contains(PropId::Pitch));
    }

    #[test]
    fn test_accumulate_respects_mask_and_kind() {
        let bundle = PropBundle::new()
            .with(PropId::Volume, -6.0)
            .with(PropId::Lpf, 20.0)
            .with(PropId::Priority, 80.0);
        let mut values = PropValues::defaults();
        values.accumulate(&bundle, PropSet::of(&[PropId::Volume, PropId::Priority]));
        assert_eq!(values.get(PropId::Volume), -6.0);
        assert_eq!(values.get(PropId::Lpf), 0.0, "not requested");
        assert_eq!(values.get(PropId::Priority), 50.0, "overridable is not summed");
    }

    #[test]
    fn test_from_index() {
        for (i, prop) in PropId::ALL.iter().enumerate() {
            assert_eq!(PropId::from_index(i as u8), Some(*prop));
        }
        assert_eq!(PropId::from_index(PROP_COUNT as u8), None);
        assert!(!PropId::Priority.is_additive());
    }
}
