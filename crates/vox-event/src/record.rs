//! Wire layout of action records inside the command ring
//!
//! The record tag is the `ActionType` discriminant, so the audio thread can
//! peek the tag and dispatch before decoding the payload.

use vox_core::{BankReader, ByteWriter, FadeCurve, NodeId, VoxError, VoxResult};

use crate::action::{Action, ActionRecord, ActionScope, ActionType, SeekPosition, TransitionSpec};

const SEEK_NONE: u8 = 0;
const SEEK_SAMPLES: u8 = 1;
const SEEK_PERCENT: u8 = 2;

/// Upper bound on an encoded record payload
pub const MAX_RECORD_PAYLOAD: usize = 96;

impl ActionRecord {
    /// Ring tag for this record
    #[inline]
    pub fn tag(&self) -> u8 {
        self.action.action_type as u8
    }

    pub fn encode(&self, w: &mut ByteWriter) {
        let a = &self.action;
        w.u32(a.id)
            .u32(a.target.0)
            .u8(a.scope as u8)
            .f32(a.delay_ms)
            .f32(a.transition.duration_ms)
            .u8(a.transition.curve as u8)
            .bool(a.is_master_resume)
            .u32(a.group_id)
            .u32(a.value_id)
            .u32(a.rtpc_id)
            .f32(a.rtpc_value);

        match a.seek {
            None => {
                w.u8(SEEK_NONE);
            }
            Some(SeekPosition::Samples(s)) => {
                w.u8(SEEK_SAMPLES).u64(s);
            }
            Some(SeekPosition::Percent(p)) => {
                w.u8(SEEK_PERCENT).f32(p);
            }
        }

        w.u64(self.game_object)
            .u64(self.playing_id)
            .u64(self.custom_param);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(MAX_RECORD_PAYLOAD);
        self.encode(&mut w);
        w.into_bytes()
    }

    /// Decode a payload previously produced by [`ActionRecord::encode`]
    pub fn decode(tag: u8, payload: &[u8]) -> VoxResult<Self> {
        let action_type = ActionType::from_index(tag)
            .ok_or_else(|| VoxError::Serialization(format!("unknown action tag {}", tag)))?;

        let mut r = BankReader::new(payload);
        let id = r.read::<u32>()?;
        let target = NodeId(r.read::<u32>()?);
        let scope = ActionScope::from_index(r.read::<u8>()?);
        let delay_ms = r.read::<f32>()?;
        let duration_ms = r.read::<f32>()?;
        let curve = FadeCurve::from_index(r.read::<u8>()?);
        let is_master_resume = r.read_bool()?;
        let group_id = r.read::<u32>()?;
        let value_id = r.read::<u32>()?;
        let rtpc_id = r.read::<u32>()?;
        let rtpc_value = r.read::<f32>()?;

        let seek = match r.read::<u8>()? {
            SEEK_NONE => None,
            SEEK_SAMPLES => Some(SeekPosition::Samples(r.read::<u64>()?)),
            SEEK_PERCENT => Some(SeekPosition::Percent(r.read::<f32>()?)),
            other => {
                return Err(VoxError::Serialization(format!("bad seek kind {}", other)));
            }
        };

        let game_object = r.read::<u64>()?;
        let playing_id = r.read::<u64>()?;
        let custom_param = r.read::<u64>()?;

        Ok(ActionRecord {
            action: Action {
                id,
                action_type,
                target,
                scope,
                delay_ms,
                transition: TransitionSpec {
                    duration_ms,
                    curve,
                },
                is_master_resume,
                group_id,
                value_id,
                rtpc_id,
                rtpc_value,
                seek,
            },
            game_object,
            playing_id,
            custom_param,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_matches_encode() {
        let record = ActionRecord::new(
            Action::seek(NodeId(99), SeekPosition::Percent(0.25))
                .with_fade(30.0, FadeCurve::SCurve)
                .with_delay_ms(12.5),
            42,
            7,
        )
        .with_custom_param(0xABCD);

        let bytes = record.to_bytes();
        assert!(bytes.len() <= MAX_RECORD_PAYLOAD);
        let decoded = ActionRecord::decode(record.tag(), &bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let record = ActionRecord::new(Action::play(NodeId(1)), 1, 1);
        let bytes = record.to_bytes();
        assert!(ActionRecord::decode(record.tag(), &bytes[..10]).is_err());
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let record = ActionRecord::new(Action::play(NodeId(1)), 1, 1);
        assert!(ActionRecord::decode(0xEE, &record.to_bytes()).is_err());
    }
}
