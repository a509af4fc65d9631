//! The parameter table and payload decoding.
//!
//! [`Registry::standard`] builds the table for the production firmware.
//! Combo member order is load-bearing: it must match the order the firmware
//! concatenates constituent encodings, since the wire carries no sub-field
//! framing.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use super::{ParamType, Value};
use crate::{Result, VelodromeError};

/// Sign applied to every decoded velocity, in one place.
///
/// With `1.0`, the decoded velocity is `magnitude × direction`: a direction
/// byte of -1 yields a negative value. Historic host revisions disagreed on
/// whether to negate; this constant is the single source of truth for the
/// whole crate — never re-apply a sign at a call site.
pub const VELOCITY_SIGN: f32 = 1.0;

/// Descriptor for one device parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    pub id: u8,
    pub name: &'static str,
    pub description: &'static str,
    pub ty: ParamType,
}

/// Maps parameter identifiers to descriptors and decodes reply payloads.
#[derive(Debug, Clone)]
pub struct Registry {
    params: HashMap<u8, ParamInfo>,
    combos: HashMap<u8, Vec<u8>>,
}

impl Registry {
    /// The parameter table of the production firmware.
    pub fn standard() -> Self {
        let table = [
            (0x01, "VSEN3V3", "Voltage on the 3.3V rail.", ParamType::Float32),
            (0x02, "VSEN5V", "Voltage on the 5V rail.", ParamType::Float32),
            (0x03, "TSENMCU", "Internal temperature of the MCU.", ParamType::Float32),
            (0x04, "TSENEXT", "External temperature sensor on the board.", ParamType::Float32),
            (0x05, "TIME", "The device's internal clock.", ParamType::Uint64),
            (0x0A, "SENSORS", "All voltages and temperatures in one read.", ParamType::Combo),
            (0x0B, "VOLTAGES", "Both voltage rails in one read.", ParamType::Combo),
            (0x0C, "TEMPS", "Both temperatures in one read.", ParamType::Combo),
            (0x10, "ENCPOS", "Encoder position in counts.", ParamType::Int32),
            (0x11, "ENCVEL", "Encoder velocity in counts per second.", ParamType::Velocity),
            (0x12, "ENCVELWIN", "Velocity averaging window size.", ParamType::Uint16),
            (0x13, "ENCHOME", "Encoder homing state.", ParamType::Uint8),
            (0x14, "ENCHOMEPOS", "Encoder home position.", ParamType::Int32),
            (0x20, "DI-1", "Digital input 1.", ParamType::Uint8),
            (0x21, "DI-2", "Digital input 2.", ParamType::Uint8),
            (0x25, "DI", "All digital inputs.", ParamType::Combo),
            (0x30, "DO-1", "Digital output 1.", ParamType::Uint8),
            (0x31, "DO-2", "Digital output 2.", ParamType::Uint8),
            (0x32, "DO-3", "Digital output 3.", ParamType::Uint8),
            (0x33, "DO-4", "Digital output 4.", ParamType::Uint8),
            (0x35, "DO", "All digital outputs.", ParamType::Combo),
            (0x40, "AO", "Analog output voltage.", ParamType::Float32),
            (0xAA, "REC", "Recording bundle: time, velocity, I/O.", ParamType::Combo),
            (0xBB, "LINM", "Maze bundle: time, position, I/O.", ParamType::Combo),
            (0xFF, "LED", "Status LED state.", ParamType::Uint8),
        ];

        let mut params = HashMap::with_capacity(table.len());
        for (id, name, description, ty) in table {
            params.insert(id, ParamInfo { id, name, description, ty });
        }

        // Member order mirrors the firmware's concatenation order exactly.
        let mut combos = HashMap::new();
        combos.insert(0x0A, vec![0x01, 0x02, 0x03, 0x04]);
        combos.insert(0x0B, vec![0x01, 0x02]);
        combos.insert(0x0C, vec![0x03, 0x04]);
        combos.insert(0x25, vec![0x20, 0x21]);
        combos.insert(0x35, vec![0x30, 0x31, 0x32, 0x33]);
        combos.insert(0xAA, vec![0x05, 0x11, 0x20, 0x21, 0x30, 0x31, 0x32, 0x33]);
        combos.insert(0xBB, vec![0x05, 0x10, 0x20, 0x21, 0x30, 0x31, 0x32, 0x33]);

        Self { params, combos }
    }

    /// Look up a parameter descriptor.
    pub fn get(&self, id: u8) -> Result<&ParamInfo> {
        self.params.get(&id).ok_or(VelodromeError::UnknownParameter { id })
    }

    /// Whether `id` names a combo parameter.
    pub fn is_combo(&self, id: u8) -> bool {
        self.combos.contains_key(&id)
    }

    /// Constituent identifiers of a combo, in wire order.
    pub fn combo_members(&self, id: u8) -> Result<&[u8]> {
        let info = self.get(id)?;
        self.combos
            .get(&info.id)
            .map(Vec::as_slice)
            .ok_or(VelodromeError::UnknownParameter { id })
    }

    /// Encoded length of a parameter, summing combo constituents recursively.
    pub fn byte_len(&self, id: u8) -> Result<usize> {
        let info = self.get(id)?;
        match info.ty {
            ParamType::Combo => {
                let mut total = 0;
                for &member in self.combo_members(id)? {
                    total += self.byte_len(member)?;
                }
                Ok(total)
            }
            other => other.fixed_size().ok_or_else(|| {
                VelodromeError::config(
                    "registry",
                    format!("parameter {} has no fixed encoded length", info.name),
                )
            }),
        }
    }

    /// Decode a reply payload for the given parameter.
    ///
    /// Fixed-size types require the payload length to match exactly. Combo
    /// decoding walks constituents in registration order, slicing the
    /// payload by each constituent's fixed length; total consumption must
    /// equal the payload length exactly, otherwise every field after a
    /// malformed constituent would be silently corrupted.
    pub fn decode(&self, id: u8, bytes: &[u8]) -> Result<Value> {
        let info = *self.get(id)?;
        trace!(param = info.name, len = bytes.len(), "decoding parameter payload");

        if let Some(expected) = info.ty.fixed_size() {
            if bytes.len() != expected {
                return Err(VelodromeError::PayloadLength {
                    name: info.name,
                    expected,
                    actual: bytes.len(),
                });
            }
        }

        match info.ty {
            ParamType::Float32 => {
                Ok(Value::Float32(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
            }
            ParamType::Uint8 => Ok(Value::Uint8(bytes[0])),
            ParamType::Uint16 => Ok(Value::Uint16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            ParamType::Uint32 => Ok(Value::Uint32(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            ParamType::Uint64 => Ok(Value::Uint64(u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]))),
            ParamType::Int32 => Ok(Value::Int32(i32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            ParamType::Int32Inverted => {
                let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(Value::Int32(raw.wrapping_neg()))
            }
            ParamType::Velocity => {
                let magnitude = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let direction = bytes[4] as i8;
                Ok(Value::Velocity(VELOCITY_SIGN * magnitude * f32::from(direction)))
            }
            ParamType::Bytes => Ok(Value::Bytes(bytes.to_vec())),
            ParamType::Combo => {
                let members = self.combo_members(id)?.to_vec();
                let mut values = BTreeMap::new();
                let mut offset = 0;
                for member in members {
                    let len = self.byte_len(member)?;
                    let slice = bytes.get(offset..offset + len).ok_or_else(|| {
                        VelodromeError::PayloadLength {
                            name: info.name,
                            expected: offset + len,
                            actual: bytes.len(),
                        }
                    })?;
                    values.insert(member, self.decode(member, slice)?);
                    offset += len;
                }
                if offset != bytes.len() {
                    return Err(VelodromeError::PayloadLength {
                        name: info.name,
                        expected: offset,
                        actual: bytes.len(),
                    });
                }
                Ok(Value::Combo(values))
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unknown_parameter_is_an_error() {
        let registry = Registry::standard();
        assert!(matches!(
            registry.decode(0xD7, &[0]),
            Err(VelodromeError::UnknownParameter { id: 0xD7 })
        ));
    }

    #[test]
    fn short_payload_is_an_error() {
        let registry = Registry::standard();
        let err = registry.decode(0x05, &[0u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            VelodromeError::PayloadLength { name: "TIME", expected: 8, actual: 7 }
        ));
    }

    #[test]
    fn every_combo_member_is_registered_and_sized() {
        let registry = Registry::standard();
        for combo in [0x0A, 0x0B, 0x0C, 0x25, 0x35, 0xAA, 0xBB] {
            assert!(registry.is_combo(combo));
            for &member in registry.combo_members(combo).unwrap() {
                let info = registry.get(member).unwrap();
                assert_ne!(info.ty, ParamType::Combo, "nested combos are not in the firmware");
                assert!(registry.byte_len(member).is_ok());
            }
        }
    }

    #[test]
    fn velocity_decodes_magnitude_times_direction() {
        let registry = Registry::standard();
        // f32 1.0 followed by direction byte -1
        let decoded = registry.decode(0x11, &[0, 0, 128, 63, 0xFF]).unwrap();
        assert_eq!(decoded, Value::Velocity(-1.0));

        // direction byte +1 keeps the sign
        let decoded = registry.decode(0x11, &[0, 0, 128, 63, 0x01]).unwrap();
        assert_eq!(decoded, Value::Velocity(1.0));

        // direction byte 0 means standstill regardless of magnitude
        let decoded = registry.decode(0x11, &[0, 0, 128, 63, 0x00]).unwrap();
        assert_eq!(decoded, Value::Velocity(0.0));
    }

    #[test]
    fn inverted_int32_flips_sign() {
        let mut registry = Registry::standard();
        registry.params.insert(
            0xD0,
            ParamInfo {
                id: 0xD0,
                name: "TESTINV",
                description: "test",
                ty: ParamType::Int32Inverted,
            },
        );
        let decoded = registry.decode(0xD0, &25i32.to_le_bytes()).unwrap();
        assert_eq!(decoded, Value::Int32(-25));
    }

    /// Build a valid REC (0xAA) payload from its constituent encodings.
    fn rec_payload(
        time: u64,
        vel_mag: f32,
        vel_dir: i8,
        di: [u8; 2],
        do_: [u8; 4],
    ) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&time.to_le_bytes());
        payload.extend_from_slice(&vel_mag.to_le_bytes());
        payload.push(vel_dir as u8);
        payload.extend_from_slice(&di);
        payload.extend_from_slice(&do_);
        payload
    }

    #[test]
    fn combo_decode_matches_independent_member_decodes() {
        let registry = Registry::standard();
        let payload = rec_payload(123_456, 2.5, -1, [1, 0], [0, 1, 0, 1]);
        assert_eq!(payload.len(), registry.byte_len(0xAA).unwrap());

        let combined = registry.decode(0xAA, &payload).unwrap();
        let values = combined.as_combo().unwrap();

        // each member must equal decoding its own correctly-sliced sub-range
        let mut offset = 0;
        for &member in registry.combo_members(0xAA).unwrap() {
            let len = registry.byte_len(member).unwrap();
            let alone = registry.decode(member, &payload[offset..offset + len]).unwrap();
            assert_eq!(values[&member], alone);
            offset += len;
        }
        assert_eq!(offset, payload.len());

        assert_eq!(values[&0x05], Value::Uint64(123_456));
        assert_eq!(values[&0x11], Value::Velocity(-2.5));
    }

    #[test]
    fn combo_decode_rejects_truncated_payload() {
        let registry = Registry::standard();
        let mut payload = rec_payload(1, 1.0, 1, [0, 0], [0, 0, 0, 0]);
        payload.pop(); // one byte short must fail, not silently truncate
        let err = registry.decode(0xAA, &payload).unwrap_err();
        assert!(matches!(err, VelodromeError::PayloadLength { name: "REC", .. }));
    }

    #[test]
    fn combo_decode_rejects_trailing_bytes() {
        let registry = Registry::standard();
        let mut payload = rec_payload(1, 1.0, 1, [0, 0], [0, 0, 0, 0]);
        payload.push(0xAB);
        let err = registry.decode(0xAA, &payload).unwrap_err();
        assert!(matches!(err, VelodromeError::PayloadLength { name: "REC", .. }));
    }

    proptest! {
        #[test]
        fn prop_combo_decode_consistent_for_all_payloads(
            time in any::<u64>(),
            vel_mag in any::<f32>(),
            vel_dir in any::<i8>(),
            di in any::<[u8; 2]>(),
            do_ in any::<[u8; 4]>(),
        ) {
            let registry = Registry::standard();
            let payload = rec_payload(time, vel_mag, vel_dir, di, do_);
            let combined = registry.decode(0xAA, &payload).unwrap();
            let values = combined.as_combo().unwrap();

            let mut offset = 0;
            for &member in registry.combo_members(0xAA).unwrap() {
                let len = registry.byte_len(member).unwrap();
                let alone = registry.decode(member, &payload[offset..offset + len]).unwrap();
                prop_assert_eq!(&values[&member], &alone);
                offset += len;
            }
        }

        #[test]
        fn prop_wrong_length_never_decodes(
            id in prop::sample::select(vec![0x05u8, 0x10, 0x11, 0x12, 0x20, 0x40, 0xAA, 0xBB]),
            extra in 1usize..8,
            shrink in prop::bool::ANY,
        ) {
            let registry = Registry::standard();
            let expected = registry.byte_len(id).unwrap();
            let len = if shrink { expected.saturating_sub(extra) } else { expected + extra };
            prop_assume!(len != expected);
            let result = registry.decode(id, &vec![0u8; len]);
            let is_payload_length_err = matches!(result, Err(VelodromeError::PayloadLength { .. }));
            prop_assert!(is_payload_length_err);
        }
    }
}
