//! Fixed-size binary frame codec for the device protocol.
//!
//! Every exchange with the device is a 65-byte frame:
//!
//! ```text
//! offset  size  field
//! 0       2     target address (little-endian)
//! 2       2     source address (little-endian)
//! 4       1     msn (message sequence number)
//! 5       1     command code
//! 6       1     payload length
//! 7       0-56  payload
//! ...           zero filler to 65 bytes
//! ```
//!
//! Some transports prepend a report-id byte; stripping it is the
//! transport's job, the codec always sees the 65-byte frame above.
//!
//! This module is pure data transformation: no I/O, no panics on garbage
//! input. Decoding truncated or corrupted bytes yields a structured
//! [`VelodromeError::Decode`].

use crate::{Result, VelodromeError};

/// Total size of a frame on the wire.
pub const FRAME_LEN: usize = 65;

/// Fixed header size: target[2] + source[2] + msn[1] + cmd[1] + plen[1].
pub const HEADER_LEN: usize = 7;

/// Maximum payload a single frame can carry.
pub const MAX_PAYLOAD: usize = 56;

/// Raw frame bytes as moved by a [`Transport`](crate::Transport).
pub type RawFrame = [u8; FRAME_LEN];

/// Command codes understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// 0x00 — echo request; the reply carries the same payload back
    Ping,
    /// 0x01 — command accepted
    Ack,
    /// 0x02 — command rejected; payload carries a [`NackCode`](crate::NackCode) byte
    Nack,
    /// 0x04 — firmware version and build date
    FirmwareInfo,
    /// 0x05 — application vs. bootloader state
    DeviceState,
    /// 0x08 — product name, revision, serial
    ProductInfo,
    /// 0x0B — read one or more parameters
    ParamRead,
    /// 0x0C — write a parameter
    ParamWrite,
    /// 0x12 — set the status LED
    SetLed,
    /// 0xF0 — reboot the device
    Reset,
    /// Any vendor-specific or undocumented code
    Vendor(u8),
}

impl Command {
    /// Map a raw command byte to its symbolic code.
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Command::Ping,
            0x01 => Command::Ack,
            0x02 => Command::Nack,
            0x04 => Command::FirmwareInfo,
            0x05 => Command::DeviceState,
            0x08 => Command::ProductInfo,
            0x0B => Command::ParamRead,
            0x0C => Command::ParamWrite,
            0x12 => Command::SetLed,
            0xF0 => Command::Reset,
            other => Command::Vendor(other),
        }
    }

    /// The byte this command is encoded as.
    pub const fn raw(self) -> u8 {
        match self {
            Command::Ping => 0x00,
            Command::Ack => 0x01,
            Command::Nack => 0x02,
            Command::FirmwareInfo => 0x04,
            Command::DeviceState => 0x05,
            Command::ProductInfo => 0x08,
            Command::ParamRead => 0x0B,
            Command::ParamWrite => 0x0C,
            Command::SetLed => 0x12,
            Command::Reset => 0xF0,
            Command::Vendor(raw) => raw,
        }
    }
}

/// A decoded protocol frame.
///
/// `target` and `source` are the session-scoped endpoint addresses; a reply
/// is correlated to its request by [`Packet::is_reply_to`]. Filler bytes
/// are not part of `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub target: u16,
    pub source: u16,
    pub msn: u8,
    pub cmd: Command,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Construct a packet; fails if the payload exceeds [`MAX_PAYLOAD`].
    pub fn new(
        target: u16,
        source: u16,
        msn: u8,
        cmd: Command,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(VelodromeError::Encode {
                details: format!("payload is {} bytes (max {MAX_PAYLOAD})", payload.len()),
            });
        }
        Ok(Self { target, source, msn, cmd, payload })
    }

    /// Encode into a fixed-size wire frame, zero-padding the remainder.
    pub fn encode(&self) -> Result<RawFrame> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(VelodromeError::Encode {
                details: format!("payload is {} bytes (max {MAX_PAYLOAD})", self.payload.len()),
            });
        }

        let mut frame = [0u8; FRAME_LEN];
        frame[0..2].copy_from_slice(&self.target.to_le_bytes());
        frame[2..4].copy_from_slice(&self.source.to_le_bytes());
        frame[4] = self.msn;
        frame[5] = self.cmd.raw();
        frame[6] = self.payload.len() as u8;
        frame[HEADER_LEN..HEADER_LEN + self.payload.len()].copy_from_slice(&self.payload);
        Ok(frame)
    }

    /// Decode a frame from raw bytes.
    ///
    /// Accepts any buffer of at least [`HEADER_LEN`] bytes whose declared
    /// payload length fits inside it; trailing filler is ignored. Never
    /// panics on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(VelodromeError::decode(
                "frame header",
                format!("got {} bytes, need at least {HEADER_LEN}", bytes.len()),
            ));
        }

        let target = u16::from_le_bytes([bytes[0], bytes[1]]);
        let source = u16::from_le_bytes([bytes[2], bytes[3]]);
        let msn = bytes[4];
        let cmd = Command::from_raw(bytes[5]);
        let plen = bytes[6] as usize;

        if plen > MAX_PAYLOAD {
            return Err(VelodromeError::decode(
                "frame payload",
                format!("declared payload length {plen} exceeds max {MAX_PAYLOAD}"),
            ));
        }
        let payload = bytes
            .get(HEADER_LEN..HEADER_LEN + plen)
            .ok_or_else(|| {
                VelodromeError::decode(
                    "frame payload",
                    format!(
                        "declared payload length {plen} runs past buffer of {} bytes",
                        bytes.len()
                    ),
                )
            })?
            .to_vec();

        Ok(Self { target, source, msn, cmd, payload })
    }

    /// Whether this frame is the reply to `request`.
    ///
    /// A reply swaps the address pair and carries the request's msn:
    /// `reply.target == request.source`, `reply.source == request.target`,
    /// `reply.msn == request.msn`. All three must hold.
    pub fn is_reply_to(&self, request: &Packet) -> bool {
        self.target == request.source && self.source == request.target && self.msn == request.msn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(target: u16, source: u16, msn: u8, cmd: Command, payload: &[u8]) -> Packet {
        Packet::new(target, source, msn, cmd, payload.to_vec()).unwrap()
    }

    #[test]
    fn encode_produces_fixed_size_zero_padded_frame() {
        let p = packet(0x0200, 0xFD72, 7, Command::ParamRead, &[0x10]);
        let frame = p.encode().unwrap();
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[0..2], &[0x00, 0x02]);
        assert_eq!(&frame[2..4], &[0x72, 0xFD]);
        assert_eq!(frame[4], 7);
        assert_eq!(frame[5], 0x0B);
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], 0x10);
        assert!(frame[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let err = Packet::new(1, 2, 0, Command::Ping, vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, VelodromeError::Encode { .. }));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = Packet::decode(&[0u8; HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, VelodromeError::Decode { .. }));
    }

    #[test]
    fn decode_rejects_payload_running_past_buffer() {
        let mut bytes = vec![0u8; HEADER_LEN + 2];
        bytes[6] = 10; // claims 10 payload bytes, only 2 present
        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(err, VelodromeError::Decode { .. }));
    }

    #[test]
    fn decode_rejects_absurd_declared_length() {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[6] = (MAX_PAYLOAD + 1) as u8;
        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(err, VelodromeError::Decode { .. }));
    }

    #[test]
    fn decode_ignores_filler() {
        let p = packet(1, 2, 3, Command::Ack, &[]);
        let mut frame = p.encode().unwrap();
        // garbage in the filler region must not affect decoding
        frame[FRAME_LEN - 1] = 0xEE;
        let decoded = Packet::decode(&frame).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn reply_matching_requires_all_three_conditions() {
        let request = packet(0x0002, 0xFD72, 42, Command::ParamRead, &[0x05]);
        let reply = packet(0xFD72, 0x0002, 42, Command::ParamRead, &[1, 2, 3]);
        assert!(reply.is_reply_to(&request));

        let mut wrong = reply.clone();
        wrong.msn = 43;
        assert!(!wrong.is_reply_to(&request));

        let mut wrong = reply.clone();
        wrong.target = 0xBEEF;
        assert!(!wrong.is_reply_to(&request));

        let mut wrong = reply;
        wrong.source = 0xBEEF;
        assert!(!wrong.is_reply_to(&request));
    }

    #[test]
    fn command_roundtrip_covers_vendor_codes() {
        for raw in 0..=u8::MAX {
            assert_eq!(Command::from_raw(raw).raw(), raw);
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip_preserves_all_fields(
            target in any::<u16>(),
            source in any::<u16>(),
            msn in any::<u8>(),
            cmd in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
        ) {
            let p = Packet::new(target, source, msn, Command::from_raw(cmd), payload).unwrap();
            let decoded = Packet::decode(&p.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, p);
        }

        #[test]
        fn prop_decode_never_panics_on_garbage(
            bytes in prop::collection::vec(any::<u8>(), 0..=2 * FRAME_LEN),
        ) {
            // must return a structured result, never panic
            let _ = Packet::decode(&bytes);
        }
    }
}
