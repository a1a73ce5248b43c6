// MAVLink v1/v2 framing: streaming decoder with resync, v2 encoder.
// Invariants: a frame is only surfaced after its checksum (including the
// per-message CRC_EXTRA) matches; anything else is consumed and reported.

use thiserror::Error;

use crate::crc;
use crate::dialect;

pub const STX_V1: u8 = 0xFE;
pub const STX_V2: u8 = 0xFD;

const V1_HEADER_LEN: usize = 6;
const V2_HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_SIGNED: u8 = 0x01;

/// Largest possible frame: v2 header + 255 payload + checksum + signature.
pub const MAX_FRAME_LEN: usize = V2_HEADER_LEN + 255 + CHECKSUM_LEN + SIGNATURE_LEN;

/// Identity the encoder stamps on outbound frames (mission-planner style GCS).
pub const GCS_SYSTEM_ID: u8 = 255;
pub const GCS_COMPONENT_ID: u8 = 190;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("bad magic, skipped {skipped} bytes resyncing")]
    BadMagic { skipped: usize },
    #[error("unknown message id {id}")]
    UnknownMessage { id: u32 },
    #[error("crc mismatch on msg {msg_id}: wire {wire:#06x}, computed {computed:#06x}")]
    CrcMismatch { msg_id: u32, wire: u16, computed: u16 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MavVersion {
    V1,
    V2,
}

/// One validated frame, header fields plus the raw (possibly truncated) payload.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub version: MavVersion,
    pub seq: u8,
    pub sysid: u8,
    pub compid: u8,
    pub msg_id: u32,
    pub payload: Vec<u8>,
    pub signed: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DecoderStats {
    pub frames: u64,
    pub errors: u64,
}

/// Streaming decoder. Feed arbitrary chunks, pull frames (or errors) until
/// `None`, which means more bytes are needed.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Result<RawFrame, FramingError>> {
        loop {
            // Resync: drop everything up to the next magic byte.
            let skipped = self
                .buf
                .iter()
                .position(|&b| b == STX_V1 || b == STX_V2)
                .unwrap_or(self.buf.len());
            if skipped > 0 {
                self.buf.drain(..skipped);
                self.stats.errors += 1;
                return Some(Err(FramingError::BadMagic { skipped }));
            }
            if self.buf.is_empty() {
                return None;
            }

            let version = if self.buf[0] == STX_V2 {
                MavVersion::V2
            } else {
                MavVersion::V1
            };
            let header_len = match version {
                MavVersion::V1 => V1_HEADER_LEN,
                MavVersion::V2 => V2_HEADER_LEN,
            };
            if self.buf.len() < header_len {
                return None;
            }

            let payload_len = self.buf[1] as usize;
            let signed =
                version == MavVersion::V2 && self.buf[2] & INCOMPAT_SIGNED != 0;
            let mut total = header_len + payload_len + CHECKSUM_LEN;
            if signed {
                total += SIGNATURE_LEN;
            }
            if self.buf.len() < total {
                return None;
            }

            let frame = self.parse_frame(version, header_len, payload_len, signed);
            self.buf.drain(..total);
            match &frame {
                Ok(_) => self.stats.frames += 1,
                Err(_) => self.stats.errors += 1,
            }
            return Some(frame);
        }
    }

    fn parse_frame(
        &self,
        version: MavVersion,
        header_len: usize,
        payload_len: usize,
        signed: bool,
    ) -> Result<RawFrame, FramingError> {
        let buf = &self.buf;
        let (seq, sysid, compid, msg_id) = match version {
            MavVersion::V1 => (buf[2], buf[3], buf[4], buf[5] as u32),
            MavVersion::V2 => (
                buf[4],
                buf[5],
                buf[6],
                buf[7] as u32 | (buf[8] as u32) << 8 | (buf[9] as u32) << 16,
            ),
        };

        let crc_extra = dialect::crc_extra(msg_id)
            .ok_or(FramingError::UnknownMessage { id: msg_id })?;

        let crc_end = header_len + payload_len;
        let computed = crc::checksum(&buf[1..crc_end], crc_extra);
        let wire = u16::from_le_bytes([buf[crc_end], buf[crc_end + 1]]);
        if wire != computed {
            return Err(FramingError::CrcMismatch {
                msg_id,
                wire,
                computed,
            });
        }

        Ok(RawFrame {
            version,
            seq,
            sysid,
            compid,
            msg_id,
            payload: buf[header_len..crc_end].to_vec(),
            signed,
        })
    }
}

/// v2 encoder with a rolling sequence and a fixed GCS identity.
pub struct FrameEncoder {
    seq: u8,
    sysid: u8,
    compid: u8,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            seq: 0,
            sysid: GCS_SYSTEM_ID,
            compid: GCS_COMPONENT_ID,
        }
    }

    pub fn sequence(&self) -> u8 {
        self.seq
    }

    /// Build a complete v2 frame around `payload`. Fails for message ids
    /// outside the dialect table (no CRC_EXTRA to seal the checksum with).
    pub fn encode(&mut self, msg_id: u32, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
        let crc_extra = dialect::crc_extra(msg_id)
            .ok_or(FramingError::UnknownMessage { id: msg_id })?;
        debug_assert!(payload.len() <= 255);

        let mut out = Vec::with_capacity(V2_HEADER_LEN + payload.len() + CHECKSUM_LEN);
        out.push(STX_V2);
        out.push(payload.len() as u8);
        out.push(0); // incompat_flags
        out.push(0); // compat_flags
        out.push(self.seq);
        out.push(self.sysid);
        out.push(self.compid);
        out.push(msg_id as u8);
        out.push((msg_id >> 8) as u8);
        out.push((msg_id >> 16) as u8);
        out.extend_from_slice(payload);

        let checksum = crc::checksum(&out[1..], crc_extra);
        out.extend_from_slice(&checksum.to_le_bytes());

        self.seq = self.seq.wrapping_add(1);
        Ok(out)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{self, msg};

    fn heartbeat_payload() -> Vec<u8> {
        // custom_mode=4 (GUIDED), type=2, autopilot=3, base_mode=0x81, status=4, version=3
        vec![0x04, 0x00, 0x00, 0x00, 0x02, 0x03, 0x81, 0x04, 0x03]
    }

    #[test]
    fn round_trip_all_dialect_messages() {
        let mut enc = FrameEncoder::new();
        let mut dec = FrameDecoder::new();
        for (msg_id, len) in [
            (msg::HEARTBEAT, 9usize),
            (msg::SYS_STATUS, 31),
            (msg::GPS_RAW_INT, 30),
            (msg::GLOBAL_POSITION_INT, 28),
            (msg::VFR_HUD, 20),
            (msg::SET_MODE, 6),
            (msg::COMMAND_LONG, 33),
            (msg::BATTERY_STATUS, 36),
        ] {
            let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(7)).collect();
            let wire = enc.encode(msg_id, &payload).unwrap();
            dec.feed(&wire);
            let frame = dec.next_frame().unwrap().unwrap();
            assert_eq!(frame.msg_id, msg_id);
            assert_eq!(frame.payload, payload);
            assert_eq!(frame.sysid, GCS_SYSTEM_ID);
            assert_eq!(frame.compid, GCS_COMPONENT_ID);
            assert_eq!(frame.version, MavVersion::V2);
        }
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn sequence_rolls_over() {
        let mut enc = FrameEncoder::new();
        for _ in 0..256 {
            enc.encode(msg::HEARTBEAT, &heartbeat_payload()).unwrap();
        }
        assert_eq!(enc.sequence(), 0);
    }

    #[test]
    fn single_byte_corruption_is_rejected() {
        let mut enc = FrameEncoder::new();
        let wire = enc.encode(msg::HEARTBEAT, &heartbeat_payload()).unwrap();

        // Flip one byte at a time, skipping the magic (that is a resync, not
        // a checksum failure). A flip in the length or flag bytes may leave
        // the decoder starved instead of erroring; it must never yield a frame.
        for i in 1..wire.len() {
            let mut corrupt = wire.clone();
            corrupt[i] ^= 0x01;
            let mut dec = FrameDecoder::new();
            dec.feed(&corrupt);
            match dec.next_frame() {
                Some(Ok(frame)) => panic!("byte {} corruption accepted: {:?}", i, frame),
                Some(Err(_)) | None => {}
            }
        }
    }

    #[test]
    fn crc_catches_system_status_flip() {
        // Well-formed heartbeat, then system_status 4 -> 5 with CRC untouched.
        let mut enc = FrameEncoder::new();
        let mut wire = enc.encode(msg::HEARTBEAT, &heartbeat_payload()).unwrap();
        let status_at = V2_HEADER_LEN + 7;
        assert_eq!(wire[status_at], 4);
        wire[status_at] = 5;

        let mut dec = FrameDecoder::new();
        dec.feed(&wire);
        assert!(matches!(
            dec.next_frame(),
            Some(Err(FramingError::CrcMismatch { msg_id: 0, .. }))
        ));
    }

    #[test]
    fn resync_skips_noise_between_frames() {
        let mut enc = FrameEncoder::new();
        let a = enc.encode(msg::HEARTBEAT, &heartbeat_payload()).unwrap();
        let b = enc.encode(msg::HEARTBEAT, &heartbeat_payload()).unwrap();

        let mut dec = FrameDecoder::new();
        dec.feed(&a);
        dec.feed(&[0x00, 0x13, 0x37, 0x99]);
        dec.feed(&b);

        assert!(matches!(dec.next_frame(), Some(Ok(f)) if f.seq == 0));
        assert!(matches!(
            dec.next_frame(),
            Some(Err(FramingError::BadMagic { skipped: 4 }))
        ));
        assert!(matches!(dec.next_frame(), Some(Ok(f)) if f.seq == 1));
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn incomplete_frame_is_buffered_across_feeds() {
        let mut enc = FrameEncoder::new();
        let wire = enc.encode(msg::GLOBAL_POSITION_INT, &[0u8; 28]).unwrap();

        let mut dec = FrameDecoder::new();
        let (head, tail) = wire.split_at(13);
        dec.feed(head);
        assert!(dec.next_frame().is_none());
        dec.feed(tail);
        assert!(matches!(dec.next_frame(), Some(Ok(_))));
    }

    #[test]
    fn v1_frame_decodes() {
        // Hand-build a v1 heartbeat and verify the decoder takes it.
        let payload = heartbeat_payload();
        let mut wire = vec![STX_V1, payload.len() as u8, 7, 1, 1, msg::HEARTBEAT as u8];
        wire.extend_from_slice(&payload);
        let checksum = crc::checksum(&wire[1..], dialect::crc_extra(msg::HEARTBEAT).unwrap());
        wire.extend_from_slice(&checksum.to_le_bytes());

        let mut dec = FrameDecoder::new();
        dec.feed(&wire);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.version, MavVersion::V1);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.sysid, 1);
        assert_eq!(frame.msg_id, msg::HEARTBEAT);
    }

    #[test]
    fn signed_v2_frame_is_accepted_without_verification() {
        // Same heartbeat with the signed incompat flag and a 13-byte trailer.
        let payload = heartbeat_payload();
        let mut wire = vec![
            STX_V2,
            payload.len() as u8,
            INCOMPAT_SIGNED,
            0,
            9,
            1,
            1,
            msg::HEARTBEAT as u8,
            0,
            0,
        ];
        wire.extend_from_slice(&payload);
        let checksum = crc::checksum(&wire[1..], dialect::crc_extra(msg::HEARTBEAT).unwrap());
        wire.extend_from_slice(&checksum.to_le_bytes());
        wire.extend_from_slice(&[0u8; SIGNATURE_LEN]);

        let mut dec = FrameDecoder::new();
        dec.feed(&wire);
        let frame = dec.next_frame().unwrap().unwrap();
        assert!(frame.signed);
        assert_eq!(frame.payload, payload);
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn unknown_message_id_is_an_error() {
        let payload = [0u8; 4];
        let mut wire = vec![STX_V2, 4, 0, 0, 0, 1, 1, 0xF0, 0xFF, 0x00];
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(&[0xAA, 0xBB]);

        let mut dec = FrameDecoder::new();
        dec.feed(&wire);
        assert!(matches!(
            dec.next_frame(),
            Some(Err(FramingError::UnknownMessage { .. }))
        ));
    }
}
