//! Wire-frame header codec.
//!
//! The header layout is device-generation-specific, so the transport treats
//! it as a pluggable [`FrameCodec`]. [`Gen1Codec`] pins the first-generation
//! layout: an 8-byte little-endian header carrying length, opcode/id, a
//! magic-tagged flag byte, a channel identifier and a sequence number.

use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::BusError;

/// Command channel identifier.
pub const CHAN_CMD: u8 = 0;
/// Data channel identifier.
pub const CHAN_DATA: u8 = 1;

/// High nibble of the flag byte on every valid frame.
pub const FRAME_MAGIC: u8 = 0xA0;

/// Command sequence numbers wrap modulo this window.
pub const CMD_SEQ_WINDOW: u16 = 32;

/// Data-channel sequence numbers are 12 bits wide.
pub const DATA_SEQ_MASK: u16 = 0x0FFF;

bitflags! {
    /// Low-nibble flags of the frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// The device will not confirm this frame (fire-and-forget).
        const NO_CONFIRM = 0x01;
        /// Set by the device on a completion whose request was rejected.
        const FAILED = 0x02;
    }
}

/// Bus-facing frame header. Field values are stored little-endian so the
/// struct bytes are the wire bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    /// Total frame length including this header.
    pub len: u16,
    /// Opcode for commands, queue id for data.
    pub id: u16,
    /// Magic nibble | [`FrameFlags`].
    pub flags: u8,
    /// [`CHAN_CMD`] or [`CHAN_DATA`].
    pub channel: u8,
    /// Wrapping sequence number.
    pub seq: u16,
}

/// Size of the encoded header.
pub const HDR_LEN: usize = core::mem::size_of::<FrameHeader>();

const _: () = assert!(HDR_LEN == 8);

impl FrameHeader {
    pub fn new(id: u16, flags: FrameFlags, channel: u8, seq: u16) -> Self {
        Self {
            len: 0,
            id,
            flags: flags.bits(),
            channel,
            seq,
        }
    }

    pub fn frame_flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }
}

/// Encoder/decoder for one hardware generation's header layout.
pub trait FrameCodec: Send + Sync {
    /// Serialize `hdr` + `payload` into one outbound frame. The codec fills
    /// in the length field and magic tag.
    fn encode(&self, hdr: &FrameHeader, payload: &[u8]) -> Vec<u8>;

    /// Parse an inbound frame. `raw` may carry trailing bus padding beyond
    /// the declared length.
    fn decode<'a>(&self, raw: &'a [u8]) -> Result<(FrameHeader, &'a [u8]), BusError>;
}

/// First-generation layout: little-endian, magic `0xA` in the flag high
/// nibble, sequence masked per channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gen1Codec;

impl FrameCodec for Gen1Codec {
    fn encode(&self, hdr: &FrameHeader, payload: &[u8]) -> Vec<u8> {
        let total = HDR_LEN + payload.len();
        let seq_mask = if hdr.channel == CHAN_CMD {
            CMD_SEQ_WINDOW - 1
        } else {
            DATA_SEQ_MASK
        };
        let wire = FrameHeader {
            len: (total as u16).to_le(),
            id: hdr.id.to_le(),
            flags: FRAME_MAGIC | (hdr.flags & 0x0F),
            channel: hdr.channel,
            seq: (hdr.seq & seq_mask).to_le(),
        };
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(bytemuck::bytes_of(&wire));
        out.extend_from_slice(payload);
        out
    }

    fn decode<'a>(&self, raw: &'a [u8]) -> Result<(FrameHeader, &'a [u8]), BusError> {
        if raw.len() < HDR_LEN {
            return Err(BusError::Format);
        }
        let wire: FrameHeader = bytemuck::pod_read_unaligned(&raw[..HDR_LEN]);
        if wire.flags & 0xF0 != FRAME_MAGIC {
            return Err(BusError::Format);
        }
        let hdr = FrameHeader {
            len: u16::from_le(wire.len),
            id: u16::from_le(wire.id),
            flags: wire.flags & 0x0F,
            channel: wire.channel,
            seq: u16::from_le(wire.seq),
        };
        let len = hdr.len as usize;
        if len < HDR_LEN || len > raw.len() {
            return Err(BusError::Format);
        }
        Ok((hdr, &raw[HDR_LEN..len]))
    }
}
