//! M17 stream frames and packet-mode datagrams over one fixed buffer.
//!
//! Stream frame, 54 bytes:
//!   "M17 "(0..4) SID(4..6) DST(6..12) SRC(12..18) TYPE(18..20)
//!   META(20..34) FN(34..36) VOICE(36..52) CRC(52..54)
//!
//! Packet-mode datagram, 38..=859 bytes:
//!   "M17P"(0..4) DST(4..10) SRC(10..16) TYPE(16..18) META(18..32)
//!   LSF_CRC(32..34) PAYLOAD(34..size-2) PAYLOAD_CRC(size-2..size)
//!
//! Multi-byte fields are big-endian. The frame number doubles as the end
//! marker: the last frame of a stream carries bit 15 on top of its
//! sequence value.

use std::fmt;

use crate::callsign::{Callsign, CallsignError};
use crate::crc::crc;
use crate::wire::WireError;

pub const MAGIC_STREAM: &[u8; 4] = b"M17 ";
pub const MAGIC_PACKET: &[u8; 4] = b"M17P";

pub const STREAM_FRAME_SIZE: usize = 54;
pub const MIN_PACKET_SIZE: usize = 38;
pub const MAX_PACKET_SIZE: usize = 859;

/// Everything in a packet-mode datagram that is not payload.
const PACKET_OVERHEAD: usize = 36;
pub const MAX_PACKET_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_OVERHEAD;

pub const META_LEN: usize = 14;
pub const VOICE_HALF_LEN: usize = 8;

/// Frame-number bit marking the final frame of a stream.
pub const LAST_FRAME: u16 = 0x8000;
/// Sequence values wrap at this modulus.
pub const FN_MODULUS: u16 = 0x8000;

/// Packet-mode protocol identifier for SMS text.
pub const SMS_PROTOCOL: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    PacketMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    First,
    Second,
}

struct Layout {
    dst: usize,
    src: usize,
    frame_type: usize,
    meta: usize,
}

const STREAM_LAYOUT: Layout = Layout {
    dst: 6,
    src: 12,
    frame_type: 18,
    meta: 20,
};

const PACKET_LAYOUT: Layout = Layout {
    dst: 4,
    src: 10,
    frame_type: 16,
    meta: 18,
};

// stream-only offsets
const SID: usize = 4;
const FN: usize = 34;
const VOICE: usize = 36;
const STREAM_CRC: usize = 52;

// packet-only offsets
const LSF_START: usize = 4;
const LSF_CRC: usize = 32;
const PAYLOAD: usize = 34;

#[derive(Clone)]
pub struct Packet {
    mode: Mode,
    size: usize,
    data: [u8; MAX_PACKET_SIZE],
}

impl Packet {
    /// An empty 54-byte stream frame with its magic stamped.
    pub fn stream() -> Self {
        Self::initialize(Mode::Stream, STREAM_FRAME_SIZE)
    }

    /// An empty packet-mode datagram carrying `payload_len` payload bytes.
    pub fn packet_mode(payload_len: usize) -> Result<Self, WireError> {
        let size = payload_len + PACKET_OVERHEAD;
        if size < MIN_PACKET_SIZE {
            return Err(WireError::PayloadTooShort(payload_len));
        }
        if payload_len > MAX_PACKET_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        Ok(Self::initialize(Mode::PacketMode, size))
    }

    fn initialize(mode: Mode, size: usize) -> Self {
        let mut data = [0u8; MAX_PACKET_SIZE];
        let magic = match mode {
            Mode::Stream => MAGIC_STREAM,
            Mode::PacketMode => MAGIC_PACKET,
        };
        data[..4].copy_from_slice(magic);
        Self { mode, size, data }
    }

    /// Classify a datagram by its length and magic.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        let mode = match buf.get(..4) {
            Some(m) if m == MAGIC_STREAM && buf.len() == STREAM_FRAME_SIZE => Mode::Stream,
            Some(m)
                if m == MAGIC_PACKET
                    && (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&buf.len()) =>
            {
                Mode::PacketMode
            }
            _ => return Err(WireError::Unrecognized(buf.len())),
        };
        let mut packet = Self::initialize(mode, buf.len());
        packet.data[..buf.len()].copy_from_slice(buf);
        Ok(packet)
    }

    /// SMS datagram: protocol byte, UTF-8 text, NUL.
    pub fn sms(dst: &Callsign, src: &Callsign, text: &str) -> Result<Self, WireError> {
        let mut packet = Self::packet_mode(text.len() + 2)?;
        packet.set_destination(dst);
        packet.set_source(src);
        packet.set_frame_type(0);
        let payload = packet.payload_mut();
        payload[0] = SMS_PROTOCOL;
        payload[1..1 + text.len()].copy_from_slice(text.as_bytes());
        payload[1 + text.len()] = 0;
        packet.calc_crc();
        Ok(packet)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_stream(&self) -> bool {
        self.mode == Mode::Stream
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    fn layout(&self) -> &'static Layout {
        match self.mode {
            Mode::Stream => &STREAM_LAYOUT,
            Mode::PacketMode => &PACKET_LAYOUT,
        }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    // ── Addressing ───────────────────────────────────────────────────────────

    pub fn dst_bytes(&self) -> &[u8] {
        let o = self.layout().dst;
        &self.data[o..o + 6]
    }

    pub fn src_bytes(&self) -> &[u8] {
        let o = self.layout().src;
        &self.data[o..o + 6]
    }

    pub fn destination(&self) -> Result<Callsign, CallsignError> {
        Callsign::from_bytes(self.dst_bytes())
    }

    pub fn source(&self) -> Result<Callsign, CallsignError> {
        Callsign::from_bytes(self.src_bytes())
    }

    pub fn set_destination(&mut self, cs: &Callsign) {
        let o = self.layout().dst;
        self.data[o..o + 6].copy_from_slice(&cs.code_out());
    }

    pub fn set_source(&mut self, cs: &Callsign) {
        let o = self.layout().src;
        self.data[o..o + 6].copy_from_slice(&cs.code_out());
    }

    // ── Header fields ────────────────────────────────────────────────────────

    /// Zero for packet-mode datagrams.
    pub fn stream_id(&self) -> u16 {
        match self.mode {
            Mode::Stream => self.read_u16(SID),
            Mode::PacketMode => 0,
        }
    }

    pub fn set_stream_id(&mut self, sid: u16) {
        if self.mode == Mode::Stream {
            self.write_u16(SID, sid);
        }
    }

    pub fn frame_type(&self) -> u16 {
        self.read_u16(self.layout().frame_type)
    }

    pub fn set_frame_type(&mut self, t: u16) {
        self.write_u16(self.layout().frame_type, t);
    }

    pub fn meta(&self) -> &[u8] {
        let o = self.layout().meta;
        &self.data[o..o + META_LEN]
    }

    pub fn set_meta(&mut self, meta: &[u8; META_LEN]) {
        let o = self.layout().meta;
        self.data[o..o + META_LEN].copy_from_slice(meta);
    }

    /// Zero for packet-mode datagrams.
    pub fn frame_number(&self) -> u16 {
        match self.mode {
            Mode::Stream => self.read_u16(FN),
            Mode::PacketMode => 0,
        }
    }

    pub fn set_frame_number(&mut self, fn_: u16) {
        if self.mode == Mode::Stream {
            self.write_u16(FN, fn_);
        }
    }

    pub fn is_last_packet(&self) -> bool {
        self.mode == Mode::Stream && self.frame_number() & LAST_FRAME != 0
    }

    // ── Payload ──────────────────────────────────────────────────────────────

    /// One 8-byte voice half; empty for packet-mode datagrams.
    pub fn voice(&self, half: Half) -> &[u8] {
        match self.mode {
            Mode::Stream => {
                let o = voice_offset(half);
                &self.data[o..o + VOICE_HALF_LEN]
            }
            Mode::PacketMode => &[],
        }
    }

    pub fn set_voice(&mut self, half: Half, bits: &[u8; VOICE_HALF_LEN]) {
        if self.mode == Mode::Stream {
            let o = voice_offset(half);
            self.data[o..o + VOICE_HALF_LEN].copy_from_slice(bits);
        }
    }

    /// Voice bytes for a stream frame, application payload for packet mode.
    pub fn payload(&self) -> &[u8] {
        match self.mode {
            Mode::Stream => &self.data[VOICE..STREAM_CRC],
            Mode::PacketMode => &self.data[PAYLOAD..self.size - 2],
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self.mode {
            Mode::Stream => &mut self.data[VOICE..STREAM_CRC],
            Mode::PacketMode => {
                let end = self.size - 2;
                &mut self.data[PAYLOAD..end]
            }
        }
    }

    /// Text of an SMS datagram, up to its NUL.
    pub fn sms_text(&self) -> Option<String> {
        if self.mode != Mode::PacketMode {
            return None;
        }
        let payload = self.payload();
        if payload.first() != Some(&SMS_PROTOCOL) {
            return None;
        }
        let body = &payload[1..];
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        Some(String::from_utf8_lossy(&body[..end]).into_owned())
    }

    // ── CRC ──────────────────────────────────────────────────────────────────

    /// The stream CRC, or the LSF CRC in packet mode.
    pub fn crc(&self) -> u16 {
        match self.mode {
            Mode::Stream => self.read_u16(STREAM_CRC),
            Mode::PacketMode => self.read_u16(LSF_CRC),
        }
    }

    /// Trailing payload CRC; zero for stream frames.
    pub fn payload_crc(&self) -> u16 {
        match self.mode {
            Mode::Stream => 0,
            Mode::PacketMode => self.read_u16(self.size - 2),
        }
    }

    /// Compute and store every CRC this mode carries.
    pub fn calc_crc(&mut self) {
        match self.mode {
            Mode::Stream => {
                let c = crc(&self.data[..STREAM_CRC]);
                self.write_u16(STREAM_CRC, c);
            }
            Mode::PacketMode => {
                let lsf = crc(&self.data[LSF_START..LSF_CRC]);
                self.write_u16(LSF_CRC, lsf);
                let end = self.size - 2;
                let body = crc(&self.data[PAYLOAD..end]);
                self.write_u16(end, body);
            }
        }
    }

    /// The stream CRC, or the LSF CRC, as it should be.
    pub fn expected_crc(&self) -> u16 {
        match self.mode {
            Mode::Stream => crc(&self.data[..STREAM_CRC]),
            Mode::PacketMode => crc(&self.data[LSF_START..LSF_CRC]),
        }
    }

    pub fn crc_ok(&self) -> bool {
        match self.mode {
            Mode::Stream => self.crc() == self.expected_crc(),
            Mode::PacketMode => {
                self.crc() == self.expected_crc()
                    && self.payload_crc() == crc(&self.data[PAYLOAD..self.size - 2])
            }
        }
    }
}

fn voice_offset(half: Half) -> usize {
    match half {
        Half::First => VOICE,
        Half::Second => VOICE + VOICE_HALF_LEN,
    }
}

/// A fresh non-zero stream id.
pub fn random_stream_id() -> u16 {
    loop {
        let sid: u16 = rand::random();
        if sid != 0 {
            return sid;
        }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("mode", &self.mode)
            .field("size", &self.size)
            .field("sid", &format_args!("0x{:04x}", self.stream_id()))
            .field("fn", &format_args!("0x{:04x}", self.frame_number()))
            .finish()
    }
}
