//! M17 reflector link protocol: control datagrams, timing and constants.
//!
//! A reflector link is negotiated with short magic-tagged datagrams that
//! share the UDP port with voice traffic. They are told apart from stream
//! frames and packet-mode datagrams by length first, then by magic:
//!
//!   4 bytes   ACKN, NACK, DISC
//!   10 bytes  PING, PONG, DISC, each followed by a 6-byte callsign code
//!   11 bytes  CONN: callsign code, then the requested module letter
//!   54 bytes  stream frame ("M17 ")
//!   38..=859  packet-mode datagram ("M17P")
//!
//! The link structs are #[repr(C, packed)] with zerocopy derives, like every
//! fixed wire type in this workspace.

use std::time::Duration;

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::callsign::{Callsign, CallsignError};
use crate::packet::{Packet, VOICE_HALF_LEN};

// ── Magic ─────────────────────────────────────────────────────────────────────

pub const CONN: &[u8; 4] = b"CONN";
pub const ACKN: &[u8; 4] = b"ACKN";
pub const NACK: &[u8; 4] = b"NACK";
pub const DISC: &[u8; 4] = b"DISC";
pub const PING: &[u8; 4] = b"PING";
pub const PONG: &[u8; 4] = b"PONG";

pub const SHORT_CONTROL_SIZE: usize = 4;
pub const REF_PACKET_SIZE: usize = 10;
pub const CONN_PACKET_SIZE: usize = 11;

// ── Timing ────────────────────────────────────────────────────────────────────

/// A link request that sees no ACKN/NACK within this window is abandoned.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(5);
/// A linked peer that sends no PING within this window is considered gone.
pub const PING_WATCHDOG: Duration = Duration::from_secs(30);
/// An inbound stream idle this long is closed with a synthesized last frame.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(2);
/// Gateway wake-up granularity.
pub const GATEWAY_POLL: Duration = Duration::from_millis(40);
/// One 160-sample audio frame at 8 kHz.
pub const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Nominal on-air duration of one stream frame, used for duration logging.
pub const STREAM_FRAME_SECS: f32 = 0.04;

pub const DEFAULT_PORT: u16 = 17000;

pub const SAMPLE_RATE: u32 = 8000;
pub const SAMPLES_PER_FRAME: usize = 160;

// ── Silence ───────────────────────────────────────────────────────────────────

/// One Codec2 3200 frame of silence.
pub const SILENT_3200: [u8; VOICE_HALF_LEN] = [0x01, 0x00, 0x09, 0x43, 0x9C, 0xE4, 0x21, 0x08];
/// One Codec2 1600 frame of silence.
pub const SILENT_1600: [u8; VOICE_HALF_LEN] = [0x01, 0x00, 0x04, 0x00, 0x25, 0x75, 0xDD, 0xF2];

// ── Link datagrams ────────────────────────────────────────────────────────────

/// Link request. `cscode` is the requesting station, `module` the module
/// letter wanted on the reflector.
///
/// Wire size: 11 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ConnPacket {
    pub magic: [u8; 4],
    pub cscode: [u8; 6],
    pub module: u8,
}

assert_eq_size!(ConnPacket, [u8; CONN_PACKET_SIZE]);

impl ConnPacket {
    pub fn new(from: &Callsign, module: char) -> Self {
        Self {
            magic: *CONN,
            cscode: from.code_out(),
            module: module_byte(module),
        }
    }

    pub fn callsign(&self) -> Result<Callsign, CallsignError> {
        Callsign::from_bytes(&self.cscode)
    }
}

/// PING, PONG, or a DISC that names its sender.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RefPacket {
    pub magic: [u8; 4],
    pub cscode: [u8; 6],
}

assert_eq_size!(RefPacket, [u8; REF_PACKET_SIZE]);

impl RefPacket {
    pub fn new(magic: &[u8; 4], from: &Callsign) -> Self {
        Self {
            magic: *magic,
            cscode: from.code_out(),
        }
    }

    pub fn callsign(&self) -> Result<Callsign, CallsignError> {
        Callsign::from_bytes(&self.cscode)
    }
}

fn module_byte(module: char) -> u8 {
    if module.is_ascii() {
        module.to_ascii_uppercase() as u8
    } else {
        b' '
    }
}

/// The callsign this station announces on a link: base callsign padded to
/// eight characters, then the local module letter.
pub fn station_callsign(base: &str, module: char) -> Callsign {
    Callsign::with_module(base, module)
}

// ── Classification ────────────────────────────────────────────────────────────

/// A received datagram, sorted by shape.
#[derive(Debug)]
pub enum Inbound {
    Ackn,
    Nack,
    Disc,
    Ping(RefPacket),
    Pong(RefPacket),
    DiscFrom(RefPacket),
    Conn(ConnPacket),
    Stream(Box<Packet>),
    PacketMode(Box<Packet>),
    Unknown,
}

impl Inbound {
    pub fn classify(buf: &[u8]) -> Self {
        match buf.len() {
            SHORT_CONTROL_SIZE => match buf {
                b"ACKN" => Inbound::Ackn,
                b"NACK" => Inbound::Nack,
                b"DISC" => Inbound::Disc,
                _ => Inbound::Unknown,
            },
            REF_PACKET_SIZE => match RefPacket::read_from(buf) {
                Some(p) if &p.magic == PING => Inbound::Ping(p),
                Some(p) if &p.magic == PONG => Inbound::Pong(p),
                Some(p) if &p.magic == DISC => Inbound::DiscFrom(p),
                _ => Inbound::Unknown,
            },
            CONN_PACKET_SIZE => match ConnPacket::read_from(buf) {
                Some(p) if &p.magic == CONN => Inbound::Conn(p),
                _ => Inbound::Unknown,
            },
            _ => match Packet::from_bytes(buf) {
                Ok(p) if p.is_stream() => Inbound::Stream(Box::new(p)),
                Ok(p) => Inbound::PacketMode(Box::new(p)),
                Err(_) => Inbound::Unknown,
            },
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet-mode payload of {0} bytes is below the minimum datagram size")]
    PayloadTooShort(usize),

    #[error("packet-mode payload of {0} bytes does not fit in one datagram")]
    PayloadTooLarge(usize),

    #[error("unrecognized datagram ({0} bytes)")]
    Unrecognized(usize),
}
