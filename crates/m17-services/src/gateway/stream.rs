//! The inbound stream currently being relayed to the audio side.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use m17_core::frame_type::{FrameType, Payload};
use m17_core::packet::{Half, Packet, FN_MODULUS, LAST_FRAME};
use m17_core::wire::{SILENT_1600, SILENT_3200, STREAM_FRAME_SECS};

use crate::admission::StreamToken;

#[derive(Debug)]
pub struct CurrentStream {
    /// First frame of the stream, frame number kept current.
    header: Packet,
    from: SocketAddr,
    last_packet: Instant,
    _token: StreamToken,
}

impl CurrentStream {
    pub fn open(header: Packet, from: SocketAddr, token: StreamToken, now: Instant) -> Self {
        Self {
            header,
            from,
            last_packet: now,
            _token: token,
        }
    }

    pub fn sid(&self) -> u16 {
        self.header.stream_id()
    }

    pub fn from(&self) -> SocketAddr {
        self.from
    }

    pub fn header(&self) -> &Packet {
        &self.header
    }

    /// Record a continuation frame.
    pub fn touch(&mut self, frame: &Packet, now: Instant) {
        self.header.set_frame_number(frame.frame_number());
        self.last_packet = now;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_packet) >= timeout
    }

    /// The frame that closes the stream on behalf of a sender that went
    /// quiet: next frame number with the last-frame bit, silent voice for
    /// the stream's codec rate, fresh CRC.
    pub fn terminal_frame(&self) -> Packet {
        let mut frame = self.header.clone();
        let fn_ = (frame.frame_number().wrapping_add(1)) % FN_MODULUS;
        frame.set_frame_number(fn_ | LAST_FRAME);
        match FrameType::from_raw(frame.frame_type()).payload() {
            Payload::C2_3200 => {
                frame.set_voice(Half::First, &SILENT_3200);
                frame.set_voice(Half::Second, &SILENT_3200);
            }
            Payload::C2_1600 => frame.set_voice(Half::First, &SILENT_1600),
            Payload::DataOnly | Payload::Packet => {}
        }
        frame.calc_crc();
        frame
    }
}

/// Seconds of audio up to and including frame number `fn_`.
pub fn stream_duration(fn_: u16) -> f32 {
    STREAM_FRAME_SECS * f32::from(fn_ & !LAST_FRAME)
}
