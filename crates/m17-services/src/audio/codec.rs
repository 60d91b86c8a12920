//! Codec seam.
//!
//! codec2 itself lives outside this crate. The pipeline only needs a
//! fixed-size encode/decode pair per mode, created fresh for each stream.

use m17_core::frame_type::Payload;
use m17_core::packet::VOICE_HALF_LEN;
use m17_core::wire::{SAMPLES_PER_FRAME, SILENT_1600, SILENT_3200};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecMode {
    /// 8 bytes per 20 ms; two frames per stream frame.
    Mode3200,
    /// 8 bytes per 40 ms; one frame per stream frame, second half is data.
    Mode1600,
}

impl CodecMode {
    /// Voice-only streams use 3200, voice+data streams use 1600.
    pub fn for_voice_only(voice_only: bool) -> Self {
        if voice_only {
            Self::Mode3200
        } else {
            Self::Mode1600
        }
    }

    /// Mode implied by a stream's TYPE payload field. Data-only and
    /// packet payloads carry no speech.
    pub fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::C2_3200 => Some(Self::Mode3200),
            Payload::C2_1600 => Some(Self::Mode1600),
            Payload::DataOnly | Payload::Packet => None,
        }
    }

    pub fn payload(self) -> Payload {
        match self {
            Self::Mode3200 => Payload::C2_3200,
            Self::Mode1600 => Payload::C2_1600,
        }
    }

    /// PCM samples consumed by one encode, produced by one decode.
    pub fn samples_per_codec_frame(self) -> usize {
        match self {
            Self::Mode3200 => SAMPLES_PER_FRAME,
            Self::Mode1600 => 2 * SAMPLES_PER_FRAME,
        }
    }

    /// Pre-encoded quiet frame for this rate.
    pub fn silence(self) -> [u8; VOICE_HALF_LEN] {
        match self {
            Self::Mode3200 => SILENT_3200,
            Self::Mode1600 => SILENT_1600,
        }
    }
}

/// One codec instance. Stateful; not shared between streams.
pub trait Codec2: Send {
    fn mode(&self) -> CodecMode;

    /// `pcm` holds exactly [`CodecMode::samples_per_codec_frame`] samples.
    fn encode(&mut self, pcm: &[i16]) -> [u8; VOICE_HALF_LEN];

    /// Fills `pcm` with [`CodecMode::samples_per_codec_frame`] samples.
    fn decode(&mut self, bits: &[u8; VOICE_HALF_LEN], pcm: &mut [i16]);
}

pub trait CodecFactory: Send + Sync {
    fn create(&self, mode: CodecMode) -> Box<dyn Codec2>;
}
