//! Frames handed between pipeline stages.

use m17_core::packet::VOICE_HALF_LEN;
use m17_core::wire::SAMPLES_PER_FRAME;

/// 20 ms of 8 kHz mono PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: [i16; SAMPLES_PER_FRAME],
    /// Set on the final frame of a transmission or stream.
    pub last: bool,
}

impl AudioFrame {
    pub fn new(samples: [i16; SAMPLES_PER_FRAME], last: bool) -> Self {
        Self { samples, last }
    }

    pub fn silence(last: bool) -> Self {
        Self::new([0; SAMPLES_PER_FRAME], last)
    }

    /// Copy up to 160 samples from `pcm`; the rest stays zero.
    pub fn from_slice(pcm: &[i16], last: bool) -> Self {
        let mut samples = [0i16; SAMPLES_PER_FRAME];
        let n = pcm.len().min(SAMPLES_PER_FRAME);
        samples[..n].copy_from_slice(&pcm[..n]);
        Self { samples, last }
    }
}

/// One codec2 frame: 20 ms of speech at 3200 b/s, 40 ms at 1600 b/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec2Frame {
    pub data: [u8; VOICE_HALF_LEN],
    pub last: bool,
}

impl Codec2Frame {
    pub fn new(data: [u8; VOICE_HALF_LEN], last: bool) -> Self {
        Self { data, last }
    }

    /// Copy a voice half out of a stream frame.
    pub fn from_voice(voice: &[u8], last: bool) -> Self {
        let mut data = [0u8; VOICE_HALF_LEN];
        let n = voice.len().min(VOICE_HALF_LEN);
        data[..n].copy_from_slice(&voice[..n]);
        Self { data, last }
    }
}
