//! Sound card seam and rate adaptation.
//!
//! Device access lives behind [`AudioBackend`]; the pipeline opens one
//! input per transmission and one output per playback. When a device does
//! not run at 8 kHz, [`Capture`] and [`Playback`] put a [`Resampler`] between
//! it and the 160-sample frames the codec works on.

use std::time::Duration;

use m17_core::wire::{SAMPLES_PER_FRAME, SAMPLE_RATE};

use super::AudioError;
use crate::resample::{float_to_short, short_to_float, Resampler};

pub trait AudioInput: Send {
    fn sample_rate(&self) -> u32;

    /// Blocking read of roughly one period. Returns the samples read.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;
}

pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    /// Blocking write of roughly one period. Returns the samples written.
    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError>;

    /// Wait for queued samples to play out.
    fn drain(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

pub trait AudioBackend: Send + Sync {
    fn open_input(&self, name: &str, rate: u32) -> Result<Box<dyn AudioInput>, AudioError>;
    fn open_output(&self, name: &str, rate: u32) -> Result<Box<dyn AudioOutput>, AudioError>;
}

/// Device samples per 20 ms at `rate`.
fn period_len(rate: u32) -> usize {
    (rate as usize * SAMPLES_PER_FRAME) / SAMPLE_RATE as usize
}

/// Microphone side: yields 8 kHz frames whatever the device rate is.
pub struct Capture {
    input: Box<dyn AudioInput>,
    /// Pause after a failed read so a dead device does not spin.
    backoff: Duration,
    resampler: Option<Resampler>,
    raw: Vec<i16>,
    staged: Vec<f32>,
    pending: Vec<f32>,
}

impl Capture {
    pub fn new(input: Box<dyn AudioInput>, backoff: Duration) -> Result<Self, AudioError> {
        let rate = input.sample_rate();
        let resampler = if rate == SAMPLE_RATE {
            None
        } else {
            Some(Resampler::between(rate, SAMPLE_RATE)?)
        };
        Ok(Self {
            raw: vec![0; period_len(rate).max(1)],
            input,
            backoff,
            resampler,
            staged: Vec::new(),
            pending: Vec::new(),
        })
    }

    /// Read one 160-sample frame. Short device reads are logged and the
    /// missing samples are silence.
    pub fn read_frame(&mut self, out: &mut [i16; SAMPLES_PER_FRAME]) {
        let Some(resampler) = self.resampler.as_mut() else {
            out.fill(0);
            match self.input.read(out) {
                Ok(n) if n < SAMPLES_PER_FRAME => {
                    tracing::warn!(read = n, "short read from audio input");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "audio input read failed");
                    std::thread::sleep(self.backoff);
                }
            }
            return;
        };

        while self.pending.len() < SAMPLES_PER_FRAME {
            self.raw.fill(0);
            let n = match self.input.read(&mut self.raw) {
                Ok(n) if n > 0 => n.min(self.raw.len()),
                Ok(_) => {
                    tracing::warn!("empty read from audio input");
                    self.raw.len()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "audio input read failed");
                    std::thread::sleep(self.backoff);
                    self.raw.len()
                }
            };
            let start = self.staged.len();
            self.staged.resize(start + n, 0.0);
            short_to_float(&self.raw[..n], &mut self.staged[start..]);

            let mut converted = vec![0.0f32; SAMPLES_PER_FRAME * 2];
            match resampler.process(&self.staged, &mut converted, false) {
                Ok(done) => {
                    self.staged.drain(..done.input_used);
                    self.pending.extend_from_slice(&converted[..done.output_generated]);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resampling failed");
                    self.staged.clear();
                    self.pending.resize(SAMPLES_PER_FRAME, 0.0);
                }
            }
        }

        float_to_short(&self.pending[..SAMPLES_PER_FRAME], out);
        self.pending.drain(..SAMPLES_PER_FRAME);
    }
}

/// Speaker side: accepts 8 kHz frames whatever the device rate is.
pub struct Playback {
    output: Box<dyn AudioOutput>,
    resampler: Option<Resampler>,
    staged: Vec<f32>,
    converted: Vec<f32>,
    pcm: Vec<i16>,
}

impl Playback {
    pub fn new(output: Box<dyn AudioOutput>) -> Result<Self, AudioError> {
        let rate = output.sample_rate();
        let resampler = if rate == SAMPLE_RATE {
            None
        } else {
            Some(Resampler::between(SAMPLE_RATE, rate)?)
        };
        Ok(Self {
            converted: vec![0.0; period_len(rate).max(1) * 2],
            output,
            resampler,
            staged: Vec::new(),
            pcm: Vec::new(),
        })
    }

    pub fn write_frame(&mut self, samples: &[i16], last: bool) {
        let Some(resampler) = self.resampler.as_mut() else {
            write_all(self.output.as_mut(), samples);
            return;
        };

        let start = self.staged.len();
        self.staged.resize(start + samples.len(), 0.0);
        short_to_float(samples, &mut self.staged[start..]);

        loop {
            let done = match resampler.process(&self.staged, &mut self.converted, last) {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(error = %e, "resampling failed");
                    self.staged.clear();
                    return;
                }
            };
            self.staged.drain(..done.input_used);
            if done.output_generated == 0 {
                break;
            }
            self.pcm.resize(done.output_generated, 0);
            float_to_short(&self.converted[..done.output_generated], &mut self.pcm);
            write_all(self.output.as_mut(), &self.pcm);
        }
    }

    pub fn drain(&mut self) {
        if let Err(e) = self.output.drain() {
            tracing::warn!(error = %e, "audio output drain failed");
        }
    }
}

fn write_all(output: &mut dyn AudioOutput, samples: &[i16]) {
    match output.write(samples) {
        Ok(n) if n < samples.len() => {
            tracing::warn!(written = n, expected = samples.len(), "short write to audio output");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "audio output write failed"),
    }
}
