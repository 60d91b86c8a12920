//! Transmit volume statistics.
//!
//! Reset when a transmission starts, fed every captured frame, and turned
//! into one summary line when it ends.

use m17_core::wire::SAMPLE_RATE;

const CLIP_LEVEL: i32 = 16383;
/// Subtracted so ordinary speech lands near 0 dB.
const AMBIENT_DB: f64 = 25.0;
/// Reported for silence.
const FLOOR_DB: f64 = -99.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeStats {
    pub count: u64,
    /// Sum of squares over every other sample.
    pub ss: f64,
    pub clip: u64,
}

impl VolumeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add(&mut self, samples: &[i16]) {
        for (i, &s) in samples.iter().enumerate() {
            if i % 2 == 0 {
                let v = f64::from(s);
                self.ss += v * v;
            }
            if i32::from(s).abs() > CLIP_LEVEL {
                self.clip += 1;
            }
        }
        self.count += samples.len() as u64;
    }

    pub fn seconds(&self) -> f64 {
        self.count as f64 / f64::from(SAMPLE_RATE)
    }

    /// Approximate level, never below -99 dB. Only half the samples are
    /// squared, hence the 0.5.
    pub fn decibels(&self) -> f64 {
        if self.count == 0 || self.ss <= 0.0 {
            return FLOOR_DB;
        }
        let db = 20.0 * (self.ss / (0.5 * self.count as f64)).sqrt().log10() - AMBIENT_DB;
        db.max(FLOOR_DB)
    }

    pub fn clip_percent(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        100.0 * self.clip as f64 / self.count as f64
    }

    /// `"{title} Time=1.2s Vol=-3dB Clip=0%"`
    pub fn summary(&self, title: &str) -> String {
        format!(
            "{title} Time={:.1}s Vol={:.0}dB Clip={:.0}%",
            self.seconds(),
            self.decibels(),
            self.clip_percent()
        )
    }
}
