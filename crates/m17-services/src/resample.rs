//! Band-limited sample-rate conversion.
//!
//! A single-channel windowed-sinc interpolator in the style of
//! libsamplerate's "fastest" converter: the filter table is sampled 128
//! times per zero crossing and read with linear interpolation, filter
//! positions are tracked in 20.12 fixed point, and input is staged in a
//! ring buffer that keeps enough history on both sides of the current
//! sample for the filter to straddle it.
//!
//! Only needed when the sound card cannot run at 8 kHz.

use std::f64::consts::PI;

const SHIFT_BITS: u32 = 12;
const FP_ONE: f64 = (1i32 << SHIFT_BITS) as f64;
const INV_FP_ONE: f64 = 1.0 / FP_ONE;

/// Table entries per zero crossing.
const INDEX_INC: i32 = 128;
/// Table length. Two guard entries follow the usable half length.
const ARRAY_LEN: usize = 2464;
/// Passband edge as a fraction of the lower Nyquist frequency.
const CUTOFF: f64 = 0.83;

pub const MIN_RATIO: f64 = 1.0 / 40.0;
pub const MAX_RATIO: f64 = 40.0;

const MIN_BUFFER_LEN: i32 = 4096;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResampleError {
    #[error("resample ratio {0} is outside 1/40..=40")]
    RatioOutOfRange(f64),
    #[error("internal buffer length {0} out of range")]
    BadLength(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Processed {
    pub input_used: usize,
    pub output_generated: usize,
}

pub struct Resampler {
    coeffs: Vec<f32>,
    coeff_half_len: i32,
    index_inc: i32,

    buffer: Vec<f32>,
    b_len: i32,
    b_current: i32,
    b_end: i32,
    b_real_end: i32,

    in_count: usize,
    in_used: usize,
    out_count: usize,
    out_gen: usize,

    last_position: f64,
    ratio: f64,
}

// ── Fixed point ───────────────────────────────────────────────────────────────

fn lrint(x: f64) -> i32 {
    x.round_ties_even() as i32
}

fn double_to_fp(x: f64) -> i32 {
    lrint(x * FP_ONE)
}

fn int_to_fp(x: i32) -> i32 {
    x << SHIFT_BITS
}

fn fp_to_int(x: i32) -> i32 {
    x >> SHIFT_BITS
}

fn fp_fraction_part(x: i32) -> i32 {
    x & ((1 << SHIFT_BITS) - 1)
}

fn fp_to_double(x: i32) -> f64 {
    f64::from(fp_fraction_part(x)) * INV_FP_ONE
}

fn fmod_one(x: f64) -> f64 {
    x.fract()
}

/// Right half of a Blackman-windowed sinc, `INDEX_INC` entries per zero
/// crossing, scaled for unity gain at DC.
fn sinc_table() -> Vec<f32> {
    let half_len = (ARRAY_LEN - 2) as f64;
    (0..ARRAY_LEN)
        .map(|i| {
            let i = i as f64;
            if i >= half_len {
                return 0.0;
            }
            let t = CUTOFF * i / f64::from(INDEX_INC);
            let sinc = if t == 0.0 { 1.0 } else { (PI * t).sin() / (PI * t) };
            let x = i / half_len;
            let window = 0.42 + 0.5 * (PI * x).cos() + 0.08 * (2.0 * PI * x).cos();
            (CUTOFF * sinc * window) as f32
        })
        .collect()
}

impl Resampler {
    /// A converter producing `ratio` output samples per input sample.
    pub fn new(ratio: f64) -> Result<Self, ResampleError> {
        check_ratio(ratio)?;
        let coeff_half_len = ARRAY_LEN as i32 - 2;
        let index_inc = INDEX_INC;
        let b_len = lrint(2.5 * f64::from(coeff_half_len) / f64::from(index_inc) * 40.0)
            .max(MIN_BUFFER_LEN);

        let mut r = Self {
            coeffs: sinc_table(),
            coeff_half_len,
            index_inc,
            buffer: vec![0.0; b_len as usize + 1],
            b_len,
            b_current: 0,
            b_end: 0,
            b_real_end: -1,
            in_count: 0,
            in_used: 0,
            out_count: 0,
            out_gen: 0,
            last_position: 0.0,
            ratio,
        };
        r.reset();
        Ok(r)
    }

    /// Converter from `from` Hz to `to` Hz.
    pub fn between(from: u32, to: u32) -> Result<Self, ResampleError> {
        Self::new(f64::from(to) / f64::from(from))
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn set_ratio(&mut self, ratio: f64) -> Result<(), ResampleError> {
        check_ratio(ratio)?;
        self.ratio = ratio;
        Ok(())
    }

    /// Forget all buffered input.
    pub fn reset(&mut self) {
        self.b_current = 0;
        self.b_end = 0;
        self.b_real_end = -1;
        self.last_position = 0.0;
        self.buffer.fill(0.0);
    }

    /// Convert as much of `input` into `output` as both allow. Input that
    /// does not fit is left unused and must be offered again. Set
    /// `end_of_input` on the final call to flush the filter tail.
    pub fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        end_of_input: bool,
    ) -> Result<Processed, ResampleError> {
        self.in_count = input.len();
        self.out_count = output.len();
        self.in_used = 0;
        self.out_gen = 0;

        let mut count = f64::from(self.coeff_half_len + 2) / f64::from(self.index_inc);
        if self.ratio < 1.0 {
            count /= self.ratio;
        }
        let half_filter_chan_len = lrint(count) + 1;

        let mut input_index = self.last_position;
        let mut rem = fmod_one(input_index);
        self.b_current = (self.b_current + lrint(input_index - rem)) % self.b_len;
        input_index = rem;

        let terminate = 1.0 / self.ratio + 1e-20;

        while self.out_gen < self.out_count {
            let mut samples_in_hand = (self.b_end - self.b_current + self.b_len) % self.b_len;
            if samples_in_hand <= half_filter_chan_len {
                self.prepare_data(input, end_of_input, half_filter_chan_len)?;
                samples_in_hand = (self.b_end - self.b_current + self.b_len) % self.b_len;
                if samples_in_hand <= half_filter_chan_len {
                    break;
                }
            }

            if self.b_real_end >= 0
                && f64::from(self.b_current) + input_index + terminate > f64::from(self.b_real_end)
            {
                break;
            }

            let float_increment = f64::from(self.index_inc) * self.ratio.min(1.0);
            let increment = double_to_fp(float_increment);
            let start_filter_index = double_to_fp(input_index * float_increment);
            output[self.out_gen] = ((float_increment / f64::from(self.index_inc))
                * self.calc_output_single(increment, start_filter_index))
                as f32;
            self.out_gen += 1;

            input_index += 1.0 / self.ratio;
            rem = fmod_one(input_index);
            self.b_current = (self.b_current + lrint(input_index - rem)) % self.b_len;
            input_index = rem;
        }

        self.last_position = input_index;
        Ok(Processed {
            input_used: self.in_used,
            output_generated: self.out_gen,
        })
    }

    fn sample(&self, index: i32) -> f64 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.buffer.get(i))
            .map_or(0.0, |&s| f64::from(s))
    }

    fn coeff(&self, filter_index: i32) -> f64 {
        let indx = fp_to_int(filter_index) as usize;
        let c0 = f64::from(self.coeffs.get(indx).copied().unwrap_or(0.0));
        let c1 = f64::from(self.coeffs.get(indx + 1).copied().unwrap_or(0.0));
        c0 + fp_to_double(filter_index) * (c1 - c0)
    }

    fn calc_output_single(&self, increment: i32, start_filter_index: i32) -> f64 {
        let max_filter_index = int_to_fp(self.coeff_half_len);

        // left half
        let mut filter_index = start_filter_index;
        let coeff_count = (max_filter_index - filter_index) / increment;
        filter_index += coeff_count * increment;
        let mut data_index = self.b_current - coeff_count;

        let mut left = 0.0;
        loop {
            left += self.coeff(filter_index) * self.sample(data_index);
            filter_index -= increment;
            data_index += 1;
            if filter_index < 0 {
                break;
            }
        }

        // right half
        filter_index = increment - start_filter_index;
        let coeff_count = (max_filter_index - filter_index) / increment;
        filter_index += coeff_count * increment;
        data_index = self.b_current + 1 + coeff_count;

        let mut right = 0.0;
        loop {
            right += self.coeff(filter_index) * self.sample(data_index);
            filter_index -= increment;
            data_index -= 1;
            if filter_index <= 0 {
                break;
            }
        }

        left + right
    }

    fn move_tail_to_front(&mut self, half_filter_chan_len: i32) {
        let len = self.b_end - self.b_current;
        let start = (self.b_current - half_filter_chan_len) as usize;
        let count = (half_filter_chan_len + len) as usize;
        self.buffer.copy_within(start..start + count, 0);
        self.b_current = half_filter_chan_len;
        self.b_end = self.b_current + len;
    }

    fn prepare_data(
        &mut self,
        input: &[f32],
        end_of_input: bool,
        half_filter_chan_len: i32,
    ) -> Result<(), ResampleError> {
        if self.b_real_end >= 0 {
            return Ok(());
        }

        let mut len = if self.b_current == 0 {
            // zeros ahead of the first sample
            self.b_current = half_filter_chan_len;
            self.b_end = half_filter_chan_len;
            self.b_len - 2 * half_filter_chan_len
        } else if self.b_end + half_filter_chan_len + 1 < self.b_len {
            (self.b_len - self.b_current - half_filter_chan_len).max(0)
        } else {
            self.move_tail_to_front(half_filter_chan_len);
            (self.b_len - self.b_current - half_filter_chan_len).max(0)
        };

        let available = i32::try_from(self.in_count - self.in_used).unwrap_or(i32::MAX);
        len = len.min(available);
        if len < 0 || self.b_end + len > self.b_len {
            return Err(ResampleError::BadLength(len));
        }

        let dst = self.b_end as usize;
        let n = len as usize;
        self.buffer[dst..dst + n].copy_from_slice(&input[self.in_used..self.in_used + n]);
        self.b_end += len;
        self.in_used += n;

        if self.in_used == self.in_count
            && self.b_end - self.b_current < 2 * half_filter_chan_len
            && end_of_input
        {
            if self.b_len - self.b_end < half_filter_chan_len + 5 {
                self.move_tail_to_front(half_filter_chan_len);
            }
            self.b_real_end = self.b_end;
            let mut len = half_filter_chan_len + 5;
            if self.b_end + len > self.b_len {
                len = self.b_len - self.b_end;
            }
            let dst = self.b_end as usize;
            self.buffer[dst..dst + len as usize].fill(0.0);
            self.b_end += len;
        }
        Ok(())
    }
}

fn check_ratio(ratio: f64) -> Result<(), ResampleError> {
    if (MIN_RATIO..=MAX_RATIO).contains(&ratio) {
        Ok(())
    } else {
        Err(ResampleError::RatioOutOfRange(ratio))
    }
}

// ── Sample format conversion ──────────────────────────────────────────────────

pub fn short_to_float(input: &[i16], output: &mut [f32]) {
    for (o, &i) in output.iter_mut().zip(input) {
        *o = (f64::from(i) / 32768.0) as f32;
    }
}

pub fn float_to_short(input: &[f32], output: &mut [i16]) {
    for (o, &i) in output.iter_mut().zip(input) {
        let scaled = f64::from(i) * (8.0 * f64::from(0x1000_0000));
        *o = if scaled >= f64::from(i32::MAX) {
            i16::MAX
        } else if scaled <= -8.0 * f64::from(0x1000_0000) {
            i16::MIN
        } else {
            (scaled.round_ties_even() as i64 >> 16) as i16
        };
    }
}
