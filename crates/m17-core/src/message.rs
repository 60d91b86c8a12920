//! Text messages carried in META, split over up to four 14-byte blocks.
//!
//! Block layout: one control byte, then 13 characters. The control byte's
//! high nybble is the mask of blocks in the message (0x1, 0x3, 0x7, 0xF);
//! the low nybble has the bit of this block's index. A receiver ORs the
//! control bytes together and has the whole message once both nybbles agree.

use crate::packet::META_LEN;

pub const CHARS_PER_BLOCK: usize = 13;
pub const MAX_BLOCKS: usize = 4;
pub const MAX_MESSAGE_LEN: usize = CHARS_PER_BLOCK * MAX_BLOCKS;

pub type MetaBlock = [u8; META_LEN];

/// Split `msg` into META blocks. Text past 52 characters is dropped.
///
/// Blocks carry ASCII only; any other character is sent as `'?'`.
pub fn make_blocks(msg: &str) -> Vec<MetaBlock> {
    let bytes: Vec<u8> = msg
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    let size = bytes.len();
    let mut count = size / CHARS_PER_BLOCK;
    if count >= MAX_BLOCKS {
        count = MAX_BLOCKS;
    } else if size % CHARS_PER_BLOCK != 0 {
        count += 1;
    }
    if count == 0 {
        return Vec::new();
    }

    let mask: u8 = (1u8 << count) - 1;
    (0..count)
        .map(|i| {
            let mut block = [0u8; META_LEN];
            block[0] = (mask << 4) | (1 << i);
            let start = i * CHARS_PER_BLOCK;
            let end = (start + CHARS_PER_BLOCK).min(size);
            block[1..1 + end - start].copy_from_slice(&bytes[start..end]);
            block
        })
        .collect()
}

/// Reassembles blocks received in any order.
#[derive(Debug, Clone)]
pub struct TextAssembler {
    ctl: u8,
    text: [u8; MAX_MESSAGE_LEN],
}

impl Default for TextAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TextAssembler {
    pub fn new() -> Self {
        Self {
            ctl: 0,
            text: [b' '; MAX_MESSAGE_LEN],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one META block. Returns the trimmed message once every block
    /// named by the mask has arrived. A malformed control byte resets the
    /// assembler.
    pub fn push(&mut self, block: &[u8]) -> Option<String> {
        let control = *block.first()?;
        if control == 0 || block.len() < 1 + CHARS_PER_BLOCK {
            return None;
        }
        if !matches!(control >> 4, 0x1 | 0x3 | 0x7 | 0xF) {
            self.reset();
            return None;
        }
        let index = match control & 0xF {
            0x1 => 0,
            0x2 => 1,
            0x4 => 2,
            0x8 => 3,
            _ => {
                self.reset();
                return None;
            }
        };

        let dst = &mut self.text[index * CHARS_PER_BLOCK..(index + 1) * CHARS_PER_BLOCK];
        for (to, &from) in dst.iter_mut().zip(&block[1..1 + CHARS_PER_BLOCK]) {
            *to = if from.is_ascii_graphic() { from } else { b' ' };
        }
        self.ctl |= control;

        if self.ctl & 0xF == self.ctl >> 4 {
            let message = String::from_utf8_lossy(&self.text).trim().to_string();
            self.reset();
            Some(message)
        } else {
            None
        }
    }
}
