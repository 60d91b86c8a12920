//! Base-40 callsign codec.
//!
//! A callsign of up to nine characters packs into a 48-bit integer, sent
//! big-endian in six bytes. Two ranges are reserved: the all-ones code is
//! the broadcast address "@ALL", and codes from 40^9 upwards carry a
//! leading `#` for reflector and repeater pseudo-callsigns.

use std::fmt;

pub const ALPHABET: &[u8; 40] = b" ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-/.";

/// Broadcast destination.
pub const BROADCAST_CODE: u64 = 0xFFFF_FFFF_FFFF;
pub const BROADCAST_TEXT: &str = "@ALL";

/// First code of the `#` range (40^9).
pub const HASH_BASE: u64 = 0xEE6B_2800_0000;

/// Largest code that decodes to a callsign.
pub const MAX_VALID_CODE: u64 = 0xF461_08FF_FFFF;

/// Position of the module letter in a reflector-style callsign.
pub const MODULE_INDEX: usize = 8;

const MAX_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallsignError {
    #[error("callsign code 0x{0:012x} is outside the encodable range")]
    InvalidCode(u64),

    #[error("callsign field must be 6 bytes, got {0}")]
    BadLength(usize),
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Callsign {
    text: String,
    code: u64,
}

impl Callsign {
    /// Encode `text`. Lower case is folded to upper case; characters outside
    /// the alphabet become spaces.
    pub fn new(text: &str) -> Self {
        if text == BROADCAST_TEXT {
            return Self {
                text: BROADCAST_TEXT.to_string(),
                code: BROADCAST_CODE,
            };
        }

        let upper = text.to_ascii_uppercase();
        let (prefix, body, limit) = match upper.strip_prefix('#') {
            Some(rest) => ("#", rest, MAX_LEN - 1),
            None => ("", upper.as_str(), MAX_LEN),
        };

        let indices: Vec<u8> = body.chars().take(limit).map(alphabet_index).collect();
        let mut code = indices
            .iter()
            .rev()
            .fold(0u64, |acc, &idx| acc * 40 + u64::from(idx));
        if !prefix.is_empty() {
            code += HASH_BASE;
        }

        let mut canonical: String = prefix.to_string();
        canonical.extend(indices.iter().map(|&i| ALPHABET[i as usize] as char));
        let trimmed_len = canonical.trim_end_matches(' ').len();
        canonical.truncate(trimmed_len);

        Self {
            text: canonical,
            code,
        }
    }

    /// Decode a 48-bit code.
    pub fn from_code(code: u64) -> Result<Self, CallsignError> {
        if code == BROADCAST_CODE {
            return Ok(Self {
                text: BROADCAST_TEXT.to_string(),
                code,
            });
        }
        if code > MAX_VALID_CODE {
            return Err(CallsignError::InvalidCode(code));
        }

        let (mut text, mut rest) = if code >= HASH_BASE {
            (String::from("#"), code - HASH_BASE)
        } else {
            (String::new(), code)
        };
        while rest > 0 {
            text.push(ALPHABET[(rest % 40) as usize] as char);
            rest /= 40;
        }
        let trimmed_len = text.trim_end_matches(' ').len();
        text.truncate(trimmed_len);

        Ok(Self { text, code })
    }

    /// Decode the 6-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CallsignError> {
        let field: [u8; 6] = bytes
            .try_into()
            .map_err(|_| CallsignError::BadLength(bytes.len()))?;
        Self::from_code(code_from_bytes(&field))
    }

    /// Six bytes, big-endian.
    pub fn code_out(&self) -> [u8; 6] {
        let be = self.code.to_be_bytes();
        let mut out = [0u8; 6];
        out.copy_from_slice(&be[2..]);
        out
    }

    pub fn code(&self) -> u64 {
        self.code
    }

    /// Canonical text with trailing spaces removed.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_broadcast(&self) -> bool {
        self.code == BROADCAST_CODE
    }

    /// Text padded with spaces (or truncated) to exactly `len` characters.
    pub fn padded(&self, len: usize) -> String {
        let mut s: String = self.text.chars().take(len).collect();
        while s.len() < len {
            s.push(' ');
        }
        s
    }

    /// The callsign without its module letter, trailing spaces removed.
    pub fn base(&self) -> String {
        self.padded(MODULE_INDEX).trim_end().to_string()
    }

    /// The module letter, or a space when there is none.
    pub fn module(&self) -> char {
        self.text.chars().nth(MODULE_INDEX).unwrap_or(' ')
    }

    /// Replace the module letter and re-encode.
    pub fn set_module(&mut self, module: char) {
        let mut text = self.padded(MODULE_INDEX);
        text.push(module);
        *self = Self::new(&text);
    }

    /// Build "BASE    M" from a base callsign and a module letter.
    pub fn with_module(base: &str, module: char) -> Self {
        let mut cs = Self::new(base);
        cs.set_module(module);
        cs
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({:?}, 0x{:012x})", self.text, self.code)
    }
}

pub fn code_from_bytes(bytes: &[u8; 6]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn alphabet_index(c: char) -> u8 {
    if !c.is_ascii() {
        return 0;
    }
    ALPHABET
        .iter()
        .position(|&a| a == c as u8)
        .map(|p| p as u8)
        .unwrap_or(0)
}
