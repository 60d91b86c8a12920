//! META scheduling on transmit and decoding on receive.
//!
//! Every sixth stream frame is a superframe boundary. Boundary 1 (frame 6)
//! carries the GNSS report when one is configured; boundaries 2..=5
//! (frames 12, 18, 24, 30) carry text blocks 1..4. A boundary with nothing
//! to say clears META and sets the TYPE meta field back to none. META is
//! left as is between boundaries.

use m17_core::frame_type::{FrameType, MetaKind, Origin};
use m17_core::gnss::Gnss;
use m17_core::message::{make_blocks, MetaBlock, TextAssembler};
use m17_core::packet::{Packet, META_LEN};

pub const SUPERFRAME: u32 = 6;
const GNSS_SLOT: u32 = 1;
const FIRST_TEXT_SLOT: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct MetaScheduler {
    gnss: Option<Gnss>,
    blocks: Vec<MetaBlock>,
}

impl MetaScheduler {
    pub fn new(gnss: Option<Gnss>, message: &str) -> Self {
        Self {
            gnss: gnss.filter(Gnss::is_valid),
            blocks: make_blocks(message),
        }
    }

    /// META for the frame with sequence `count`, or None when `count` is not
    /// a boundary.
    pub fn at(&self, count: u32) -> Option<(MetaKind, [u8; META_LEN])> {
        if count == 0 || count % SUPERFRAME != 0 {
            return None;
        }
        let slot = count / SUPERFRAME;
        if slot == GNSS_SLOT {
            if let Some(gnss) = &self.gnss {
                return Some((MetaKind::Gnss, *gnss.as_bytes()));
            }
        }
        if slot >= FIRST_TEXT_SLOT {
            if let Some(block) = self.blocks.get((slot - FIRST_TEXT_SLOT) as usize) {
                return Some((MetaKind::Text, *block));
            }
        }
        Some((MetaKind::None, [0; META_LEN]))
    }

    /// Write the boundary content for `count` into `frame`, keeping the TYPE
    /// meta field in step.
    pub fn apply(&self, count: u32, frame: &mut Packet) {
        let Some((kind, meta)) = self.at(count) else {
            return;
        };
        let mut ft = FrameType::from_raw(frame.frame_type());
        ft.set_meta(kind);
        frame.set_frame_type(ft.origin_raw());
        frame.set_meta(&meta);
    }
}

/// What a received META field turned out to hold.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaEvent {
    Text(String),
    Gnss(Gnss),
}

/// Per-stream receive state for META.
#[derive(Debug, Clone, Default)]
pub struct MetaDecoder {
    text: TextAssembler,
    last_text: Option<String>,
    last_gnss: Option<Gnss>,
}

impl MetaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Inspect one stream frame. Repeated reports are only returned once.
    pub fn push(&mut self, frame: &Packet) -> Option<MetaEvent> {
        let ft = FrameType::from_raw(frame.frame_type());
        let meta = frame.meta();
        match ft.meta() {
            MetaKind::Gnss => {
                let gnss = Gnss::from_meta(meta).filter(Gnss::is_valid)?;
                if self.last_gnss == Some(gnss) {
                    return None;
                }
                self.last_gnss = Some(gnss);
                Some(MetaEvent::Gnss(gnss))
            }
            MetaKind::Text => self.push_text(meta),
            // the legacy layout has no text kind
            MetaKind::None if matches!(ft.origin(), Origin::Legacy(_)) && looks_like_text(meta) => {
                self.push_text(meta)
            }
            _ => None,
        }
    }

    fn push_text(&mut self, meta: &[u8]) -> Option<MetaEvent> {
        let text = self.text.push(meta)?;
        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.last_text = Some(text.clone());
        Some(MetaEvent::Text(text))
    }
}

/// A control byte whose block bit lies inside its mask, and the mask is one
/// of 0x1, 0x3, 0x7, 0xF.
fn looks_like_text(meta: &[u8]) -> bool {
    let Some(&ctl) = meta.first() else {
        return false;
    };
    let mask = ctl >> 4;
    let bit = ctl & 0xF;
    matches!(mask, 0x1 | 0x3 | 0x7 | 0xF) && bit.count_ones() == 1 && bit & mask == bit
}
