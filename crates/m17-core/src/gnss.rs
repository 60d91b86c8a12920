//! GNSS position report carried in a 14-byte META field.
//!
//! Byte layout:
//!   0      source type (high nybble), station type (low nybble)
//!   1      validity flags 0x80 position, 0x40 altitude, 0x20 velocity,
//!          0x10 radius; bits 3..1 radius exponent; bit 0 bearing bit 8
//!   2      bearing, low 8 bits
//!   3..6   latitude, 24-bit signed, full scale = 90 degrees
//!   6..9   longitude, 24-bit signed, full scale = 180 degrees
//!   9..11  altitude, half metres above -500 m
//!   11..13 speed, 12 bits of half km/h; low nybble of byte 12 is reserved
//!   13     reserved

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::packet::META_LEN;

const FULL_SCALE: f64 = 8_388_607.0;

const VALID_POSITION: u8 = 0x80;
const VALID_ALTITUDE: u8 = 0x40;
const VALID_VELOCITY: u8 = 0x20;
const VALID_RADIUS: u8 = 0x10;

const MIN_ALTITUDE: f64 = -500.0;
const MAX_ALTITUDE: f64 = 31_767.5;
const MAX_SPEED: f64 = 2047.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Client,
    OpenRtx,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationType {
    #[default]
    Fixed,
    Mobile,
    HandHeld,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    /// Degrees, 0..360.
    pub bearing: f64,
    /// km/h.
    pub speed: f64,
}

/// Decoded report. Optional parts are absent when their validity bit is clear.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GnssFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub velocity: Option<Velocity>,
    /// Metres. Encoded as a power of two.
    pub radius: Option<f64>,
}

impl GnssFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            velocity: None,
            radius: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Gnss {
    data: [u8; META_LEN],
}

impl Gnss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a received META field.
    pub fn from_meta(meta: &[u8]) -> Option<Self> {
        let data: [u8; META_LEN] = meta.get(..META_LEN)?.try_into().ok()?;
        Some(Self { data })
    }

    /// Encode `fix`, replacing everything but the source and station types.
    /// A fix at exactly 0,0 is treated as "no position" and leaves the
    /// report invalid.
    pub fn set(&mut self, fix: &GnssFix) {
        let types = self.data[0];
        self.data = [0u8; META_LEN];
        self.data[0] = types;
        if fix.latitude == 0.0 && fix.longitude == 0.0 {
            return;
        }

        let mut flags = VALID_POSITION;
        if fix.altitude.is_some() {
            flags |= VALID_ALTITUDE;
        }
        if fix.velocity.is_some() {
            flags |= VALID_VELOCITY;
        }
        if fix.radius.is_some() {
            flags |= VALID_RADIUS;
        }
        self.data[1] = flags;

        self.set_position(fix.latitude, fix.longitude);
        if let Some(alt) = fix.altitude {
            self.set_altitude(alt);
        }
        if let Some(v) = fix.velocity {
            self.set_bearing(v.bearing);
            self.set_speed(v.speed);
        }
        if let Some(r) = fix.radius {
            self.set_radius(r);
        }
    }

    pub fn set_station_types(&mut self, source: SourceType, station: StationType) {
        let hi = match source {
            SourceType::Client => 0x0,
            SourceType::OpenRtx => 0x1,
            SourceType::Other => 0xF,
        };
        let lo = match station {
            StationType::Fixed => 0x0,
            StationType::Mobile => 0x1,
            StationType::HandHeld => 0x2,
            StationType::Other => 0xF,
        };
        self.data[0] = (hi << 4) | lo;
    }

    pub fn as_bytes(&self) -> &[u8; META_LEN] {
        &self.data
    }

    pub fn is_valid(&self) -> bool {
        self.data[1] & VALID_POSITION != 0
    }

    pub fn source(&self) -> SourceType {
        match self.data[0] >> 4 {
            0 => SourceType::Client,
            1 => SourceType::OpenRtx,
            _ => SourceType::Other,
        }
    }

    pub fn station(&self) -> StationType {
        match self.data[0] & 0xF {
            0 => StationType::Fixed,
            1 => StationType::Mobile,
            2 => StationType::HandHeld,
            _ => StationType::Other,
        }
    }

    /// The decoded report, or `None` when the position is not valid.
    pub fn fix(&self) -> Option<GnssFix> {
        if !self.is_valid() {
            return None;
        }
        let flags = self.data[1];
        let (latitude, longitude) = self.position();
        Some(GnssFix {
            latitude,
            longitude,
            altitude: (flags & VALID_ALTITUDE != 0).then(|| self.altitude()),
            velocity: (flags & VALID_VELOCITY != 0).then(|| Velocity {
                bearing: self.bearing(),
                speed: self.speed(),
            }),
            radius: (flags & VALID_RADIUS != 0).then(|| self.radius()),
        })
    }

    // ── Field decoding ───────────────────────────────────────────────────────

    fn position(&self) -> (f64, f64) {
        let lat = read_i24(&self.data[3..6]);
        let lon = read_i24(&self.data[6..9]);
        (90.0 * f64::from(lat) / FULL_SCALE, 180.0 * f64::from(lon) / FULL_SCALE)
    }

    fn altitude(&self) -> f64 {
        let raw = u16::from_be_bytes([self.data[9], self.data[10]]);
        0.5 * f64::from(raw) + MIN_ALTITUDE
    }

    fn bearing(&self) -> f64 {
        f64::from(u16::from(self.data[1] & 0x1) << 8 | u16::from(self.data[2]))
    }

    fn speed(&self) -> f64 {
        let raw = u16::from(self.data[11]) << 4 | u16::from(self.data[12] >> 4);
        0.5 * f64::from(raw)
    }

    fn radius(&self) -> f64 {
        f64::from(1u32 << ((self.data[1] >> 1) & 0x7))
    }

    // ── Field encoding ───────────────────────────────────────────────────────

    fn set_position(&mut self, lat: f64, lon: f64) {
        let lat = (FULL_SCALE * lat.clamp(-90.0, 90.0) / 90.0).round() as i32;
        let lon = (FULL_SCALE * lon.clamp(-180.0, 180.0) / 180.0).round() as i32;
        self.data[3..6].copy_from_slice(&lat.to_be_bytes()[1..]);
        self.data[6..9].copy_from_slice(&lon.to_be_bytes()[1..]);
    }

    fn set_altitude(&mut self, alt: f64) {
        let a = (2.0 * (alt.clamp(MIN_ALTITUDE, MAX_ALTITUDE) - MIN_ALTITUDE)).round();
        let a = a.min(f64::from(u16::MAX)) as u16;
        self.data[9..11].copy_from_slice(&a.to_be_bytes());
    }

    fn set_bearing(&mut self, bearing: f64) {
        let b = bearing.rem_euclid(360.0) as u16;
        self.data[1] = (self.data[1] & 0xFE) | ((b >> 8) as u8 & 0x1);
        self.data[2] = (b & 0xFF) as u8;
    }

    fn set_speed(&mut self, speed: f64) {
        let s = (2.0 * speed.clamp(0.0, MAX_SPEED)).round() as u16;
        self.data[11] = (s >> 4) as u8;
        self.data[12] = (self.data[12] & 0x0F) | (((s & 0xF) as u8) << 4);
    }

    fn set_radius(&mut self, radius: f64) {
        self.data[1] &= 0xF1;
        if radius <= 1.0 {
            return;
        }
        let r = (radius.log2().ceil() as u8).min(7);
        self.data[1] |= r << 1;
    }
}

fn read_i24(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], 0]) >> 8
}

impl fmt::Debug for Gnss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gnss({})", hex_bytes(&self.data))
    }
}

impl fmt::Display for Gnss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(fix) = self.fix() else {
            return f.write_str("position unavailable");
        };
        write!(f, "lat {:.5} lon {:.5}", fix.latitude, fix.longitude)?;
        if let Some(alt) = fix.altitude {
            write!(f, ", alt {alt:.1} m")?;
        }
        if let Some(v) = fix.velocity {
            write!(f, ", {:.1} km/h toward {:.0} deg", v.speed, v.bearing)?;
        }
        if let Some(r) = fix.radius {
            write!(f, ", radius {r:.0} m")?;
        }
        Ok(())
    }
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}
