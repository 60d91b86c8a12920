//! The 16-bit TYPE field, in its two wire layouts.
//!
//! Legacy layout (top nybble always zero):
//!   bit  0      stream (1) / packet (0)
//!   bits 1-2    payload: 1 data only, 2 codec2 3200, 3 codec2 1600
//!   bits 3-4    encryption family: 0 none, 1 scrambler, 2 AES
//!   bits 5-6    subtype: meta kind when unencrypted, key size otherwise
//!   bits 7-10   CAN
//!   bit  11     signed
//!
//! v3 layout (top nybble never zero):
//!   bits 15-12  payload: 1 data only, 2 codec2 3200, 3 codec2 1600, 15 packet
//!   bits 11-9   encryption: 0 none, 1-3 scrambler 8/16/24, 4-6 AES 128/192/256
//!   bit  8      signed
//!   bits 7-4    meta: 0 none, 1 GNSS, 2 extended callsign, 3 text, 15 AES IV
//!   bits 3-0    CAN
//!
//! The encoding that was parsed or last rebuilt is carried in [`Origin`].
//! Field setters rebuild only that encoding; asking for the other version
//! builds it from the decoded fields on the spot.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Legacy,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    DataOnly,
    C2_3200,
    C2_1600,
    Packet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encrypt {
    None,
    Scram8,
    Scram16,
    Scram24,
    Aes128,
    Aes192,
    Aes256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    None,
    Gnss,
    ExtendedCallsign,
    Text,
    AesIv,
}

/// The authoritative raw encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Legacy(u16),
    V3(u16),
}

impl Origin {
    pub fn version(self) -> Version {
        match self {
            Origin::Legacy(_) => Version::Legacy,
            Origin::V3(_) => Version::V3,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Origin::Legacy(t) | Origin::V3(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameType {
    payload: Payload,
    encrypt: Encrypt,
    meta: MetaKind,
    signed: bool,
    can: u8,
    origin: Origin,
}

impl Default for FrameType {
    fn default() -> Self {
        Self::from_raw(0)
    }
}

impl FrameType {
    /// Build from decoded fields in the given layout.
    pub fn new(version: Version, payload: Payload, encrypt: Encrypt, meta: MetaKind) -> Self {
        let mut ft = Self {
            payload,
            encrypt,
            meta,
            signed: false,
            can: 0,
            origin: Origin::Legacy(0),
        };
        ft.origin = ft.build(version);
        ft
    }

    /// Classify and decode a raw TYPE value.
    pub fn from_raw(t: u16) -> Self {
        if t & 0xF000 != 0 {
            Self::decode_v3(t)
        } else {
            Self::decode_legacy(t)
        }
    }

    fn decode_v3(t: u16) -> Self {
        let payload = match t >> 12 {
            1 => Payload::DataOnly,
            3 => Payload::C2_1600,
            15 => Payload::Packet,
            _ => Payload::C2_3200,
        };
        let encrypt = match (t >> 9) & 0x7 {
            1 => Encrypt::Scram8,
            2 => Encrypt::Scram16,
            3 => Encrypt::Scram24,
            4 => Encrypt::Aes128,
            5 => Encrypt::Aes192,
            6 => Encrypt::Aes256,
            _ => Encrypt::None,
        };
        let meta = match (t >> 4) & 0xF {
            1 => MetaKind::Gnss,
            2 => MetaKind::ExtendedCallsign,
            3 => MetaKind::Text,
            15 => MetaKind::AesIv,
            _ => MetaKind::None,
        };
        Self {
            payload,
            encrypt,
            meta,
            signed: t & 0x100 != 0,
            can: (t & 0xF) as u8,
            origin: Origin::V3(t),
        }
    }

    fn decode_legacy(t: u16) -> Self {
        let payload = if t & 1 == 0 {
            Payload::Packet
        } else {
            match (t >> 1) & 0x3 {
                1 => Payload::DataOnly,
                3 => Payload::C2_1600,
                _ => Payload::C2_3200,
            }
        };

        let subtype = (t >> 5) & 0x3;
        let (encrypt, meta) = match (t >> 3) & 0x3 {
            1 => (
                match subtype {
                    1 => Encrypt::Scram16,
                    2 => Encrypt::Scram24,
                    _ => Encrypt::Scram8,
                },
                MetaKind::None,
            ),
            2 => (
                match subtype {
                    1 => Encrypt::Aes192,
                    2 => Encrypt::Aes256,
                    _ => Encrypt::Aes128,
                },
                MetaKind::None,
            ),
            _ => (
                Encrypt::None,
                match subtype {
                    1 => MetaKind::Gnss,
                    2 => MetaKind::ExtendedCallsign,
                    _ => MetaKind::None,
                },
            ),
        };

        Self {
            payload,
            encrypt,
            meta,
            signed: t & 0x800 != 0,
            can: ((t >> 7) & 0xF) as u8,
            origin: Origin::Legacy(t),
        }
    }

    /// Raw TYPE in the requested layout.
    pub fn raw(&self, version: Version) -> u16 {
        if self.origin.version() == version {
            self.origin.raw()
        } else {
            self.build(version).raw()
        }
    }

    /// Raw TYPE in the authoritative layout.
    pub fn origin_raw(&self) -> u16 {
        self.origin.raw()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn version(&self) -> Version {
        self.origin.version()
    }

    pub fn payload(&self) -> Payload {
        self.payload
    }

    pub fn encrypt(&self) -> Encrypt {
        self.encrypt
    }

    pub fn meta(&self) -> MetaKind {
        self.meta
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn can(&self) -> u8 {
        self.can
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
        self.rebuild();
    }

    pub fn set_encrypt(&mut self, encrypt: Encrypt) {
        self.encrypt = encrypt;
        self.rebuild();
    }

    pub fn set_meta(&mut self, meta: MetaKind) {
        self.meta = meta;
        self.rebuild();
    }

    pub fn set_signed(&mut self, signed: bool) {
        self.signed = signed;
        self.rebuild();
    }

    /// Only the low four bits are kept.
    pub fn set_can(&mut self, can: u8) {
        self.can = can & 0xF;
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.origin = self.build(self.origin.version());
    }

    fn build(&self, version: Version) -> Origin {
        match version {
            Version::Legacy => Origin::Legacy(self.build_legacy()),
            Version::V3 => Origin::V3(self.build_v3()),
        }
    }

    fn build_legacy(&self) -> u16 {
        let mut t: u16 = match self.payload {
            Payload::Packet => 0,
            Payload::DataOnly => 0x3,
            Payload::C2_3200 => 0x5,
            Payload::C2_1600 => 0x7,
        };
        t |= match self.encrypt {
            Encrypt::None => 0,
            Encrypt::Scram8 => 0x08,
            Encrypt::Scram16 => 0x28,
            Encrypt::Scram24 => 0x48,
            Encrypt::Aes128 => 0x10,
            Encrypt::Aes192 => 0x30,
            Encrypt::Aes256 => 0x50,
        };
        // the subtype bits belong to the key size once encryption is on
        if self.encrypt == Encrypt::None {
            t |= match self.meta {
                MetaKind::Gnss => 0x20,
                MetaKind::ExtendedCallsign => 0x40,
                _ => 0,
            };
        }
        t |= u16::from(self.can) << 7;
        if self.signed {
            t |= 0x800;
        }
        t
    }

    fn build_v3(&self) -> u16 {
        let payload: u16 = match self.payload {
            Payload::DataOnly => 0x1,
            Payload::C2_3200 => 0x2,
            Payload::C2_1600 => 0x3,
            Payload::Packet => 0xF,
        };
        let encrypt: u16 = match self.encrypt {
            Encrypt::None => 0,
            Encrypt::Scram8 => 1,
            Encrypt::Scram16 => 2,
            Encrypt::Scram24 => 3,
            Encrypt::Aes128 => 4,
            Encrypt::Aes192 => 5,
            Encrypt::Aes256 => 6,
        };
        let meta: u16 = match self.meta {
            MetaKind::None => 0,
            MetaKind::Gnss => 1,
            MetaKind::ExtendedCallsign => 2,
            MetaKind::Text => 3,
            MetaKind::AesIv => 0xF,
        };
        (payload << 12)
            | (encrypt << 9)
            | (u16::from(self.signed) << 8)
            | (meta << 4)
            | u16::from(self.can)
    }
}
