//! m17-core: M17 wire formats, codecs and configuration.
//! The services and daemon crates depend on this one.

pub mod callsign;
pub mod config;
pub mod crc;
pub mod frame_type;
pub mod gnss;
pub mod message;
pub mod packet;
pub mod wire;

pub use callsign::{Callsign, CallsignError};
pub use config::M17Config;
pub use frame_type::{FrameType, Version};
pub use packet::{Half, Packet};
pub use wire::WireError;
