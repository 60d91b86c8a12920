//! m17-services: the running parts of an M17 station.
//!
//! [`M17Gateway`] owns the UDP side (reflector link, inbound stream relay),
//! [`AudioManager`] the codec and sound card side. They meet over two
//! frame channels and share one [`StreamAdmission`].

pub mod admission;
pub mod audio;
pub mod gateway;
pub mod log_sink;
pub mod resample;
pub mod route_map;

pub use admission::{StreamAdmission, StreamToken};
pub use audio::{AudioEvent, AudioManager, AudioSettings, PttMode};
pub use gateway::{GatewayHandle, LocalFrame, M17Gateway};
pub use log_sink::LogSink;
pub use resample::Resampler;
pub use route_map::RouteMap;
