//! Route map: callsign → base callsign → reflector or peer address.
//!
//! Several callsigns can share one base ("N7TAE/P" and "N7TAE.1" both route
//! via "N7TAE"); updating any of them moves the shared base address. The
//! base is the text before the first of `' '`, `'.'` or `'/'`, and must be at
//! least three characters long.
//!
//! Persisted as `callsign=address` lines; `#` starts a comment line.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use m17_core::wire::DEFAULT_PORT;

const MIN_BASE_LEN: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("callsign {0:?} has a base shorter than three characters")]
    ShortBase(String),
    #[error("{0:?} is not an IP address")]
    BadAddress(String),
    #[error("route file {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

/// Shared between the daemon's control surface and whoever resolves
/// destinations. Cloning shares the same maps.
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    cs2base: Arc<DashMap<String, String>>,
    bases: Arc<DashMap<String, SocketAddr>>,
}

/// The part of `callsign` that routes share, or None when it is too short.
pub fn base_of(callsign: &str) -> Option<&str> {
    let end = callsign
        .find(|c: char| matches!(c, ' ' | '.' | '/'))
        .unwrap_or(callsign.len());
    (end >= MIN_BASE_LEN).then(|| &callsign[..end])
}

impl RouteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address for a callsign that was explicitly added.
    pub fn find(&self, callsign: &str) -> Option<SocketAddr> {
        let base = self.cs2base.get(callsign)?;
        self.bases.get(base.value()).map(|a| *a)
    }

    /// Address for any callsign whose base is known.
    pub fn find_base(&self, callsign: &str) -> Option<SocketAddr> {
        let base = base_of(callsign)?;
        self.bases.get(base).map(|a| *a)
    }

    /// Add or move a route. The address is an IPv4 or IPv6 literal; the
    /// port is always 17000.
    pub fn update(&self, callsign: &str, address: &str) -> Result<(), RouteError> {
        let base = base_of(callsign).ok_or_else(|| RouteError::ShortBase(callsign.to_string()))?;
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| RouteError::BadAddress(address.to_string()))?;

        let base = self
            .cs2base
            .entry(callsign.to_string())
            .or_insert_with(|| base.to_string())
            .clone();
        self.bases.insert(base, SocketAddr::new(ip, DEFAULT_PORT));
        Ok(())
    }

    /// Callsigns, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cs2base.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Forget a callsign. Its base address stays for other callsigns.
    pub fn erase(&self, callsign: &str) {
        self.cs2base.remove(callsign);
    }

    pub fn len(&self) -> usize {
        self.cs2base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cs2base.is_empty()
    }

    /// Merge routes from a file. A missing file is not an error; bad lines
    /// are skipped with a warning. Returns the number of routes read.
    pub fn load(&self, path: &Path) -> Result<usize, RouteError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(RouteError::Io(path.to_path_buf(), e)),
        };

        let mut count = 0;
        for line in text.lines() {
            let Some((key, rest)) = line.split_once('=') else {
                continue;
            };
            if key.is_empty() || key.starts_with('#') {
                continue;
            }
            let Some(value) = rest.split_whitespace().next() else {
                continue;
            };
            match self.update(key, value) {
                Ok(()) => count += 1,
                Err(e) => tracing::warn!(error = %e, line, "skipping route"),
            }
        }
        Ok(count)
    }

    pub fn save(&self, path: &Path) -> Result<(), RouteError> {
        let mut text = String::new();
        for cs in self.keys() {
            if let Some(addr) = self.find(&cs) {
                text.push_str(&format!("{cs}={}\n", addr.ip()));
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RouteError::Io(path.to_path_buf(), e))?;
        }
        std::fs::write(path, text).map_err(|e| RouteError::Io(path.to_path_buf(), e))
    }
}
