//! Stream admission: at most one voice stream, inbound or outbound, is open
//! at any moment.
//!
//! The lock is a single `tokio::sync::Mutex<()>`. Whoever opens a stream
//! holds the returned [`StreamToken`] for the stream's lifetime; dropping it
//! (or calling [`StreamToken::release`]) lets the next stream in.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct StreamAdmission {
    lock: Arc<Mutex<()>>,
}

/// Proof of admission. Not cloneable.
pub struct StreamToken {
    _guard: OwnedMutexGuard<()>,
}

impl StreamAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking attempt to open a stream.
    pub fn try_lock(&self) -> Option<StreamToken> {
        self.lock
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| StreamToken { _guard: guard })
    }

    /// Wait until the current stream closes, then take the slot.
    pub async fn lock(&self) -> StreamToken {
        StreamToken {
            _guard: self.lock.clone().lock_owned().await,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

impl StreamToken {
    pub fn release(self) {}
}

impl std::fmt::Debug for StreamAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdmission")
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl std::fmt::Debug for StreamToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamToken")
    }
}
