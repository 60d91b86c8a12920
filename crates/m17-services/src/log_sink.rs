//! Operator-facing log lines.
//!
//! Each line is stamped `H:MM:SS ` (UTC), mirrored into `tracing` at info
//! level, and forwarded to an attached consumer (the `log_input` bridge in
//! the daemon) when there is one.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct LogSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    /// A sink that only writes to `tracing`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that also forwards stamped lines to the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn send(&self, line: impl AsRef<str>) {
        let line = line.as_ref().trim_end();
        tracing::info!(target: "m17::log", "{line}");
        if let Some(tx) = &self.tx {
            let stamped = format!("{}{line}\n", timestamp(SystemTime::now()));
            // consumer may have gone away
            let _ = tx.send(stamped);
        }
    }
}

fn timestamp(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        % 86_400;
    format!("{}:{:02}:{:02} ", secs / 3600, (secs / 60) % 60, secs % 60)
}
