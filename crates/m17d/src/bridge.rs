//! Unix-datagram bridges to an external audio front end.
//!
//! Three sockets live under `ipc.bridge_dir`:
//!
//! * `am2m17`: we bind it; every datagram is a frame for the gateway
//!   (stream frame, packet-mode datagram, or a link-control frame);
//! * `m172am`: the front end binds it; we send it every frame the gateway
//!   relays towards audio;
//! * `log_input`: the front end binds it; we send it operator log lines.
//!
//! A missing peer socket is not an error: datagrams are dropped until the
//! front end comes up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::UnixDatagram;
use tokio::sync::{broadcast, mpsc};

use m17_core::packet::{Packet, MAX_PACKET_SIZE};
use m17_services::audio::meta::{MetaDecoder, MetaEvent};
use m17_services::{GatewayHandle, LogSink};

pub const AM2M17: &str = "am2m17";
pub const M172AM: &str = "m172am";
pub const LOG_INPUT: &str = "log_input";

/// Bind `am2m17`, replacing a stale socket file.
pub fn bind_inbound(dir: &Path) -> Result<UnixDatagram> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(AM2M17);
    if path.exists() {
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    UnixDatagram::bind(&path).with_context(|| format!("bind {}", path.display()))
}

/// am2m17 → gateway.
pub async fn inbound_loop(
    socket: UnixDatagram,
    gateway: GatewayHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            r = socket.recv(&mut buf) => {
                let n = match r {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "am2m17 receive failed");
                        continue;
                    }
                };
                match Packet::from_bytes(&buf[..n]) {
                    Ok(frame) => gateway.send_frame(frame)?,
                    Err(e) => tracing::debug!(
                        error = %e,
                        len = n,
                        bytes = %hex::encode(&buf[..n]),
                        "dropping malformed am2m17 datagram"
                    ),
                }
            }
        }
    }
}

/// Frames the gateway relays towards audio. Watches META for text and
/// position reports and, when the bridges are on, passes each frame to
/// `m172am`.
pub struct AudioRelay {
    frames: mpsc::UnboundedReceiver<Packet>,
    peer: Option<(UnixDatagram, PathBuf)>,
    log: LogSink,
    meta: MetaDecoder,
    sid: u16,
    source: String,
    shutdown: broadcast::Receiver<()>,
}

impl AudioRelay {
    pub fn new(
        frames: mpsc::UnboundedReceiver<Packet>,
        bridge_dir: Option<&Path>,
        log: LogSink,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let peer = match bridge_dir {
            Some(dir) => Some((
                UnixDatagram::unbound().context("m172am socket")?,
                dir.join(M172AM),
            )),
            None => None,
        };
        Ok(Self {
            frames,
            peer,
            log,
            meta: MetaDecoder::new(),
            sid: 0,
            source: String::new(),
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                frame = self.frames.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    self.observe(&frame);
                    if let Some((socket, path)) = &self.peer {
                        if let Err(e) = socket.send_to(frame.as_bytes(), path).await {
                            tracing::trace!(error = %e, "m172am peer not listening");
                        }
                    }
                }
            }
        }
    }

    fn observe(&mut self, frame: &Packet) {
        if !frame.is_stream() {
            return;
        }
        if frame.stream_id() != self.sid {
            self.sid = frame.stream_id();
            self.source = frame.source().map(|c| c.to_string()).unwrap_or_default();
            self.meta.reset();
        }
        match self.meta.push(frame) {
            Some(MetaEvent::Text(text)) => {
                self.log.send(format!("Text from {}: {text}", self.source))
            }
            Some(MetaEvent::Gnss(report)) => {
                self.log.send(format!("Position from {}: {report}", self.source))
            }
            None => {}
        }
        if frame.is_last_packet() {
            self.sid = 0;
        }
    }
}

/// Operator log lines → `log_input`.
pub async fn log_loop(
    mut lines: mpsc::UnboundedReceiver<String>,
    bridge_dir: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = UnixDatagram::unbound().context("log_input socket")?;
    let path = bridge_dir.join(LOG_INPUT);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            line = lines.recv() => {
                let Some(line) = line else { return Ok(()) };
                if let Err(e) = socket.send_to(line.as_bytes(), &path).await {
                    tracing::trace!(error = %e, "log_input peer not listening");
                }
            }
        }
    }
}
