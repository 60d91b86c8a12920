//! Line-oriented control surface on stdin.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use m17_core::callsign::Callsign;
use m17_core::packet::Packet;
use m17_core::wire::DEFAULT_PORT;
use m17_services::audio::quick_key_frames;
use m17_services::{GatewayHandle, RouteMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Link(String),
    Unlink,
    Dest(String, u16),
    Route(String),
    Sms(String, String),
    /// Send a quick-key probe to a callsign.
    Key(String),
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl std::str::FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let arg = |usage| {
            if rest.is_empty() {
                Err(ParseError::Usage(usage))
            } else {
                Ok(rest.to_string())
            }
        };
        match word.to_ascii_lowercase().as_str() {
            "link" => arg("link <reflector callsign with module>").map(Command::Link),
            "unlink" => Ok(Command::Unlink),
            "dest" => {
                let mut parts = rest.split_whitespace();
                let usage = ParseError::Usage("dest <address> [port]");
                let addr = parts.next().ok_or(usage.clone())?;
                let port = match parts.next() {
                    Some(p) => p.parse().map_err(|_| usage)?,
                    None => DEFAULT_PORT,
                };
                Ok(Command::Dest(addr.to_string(), port))
            }
            "route" => arg("route <callsign>").map(Command::Route),
            "sms" => {
                let (to, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or(ParseError::Usage("sms <callsign> <text>"))?;
                Ok(Command::Sms(to.to_string(), text.trim().to_string()))
            }
            "key" => arg("key <callsign>").map(Command::Key),
            "status" => Ok(Command::Status),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

pub struct Control {
    gateway: GatewayHandle,
    routes: RouteMap,
    shutdown_tx: broadcast::Sender<()>,
}

impl Control {
    pub fn new(gateway: GatewayHandle, routes: RouteMap, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            gateway,
            routes,
            shutdown_tx,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::debug!("stdin closed");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<Command>() {
                        Ok(Command::Quit) => {
                            let _ = self.shutdown_tx.send(());
                            return Ok(());
                        }
                        Ok(cmd) => {
                            if let Err(e) = self.execute(cmd) {
                                println!("error: {e}");
                            }
                        }
                        Err(e) => println!("{e}"),
                    }
                }
            }
        }
    }

    pub fn execute(&self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Link(reflector) => self.gateway.link(&reflector)?,
            Command::Unlink => self.gateway.unlink()?,
            Command::Dest(addr, port) => {
                let to = self.gateway.set_dest_address(&addr, port)?;
                println!("destination {to}");
            }
            Command::Route(callsign) => {
                let to = self.resolve(&callsign)?;
                self.gateway.set_destination(to)?;
                println!("destination {to} for {callsign}");
            }
            Command::Sms(to, text) => {
                let packet = Packet::sms(&Callsign::new(&to), self.gateway.station(), &text)?;
                self.gateway.send_message(packet)?;
            }
            Command::Key(to) => {
                let frames = quick_key_frames(&Callsign::new(&to), self.gateway.station());
                self.gateway.send_stream(frames)?;
            }
            Command::Status => {
                let status = self.gateway.link_state();
                let reflector = status
                    .reflector
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".into());
                let peer = status
                    .peer
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "station {} {} reflector {reflector} peer {peer} routes {}",
                    self.gateway.station(),
                    status.state,
                    self.routes.len()
                );
            }
            Command::Quit => {}
        }
        Ok(())
    }

    fn resolve(&self, callsign: &str) -> Result<SocketAddr> {
        let cs = Callsign::new(callsign);
        self.routes
            .find(cs.as_str())
            .or_else(|| self.routes.find_base(cs.as_str()))
            .ok_or_else(|| anyhow::anyhow!("no route for {callsign}"))
    }
}
