//! Reflector link state machine.
//!
//! Pure state: callers pass the current `Instant` and the sender address,
//! and do whatever I/O the returned [`LinkEvent`] asks for. Control traffic
//! is only honoured from the address the link request went to.
//!
//! ```text
//!   Unlinked --request--> Linking --ACKN--> Linked
//!      ^                    |  NACK, DISC,     |  DISC, 30 s without PING,
//!      |                    |  5 s timeout     |  local unlink
//!      +--------------------+------------------+
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use m17_core::callsign::Callsign;
use m17_core::wire::{ConnPacket, RefPacket, DISC, PONG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Unlinked,
    Linking,
    Linked,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unlinked => "unlinked",
            Self::Linking => "linking",
            Self::Linked => "linked",
        })
    }
}

/// Read-only snapshot published to the rest of the process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub state: LinkState,
    pub reflector: Option<Callsign>,
    pub peer: Option<SocketAddr>,
}

/// A link-control datagram, already classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ackn,
    Nack,
    Disc,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Linked,
    Refused,
    /// The peer said goodbye.
    Disconnected,
    /// Send this PONG to the peer.
    Pong(SocketAddr, [u8; 10]),
    LinkTimeout,
    PingTimeout,
    /// Wrong state or wrong sender.
    Ignored,
}

#[derive(Debug)]
pub struct Link {
    state: LinkState,
    reflector: Option<Callsign>,
    peer: Option<SocketAddr>,
    from_module: char,
    pong: [u8; 10],
    linking_since: Option<Instant>,
    last_ping: Option<Instant>,
    link_timeout: Duration,
    ping_watchdog: Duration,
}

impl Link {
    pub fn new(link_timeout: Duration, ping_watchdog: Duration) -> Self {
        Self {
            state: LinkState::Unlinked,
            reflector: None,
            peer: None,
            from_module: ' ',
            pong: [0; 10],
            linking_since: None,
            last_ping: None,
            link_timeout,
            ping_watchdog,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn reflector(&self) -> Option<&Callsign> {
        self.reflector.as_ref()
    }

    pub fn from_module(&self) -> char {
        self.from_module
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            reflector: self.reflector.clone(),
            peer: self.peer,
        }
    }

    /// Start linking to `reflector` at `peer`. `station` is our callsign with
    /// our module in the ninth position. Returns the CONN datagram to send;
    /// the matching PONG is prepared at the same time.
    pub fn request(
        &mut self,
        reflector: Callsign,
        peer: SocketAddr,
        station: &Callsign,
        now: Instant,
    ) -> ConnPacket {
        let conn = ConnPacket::new(station, reflector.module());
        self.pong.copy_from_slice(zerocopy::AsBytes::as_bytes(&RefPacket::new(PONG, station)));
        self.from_module = station.module();
        self.reflector = Some(reflector);
        self.peer = Some(peer);
        self.state = LinkState::Linking;
        self.linking_since = Some(now);
        self.last_ping = None;
        conn
    }

    /// Apply a control datagram received from `from`.
    pub fn on_control(&mut self, from: SocketAddr, msg: Control, now: Instant) -> LinkEvent {
        if self.peer != Some(from) {
            return LinkEvent::Ignored;
        }
        match (self.state, msg) {
            (LinkState::Linking, Control::Ackn) => {
                self.state = LinkState::Linked;
                self.linking_since = None;
                self.last_ping = Some(now);
                LinkEvent::Linked
            }
            (LinkState::Linking, Control::Nack) => {
                self.state = LinkState::Unlinked;
                self.linking_since = None;
                LinkEvent::Refused
            }
            (LinkState::Linking | LinkState::Linked, Control::Disc) => {
                self.state = LinkState::Unlinked;
                self.linking_since = None;
                self.last_ping = None;
                LinkEvent::Disconnected
            }
            (LinkState::Linked, Control::Ping) => {
                self.last_ping = Some(now);
                LinkEvent::Pong(from, self.pong)
            }
            _ => LinkEvent::Ignored,
        }
    }

    /// Housekeeping: the linking timer and the ping watchdog.
    pub fn check(&mut self, now: Instant) -> Option<LinkEvent> {
        match self.state {
            LinkState::Linking => {
                let since = self.linking_since?;
                if now.saturating_duration_since(since) < self.link_timeout {
                    return None;
                }
                self.state = LinkState::Unlinked;
                self.linking_since = None;
                Some(LinkEvent::LinkTimeout)
            }
            LinkState::Linked => {
                let since = self.last_ping?;
                if now.saturating_duration_since(since) <= self.ping_watchdog {
                    return None;
                }
                self.state = LinkState::Unlinked;
                self.last_ping = None;
                self.peer = None;
                Some(LinkEvent::PingTimeout)
            }
            LinkState::Unlinked => None,
        }
    }

    /// Local unlink. Returns the DISC to send when there was a peer.
    pub fn unlink(&mut self, station: &Callsign) -> Option<(SocketAddr, RefPacket)> {
        let peer = self.peer?;
        if self.state == LinkState::Unlinked {
            return None;
        }
        self.state = LinkState::Unlinked;
        self.linking_since = None;
        self.last_ping = None;
        Some((peer, RefPacket::new(DISC, station)))
    }
}
