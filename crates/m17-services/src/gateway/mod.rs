//! M17 gateway: the UDP side of the station.
//!
//! One task owns the sockets, the reflector link and the inbound stream.
//! Each turn of its loop first does housekeeping (linking timer, ping
//! watchdog, stream timeout) and then waits, at most one poll period, for
//! whichever of these is ready:
//!
//! * a datagram on the IPv4 or IPv6 socket,
//! * a frame from the local side (am2m17), which may also be a link or
//!   unlink request encoded in its destination,
//! * a request from a [`GatewayHandle`],
//! * shutdown.
//!
//! Inbound stream frames and packet-mode datagrams go to the audio side
//! (m172am). Only one inbound stream is relayed at a time; it holds the
//! station's [`StreamAdmission`] token while open.

pub mod link;
pub mod stream;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use zerocopy::AsBytes;

use m17_core::callsign::Callsign;
use m17_core::config::{M17Config, TimerConfig};
use m17_core::packet::{Packet, MAX_PACKET_SIZE};
use m17_core::wire::{station_callsign, Inbound};

use crate::admission::{StreamAdmission, StreamToken};
use crate::audio::link_command_frame;
use crate::log_sink::LogSink;

use link::{Control, Link, LinkEvent, LinkState, LinkStatus};
use stream::{stream_duration, CurrentStream};

/// Index of the `'L'` that marks a link request in a local frame's
/// destination.
const LINK_MARK_INDEX: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("no address family enabled")]
    NoSockets,
    #[error("{0:?} is not an IP address")]
    BadAddress(String),
    #[error("{0:?} is not a reflector callsign with a module")]
    BadReflector(String),
    #[error("another stream is in progress")]
    ChannelBusy,
    #[error("gateway has stopped")]
    Closed,
}

/// A frame from the local side. When it carries the stream's token, the
/// token is released once the frame has been sent, so the channel stays
/// closed to inbound streams until the last frame of a local stream is out.
#[derive(Debug)]
pub struct LocalFrame {
    pub frame: Packet,
    pub token: Option<StreamToken>,
}

impl LocalFrame {
    /// The closing frame of a stream, holding its token.
    pub fn closing(frame: Packet, token: StreamToken) -> Self {
        Self {
            frame,
            token: Some(token),
        }
    }
}

impl From<Packet> for LocalFrame {
    fn from(frame: Packet) -> Self {
        Self { frame, token: None }
    }
}

/// Requests that are not frames.
#[derive(Debug)]
pub enum GatewayRequest {
    SetDestination(SocketAddr),
    /// Send a packet-mode datagram, then release the token.
    SendMessage(Packet, StreamToken),
}

/// Cheap handle for everything outside the gateway task.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    local_tx: mpsc::UnboundedSender<LocalFrame>,
    requests: mpsc::UnboundedSender<GatewayRequest>,
    link: watch::Receiver<LinkStatus>,
    admission: StreamAdmission,
    station: Callsign,
    local_addrs: Vec<SocketAddr>,
}

impl GatewayHandle {
    /// Where non-reflector traffic and link requests go.
    pub fn set_dest_address(&self, address: &str, port: u16) -> Result<SocketAddr, GatewayError> {
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| GatewayError::BadAddress(address.to_string()))?;
        let addr = SocketAddr::new(ip, port);
        self.set_destination(addr)?;
        Ok(addr)
    }

    pub fn set_destination(&self, addr: SocketAddr) -> Result<(), GatewayError> {
        self.requests
            .send(GatewayRequest::SetDestination(addr))
            .map_err(|_| GatewayError::Closed)
    }

    pub fn link_state(&self) -> LinkStatus {
        self.link.borrow().clone()
    }

    /// Follow link state changes.
    pub fn subscribe_link(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    pub fn try_lock(&self) -> Option<StreamToken> {
        self.admission.try_lock()
    }

    /// Queue a frame as if it came from the local side.
    pub fn send_frame(&self, frame: impl Into<LocalFrame>) -> Result<(), GatewayError> {
        self.local_tx
            .send(frame.into())
            .map_err(|_| GatewayError::Closed)
    }

    /// Send a complete stream as one burst. The channel is held until its
    /// last frame has gone out.
    pub fn send_stream(&self, frames: Vec<Packet>) -> Result<(), GatewayError> {
        let token = self.admission.try_lock().ok_or(GatewayError::ChannelBusy)?;
        let mut frames = frames.into_iter().peekable();
        while let Some(frame) = frames.next() {
            if frames.peek().is_some() {
                self.send_frame(frame)?;
            } else {
                self.send_frame(LocalFrame::closing(frame, token))?;
                break;
            }
        }
        Ok(())
    }

    /// Link to a reflector module, e.g. `"M17-M17 C"`. The request goes to
    /// the current destination address.
    pub fn link(&self, reflector: &str) -> Result<(), GatewayError> {
        let bad = || GatewayError::BadReflector(reflector.to_string());
        let cs = Callsign::new(reflector);
        if !cs.as_str().starts_with("M17-") || !cs.module().is_ascii_uppercase() {
            return Err(bad());
        }
        let frame = link_command_frame(&format!("M17L{}", cs.padded(9))).map_err(|_| bad())?;
        self.send_frame(frame)
    }

    pub fn unlink(&self) -> Result<(), GatewayError> {
        let frame = link_command_frame("M17U").map_err(|_| GatewayError::Closed)?;
        self.send_frame(frame)
    }

    /// Send a packet-mode datagram. Fails when a stream is in progress.
    pub fn send_message(&self, packet: Packet) -> Result<(), GatewayError> {
        let token = self.admission.try_lock().ok_or(GatewayError::ChannelBusy)?;
        self.requests
            .send(GatewayRequest::SendMessage(packet, token))
            .map_err(|_| GatewayError::Closed)
    }

    /// Our callsign with our module.
    pub fn station(&self) -> &Callsign {
        &self.station
    }

    /// Bound socket addresses (unspecified IP, real port).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }
}

pub struct M17Gateway {
    station: Callsign,
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
    local_rx: mpsc::UnboundedReceiver<LocalFrame>,
    requests: mpsc::UnboundedReceiver<GatewayRequest>,
    to_audio: mpsc::UnboundedSender<Packet>,
    link: Link,
    link_tx: watch::Sender<LinkStatus>,
    stream: Option<CurrentStream>,
    destination: Option<SocketAddr>,
    admission: StreamAdmission,
    log: LogSink,
    timers: TimerConfig,
    shutdown: broadcast::Receiver<()>,
}

impl M17Gateway {
    /// Bind the sockets and build the gateway and its handle. `to_audio`
    /// is the m172am channel.
    pub fn init(
        config: &M17Config,
        to_audio: mpsc::UnboundedSender<Packet>,
        admission: StreamAdmission,
        log: LogSink,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, GatewayHandle), GatewayError> {
        let net = &config.network;
        let v4 = net
            .net_type
            .ipv4()
            .then(|| bind_udp(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), net.listen_port)))
            .transpose()?;
        let v6 = net
            .net_type
            .ipv6()
            .then(|| bind_udp(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), net.listen_port)))
            .transpose()?;
        if v4.is_none() && v6.is_none() {
            return Err(GatewayError::NoSockets);
        }
        let local_addrs: Vec<SocketAddr> = v4
            .iter()
            .chain(v6.iter())
            .filter_map(|s| s.local_addr().ok())
            .collect();

        let destination = match net.destination.trim() {
            "" => None,
            host => match host.parse::<IpAddr>() {
                Ok(ip) => Some(SocketAddr::new(ip, net.destination_port)),
                Err(_) => {
                    tracing::warn!(destination = host, "ignoring destination that is not an IP address");
                    None
                }
            },
        };

        let station = station_callsign(&config.station.callsign, config.station.module);
        let timers = config.network.timers.clone();
        let link = Link::new(timers.link_timeout(), timers.ping_watchdog());
        let (link_tx, link_rx) = watch::channel(link.status());
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (req_tx, requests) = mpsc::unbounded_channel();

        tracing::info!(station = %station, addrs = ?local_addrs, "gateway bound");

        let handle = GatewayHandle {
            local_tx,
            requests: req_tx,
            link: link_rx,
            admission: admission.clone(),
            station: station.clone(),
            local_addrs,
        };
        let gateway = Self {
            station,
            v4,
            v6,
            local_rx,
            requests,
            to_audio,
            link,
            link_tx,
            stream: None,
            destination,
            admission,
            log,
            timers,
            shutdown,
        };
        Ok((gateway, handle))
    }

    /// Run until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf4 = vec![0u8; MAX_PACKET_SIZE];
        let mut buf6 = vec![0u8; MAX_PACKET_SIZE];
        let poll = self.timers.gateway_poll();

        loop {
            self.housekeeping(Instant::now());

            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("gateway shutting down");
                    return Ok(());
                }

                r = recv_from(self.v4.as_ref(), &mut buf4) => match r {
                    Ok((n, from)) => self.on_datagram(&buf4[..n], from).await,
                    Err(e) => tracing::warn!(error = %e, "IPv4 receive failed"),
                },

                r = recv_from(self.v6.as_ref(), &mut buf6) => match r {
                    Ok((n, from)) => self.on_datagram(&buf6[..n], from).await,
                    Err(e) => tracing::warn!(error = %e, "IPv6 receive failed"),
                },

                Some(local) = self.local_rx.recv() => {
                    self.on_local(local.frame).await;
                    if let Some(token) = local.token {
                        tracing::debug!("local stream sent, channel released");
                        token.release();
                    }
                }

                Some(request) = self.requests.recv() => {
                    self.on_request(request).await;
                }

                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    fn housekeeping(&mut self, now: Instant) {
        if let Some(event) = self.link.check(now) {
            self.report(event);
        }

        let timed_out = self
            .stream
            .as_ref()
            .is_some_and(|s| s.is_timed_out(now, self.timers.stream_timeout()));
        if timed_out {
            if let Some(stream) = self.stream.take() {
                let terminal = stream.terminal_frame();
                self.log.send(format!(
                    "Close stream id=0x{:04x}, timed out after {:.2} sec",
                    stream.sid(),
                    stream_duration(terminal.frame_number())
                ));
                self.forward(terminal);
            }
        }
    }

    /// Publish the new link state and log the event.
    fn report(&mut self, event: LinkEvent) {
        let reflector = self
            .link
            .reflector()
            .map(|c| c.to_string())
            .unwrap_or_default();
        let line = match event {
            LinkEvent::Linked => format!("Linked to {reflector}"),
            LinkEvent::Refused => format!("Link request refused from {reflector}"),
            LinkEvent::Disconnected => format!("Unlinked from {reflector}"),
            LinkEvent::LinkTimeout => format!("Link request to {reflector} timed out"),
            LinkEvent::PingTimeout => format!("Unlinked from {reflector}, TIMEOUT..."),
            LinkEvent::Pong(..) | LinkEvent::Ignored => return,
        };
        self.link_tx.send_replace(self.link.status());
        self.log.send(line);
    }

    // ── Network side ─────────────────────────────────────────────────────────

    async fn on_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let control = match Inbound::classify(buf) {
            Inbound::Ackn => Control::Ackn,
            Inbound::Nack => Control::Nack,
            Inbound::Disc | Inbound::DiscFrom(_) => Control::Disc,
            Inbound::Ping(_) => Control::Ping,
            Inbound::Stream(frame) => {
                self.process_frame(*frame, from, now);
                return;
            }
            Inbound::PacketMode(packet) => {
                self.process_packet(*packet, from);
                return;
            }
            Inbound::Pong(_) | Inbound::Conn(_) | Inbound::Unknown => {
                dump("Unknown packet", buf, from);
                return;
            }
        };

        match self.link.on_control(from, control, now) {
            LinkEvent::Pong(to, pong) => self.send_to(to, &pong).await,
            LinkEvent::Ignored => {
                tracing::debug!(%from, ?control, state = %self.link.state(), "unexpected control datagram");
            }
            event => self.report(event),
        }
    }

    fn process_frame(&mut self, frame: Packet, from: SocketAddr, now: Instant) {
        let sid = frame.stream_id();

        if let Some(stream) = self.stream.as_mut() {
            if stream.sid() != sid {
                tracing::debug!(sid, active = stream.sid(), %from, "dropping frame of another stream");
                return;
            }
            stream.touch(&frame, now);
            let last = frame.is_last_packet();
            let fn_ = frame.frame_number();
            self.forward(frame);
            if last {
                self.log.send(format!(
                    "Close stream id=0x{sid:04x}, duration={:.2} sec",
                    stream_duration(fn_)
                ));
                self.stream = None;
            }
            return;
        }

        if !frame.crc_ok() {
            tracing::warn!(
                sid,
                crc = frame.crc(),
                expected = frame.expected_crc(),
                "stream header CRC mismatch"
            );
        }
        if frame.is_last_packet() {
            tracing::debug!(sid, %from, "lone terminal frame");
            self.forward(frame);
            return;
        }
        let Some(token) = self.admission.try_lock() else {
            tracing::debug!(sid, %from, "channel busy, dropping inbound stream");
            return;
        };

        let source = frame
            .source()
            .map(|c| c.to_string())
            .unwrap_or_else(|e| e.to_string());
        self.log
            .send(format!("Open stream id=0x{sid:04x} from {source} at {from}"));
        self.stream = Some(CurrentStream::open(frame.clone(), from, token, now));
        self.forward(frame);
    }

    fn process_packet(&mut self, packet: Packet, from: SocketAddr) {
        if !packet.crc_ok() {
            tracing::warn!(%from, size = packet.size(), "packet-mode CRC mismatch, dropping");
            return;
        }
        if let Some(text) = packet.sms_text() {
            let source = packet
                .source()
                .map(|c| c.to_string())
                .unwrap_or_else(|e| e.to_string());
            self.log.send(format!("SMS from {source}: {text}"));
        }
        self.forward(packet);
    }

    fn forward(&self, packet: Packet) {
        if self.to_audio.send(packet).is_err() {
            tracing::debug!("audio side is gone, frame dropped");
        }
    }

    // ── Local side ───────────────────────────────────────────────────────────

    async fn on_local(&mut self, frame: Packet) {
        let dest = frame.destination().ok();
        if let Some(d) = &dest {
            if d.as_str() == "U" {
                self.unlink().await;
                return;
            }
            if let Some(reflector) = link_target(d) {
                self.link_request(reflector).await;
                return;
            }
        }
        self.route_out(&frame, dest.as_ref()).await;
    }

    async fn link_request(&mut self, reflector: Callsign) {
        if self.link.state() != LinkState::Unlinked {
            tracing::warn!(
                state = %self.link.state(),
                requested = %reflector,
                "already linked or linking; unlink first"
            );
            return;
        }
        let Some(peer) = self.destination else {
            tracing::warn!(requested = %reflector, "no destination address for link request");
            return;
        };
        let conn = self
            .link
            .request(reflector.clone(), peer, &self.station, Instant::now());
        self.send_to(peer, conn.as_bytes()).await;
        tracing::info!(reflector = %reflector, %peer, "link request sent");
        self.link_tx.send_replace(self.link.status());
    }

    async fn unlink(&mut self) {
        let reflector = self.link.reflector().map(|c| c.to_string());
        let Some((peer, disc)) = self.link.unlink(&self.station) else {
            tracing::debug!("unlink requested while unlinked");
            return;
        };
        self.send_to(peer, disc.as_bytes()).await;
        self.link_tx.send_replace(self.link.status());
        self.log
            .send(format!("Unlinked from {}", reflector.unwrap_or_default()));
    }

    /// Frames addressed to a reflector go to the peer only while linked to
    /// that reflector and are dropped otherwise. Everything else goes to the
    /// destination address.
    async fn route_out(&self, packet: &Packet, dest: Option<&Callsign>) {
        let target = match dest {
            Some(d) if d.as_str().starts_with("M17") => {
                if self.link.state() != LinkState::Linked || Some(d) != self.link.reflector() {
                    tracing::debug!(
                        dest = %d,
                        state = %self.link.state(),
                        "not linked to this reflector, dropping outbound frame"
                    );
                    return;
                }
                self.link.peer()
            }
            _ => self.destination,
        };
        match target {
            Some(addr) => self.send_to(addr, packet.as_bytes()).await,
            None => tracing::warn!(
                dest = ?dest.map(|c| c.to_string()),
                "no destination for outbound frame, dropping"
            ),
        }
    }

    async fn on_request(&mut self, request: GatewayRequest) {
        match request {
            GatewayRequest::SetDestination(addr) => {
                tracing::info!(%addr, "destination set");
                self.destination = Some(addr);
            }
            GatewayRequest::SendMessage(packet, token) => {
                let dest = packet.destination().ok();
                self.route_out(&packet, dest.as_ref()).await;
                token.release();
            }
        }
    }

    async fn send_to(&self, addr: SocketAddr, bytes: &[u8]) {
        let socket = match addr {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        let Some(socket) = socket else {
            tracing::warn!(%addr, "no socket for this address family");
            return;
        };
        match socket.send_to(bytes, addr).await {
            Ok(n) if n < bytes.len() => {
                tracing::warn!(%addr, sent = n, expected = bytes.len(), "short send");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, %addr, "send failed"),
        }
    }
}

/// The reflector named by a local link-request destination: `"M17-XXX"`
/// with `'L'` at index 7 and the module after it.
fn link_target(dest: &Callsign) -> Option<Callsign> {
    let text = dest.as_str();
    if !text.starts_with("M17") || text.as_bytes().get(LINK_MARK_INDEX) != Some(&b'L') {
        return None;
    }
    let module = dest.module();
    let base = text.get(..LINK_MARK_INDEX)?;
    Some(Callsign::with_module(base, module))
}

fn dump(title: &str, buf: &[u8], from: SocketAddr) {
    tracing::debug!(%from, len = buf.len(), bytes = %hex::encode(buf), "{title}");
}

async fn recv_from(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, GatewayError> {
    let bind_err = |source| GatewayError::Bind { addr, source };
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    UdpSocket::from_std(socket.into()).map_err(bind_err)
}
