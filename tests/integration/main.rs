//! M17 integration test harness.
//!
//! Tests drive a real gateway over loopback UDP against a scripted fake
//! reflector, and the audio manager against in-memory codec and sound
//! devices. Timers are shortened so each scenario runs in well under a
//! second.
//!
//!   cargo test --test integration

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use m17_core::callsign::Callsign;
use m17_core::config::M17Config;
use m17_core::packet::{Half, Packet, MAX_PACKET_SIZE};
use m17_core::wire::station_callsign;
use m17_services::audio::codec::{Codec2, CodecFactory, CodecMode};
use m17_services::audio::device::{AudioBackend, AudioInput, AudioOutput};
use m17_services::audio::AudioError;
use m17_services::{GatewayHandle, LogSink, M17Gateway, StreamAdmission};

mod audio;
mod link;
mod stream;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const STATION: &str = "N0CALL";
pub const MODULE: char = 'D';
pub const REFLECTOR: &str = "M17-M17 C";

pub const LINK_TIMEOUT: Duration = Duration::from_millis(300);
pub const PING_WATCHDOG: Duration = Duration::from_millis(400);
pub const STREAM_TIMEOUT: Duration = Duration::from_millis(200);

/// How long a test waits for something that should happen.
pub const PATIENCE: Duration = Duration::from_secs(3);

/// Config with short timers and the destination pointing at `reflector`.
pub fn test_config(reflector: SocketAddr) -> M17Config {
    let mut config = M17Config::default();
    config.station.callsign = STATION.into();
    config.station.module = MODULE;
    config.network.destination = reflector.ip().to_string();
    config.network.destination_port = reflector.port();
    config.network.listen_port = 0;
    let timers = &mut config.network.timers;
    timers.link_timeout_ms = LINK_TIMEOUT.as_millis() as u64;
    timers.ping_watchdog_ms = PING_WATCHDOG.as_millis() as u64;
    timers.stream_timeout_ms = STREAM_TIMEOUT.as_millis() as u64;
    timers.gateway_poll_ms = 10;
    config
}

pub fn station() -> Callsign {
    station_callsign(STATION, MODULE)
}

/// A UDP socket on loopback playing the reflector.
pub struct FakeReflector {
    pub socket: UdpSocket,
}

impl FakeReflector {
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("bind fake reflector")?;
        Ok(Self { socket })
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (n, from) = tokio::time::timeout(PATIENCE, self.socket.recv_from(&mut buf))
            .await
            .context("reflector saw nothing")??;
        buf.truncate(n);
        Ok((buf, from))
    }

    /// Expect nothing for `window`.
    pub async fn quiet_for(&self, window: Duration) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        match tokio::time::timeout(window, self.socket.recv_from(&mut buf)).await {
            Err(_) => Ok(()),
            Ok(r) => {
                let (n, _) = r?;
                bail!("unexpected datagram {:02x?}", &buf[..n])
            }
        }
    }

    pub async fn send(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }
}

/// A running gateway and everything a test needs to poke at it.
pub struct Station {
    pub handle: GatewayHandle,
    pub admission: StreamAdmission,
    pub to_audio: mpsc::UnboundedReceiver<Packet>,
    pub log: mpsc::UnboundedReceiver<String>,
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl Station {
    pub async fn start(config: &M17Config) -> Result<Self> {
        let admission = StreamAdmission::new();
        let (log_sink, log) = LogSink::channel();
        let (tx, to_audio) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let (gateway, handle) =
            M17Gateway::init(config, tx, admission.clone(), log_sink, shutdown.subscribe())?;
        let port = handle.local_addrs()[0].port();
        tokio::spawn(gateway.run());
        Ok(Self {
            handle,
            admission,
            to_audio,
            log,
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            shutdown,
        })
    }

    /// Wait for a log line containing `needle`.
    pub async fn expect_log(&mut self, needle: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + PATIENCE;
        loop {
            let line = tokio::time::timeout_at(deadline, self.log.recv())
                .await
                .with_context(|| format!("no log line containing {needle:?}"))?
                .context("log closed")?;
            if line.contains(needle) {
                return Ok(line);
            }
        }
    }

    pub async fn next_frame(&mut self) -> Result<Packet> {
        tokio::time::timeout(PATIENCE, self.to_audio.recv())
            .await
            .context("no frame reached the audio side")?
            .context("audio channel closed")
    }

    /// Link to [`REFLECTOR`] and answer ACKN. Returns the CONN bytes.
    pub async fn link_up(&mut self, reflector: &FakeReflector) -> Result<Vec<u8>> {
        self.handle.link(REFLECTOR)?;
        let (conn, _) = reflector.recv().await?;
        reflector.send(b"ACKN", self.addr).await?;
        self.expect_log("Linked to").await?;
        Ok(conn)
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// A 3200 stream frame from `src` with silent voice and a valid CRC.
pub fn voice_frame(sid: u16, fn_: u16, src: &str) -> Packet {
    let mut frame = Packet::stream();
    frame.set_stream_id(sid);
    frame.set_destination(&Callsign::new(REFLECTOR));
    frame.set_source(&Callsign::new(src));
    frame.set_frame_type(0x5);
    frame.set_voice(Half::First, &[0x11; 8]);
    frame.set_voice(Half::Second, &[0x22; 8]);
    frame.set_frame_number(fn_);
    frame.calc_crc();
    frame
}

// ── In-memory audio ───────────────────────────────────────────────────────────

/// Codec whose bits are the first sample's high byte repeated; decoding
/// fills the frame with that byte shifted back up.
pub struct FlatCodec(pub CodecMode);

impl Codec2 for FlatCodec {
    fn mode(&self) -> CodecMode {
        self.0
    }

    fn encode(&mut self, pcm: &[i16]) -> [u8; 8] {
        [(pcm[0] >> 8) as u8; 8]
    }

    fn decode(&mut self, bits: &[u8; 8], pcm: &mut [i16]) {
        pcm.fill(i16::from(bits[0]) << 8);
    }
}

pub struct FlatCodecs;

impl CodecFactory for FlatCodecs {
    fn create(&self, mode: CodecMode) -> Box<dyn Codec2> {
        Box::new(FlatCodec(mode))
    }
}

/// Microphone producing a constant level, paced at one period per read.
struct ToneInput {
    level: i16,
    pace: Duration,
}

impl AudioInput for ToneInput {
    fn sample_rate(&self) -> u32 {
        8000
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        std::thread::sleep(self.pace);
        buf.fill(self.level);
        Ok(buf.len())
    }
}

struct CollectOutput {
    out: Arc<Mutex<Vec<i16>>>,
}

impl AudioOutput for CollectOutput {
    fn sample_rate(&self) -> u32 {
        8000
    }

    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError> {
        self.out.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Sound card stand-in: a constant-level microphone and a speaker that
/// keeps everything it is given.
pub struct MemoryBackend {
    pub level: i16,
    pub pace: Duration,
    pub played: Arc<Mutex<Vec<i16>>>,
}

impl MemoryBackend {
    pub fn new(level: i16) -> Arc<Self> {
        Arc::new(Self {
            level,
            pace: Duration::from_millis(2),
            played: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn played(&self) -> Vec<i16> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioBackend for MemoryBackend {
    fn open_input(&self, _name: &str, _rate: u32) -> Result<Box<dyn AudioInput>, AudioError> {
        Ok(Box::new(ToneInput {
            level: self.level,
            pace: self.pace,
        }))
    }

    fn open_output(&self, _name: &str, _rate: u32) -> Result<Box<dyn AudioOutput>, AudioError> {
        Ok(Box::new(CollectOutput {
            out: self.played.clone(),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Two concurrent attempts to open a stream: exactly one wins until the
/// winner lets go.
#[tokio::test]
async fn test_admission_is_exclusive() {
    let admission = StreamAdmission::new();
    let contenders: Vec<_> = (0..2)
        .map(|_| {
            let admission = admission.clone();
            tokio::spawn(async move { admission.try_lock() })
        })
        .collect();
    let mut tokens = Vec::new();
    for c in contenders {
        if let Some(token) = c.await.unwrap() {
            tokens.push(token);
        }
    }
    assert_eq!(tokens.len(), 1);
    assert!(admission.try_lock().is_none());

    tokens.pop().unwrap().release();
    assert!(admission.try_lock().is_some());
}

/// The gateway answers nothing it does not understand.
#[tokio::test]
async fn test_unknown_datagram_is_dropped() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    reflector.send(b"HELLO", st.addr).await?;
    reflector.quiet_for(Duration::from_millis(100)).await?;
    assert!(st.to_audio.try_recv().is_err());
    Ok(())
}
