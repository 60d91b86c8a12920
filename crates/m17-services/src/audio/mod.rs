//! Audio manager: microphone → codec2 → stream frames on transmit, stream
//! frames → codec2 → speaker on receive.
//!
//! Each direction is a short chain of blocking stages joined by unbounded
//! channels. A stage owns what it pops and ends after passing on a frame
//! flagged `last`, so a chain always drains once its head stops.
//!
//! Transmit: capture → encode → assemble. Capture samples `hot_mic` once per
//! 20 ms frame; clearing it ends the transmission at the next frame
//! boundary. Receive: the first frame of a stream fixes its id and codec
//! rate and starts decode → play; frames of any other stream are dropped
//! until that one ends.

pub mod codec;
pub mod device;
pub mod frames;
pub mod meta;
pub mod volume;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use m17_core::callsign::Callsign;
use m17_core::config::M17Config;
use m17_core::frame_type::{Encrypt, FrameType, MetaKind, Version};
use m17_core::gnss::Gnss;
use m17_core::packet::{random_stream_id, Half, Packet, FN_MODULUS, LAST_FRAME};
use m17_core::wire::{SAMPLES_PER_FRAME, SILENT_3200};

use crate::admission::{StreamAdmission, StreamToken};
use crate::gateway::LocalFrame;
use crate::log_sink::LogSink;
use crate::resample::ResampleError;

use codec::{CodecFactory, CodecMode};
use device::{AudioBackend, Capture, Playback};
use frames::{AudioFrame, Codec2Frame};
use meta::{MetaDecoder, MetaEvent, MetaScheduler};
use volume::VolumeStats;

/// Pause between the end of an echo recording and its playback.
const ECHO_PAUSE: Duration = Duration::from_millis(200);
/// Audio buffered before the speaker is opened.
const PLAYBACK_PREROLL: Duration = Duration::from_millis(300);
/// Frames in a quick-key probe.
const QUICK_KEY_FRAMES: u16 = 5;
const LINK_COMMAND_LEN: usize = 13;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("audio device: {0}")]
    Device(String),
    #[error("another stream is in progress")]
    ChannelBusy,
    #[error("already transmitting")]
    AlreadyTransmitting,
    #[error("nothing has been recorded")]
    NothingRecorded,
    #[error("bad link command {0:?}")]
    BadLinkCommand(String),
    #[error("gateway channel closed")]
    GatewayClosed,
    #[error(transparent)]
    Resample(#[from] ResampleError),
}

/// What a transmission is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttMode {
    /// Record locally, play back on [`AudioManager::play_echo_data`].
    Echo,
    /// Send to the gateway as an M17 stream.
    M17,
}

/// Notifications for whatever drives the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// A received stream started (`true`) or ended (`false`).
    Receiving(bool),
    Text { source: String, text: String },
    Gnss { source: String, report: Gnss },
    Sms { source: String, text: String },
}

/// The slice of [`M17Config`] the audio side uses.
#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub source: Callsign,
    pub input: String,
    pub output: String,
    pub sample_rate: u32,
    pub voice_only: bool,
    pub version: Version,
    pub text_message: String,
    pub gnss: Option<Gnss>,
    pub frame_period: Duration,
}

impl AudioSettings {
    pub fn from_config(config: &M17Config) -> Self {
        let gnss = config.gnss.fix().map(|fix| {
            let mut g = Gnss::new();
            g.set_station_types(config.gnss.source, config.gnss.station);
            g.set(&fix);
            g
        });
        Self {
            source: Callsign::new(&config.station.callsign),
            input: config.audio.input.clone(),
            output: config.audio.output.clone(),
            sample_rate: config.audio.sample_rate,
            voice_only: config.audio.voice_only,
            version: config.audio.frame_type_version.into(),
            text_message: config.audio.text_message.clone(),
            gnss,
            frame_period: config.network.timers.audio_frame(),
        }
    }
}

struct Transmission {
    ptt: PttMode,
    mode: CodecMode,
    capture: JoinHandle<VolumeStats>,
    stages: Vec<JoinHandle<()>>,
    /// Encoded echo audio.
    echo: Option<mpsc::UnboundedReceiver<Codec2Frame>>,
}

/// A finished echo recording waiting to be played.
struct Recording {
    mode: CodecMode,
    frames: mpsc::UnboundedReceiver<Codec2Frame>,
}

#[derive(Default)]
struct Reception {
    sid: u16,
    source: String,
    codec_tx: Option<mpsc::UnboundedSender<Codec2Frame>>,
    mode: Option<CodecMode>,
    stages: Vec<JoinHandle<()>>,
    player: Option<JoinHandle<VolumeStats>>,
    meta: MetaDecoder,
}

pub struct AudioManager {
    settings: AudioSettings,
    backend: Arc<dyn AudioBackend>,
    codecs: Arc<dyn CodecFactory>,
    admission: StreamAdmission,
    to_gateway: mpsc::UnboundedSender<LocalFrame>,
    events: mpsc::UnboundedSender<AudioEvent>,
    log: LogSink,
    hot_mic: Arc<AtomicBool>,
    transmit: Mutex<Option<Transmission>>,
    recording: Mutex<Option<Recording>>,
    receive: Mutex<Reception>,
}

impl AudioManager {
    /// `to_gateway` is the local frame channel into the gateway (am2m17).
    /// The last frame of each stream carries the stream's token.
    pub fn new(
        settings: AudioSettings,
        backend: Arc<dyn AudioBackend>,
        codecs: Arc<dyn CodecFactory>,
        admission: StreamAdmission,
        to_gateway: mpsc::UnboundedSender<LocalFrame>,
        log: LogSink,
    ) -> (Self, mpsc::UnboundedReceiver<AudioEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            settings,
            backend,
            codecs,
            admission,
            to_gateway,
            events,
            log,
            hot_mic: Arc::new(AtomicBool::new(false)),
            transmit: Mutex::new(None),
            recording: Mutex::new(None),
            receive: Mutex::new(Reception::default()),
        };
        (manager, events_rx)
    }

    pub fn is_transmitting(&self) -> bool {
        self.hot_mic.load(Ordering::SeqCst)
    }

    // ── Transmit ─────────────────────────────────────────────────────────────

    /// Open the microphone and start a transmission to `destination`.
    /// Runs until [`key_off`](Self::key_off) (or, for echo,
    /// [`play_echo_data`](Self::play_echo_data)).
    pub async fn record_mic(&self, ptt: PttMode, destination: &str) -> Result<(), AudioError> {
        let mut transmit = self.transmit.lock().await;
        if transmit.is_some() {
            return Err(AudioError::AlreadyTransmitting);
        }
        let token = match ptt {
            PttMode::M17 => Some(self.admission.try_lock().ok_or(AudioError::ChannelBusy)?),
            PttMode::Echo => None,
        };

        let input = self
            .backend
            .open_input(&self.settings.input, self.settings.sample_rate)?;
        let capture = Capture::new(input, self.settings.frame_period)?;
        let mode = CodecMode::for_voice_only(self.settings.voice_only);

        self.hot_mic.store(true, Ordering::SeqCst);
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (codec_tx, codec_rx) = mpsc::unbounded_channel();

        let hot_mic = self.hot_mic.clone();
        let capture = tokio::task::spawn_blocking(move || capture_stage(capture, hot_mic, audio_tx));
        let codec = self.codecs.create(mode);
        let mut stages = vec![tokio::task::spawn_blocking(move || {
            encode_stage(codec, audio_rx, codec_tx)
        })];

        let echo = match (ptt, token) {
            (PttMode::M17, Some(token)) => {
                let header = self.stream_header(mode, destination);
                let scheduler = MetaScheduler::new(self.settings.gnss, &self.settings.text_message);
                let to_gateway = self.to_gateway.clone();
                stages.push(tokio::task::spawn_blocking(move || {
                    assemble_stage(header, mode, scheduler, codec_rx, to_gateway, token)
                }));
                None
            }
            _ => Some(codec_rx),
        };

        tracing::info!(?ptt, ?mode, destination, "transmission started");
        *transmit = Some(Transmission {
            ptt,
            mode,
            capture,
            stages,
            echo,
        });
        Ok(())
    }

    /// Release push-to-talk and wait for the transmission to drain. An echo
    /// recording is kept for [`play_echo_data`](Self::play_echo_data).
    pub async fn key_off(&self) {
        let Some(tx) = self.transmit.lock().await.take() else {
            return;
        };
        let ptt = tx.ptt;
        let (stats, recording) = self.finish_transmission(tx).await;
        match ptt {
            PttMode::M17 => self.log.send(stats.summary("PTT")),
            PttMode::Echo => {
                self.log.send(stats.summary("Echo"));
                *self.recording.lock().await = recording;
            }
        }
    }

    /// Stop an echo recording, pause, then play it back.
    pub async fn play_echo_data(&self) -> Result<(), AudioError> {
        let active = {
            let mut transmit = self.transmit.lock().await;
            match transmit.take() {
                Some(tx) if tx.ptt == PttMode::M17 => {
                    *transmit = Some(tx);
                    return Err(AudioError::AlreadyTransmitting);
                }
                other => other,
            }
        };
        let recording = match active {
            Some(tx) => {
                let (stats, recording) = self.finish_transmission(tx).await;
                self.log.send(stats.summary("Echo"));
                recording
            }
            None => self.recording.lock().await.take(),
        };
        let Some(recording) = recording else {
            return Err(AudioError::NothingRecorded);
        };

        tokio::time::sleep(ECHO_PAUSE).await;

        let output = self
            .backend
            .open_output(&self.settings.output, self.settings.sample_rate)?;
        let playback = Playback::new(output)?;
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let codec = self.codecs.create(recording.mode);
        let frames = recording.frames;
        let decoder = tokio::task::spawn_blocking(move || decode_stage(codec, frames, audio_tx));
        let player =
            tokio::task::spawn_blocking(move || play_stage(playback, audio_rx, Duration::ZERO));
        join(decoder).await;
        match player.await {
            Ok(stats) => tracing::debug!(seconds = stats.seconds(), "echo played"),
            Err(e) => tracing::error!(error = %e, "playback stage failed"),
        }
        Ok(())
    }

    /// Clear `hot_mic` and join the stages. Returns the capture statistics
    /// and, for echo, what was recorded.
    async fn finish_transmission(&self, tx: Transmission) -> (VolumeStats, Option<Recording>) {
        self.hot_mic.store(false, Ordering::SeqCst);
        let stats = match tx.capture.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "capture stage failed");
                VolumeStats::default()
            }
        };
        for stage in tx.stages {
            join(stage).await;
        }
        tracing::info!(ptt = ?tx.ptt, seconds = stats.seconds(), "transmission ended");
        let recording = tx.echo.map(|frames| Recording {
            mode: tx.mode,
            frames,
        });
        (stats, recording)
    }

    fn stream_header(&self, mode: CodecMode, destination: &str) -> Packet {
        let mut frame = Packet::stream();
        frame.set_stream_id(random_stream_id());
        let ft = FrameType::new(self.settings.version, mode.payload(), Encrypt::None, MetaKind::None);
        frame.set_frame_type(ft.origin_raw());
        frame.set_destination(&Callsign::new(destination));
        frame.set_source(&self.settings.source);
        frame
    }

    /// Send a short burst of silence to `dst` to check the path. The
    /// channel stays held until the gateway has sent the last frame.
    pub async fn quick_key(&self, dst: &str, src: &str) -> Result<(), AudioError> {
        let mut token = Some(self.admission.try_lock().ok_or(AudioError::ChannelBusy)?);
        let frames = quick_key_frames(&Callsign::new(dst), &Callsign::new(src));
        let count = frames.len();
        for (i, frame) in frames.into_iter().enumerate() {
            let token = if i + 1 == count { token.take() } else { None };
            self.to_gateway
                .send(LocalFrame { frame, token })
                .map_err(|_| AudioError::GatewayClosed)?;
        }
        Ok(())
    }

    /// `"M17L"` + nine-character reflector callsign links, `"M17U"` unlinks.
    pub fn link(&self, command: &str) -> Result<(), AudioError> {
        let frame = link_command_frame(command)?;
        self.to_gateway
            .send(frame.into())
            .map_err(|_| AudioError::GatewayClosed)
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    /// Feed one frame from the gateway (m172am).
    pub async fn receive(&self, packet: Packet) {
        if !packet.is_stream() {
            self.receive_packet_mode(&packet);
            return;
        }

        let mut rx = self.receive.lock().await;
        let sid = packet.stream_id();
        let last = packet.is_last_packet();

        if rx.sid == 0 && !last {
            self.open_reception(&mut rx, &packet);
        }
        if sid != rx.sid {
            tracing::debug!(sid, active = rx.sid, "dropping frame of another stream");
            return;
        }

        if let Some(event) = rx.meta.push(&packet) {
            let source = rx.source.clone();
            let _ = self.events.send(match event {
                MetaEvent::Text(text) => AudioEvent::Text { source, text },
                MetaEvent::Gnss(report) => AudioEvent::Gnss { source, report },
            });
        }

        if let (Some(tx), Some(mode)) = (&rx.codec_tx, rx.mode) {
            let first = Codec2Frame::from_voice(packet.voice(Half::First), false);
            match mode {
                CodecMode::Mode3200 => {
                    let _ = tx.send(first);
                    let _ = tx.send(Codec2Frame::from_voice(packet.voice(Half::Second), last));
                }
                CodecMode::Mode1600 => {
                    let _ = tx.send(Codec2Frame { last, ..first });
                }
            }
        }

        if last {
            self.close_reception(&mut rx).await;
        }
    }

    fn open_reception(&self, rx: &mut Reception, packet: &Packet) {
        rx.sid = packet.stream_id();
        rx.source = packet.source().map(|c| c.to_string()).unwrap_or_default();
        rx.meta.reset();
        rx.mode = CodecMode::from_payload(FrameType::from_raw(packet.frame_type()).payload());
        let _ = self.events.send(AudioEvent::Receiving(true));

        let Some(mode) = rx.mode else {
            tracing::debug!(sid = rx.sid, "stream carries no voice");
            return;
        };
        let output = match self
            .backend
            .open_output(&self.settings.output, self.settings.sample_rate)
            .and_then(Playback::new)
        {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "cannot open audio output, stream will not be played");
                return;
            }
        };
        let (codec_tx, codec_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let codec = self.codecs.create(mode);
        rx.stages
            .push(tokio::task::spawn_blocking(move || decode_stage(codec, codec_rx, audio_tx)));
        rx.player = Some(tokio::task::spawn_blocking(move || {
            play_stage(output, audio_rx, PLAYBACK_PREROLL)
        }));
        rx.codec_tx = Some(codec_tx);
    }

    async fn close_reception(&self, rx: &mut Reception) {
        rx.codec_tx = None;
        for stage in rx.stages.drain(..) {
            join(stage).await;
        }
        if let Some(player) = rx.player.take() {
            match player.await {
                Ok(stats) if stats.count > 0 => self.log.send(stats.summary("RX Audio")),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "playback stage failed"),
            }
        }
        rx.sid = 0;
        rx.mode = None;
        let _ = self.events.send(AudioEvent::Receiving(false));
    }

    fn receive_packet_mode(&self, packet: &Packet) {
        let Some(text) = packet.sms_text() else {
            tracing::debug!(size = packet.size(), "ignoring non-SMS packet");
            return;
        };
        let source = packet.source().map(|c| c.to_string()).unwrap_or_default();
        let _ = self.events.send(AudioEvent::Sms { source, text });
    }
}

async fn join(stage: JoinHandle<()>) {
    if let Err(e) = stage.await {
        tracing::error!(error = %e, "audio stage failed");
    }
}

// ── Frame builders ───────────────────────────────────────────────────────────

/// The quick-key probe: five 3200 frames of silence, numbered 0..=3 and then
/// 4 with the last-frame bit.
pub fn quick_key_frames(dst: &Callsign, src: &Callsign) -> Vec<Packet> {
    let mut frame = Packet::stream();
    frame.set_stream_id(random_stream_id());
    frame.set_destination(dst);
    frame.set_source(src);
    frame.set_frame_type(0x5);
    frame.set_voice(Half::First, &SILENT_3200);
    frame.set_voice(Half::Second, &SILENT_3200);

    (0..QUICK_KEY_FRAMES)
        .map(|i| {
            let fn_ = if i + 1 < QUICK_KEY_FRAMES { i } else { i | LAST_FRAME };
            frame.set_frame_number(fn_);
            frame.calc_crc();
            frame.clone()
        })
        .collect()
}

/// Encode a link command as the frame the gateway recognises: the target
/// with `'L'` at index 7 to link, `"U"` to unlink.
pub fn link_command_frame(command: &str) -> Result<Packet, AudioError> {
    let bad = || AudioError::BadLinkCommand(command.to_string());
    let destination = match command.get(..4) {
        Some("M17L") if command.len() == LINK_COMMAND_LEN => {
            let mut target: Vec<char> = command[4..].chars().collect();
            *target.get_mut(7).ok_or_else(bad)? = 'L';
            target.into_iter().collect::<String>()
        }
        Some("M17U") => "U".to_string(),
        _ => return Err(bad()),
    };
    let mut frame = Packet::stream();
    frame.set_destination(&Callsign::new(&destination));
    Ok(frame)
}

// ── Stages ───────────────────────────────────────────────────────────────────

fn capture_stage(
    mut capture: Capture,
    hot_mic: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<AudioFrame>,
) -> VolumeStats {
    let mut stats = VolumeStats::new();
    loop {
        let mut samples = [0i16; SAMPLES_PER_FRAME];
        capture.read_frame(&mut samples);
        stats.add(&samples);
        let keep_running = hot_mic.load(Ordering::SeqCst);
        if tx.send(AudioFrame::new(samples, !keep_running)).is_err() || !keep_running {
            break;
        }
    }
    stats
}

fn encode_stage(
    mut codec: Box<dyn codec::Codec2>,
    mut rx: mpsc::UnboundedReceiver<AudioFrame>,
    tx: mpsc::UnboundedSender<Codec2Frame>,
) {
    let mode = codec.mode();
    let mut odd = false;
    loop {
        let frame = rx.blocking_recv().unwrap_or_else(|| AudioFrame::silence(true));
        let mut last = frame.last;
        match mode {
            CodecMode::Mode3200 => {
                odd = !odd;
                let bits = codec.encode(&frame.samples);
                let _ = tx.send(Codec2Frame::new(bits, !odd && last));
                if odd && last {
                    // stream frames carry two 3200 frames
                    let bits = codec.encode(&[0; SAMPLES_PER_FRAME]);
                    let _ = tx.send(Codec2Frame::new(bits, true));
                }
            }
            CodecMode::Mode1600 => {
                let mut pcm = [0i16; 2 * SAMPLES_PER_FRAME];
                pcm[..SAMPLES_PER_FRAME].copy_from_slice(&frame.samples);
                if !last {
                    let second = rx.blocking_recv().unwrap_or_else(|| AudioFrame::silence(true));
                    pcm[SAMPLES_PER_FRAME..].copy_from_slice(&second.samples);
                    last = second.last;
                }
                let _ = tx.send(Codec2Frame::new(codec.encode(&pcm), last));
            }
        }
        if last {
            break;
        }
    }
}

fn assemble_stage(
    mut frame: Packet,
    mode: CodecMode,
    scheduler: MetaScheduler,
    mut rx: mpsc::UnboundedReceiver<Codec2Frame>,
    to_gateway: mpsc::UnboundedSender<LocalFrame>,
    token: StreamToken,
) {
    let mut token = Some(token);
    let mut count: u32 = 0;
    loop {
        let first = rx
            .blocking_recv()
            .unwrap_or_else(|| Codec2Frame::new(mode.silence(), true));
        let mut last = first.last;
        frame.set_voice(Half::First, &first.data);
        match mode {
            CodecMode::Mode3200 if last => {
                tracing::warn!("unexpected end of 3200 voice stream");
                frame.set_voice(Half::Second, &SILENT_3200);
            }
            CodecMode::Mode3200 => {
                let second = rx
                    .blocking_recv()
                    .unwrap_or_else(|| Codec2Frame::new(SILENT_3200, true));
                last = second.last;
                frame.set_voice(Half::Second, &second.data);
            }
            CodecMode::Mode1600 => frame.set_voice(Half::Second, &[0; 8]),
        }

        scheduler.apply(count, &mut frame);
        let mut fn_ = (count % u32::from(FN_MODULUS)) as u16;
        if last {
            fn_ |= LAST_FRAME;
        }
        frame.set_frame_number(fn_);
        frame.calc_crc();
        let local = LocalFrame {
            frame: frame.clone(),
            token: if last { token.take() } else { None },
        };
        if to_gateway.send(local).is_err() {
            tracing::warn!("gateway channel closed, abandoning stream");
            break;
        }
        count += 1;
        if last {
            break;
        }
    }
    tracing::debug!(frames = count, sid = frame.stream_id(), "stream assembled");
}

fn decode_stage(
    mut codec: Box<dyn codec::Codec2>,
    mut rx: mpsc::UnboundedReceiver<Codec2Frame>,
    tx: mpsc::UnboundedSender<AudioFrame>,
) {
    let mode = codec.mode();
    loop {
        let frame = rx
            .blocking_recv()
            .unwrap_or_else(|| Codec2Frame::new(mode.silence(), true));
        let mut pcm = [0i16; 2 * SAMPLES_PER_FRAME];
        let pcm = &mut pcm[..mode.samples_per_codec_frame()];
        codec.decode(&frame.data, pcm);
        match mode {
            CodecMode::Mode3200 => {
                let _ = tx.send(AudioFrame::from_slice(pcm, frame.last));
            }
            CodecMode::Mode1600 => {
                let _ = tx.send(AudioFrame::from_slice(&pcm[..SAMPLES_PER_FRAME], false));
                let _ = tx.send(AudioFrame::from_slice(&pcm[SAMPLES_PER_FRAME..], frame.last));
            }
        }
        if frame.last {
            break;
        }
    }
}

fn play_stage(
    mut playback: Playback,
    mut rx: mpsc::UnboundedReceiver<AudioFrame>,
    preroll: Duration,
) -> VolumeStats {
    std::thread::sleep(preroll);
    let mut stats = VolumeStats::new();
    loop {
        let frame = rx.blocking_recv().unwrap_or_else(|| AudioFrame::silence(true));
        stats.add(&frame.samples);
        playback.write_frame(&frame.samples, frame.last);
        if frame.last {
            break;
        }
    }
    playback.drain();
    stats
}
