use crate::*;

use m17_core::config::FrameTypeVersion;
use m17_core::frame_type::{Encrypt, FrameType, MetaKind, Payload, Version};
use m17_core::gnss::Gnss;
use m17_core::message::make_blocks;
use m17_services::{AudioEvent, AudioManager, AudioSettings, LocalFrame, PttMode};

const MESSAGE: &str = "Thirty-nine characters of station text."; // 39

struct Rig {
    manager: AudioManager,
    backend: Arc<MemoryBackend>,
    admission: StreamAdmission,
    to_gateway: mpsc::UnboundedReceiver<LocalFrame>,
    events: mpsc::UnboundedReceiver<AudioEvent>,
    log: mpsc::UnboundedReceiver<String>,
}

fn rig(config: &M17Config) -> Rig {
    rig_sharing(config, StreamAdmission::new())
}

/// A rig whose transmissions compete with a gateway for `admission`.
fn rig_sharing(config: &M17Config, admission: StreamAdmission) -> Rig {
    let backend = MemoryBackend::new(0x1000);
    let (tx, to_gateway) = mpsc::unbounded_channel();
    let (log_sink, log) = LogSink::channel();
    let (manager, events) = AudioManager::new(
        AudioSettings::from_config(config),
        backend.clone(),
        Arc::new(FlatCodecs),
        admission.clone(),
        tx,
        log_sink,
    );
    Rig {
        manager,
        backend,
        admission,
        to_gateway,
        events,
        log,
    }
}

fn take_queued(rx: &mut mpsc::UnboundedReceiver<LocalFrame>) -> Vec<LocalFrame> {
    let mut frames = Vec::new();
    while let Ok(f) = rx.try_recv() {
        frames.push(f);
    }
    frames
}

/// The queued frames, releasing any token they hold.
fn drain(rx: &mut mpsc::UnboundedReceiver<LocalFrame>) -> Vec<Packet> {
    take_queued(rx).into_iter().map(|local| local.frame).collect()
}

fn meta_kind(frame: &Packet) -> MetaKind {
    FrameType::from_raw(frame.frame_type()).meta()
}

/// Push-to-talk produces one numbered stream, holds the channel while it
/// runs, and places GNSS and text at the superframe boundaries.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ptt_stream_layout() -> Result<()> {
    let mut config = M17Config::default();
    config.station.callsign = "W1AW".into();
    config.audio.text_message = MESSAGE.into();
    config.audio.frame_type_version = FrameTypeVersion::V3;
    config.gnss.enabled = true;
    config.gnss.latitude = 41.71;
    config.gnss.longitude = -72.73;
    let mut rig = rig(&config);

    rig.manager.record_mic(PttMode::M17, REFLECTOR).await?;
    assert!(rig.manager.is_transmitting());
    assert!(rig.admission.try_lock().is_none());
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.manager.key_off().await;
    assert!(!rig.manager.is_transmitting());
    // the last frame has not been sent yet
    assert!(rig.admission.is_busy());

    let frames = drain(&mut rig.to_gateway);
    assert!(rig.admission.try_lock().is_some());
    assert!(frames.len() > 30, "only {} frames", frames.len());
    let sid = frames[0].stream_id();
    for (i, f) in frames.iter().enumerate() {
        assert_eq!(f.stream_id(), sid);
        assert!(f.crc_ok());
        assert_eq!(f.destination()?.as_str(), REFLECTOR);
        assert_eq!(f.source()?.as_str(), "W1AW");
        assert_eq!(f.frame_number() & 0x7fff, i as u16);
        assert_eq!(f.is_last_packet(), i == frames.len() - 1);
        assert_eq!(f.voice(Half::First), &[0x10; 8]);
    }

    assert_eq!(meta_kind(&frames[6]), MetaKind::Gnss);
    let gnss = Gnss::from_meta(frames[6].meta()).context("gnss meta")?;
    assert!(gnss.is_valid());

    let blocks = make_blocks(MESSAGE);
    assert_eq!(blocks.len(), 3);
    for (slot, block) in [12, 18, 24].into_iter().zip(&blocks) {
        assert_eq!(meta_kind(&frames[slot]), MetaKind::Text);
        assert_eq!(frames[slot].meta(), block);
    }
    assert_eq!(meta_kind(&frames[30]), MetaKind::None);
    assert_eq!(frames[30].meta(), &[0u8; 14]);

    let line = tokio::time::timeout(PATIENCE, rig.log.recv())
        .await?
        .context("no volume line")?;
    assert!(line.contains("PTT Time="), "{line}");
    Ok(())
}

/// Without GNSS the first boundary carries the no-metadata marker and text
/// still starts at frame 12.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_text_without_gnss() -> Result<()> {
    let mut config = M17Config::default();
    config.audio.text_message = MESSAGE.into();
    config.audio.frame_type_version = FrameTypeVersion::V3;
    let mut rig = rig(&config);

    rig.manager.record_mic(PttMode::M17, REFLECTOR).await?;
    tokio::time::sleep(Duration::from_millis(250)).await;
    rig.manager.key_off().await;

    let frames = drain(&mut rig.to_gateway);
    assert!(frames.len() > 24, "only {} frames", frames.len());
    assert_eq!(meta_kind(&frames[6]), MetaKind::None);
    assert_eq!(meta_kind(&frames[12]), MetaKind::Text);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_transmission_is_refused() -> Result<()> {
    let rig = rig(&M17Config::default());
    let token = rig.admission.try_lock().context("channel free")?;
    assert!(matches!(
        rig.manager.record_mic(PttMode::M17, REFLECTOR).await,
        Err(AudioError::ChannelBusy)
    ));
    assert!(matches!(
        rig.manager.quick_key(REFLECTOR, "W1AW").await,
        Err(AudioError::ChannelBusy)
    ));
    token.release();

    rig.manager.record_mic(PttMode::Echo, "").await?;
    assert!(matches!(
        rig.manager.record_mic(PttMode::M17, REFLECTOR).await,
        Err(AudioError::AlreadyTransmitting)
    ));
    rig.manager.key_off().await;
    Ok(())
}

/// Echo mode records locally and plays back what it recorded.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_plays_back() -> Result<()> {
    let mut rig = rig(&M17Config::default());

    rig.manager.record_mic(PttMode::Echo, "").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.manager.play_echo_data().await?;

    assert!(drain(&mut rig.to_gateway).is_empty());
    let played = rig.backend.played();
    assert!(played.len() >= 10 * 160, "{}", played.len());
    assert!(played.iter().filter(|&&s| s == 0x1000).count() >= 9 * 160);

    let line = tokio::time::timeout(PATIENCE, rig.log.recv())
        .await?
        .context("no volume line")?;
    assert!(line.contains("Echo Time="), "{line}");

    assert!(matches!(
        rig.manager.play_echo_data().await,
        Err(AudioError::NothingRecorded)
    ));
    Ok(())
}

/// A received stream is decoded to the speaker, its text reported once,
/// and the start and end announced.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_plays_stream() -> Result<()> {
    let mut rig = rig(&M17Config::default());

    let ft = FrameType::new(Version::V3, Payload::C2_3200, Encrypt::None, MetaKind::Text);
    let block = make_blocks("CQ CQ")[0];
    let mut frames = Vec::new();
    for fn_ in 0..10u16 {
        let mut f = voice_frame(0x4242, if fn_ == 9 { fn_ | 0x8000 } else { fn_ }, "W1AW");
        f.set_frame_type(ft.origin_raw());
        f.set_meta(&block);
        f.set_voice(Half::First, &[0x10; 8]);
        f.set_voice(Half::Second, &[0x10; 8]);
        f.calc_crc();
        frames.push(f);
    }
    for f in frames {
        rig.manager.receive(f).await;
    }

    assert_eq!(rig.events.recv().await, Some(AudioEvent::Receiving(true)));
    assert_eq!(
        rig.events.recv().await,
        Some(AudioEvent::Text {
            source: "W1AW".into(),
            text: "CQ CQ".into()
        })
    );
    assert_eq!(rig.events.recv().await, Some(AudioEvent::Receiving(false)));

    let played = rig.backend.played();
    assert_eq!(played.len(), 20 * 160);
    assert!(played.iter().all(|&s| s == 0x1000));

    let line = tokio::time::timeout(PATIENCE, rig.log.recv())
        .await?
        .context("no volume line")?;
    assert!(line.contains("RX Audio Time=0.4s"), "{line}");
    Ok(())
}

#[tokio::test]
async fn test_receive_sms() -> Result<()> {
    let mut rig = rig(&M17Config::default());
    let sms = Packet::sms(&station(), &Callsign::new("W1AW"), "73")?;
    rig.manager.receive(sms).await;
    assert_eq!(
        rig.events.recv().await,
        Some(AudioEvent::Sms {
            source: "W1AW".into(),
            text: "73".into()
        })
    );
    Ok(())
}

/// Quick-key through a live gateway: the channel stays closed, to inbound
/// streams too, until the reflector has the terminal frame.
#[tokio::test]
async fn test_quick_key_holds_the_channel_until_sent() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;
    let mut rig = rig_sharing(&M17Config::default(), st.admission.clone());

    rig.manager.quick_key(REFLECTOR, STATION).await?;
    let queued = take_queued(&mut rig.to_gateway);
    assert_eq!(queued.len(), 5);
    assert!(queued[..4].iter().all(|local| local.token.is_none()));
    assert!(queued[4].token.is_some());
    assert!(st.admission.is_busy());

    reflector
        .send(voice_frame(0x7777, 0, "W1AW").as_bytes(), st.addr)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut queued = queued.into_iter();
    for local in queued.by_ref().take(4) {
        st.handle.send_frame(local)?;
    }
    for _ in 0..4 {
        let (bytes, _) = reflector.recv().await?;
        assert!(!Packet::from_bytes(&bytes)?.is_last_packet());
    }
    assert!(st.admission.is_busy());

    for local in queued {
        st.handle.send_frame(local)?;
    }
    let (bytes, _) = reflector.recv().await?;
    assert!(Packet::from_bytes(&bytes)?.is_last_packet());

    let deadline = tokio::time::Instant::now() + PATIENCE;
    while st.admission.is_busy() {
        assert!(tokio::time::Instant::now() < deadline, "channel never released");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(st.to_audio.try_recv().is_err(), "inbound stream opened while busy");
    Ok(())
}

/// Microphone to reflector: the manager's frames routed through a live
/// gateway while linked.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ptt_through_gateway() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;

    let mut rig = rig(&M17Config::default());
    let handle = st.handle.clone();
    let mut from_audio = std::mem::replace(&mut rig.to_gateway, mpsc::unbounded_channel().1);
    let pump = tokio::spawn(async move {
        while let Some(frame) = from_audio.recv().await {
            if handle.send_frame(frame).is_err() {
                break;
            }
        }
    });

    rig.manager.record_mic(PttMode::M17, REFLECTOR).await?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    rig.manager.key_off().await;

    let mut count = 0;
    loop {
        let (bytes, _) = reflector.recv().await?;
        if bytes.len() != 54 {
            continue; // a PONG or similar
        }
        count += 1;
        let frame = Packet::from_bytes(&bytes)?;
        assert!(frame.crc_ok());
        if frame.is_last_packet() {
            break;
        }
    }
    assert!(count >= 2);
    drop(rig);
    pump.await?;
    Ok(())
}
