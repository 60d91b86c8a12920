use crate::*;

use m17_core::wire::{SILENT_1600, SILENT_3200};

#[tokio::test]
async fn test_inbound_stream_is_relayed() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    for fn_ in [0, 1, 2 | 0x8000] {
        reflector
            .send(voice_frame(0x1234, fn_, "W1AW").as_bytes(), st.addr)
            .await?;
    }

    let open = st.expect_log("Open stream id=0x1234").await?;
    assert!(open.contains(&format!("from W1AW at {}", reflector.addr())), "{open}");
    for fn_ in [0, 1, 2 | 0x8000] {
        let frame = st.next_frame().await?;
        assert_eq!(frame.stream_id(), 0x1234);
        assert_eq!(frame.frame_number(), fn_);
    }
    st.expect_log("Close stream id=0x1234, duration=0.08 sec").await?;
    assert!(!st.admission.is_busy());
    Ok(())
}

/// A sender that goes quiet is closed on its behalf with silent voice.
#[tokio::test]
async fn test_stream_timeout_3200() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    for fn_ in [0, 1] {
        reflector
            .send(voice_frame(0x0bad, fn_, "W1AW").as_bytes(), st.addr)
            .await?;
    }
    st.next_frame().await?;
    st.next_frame().await?;
    assert!(st.admission.is_busy());
    let opened = tokio::time::Instant::now();

    let terminal = st.next_frame().await?;
    assert!(opened.elapsed() >= STREAM_TIMEOUT - Duration::from_millis(50));
    assert_eq!(terminal.stream_id(), 0x0bad);
    assert_eq!(terminal.frame_number(), 2 | 0x8000);
    assert!(terminal.is_last_packet());
    assert_eq!(terminal.voice(Half::First), &SILENT_3200);
    assert_eq!(terminal.voice(Half::Second), &SILENT_3200);
    assert!(terminal.crc_ok());

    st.expect_log("timed out").await?;
    assert!(!st.admission.is_busy());
    Ok(())
}

#[tokio::test]
async fn test_stream_timeout_1600_keeps_data_half() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    let mut frame = voice_frame(0x1600, 0, "W1AW");
    frame.set_frame_type(0x7);
    frame.calc_crc();
    reflector.send(frame.as_bytes(), st.addr).await?;
    st.next_frame().await?;

    let terminal = st.next_frame().await?;
    assert_eq!(terminal.frame_number(), 1 | 0x8000);
    assert_eq!(terminal.voice(Half::First), &SILENT_1600);
    assert_eq!(terminal.voice(Half::Second), &[0x22; 8]);
    assert!(terminal.crc_ok());
    Ok(())
}

/// While one stream is open, frames of another are dropped; once it ends
/// the other can start.
#[tokio::test]
async fn test_one_stream_at_a_time() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    let send = |sid, fn_| voice_frame(sid, fn_, "W1AW");
    reflector.send(send(0xaaaa, 0).as_bytes(), st.addr).await?;
    reflector.send(send(0xbbbb, 0).as_bytes(), st.addr).await?;
    reflector.send(send(0xaaaa, 0x8001).as_bytes(), st.addr).await?;
    reflector.send(send(0xbbbb, 1).as_bytes(), st.addr).await?;

    let sids: Vec<u16> = [
        st.next_frame().await?,
        st.next_frame().await?,
        st.next_frame().await?,
    ]
    .iter()
    .map(|f| f.stream_id())
    .collect();
    assert_eq!(sids, [0xaaaa, 0xaaaa, 0xbbbb]);
    st.expect_log("Open stream id=0xbbbb").await?;
    Ok(())
}

/// A local transmission holds the channel: inbound streams are not opened.
#[tokio::test]
async fn test_busy_channel_drops_inbound() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    let token = st.admission.try_lock().context("channel free")?;
    reflector
        .send(voice_frame(0x0001, 0, "W1AW").as_bytes(), st.addr)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(st.to_audio.try_recv().is_err());

    token.release();
    reflector
        .send(voice_frame(0x0001, 1, "W1AW").as_bytes(), st.addr)
        .await?;
    assert_eq!(st.next_frame().await?.frame_number(), 1);
    Ok(())
}

#[tokio::test]
async fn test_inbound_sms_is_forwarded_and_logged() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    let sms = Packet::sms(&station(), &Callsign::new("W1AW"), "hello there")?;
    reflector.send(sms.as_bytes(), st.addr).await?;
    let got = st.next_frame().await?;
    assert!(!got.is_stream());
    assert_eq!(got.sms_text().as_deref(), Some("hello there"));
    st.expect_log("SMS from W1AW: hello there").await?;

    let mut bytes = sms.as_bytes().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    reflector.send(&bytes, st.addr).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(st.to_audio.try_recv().is_err());
    Ok(())
}
