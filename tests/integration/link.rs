use crate::*;

use m17_services::audio::quick_key_frames;
use m17_services::gateway::link::LinkState;
use m17_services::gateway::GatewayError;

fn ref_datagram(magic: &[u8; 4], callsign: &Callsign) -> Vec<u8> {
    let mut bytes = magic.to_vec();
    bytes.extend_from_slice(&callsign.code_out());
    bytes
}

/// CONN to the destination, ACKN back: linked.
#[tokio::test]
async fn test_link_handshake() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    st.handle.link(REFLECTOR)?;
    let (conn, from) = reflector.recv().await?;
    assert_eq!(from.port(), st.addr.port());
    assert_eq!(conn.len(), 11);
    assert_eq!(&conn[..4], b"CONN");
    assert_eq!(&conn[4..10], &station().code_out());
    assert_eq!(conn[10], b'C');
    assert_eq!(st.handle.link_state().state, LinkState::Linking);

    reflector.send(b"ACKN", st.addr).await?;
    st.expect_log("Linked to M17-M17 C").await?;
    let status = st.handle.link_state();
    assert_eq!(status.state, LinkState::Linked);
    assert_eq!(status.reflector, Some(Callsign::new(REFLECTOR)));
    assert_eq!(status.peer, Some(reflector.addr()));
    Ok(())
}

#[tokio::test]
async fn test_link_refused() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    st.handle.link(REFLECTOR)?;
    reflector.recv().await?;
    reflector.send(b"NACK", st.addr).await?;
    st.expect_log("Link request refused from M17-M17 C").await?;
    assert_eq!(st.handle.link_state().state, LinkState::Unlinked);
    Ok(())
}

/// No answer within the linking timeout: back to unlinked, and a late ACKN
/// does not resurrect the link.
#[tokio::test]
async fn test_link_request_times_out() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    let watch = st.handle.subscribe_link();
    st.handle.link(REFLECTOR)?;
    reflector.recv().await?;
    let started = tokio::time::Instant::now();

    st.expect_log("timed out").await?;
    assert!(started.elapsed() >= LINK_TIMEOUT - Duration::from_millis(50));
    assert_eq!(st.handle.link_state().state, LinkState::Unlinked);
    assert!(watch.has_changed()?);

    reflector.send(b"ACKN", st.addr).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(st.handle.link_state().state, LinkState::Unlinked);
    Ok(())
}

/// Control datagrams from anyone but the peer are ignored.
#[tokio::test]
async fn test_stranger_cannot_ack() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let stranger = FakeReflector::bind().await?;
    let st = Station::start(&test_config(reflector.addr())).await?;

    st.handle.link(REFLECTOR)?;
    reflector.recv().await?;
    stranger.send(b"ACKN", st.addr).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(st.handle.link_state().state, LinkState::Linking);
    Ok(())
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;

    reflector
        .send(&ref_datagram(b"PING", &Callsign::new(REFLECTOR)), st.addr)
        .await?;
    let (pong, _) = reflector.recv().await?;
    assert_eq!(pong, ref_datagram(b"PONG", &station()));
    Ok(())
}

/// Linked with no PING for longer than the watchdog: unlinked and logged.
#[tokio::test]
async fn test_ping_watchdog_unlinks() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;
    let linked_at = tokio::time::Instant::now();

    st.expect_log("Unlinked from M17-M17 C, TIMEOUT...").await?;
    assert!(linked_at.elapsed() >= PING_WATCHDOG - Duration::from_millis(50));
    let status = st.handle.link_state();
    assert_eq!(status.state, LinkState::Unlinked);
    assert_eq!(status.peer, None);
    Ok(())
}

#[tokio::test]
async fn test_pings_keep_the_link_up() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;

    let ping = ref_datagram(b"PING", &Callsign::new(REFLECTOR));
    for _ in 0..6 {
        tokio::time::sleep(PING_WATCHDOG / 3).await;
        reflector.send(&ping, st.addr).await?;
        reflector.recv().await?;
    }
    assert_eq!(st.handle.link_state().state, LinkState::Linked);
    Ok(())
}

#[tokio::test]
async fn test_unlink_sends_disc() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;

    st.handle.unlink()?;
    let (disc, _) = reflector.recv().await?;
    assert_eq!(disc, ref_datagram(b"DISC", &station()));
    st.expect_log("Unlinked from M17-M17 C").await?;
    assert_eq!(st.handle.link_state().state, LinkState::Unlinked);
    Ok(())
}

#[tokio::test]
async fn test_reflector_disconnects() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;

    reflector.send(b"DISC", st.addr).await?;
    st.expect_log("Unlinked from M17-M17 C").await?;
    assert_eq!(st.handle.link_state().state, LinkState::Unlinked);
    Ok(())
}

/// Frames for the linked reflector go to the peer; anything else goes to
/// the destination address.
#[tokio::test]
async fn test_outbound_routing() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let other = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;
    st.handle.set_destination(other.addr())?;

    st.handle.send_frame(voice_frame(0x0101, 0, STATION))?;
    let (bytes, _) = reflector.recv().await?;
    assert_eq!(bytes.len(), 54);
    assert_eq!(&bytes[..4], b"M17 ");

    let mut direct = voice_frame(0x0202, 0, STATION);
    direct.set_destination(&Callsign::new("W1AW"));
    direct.calc_crc();
    st.handle.send_frame(direct.clone())?;
    let (bytes, _) = other.recv().await?;
    assert_eq!(bytes, direct.as_bytes());
    reflector.quiet_for(Duration::from_millis(50)).await?;
    Ok(())
}

#[tokio::test]
async fn test_sms_goes_out_and_releases_the_channel() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let st = Station::start(&test_config(reflector.addr())).await?;

    let sms = Packet::sms(&Callsign::new("W1AW"), &station(), "hello")?;
    st.handle.send_message(sms.clone())?;
    let (bytes, _) = reflector.recv().await?;
    assert_eq!(bytes, sms.as_bytes());
    assert_eq!(&bytes[..4], b"M17P");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(st.admission.try_lock().is_some());
    Ok(())
}

/// Frames for the reflector are held back until the reflector has
/// acknowledged the link.
#[tokio::test]
async fn test_reflector_frames_wait_for_the_link() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;

    st.handle.send_frame(voice_frame(0x0301, 0, STATION))?;
    reflector.quiet_for(Duration::from_millis(50)).await?;

    st.handle.link(REFLECTOR)?;
    reflector.recv().await?;
    st.handle.send_frame(voice_frame(0x0302, 0, STATION))?;
    reflector.quiet_for(Duration::from_millis(50)).await?;

    reflector.send(b"ACKN", st.addr).await?;
    st.expect_log("Linked to").await?;
    st.handle.send_frame(voice_frame(0x0303, 0, STATION))?;
    let (bytes, _) = reflector.recv().await?;
    assert_eq!(Packet::from_bytes(&bytes)?.stream_id(), 0x0303);
    Ok(())
}

/// Linked to one reflector, frames for another go nowhere.
#[tokio::test]
async fn test_frames_for_another_reflector_are_dropped() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let other = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;
    st.handle.set_destination(other.addr())?;

    let mut frame = voice_frame(0x0401, 0, STATION);
    frame.set_destination(&Callsign::new("M17-XYZ A"));
    frame.calc_crc();
    st.handle.send_frame(frame)?;
    reflector.quiet_for(Duration::from_millis(50)).await?;
    other.quiet_for(Duration::from_millis(10)).await?;
    Ok(())
}

/// A burst sent as one stream keeps the channel until its last frame is out.
#[tokio::test]
async fn test_send_stream_holds_the_channel() -> Result<()> {
    let reflector = FakeReflector::bind().await?;
    let mut st = Station::start(&test_config(reflector.addr())).await?;
    st.link_up(&reflector).await?;

    let token = st.admission.try_lock().context("channel free")?;
    let burst = || quick_key_frames(&Callsign::new(REFLECTOR), &station());
    assert!(matches!(
        st.handle.send_stream(burst()),
        Err(GatewayError::ChannelBusy)
    ));
    token.release();

    st.handle.send_stream(burst())?;
    assert!(st.admission.is_busy());
    for i in 0..5 {
        let (bytes, _) = reflector.recv().await?;
        assert_eq!(Packet::from_bytes(&bytes)?.is_last_packet(), i == 4);
    }

    let deadline = tokio::time::Instant::now() + PATIENCE;
    while st.admission.is_busy() {
        assert!(tokio::time::Instant::now() < deadline, "channel never released");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
