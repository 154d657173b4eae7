//! End-to-end AES2550 sessions over the scripted transport.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use fpswipe::drivers::aes2550::constants::*;
use fpswipe::testing::{MockStep, MockTransport, RecordingSink, SinkEvent};
use fpswipe::{ActivateMode, Aes2550Driver, SsmError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn next_event(rx: &mut UnboundedReceiver<SinkEvent>) -> SinkEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a sink event")
        .expect("sink channel closed")
}

/// Frame a payload the way the device does: magic, big-endian length,
/// payload.
fn frame(magic: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![magic, (payload.len() >> 8) as u8, (payload.len() & 0xff) as u8];
    frame.extend_from_slice(payload);
    frame
}

fn init_ack() -> Vec<u8> {
    frame(INIT_ACK_MAGIC, &[0x01])
}

fn calibration_table() -> Vec<u8> {
    frame(CALIBRATE_MAGIC, &[0xaa; 16])
}

fn fd_response(present: bool) -> Vec<u8> {
    frame(FD_MAGIC, &[u8::from(present)])
}

/// A strip frame whose pixels are all the given nibble.
fn strip_frame(nibble: u8) -> Vec<u8> {
    let mut payload = vec![0u8; STRIP_OFFSET - 3];
    payload.extend(std::iter::repeat_n(nibble << 4 | nibble, STRIP_SIZE));
    frame(STRIP_MAGIC, &payload)
}

fn heartbeat() -> Vec<u8> {
    frame(HEARTBEAT_MAGIC, &[0x00])
}

fn out(cmd: &[u8]) -> MockStep {
    MockStep::Out(cmd.to_vec())
}

#[tokio::test]
async fn full_session_captures_an_inverted_image() -> Result<()> {
    init_logging();
    let mut script = Vec::new();

    // Activation: register programming, then calibration as a nested
    // machine.
    script.push(out(INIT_REQS));
    script.push(MockStep::In(init_ack()));
    script.push(out(CALIBRATE_REQS));
    script.push(MockStep::In(calibration_table()));

    // Finger detection: one empty histogram, then a finger.
    script.push(out(FINGER_DET_REQS));
    script.push(MockStep::In(fd_response(false)));
    script.push(out(FINGER_DET_REQS));
    script.push(MockStep::In(fd_response(true)));
    script.push(out(SET_IDLE_REQS));

    // Capture: the device streams strips on its own; the second one is
    // split across two reads, and a heartbeat ends the swipe.
    let split_strip = strip_frame(0x0c);
    let (first_half, second_half) = split_strip.split_at(100);
    script.push(out(CAPTURE_REQS));
    script.push(MockStep::In(strip_frame(0x03)));
    script.push(MockStep::In(first_half.to_vec()));
    script.push(MockStep::In(second_half.to_vec()));
    script.push(MockStep::In(heartbeat()));
    script.push(out(SET_IDLE_REQS));

    // The loop returns to finger detection and parks on the wait read.
    script.push(out(FINGER_DET_REQS));
    script.push(MockStep::Hang);
    script.push(out(SET_IDLE_REQS));

    let transport = MockTransport::new(script);
    let (sink, mut events) = RecordingSink::new();
    let driver = Aes2550Driver::open(transport.clone(), Box::new(sink)).await?;

    driver.activate(ActivateMode::AwaitFingerOn);
    assert_eq!(
        next_event(&mut events).await,
        SinkEvent::ActivateComplete(Ok(()))
    );
    assert_eq!(next_event(&mut events).await, SinkEvent::FingerStatus(true));

    let image = match next_event(&mut events).await {
        SinkEvent::ImageCaptured(image) => image,
        other => panic!("expected a captured image, got {other:?}"),
    };
    assert_eq!(image.width, FRAME_WIDTH);
    // Constant strips overlap fully, so the image collapses to one frame
    // holding the later strip's samples.
    assert_eq!(image.height, FRAME_HEIGHT);
    assert!(image.flags.colors_inverted);
    assert!(!image.flags.h_flipped);
    assert!(image.data.iter().all(|&sample| sample == 0x0c * 17));

    assert_eq!(next_event(&mut events).await, SinkEvent::FingerStatus(false));

    // Wait for the next finger-detection round to park on the wait read.
    timeout(Duration::from_secs(5), async {
        while transport.remaining() > 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never reached the finger wait");

    driver.deactivate();
    assert_eq!(next_event(&mut events).await, SinkEvent::DeactivateComplete);
    assert_eq!(transport.remaining(), 0);

    driver.close().await;
    assert_eq!(next_event(&mut events).await, SinkEvent::CloseComplete);
    Ok(())
}

#[tokio::test]
async fn bogus_strip_magic_aborts_the_capture() -> Result<()> {
    init_logging();
    let mut script = Vec::new();
    script.push(out(INIT_REQS));
    script.push(MockStep::In(init_ack()));
    script.push(out(CALIBRATE_REQS));
    script.push(MockStep::In(calibration_table()));
    script.push(out(FINGER_DET_REQS));
    script.push(MockStep::In(fd_response(true)));
    script.push(out(SET_IDLE_REQS));
    script.push(out(CAPTURE_REQS));
    // Neither a strip nor a heartbeat; the decoder rejects the stream.
    script.push(MockStep::In(vec![0x99, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]));

    let transport = MockTransport::new(script);
    let (sink, mut events) = RecordingSink::new();
    let driver = Aes2550Driver::open(transport, Box::new(sink)).await?;

    driver.activate(ActivateMode::AwaitFingerOn);
    assert_eq!(
        next_event(&mut events).await,
        SinkEvent::ActivateComplete(Ok(()))
    );
    assert_eq!(next_event(&mut events).await, SinkEvent::FingerStatus(true));
    assert_eq!(
        next_event(&mut events).await,
        SinkEvent::SessionError(SsmError::Protocol)
    );

    driver.close().await;
    assert_eq!(next_event(&mut events).await, SinkEvent::CloseComplete);
    Ok(())
}
