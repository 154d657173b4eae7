//! End-to-end AES1660 sessions over the scripted transport.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use fpswipe::drivers::aes1660::constants::*;
use fpswipe::testing::{MockStep, MockTransport, RecordingSink, SinkEvent};
use fpswipe::{ActivateMode, Aes1660Driver, SsmError, TransferError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn next_event(rx: &mut UnboundedReceiver<SinkEvent>) -> SinkEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a sink event")
        .expect("sink channel closed")
}

/// Frame a payload the way the device does: magic, little-endian length,
/// payload.
fn frame(magic: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![magic, (payload.len() & 0xff) as u8, (payload.len() >> 8) as u8];
    frame.extend_from_slice(payload);
    frame
}

fn id_response(status: u8) -> Vec<u8> {
    frame(ID_MAGIC, &[0x60, 0x16, 0x01, 0x00, status])
}

fn init_ack() -> Vec<u8> {
    frame(INIT_ACK_MAGIC, &[0x01])
}

fn calibrate_ack() -> Vec<u8> {
    frame(CALIBRATE_MAGIC, &[0x00])
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

fn out(cmd: &[u8]) -> MockStep {
    MockStep::Out(cmd.to_vec())
}

/// The full activation exchange: idle, ID probe, two init passes around a
/// calibration, then the ID probe confirming the programmed status.
fn activation_steps(script: &mut Vec<MockStep>) {
    script.push(out(SET_IDLE_CMD));
    script.push(out(READ_ID_CMD));
    script.push(MockStep::In(id_response(0x00)));
    for cmd in INIT_SEQ_1 {
        script.push(out(cmd));
        script.push(MockStep::In(init_ack()));
    }
    script.push(out(CALIBRATE_CMD));
    script.push(MockStep::In(calibrate_ack()));
    for cmd in INIT_SEQ_2 {
        script.push(out(cmd));
        script.push(MockStep::In(init_ack()));
    }
    script.push(out(READ_ID_CMD));
    script.push(MockStep::In(id_response(INIT_DONE_STATUS)));
}

#[tokio::test]
async fn full_session_captures_an_image() -> Result<()> {
    init_logging();
    let mut script = Vec::new();
    activation_steps(&mut script);

    // Finger detection: one empty poll, then a finger.
    script.push(out(LED_BLINK_CMD));
    script.push(out(CALIBRATE_CMD));
    script.push(MockStep::In(calibrate_ack()));
    script.push(out(FINGER_DET_CMD));
    script.push(MockStep::In(fd_response(false)));
    script.push(out(FINGER_DET_CMD));
    script.push(MockStep::In(fd_response(true)));
    script.push(out(SET_IDLE_CMD));

    // Capture: one bright strip keeps the loop going, a dark one ends it.
    script.push(out(LED_SOLID_CMD));
    script.push(out(CALIBRATE_CMD));
    script.push(MockStep::In(calibrate_ack()));
    script.push(out(CAPTURE_CMD));
    script.push(MockStep::In(strip_frame(0x02)));
    script.push(out(CAPTURE_CMD));
    script.push(MockStep::In(strip_frame(0x00)));
    script.push(out(SET_IDLE_CMD));

    // The loop returns to finger detection and parks on the wait read.
    script.push(out(LED_BLINK_CMD));
    script.push(out(CALIBRATE_CMD));
    script.push(MockStep::In(calibrate_ack()));
    script.push(out(FINGER_DET_CMD));
    script.push(MockStep::Hang);
    script.push(out(SET_IDLE_CMD));

    let transport = MockTransport::new(script);
    let (sink, mut events) = RecordingSink::new();
    let driver = Aes1660Driver::open(transport.clone(), Box::new(sink)).await?;

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
    // Constant strips overlap fully, so the image collapses to one frame.
    assert_eq!(image.height, FRAME_HEIGHT);
    assert_eq!(image.data.len(), FRAME_WIDTH * FRAME_HEIGHT);
    assert!(!image.flags.colors_inverted);

    assert_eq!(next_event(&mut events).await, SinkEvent::FingerStatus(false));

    // Wait for the next finger-detection round to park on the wait read.
    timeout(Duration::from_secs(5), async {
        while transport.remaining() > 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never reached the finger wait");

    // A second deactivate while the first is pending must be a no-op.
    driver.deactivate();
    driver.deactivate();
    assert_eq!(next_event(&mut events).await, SinkEvent::DeactivateComplete);
    assert_eq!(transport.remaining(), 0);

    driver.close().await;
    assert_eq!(next_event(&mut events).await, SinkEvent::CloseComplete);
    Ok(())
}

#[tokio::test]
async fn bogus_id_response_fails_activation() -> Result<()> {
    init_logging();
    let script = vec![
        out(SET_IDLE_CMD),
        out(READ_ID_CMD),
        MockStep::In(vec![0x13, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
    ];
    let transport = MockTransport::new(script);
    let (sink, mut events) = RecordingSink::new();
    let driver = Aes1660Driver::open(transport, Box::new(sink)).await?;

    driver.activate(ActivateMode::AwaitFingerOn);
    assert_eq!(
        next_event(&mut events).await,
        SinkEvent::ActivateComplete(Err(SsmError::Protocol))
    );

    driver.close().await;
    assert_eq!(next_event(&mut events).await, SinkEvent::CloseComplete);
    Ok(())
}

#[tokio::test]
async fn failed_finger_wait_reports_a_session_error() -> Result<()> {
    init_logging();
    let script = vec![
        out(SET_IDLE_CMD),
        out(READ_ID_CMD),
        // Already programmed: activation short-circuits past the scripts.
        MockStep::In(id_response(INIT_DONE_STATUS)),
        out(LED_BLINK_CMD),
        out(CALIBRATE_CMD),
        MockStep::In(calibrate_ack()),
        out(FINGER_DET_CMD),
        MockStep::InError(TransferError::TimedOut),
    ];
    let transport = MockTransport::new(script);
    let (sink, mut events) = RecordingSink::new();
    let driver = Aes1660Driver::open(transport, Box::new(sink)).await?;

    driver.activate(ActivateMode::AwaitFingerOn);
    assert_eq!(
        next_event(&mut events).await,
        SinkEvent::ActivateComplete(Ok(()))
    );
    assert_eq!(
        next_event(&mut events).await,
        SinkEvent::SessionError(SsmError::Io)
    );

    // The session is already deactivated, so this completes immediately.
    driver.deactivate();
    assert_eq!(next_event(&mut events).await, SinkEvent::DeactivateComplete);

    driver.close().await;
    assert_eq!(next_event(&mut events).await, SinkEvent::CloseComplete);
    Ok(())
}
