//! AuthenTec AES1660 swipe sensor driver.
//!
//! The AES1660 images a finger swept across a 128-pixel-wide bar, returning
//! 128x8 frames that the assembly engine merges into one image. The device
//! wants a scripted register programming at activation (two passes around a
//! calibration), answers finger-detection polls on request, and hands back
//! one strip frame per capture command while the finger stays on the bar.

pub mod constants;

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};
use num_enum::TryFromPrimitive;
use tokio::sync::oneshot;

use crate::assemble::assemble_frames;
use crate::drivers::aes::{
    self, AesSession, cmd_sent, complete_on_sent, read_data, read_response, send_cmd,
};
use crate::drivers::img_driver::{ActivateMode, DriverInfo, ImageSink, ScanKind};
use crate::frames::{FRAME_HEADER_LEN, Frame, FrameDecoder};
use crate::ssm::{EventLoop, EventLoopHandle, Outcome, Ssm, SsmError};
use crate::usb::Transport;

use constants::*;

/// Registration data for the AES1660 family.
///
/// The bz3 threshold is lowered for now: binarized scan quality is good and
/// minutiae detection is accurate, we just get fewer minutiae than other
/// scanners from the smaller scanning area.
pub const INFO: DriverInfo = DriverInfo {
    name: "aes1660",
    full_name: "AuthenTec AES1660",
    id_table: ID_TABLE,
    scan_kind: ScanKind::Swipe,
    img_width: FRAME_WIDTH,
    bz3_threshold: 20,
};

struct Session<T: Transport> {
    events: EventLoopHandle<Session<T>>,
    transport: Arc<T>,
    sink: Box<dyn ImageSink>,
    decoder: FrameDecoder,
    /// Strips of the capture in progress, in capture order.
    strips: Vec<Vec<u8>>,
    deactivating: bool,
    /// A phase machine is running or about to chain into the next one.
    active: bool,
    /// Which init sequence the activation is walking, and where in it.
    init_seq: usize,
    init_idx: usize,
    frames_cnt: usize,
}

impl<T: Transport> AesSession for Session<T> {
    type Transport = T;

    fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn events(&self) -> &EventLoopHandle<Self> {
        &self.events
    }

    fn sink_mut(&mut self) -> &mut dyn ImageSink {
        &mut *self.sink
    }
}

// === Activation ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
enum ActivateState {
    SetIdle,
    SendReadId,
    ReadId,
    SendInit,
    ReadInitResponse,
    SendCalibrate,
    ReadCalibrate,
}

const ACTIVATE_NUM_STATES: usize = 7;

fn activate_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match ActivateState::try_from(state).expect("activate state out of range") {
        ActivateState::SetIdle => {
            dev.init_seq = 0;
            dev.init_idx = 0;
            debug!("activate: set idle");
            send_cmd(dev, ssm, SET_IDLE_CMD, cmd_sent);
        }
        ActivateState::SendReadId => {
            debug!("activate: read id");
            send_cmd(dev, ssm, READ_ID_CMD, cmd_sent);
        }
        ActivateState::ReadId => {
            read_response(dev, ssm, ID_RESPONSE_LEN, Some(aes::BULK_TIMEOUT), activate_read_id);
        }
        ActivateState::SendInit => {
            debug!(
                "activate: init sequence {} command {}",
                dev.init_seq, dev.init_idx
            );
            send_cmd(dev, ssm, INIT_SEQS[dev.init_seq][dev.init_idx], cmd_sent);
        }
        ActivateState::ReadInitResponse => {
            read_response(dev, ssm, INIT_ACK_LEN, Some(aes::BULK_TIMEOUT), activate_read_init);
        }
        ActivateState::SendCalibrate => {
            send_cmd(dev, ssm, CALIBRATE_CMD, cmd_sent);
        }
        ActivateState::ReadCalibrate => {
            read_response(
                dev,
                ssm,
                CALIBRATE_RESPONSE_LEN,
                Some(aes::BULK_TIMEOUT),
                activate_read_calibrate,
            );
        }
    }
}

fn activate_read_id<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => return ssm.mark_aborted(error),
    };
    if data[0] != ID_MAGIC {
        debug!("bogus read id response: {:#04x}", data[0]);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    info!(
        "sensor id {:02x}{:02x}, bcdDevice {:02x}.{:02x}, init status {:#04x}",
        data[4], data[3], data[5], data[6], data[7]
    );
    if data[7] == INIT_DONE_STATUS {
        // Already programmed; skip the init scripts.
        return ssm.mark_completed();
    }
    if dev.init_seq < INIT_SEQS.len() {
        ssm.jump_to_state(ActivateState::SendInit as usize);
    } else {
        warn!("device failed to initialise, status {:#04x}", data[7]);
        ssm.mark_aborted(SsmError::Protocol);
    }
}

fn activate_read_init<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => return ssm.mark_aborted(error),
    };
    if data[0] != INIT_ACK_MAGIC || data[3] != 0x01 {
        debug!("bogus init ack: {:#04x} {:#04x}", data[0], data[3]);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    dev.init_idx += 1;
    if dev.init_idx < INIT_SEQS[dev.init_seq].len() {
        ssm.jump_to_state(ActivateState::SendInit as usize);
    } else if dev.init_seq == 0 {
        // First pass done: calibrate, then run the second sequence.
        ssm.jump_to_state(ActivateState::SendCalibrate as usize);
    } else {
        // Second pass done: the device should now report itself programmed.
        dev.init_seq = INIT_SEQS.len();
        ssm.jump_to_state(ActivateState::SendReadId as usize);
    }
}

fn activate_read_calibrate<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => return ssm.mark_aborted(error),
    };
    if data[0] != CALIBRATE_MAGIC {
        debug!("bogus calibrate response: {:#04x}", data[0]);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    dev.init_seq = 1;
    dev.init_idx = 0;
    ssm.jump_to_state(ActivateState::SendInit as usize);
}

fn start_activation<T: Transport>(dev: &mut Session<T>, mode: ActivateMode) {
    if dev.deactivating {
        warn!("activate requested while deactivating");
        dev.sink.on_activate_complete(Err(SsmError::Cancelled));
        return;
    }
    debug!("activate requested ({mode:?})");
    dev.active = true;
    let ssm = dev.events.new_ssm(ACTIVATE_NUM_STATES, activate_run_state);
    ssm.start(activate_complete);
}

fn activate_complete<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, outcome: Outcome) {
    debug!("activation completed: {outcome:?}");
    ssm.free();
    dev.sink.on_activate_complete(outcome);
    match outcome {
        Ok(()) => start_finger_detection(dev),
        Err(_) => dev.active = false,
    }
}

// === Finger presence detection ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
enum FingerDetState {
    SendLed,
    SendCalibrate,
    ReadCalibrate,
    SendFdCmd,
    ReadFdData,
    SetIdle,
}

const FINGER_DET_NUM_STATES: usize = 6;

fn finger_det_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match FingerDetState::try_from(state).expect("finger detection state out of range") {
        FingerDetState::SendLed => send_cmd(dev, ssm, LED_BLINK_CMD, cmd_sent),
        FingerDetState::SendCalibrate => send_cmd(dev, ssm, CALIBRATE_CMD, cmd_sent),
        FingerDetState::ReadCalibrate => {
            read_response(
                dev,
                ssm,
                CALIBRATE_RESPONSE_LEN,
                Some(aes::BULK_TIMEOUT),
                read_calibrate_data,
            );
        }
        FingerDetState::SendFdCmd => send_cmd(dev, ssm, FINGER_DET_CMD, cmd_sent),
        FingerDetState::ReadFdData => {
            // The device answers when it has something to say; deactivation
            // cancels the read.
            read_response(dev, ssm, FD_RESPONSE_LEN, None, finger_det_read_fd_data);
        }
        FingerDetState::SetIdle => send_cmd(dev, ssm, SET_IDLE_CMD, complete_on_sent),
    }
}

/// Calibrate acks advance whichever phase requested them.
fn read_calibrate_data<T: Transport>(
    _dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => return ssm.mark_aborted(error),
    };
    if data[0] != CALIBRATE_MAGIC {
        debug!("bogus calibrate response: {:#04x}", data[0]);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    ssm.next_state();
}

fn finger_det_read_fd_data<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => {
            if dev.deactivating {
                // The wait was knocked out by deactivation; wind down.
                return ssm.jump_to_state(FingerDetState::SetIdle as usize);
            }
            return ssm.mark_aborted(error);
        }
    };
    if data[0] != FD_MAGIC {
        debug!("bogus finger detect response: {:#04x}", data[0]);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    if data[3] == 0x01 || dev.deactivating {
        // Finger present, or deactivation wants the phase gone.
        ssm.next_state();
    } else {
        ssm.jump_to_state(FingerDetState::SendFdCmd as usize);
    }
}

fn start_finger_detection<T: Transport>(dev: &mut Session<T>) {
    if dev.deactivating {
        complete_deactivation(dev);
        return;
    }
    debug!("starting finger detection");
    let ssm = dev.events.new_ssm(FINGER_DET_NUM_STATES, finger_det_run_state);
    ssm.start(finger_det_complete);
}

fn finger_det_complete<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    outcome: Outcome,
) {
    debug!("finger detection completed: {outcome:?}");
    ssm.free();
    if dev.deactivating {
        complete_deactivation(dev);
    } else if let Err(error) = outcome {
        session_error(dev, error);
    } else {
        dev.sink.on_finger_status(true);
        start_capture(dev);
    }
}

// === Capture ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
enum CaptureState {
    SendLed,
    SendCalibrate,
    ReadCalibrate,
    SendCaptureCmd,
    ReadStripeData,
    SetIdle,
}

const CAPTURE_NUM_STATES: usize = 6;

fn capture_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match CaptureState::try_from(state).expect("capture state out of range") {
        CaptureState::SendLed => {
            dev.frames_cnt = 0;
            dev.decoder = FrameDecoder::new(FRAME_FORMAT);
            send_cmd(dev, ssm, LED_SOLID_CMD, cmd_sent);
        }
        CaptureState::SendCalibrate => send_cmd(dev, ssm, CALIBRATE_CMD, cmd_sent),
        CaptureState::ReadCalibrate => {
            read_response(
                dev,
                ssm,
                CALIBRATE_RESPONSE_LEN,
                Some(aes::BULK_TIMEOUT),
                read_calibrate_data,
            );
        }
        CaptureState::SendCaptureCmd => {
            dev.frames_cnt += 1;
            send_cmd(dev, ssm, CAPTURE_CMD, cmd_sent);
        }
        CaptureState::ReadStripeData => {
            read_data(dev, ssm, STRIP_READ_LEN, capture_read_stripe_data);
        }
        CaptureState::SetIdle => {
            debug!("got {} frames", dev.frames_cnt);
            send_cmd(dev, ssm, SET_IDLE_CMD, capture_set_idle_sent);
        }
    }
}

/// Append one strip, remapping samples through the contrast LUT.
///
/// Returns the LUT-weighted brightness, the signal for whether the finger
/// is still on the sensor.
fn process_stripe_data<T: Transport>(dev: &mut Session<T>, payload: &[u8]) -> Result<u32, SsmError> {
    let offset = STRIP_OFFSET - FRAME_HEADER_LEN;
    let Some(pixels) = payload.get(offset..offset + STRIP_SIZE) else {
        debug!("strip payload too short: {} bytes", payload.len());
        return Err(SsmError::Protocol);
    };
    let mut sum: u32 = 0;
    let mut strip = Vec::with_capacity(STRIP_SIZE);
    for &byte in pixels {
        let hi = COLOR_LUT[usize::from(byte >> 4)];
        let lo = COLOR_LUT[usize::from(byte & 0x0f)];
        sum += u32::from(hi) + u32::from(lo);
        strip.push(hi << 4 | lo);
    }
    dev.strips.push(strip);
    Ok(sum)
}

fn capture_read_stripe_data<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => {
            if dev.deactivating {
                return ssm.next_state();
            }
            return ssm.mark_aborted(error);
        }
    };
    let mut frames = Vec::new();
    if let Err(bad) = dev.decoder.push(&data, &mut frames) {
        debug!("bogus stripe data: {:#04x}", bad.0);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    let got_frames = !frames.is_empty();
    let mut finger_present = false;
    let mut terminal = false;
    for frame in frames {
        match frame {
            Frame::Strip(payload) => match process_stripe_data(dev, &payload) {
                Ok(sum) => {
                    debug!("strip {} brightness {sum}", dev.strips.len());
                    finger_present = sum > SUM_THRESHOLD;
                }
                Err(error) => return ssm.mark_aborted(error),
            },
            Frame::Heartbeat(_) => {
                // No strip data for a while; the finger is gone.
                debug!("heartbeat, treating as the last frame");
                terminal = true;
            }
        }
    }
    if dev.deactivating || terminal {
        ssm.next_state();
    } else if !got_frames {
        // Mid-frame; keep reading without another capture command.
        ssm.jump_to_state(CaptureState::ReadStripeData as usize);
    } else if finger_present && dev.frames_cnt < MAX_FRAMES {
        ssm.jump_to_state(CaptureState::SendCaptureCmd as usize);
    } else {
        ssm.next_state();
    }
}

fn capture_set_idle_sent<T: Transport>(
    dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Outcome,
) {
    match result {
        Ok(()) => {
            if !dev.deactivating {
                submit_image(dev);
            }
            dev.sink.on_finger_status(false);
            ssm.mark_completed();
        }
        Err(error) => ssm.mark_aborted(error),
    }
}

/// Assemble the capture into an image and hand it to the sink.
fn submit_image<T: Transport>(dev: &mut Session<T>) {
    if dev.strips.is_empty() {
        // The finger can leave before a single full strip arrives.
        warn!("capture ended with no strips");
        return;
    }
    let image = assemble_frames(&dev.strips, FRAME_WIDTH, false);
    info!(
        "captured {}x{} image from {} strips",
        image.width,
        image.height,
        dev.strips.len()
    );
    dev.strips.clear();
    dev.sink.on_image_captured(image);
}

fn start_capture<T: Transport>(dev: &mut Session<T>) {
    if dev.deactivating {
        complete_deactivation(dev);
        return;
    }
    debug!("starting capture");
    let ssm = dev.events.new_ssm(CAPTURE_NUM_STATES, capture_run_state);
    ssm.start(capture_complete);
}

fn capture_complete<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, outcome: Outcome) {
    debug!("capture completed: {outcome:?}");
    ssm.free();
    if dev.deactivating {
        complete_deactivation(dev);
    } else if let Err(error) = outcome {
        session_error(dev, error);
    } else {
        start_finger_detection(dev);
    }
}

// === Deactivation ===

fn request_deactivation<T: Transport>(dev: &mut Session<T>) {
    if dev.deactivating {
        debug!("already deactivating");
        return;
    }
    if !dev.active {
        // Nothing is running; report right away.
        dev.sink.on_deactivate_complete();
        return;
    }
    debug!("deactivating");
    dev.deactivating = true;
    // Knock the session out of a finger-wait read.
    dev.transport.cancel_in();
}

fn complete_deactivation<T: Transport>(dev: &mut Session<T>) {
    debug!("deactivation complete");
    dev.deactivating = false;
    dev.active = false;
    dev.strips.clear();
    dev.sink.on_deactivate_complete();
}

fn session_error<T: Transport>(dev: &mut Session<T>, error: SsmError) {
    warn!("session error: {error}");
    dev.active = false;
    dev.strips.clear();
    dev.sink.on_session_error(error);
}

// === Session lifecycle ===

/// An opened AES1660 sensor session.
///
/// All driver work happens on a dedicated worker thread; the methods here
/// enqueue a request and return, with outcomes delivered through the
/// session's [`ImageSink`].
pub struct Aes1660Driver<T: Transport> {
    events: EventLoopHandle<Session<T>>,
    closed_rx: Option<oneshot::Receiver<()>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Transport> Aes1660Driver<T> {
    /// Claim interface 0 and spin up the session worker.
    pub async fn open(transport: T, sink: Box<dyn ImageSink>) -> io::Result<Self> {
        let transport = Arc::new(transport);
        transport.claim_interface(aes::USB_INTERFACE).await?;

        let (events, events_rx) = EventLoopHandle::channel();
        let session = Session {
            events: events.clone(),
            transport,
            sink,
            decoder: FrameDecoder::new(FRAME_FORMAT),
            strips: Vec::new(),
            deactivating: false,
            active: false,
            init_seq: 0,
            init_idx: 0,
            frames_cnt: 0,
        };
        let event_loop = EventLoop::new(events.clone(), events_rx, session);
        let (worker, closed_rx) = aes::spawn_session("aes1660-session", event_loop)?;

        Ok(Aes1660Driver {
            events,
            closed_rx: Some(closed_rx),
            worker: Some(worker),
        })
    }

    /// Begin the activate -> finger detection -> capture loop. Completion
    /// arrives through [`ImageSink::on_activate_complete`].
    pub fn activate(&self, mode: ActivateMode) {
        self.events.push(move |dev| start_activation(dev, mode));
    }

    /// Ask the running phase to wind down at its next check point.
    /// [`ImageSink::on_deactivate_complete`] fires once it has.
    pub fn deactivate(&self) {
        self.events.push(request_deactivation);
    }

    /// Tear down the session, releasing the claimed interface.
    pub async fn close(mut self) {
        self.events.shutdown();
        if let Some(closed_rx) = self.closed_rx.take() {
            let _ = closed_rx.await;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
