//! AuthenTec AES2550/AES2810 swipe sensor driver.
//!
//! The AES2550 samples a swept finger at preprogrammed intervals and pushes
//! 192x8 strip frames on its own, so capture is a single read loop rather
//! than a command per frame. A heartbeat frame means no strip data for the
//! programmed interval, which is how the device reports the finger leaving.
//! Sample values come back inverted relative to ridge darkness, so emitted
//! images carry the inversion flag.

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

/// Registration data for the AES2550 family.
pub const INFO: DriverInfo = DriverInfo {
    name: "aes2550",
    full_name: "AuthenTec AES2550/AES2810",
    id_table: ID_TABLE,
    scan_kind: ScanKind::Swipe,
    img_width: FRAME_WIDTH,
    bz3_threshold: 40,
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
    WriteInit,
    ReadInitAck,
    Calibrate,
}

const ACTIVATE_NUM_STATES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
enum CalibrateState {
    SendCalibrate,
    ReadCalibrateData,
}

const CALIBRATE_NUM_STATES: usize = 2;

fn activate_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match ActivateState::try_from(state).expect("activate state out of range") {
        ActivateState::WriteInit => {
            debug!("activate: write init registers");
            send_cmd(dev, ssm, INIT_REQS, cmd_sent);
        }
        ActivateState::ReadInitAck => {
            read_response(dev, ssm, INIT_ACK_LEN, Some(aes::BULK_TIMEOUT), activate_read_init_ack);
        }
        ActivateState::Calibrate => {
            // Calibration runs as a nested machine; its outcome advances or
            // aborts the activation.
            let child = dev.events.new_ssm(CALIBRATE_NUM_STATES, calibrate_run_state);
            ssm.start_subsm(&child);
        }
    }
}

fn activate_read_init_ack<T: Transport>(
    _dev: &mut Session<T>,
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
    ssm.next_state();
}

fn calibrate_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match CalibrateState::try_from(state).expect("calibrate state out of range") {
        CalibrateState::SendCalibrate => {
            debug!("calibrating");
            send_cmd(dev, ssm, CALIBRATE_REQS, cmd_sent);
        }
        CalibrateState::ReadCalibrateData => {
            // TODO: use the calibration table.
            read_data(dev, ssm, CALIB_READ_LEN, calibrate_read_data);
        }
    }
}

fn calibrate_read_data<T: Transport>(
    _dev: &mut Session<T>,
    ssm: &Ssm<Session<T>>,
    result: Result<Vec<u8>, SsmError>,
) {
    let data = match result {
        Ok(data) => data,
        Err(error) => return ssm.mark_aborted(error),
    };
    if data.first() != Some(&CALIBRATE_MAGIC) {
        debug!("bogus calibration data: {:?}", data.first());
        return ssm.mark_aborted(SsmError::Protocol);
    }
    ssm.next_state();
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
    SendFdReqs,
    ReadFdData,
    SetIdle,
}

const FINGER_DET_NUM_STATES: usize = 3;

fn finger_det_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match FingerDetState::try_from(state).expect("finger detection state out of range") {
        FingerDetState::SendFdReqs => send_cmd(dev, ssm, FINGER_DET_REQS, cmd_sent),
        FingerDetState::ReadFdData => {
            // The device reports once its histogram says anything; the wait
            // is unbounded and relies on deactivation cancelling it.
            read_response(dev, ssm, FD_RESPONSE_LEN, None, finger_det_read_fd_data);
        }
        FingerDetState::SetIdle => send_cmd(dev, ssm, SET_IDLE_REQS, complete_on_sent),
    }
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
                return ssm.jump_to_state(FingerDetState::SetIdle as usize);
            }
            return ssm.mark_aborted(error);
        }
    };
    if data[0] != FD_MAGIC {
        debug!("bogus finger detect response: {:#04x}", data[0]);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    if data[3] & REG83_FINGER_PRESENT != 0 || dev.deactivating {
        ssm.next_state();
    } else {
        // No finger yet; reprogram and poll for a new histogram.
        ssm.jump_to_state(FingerDetState::SendFdReqs as usize);
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
    WriteReqs,
    ReadStripData,
    SetIdle,
}

const CAPTURE_NUM_STATES: usize = 3;

fn capture_run_state<T: Transport>(dev: &mut Session<T>, ssm: &Ssm<Session<T>>, state: usize) {
    match CaptureState::try_from(state).expect("capture state out of range") {
        CaptureState::WriteReqs => {
            dev.decoder = FrameDecoder::new(FRAME_FORMAT);
            send_cmd(dev, ssm, CAPTURE_REQS, cmd_sent);
        }
        CaptureState::ReadStripData => {
            read_data(dev, ssm, STRIP_READ_LEN, capture_read_strip_data);
        }
        CaptureState::SetIdle => {
            debug!("got {} frames", dev.strips.len());
            send_cmd(dev, ssm, SET_IDLE_REQS, capture_set_idle_sent);
        }
    }
}

/// Append one raw strip; contrast is handled at assembly time.
fn process_strip_data<T: Transport>(dev: &mut Session<T>, payload: &[u8]) -> Result<(), SsmError> {
    let offset = STRIP_OFFSET - FRAME_HEADER_LEN;
    let Some(pixels) = payload.get(offset..offset + STRIP_SIZE) else {
        debug!("bogus strip payload length {}", payload.len());
        return Err(SsmError::Protocol);
    };
    dev.strips.push(pixels.to_vec());
    Ok(())
}

fn capture_read_strip_data<T: Transport>(
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
        debug!("bogus strip data: {:#04x}", bad.0);
        return ssm.mark_aborted(SsmError::Protocol);
    }
    let mut terminal = false;
    for frame in frames {
        match frame {
            Frame::Strip(payload) => {
                if let Err(error) = process_strip_data(dev, &payload) {
                    return ssm.mark_aborted(error);
                }
            }
            Frame::Heartbeat(_) => {
                // No strip data for a long time; the finger was removed or
                // never moved. Assemble what we have.
                debug!("heartbeat, treating as the last frame");
                terminal = true;
            }
        }
    }
    if dev.deactivating || terminal || dev.strips.len() >= MAX_FRAMES {
        ssm.next_state();
    } else {
        ssm.jump_to_state(CaptureState::ReadStripData as usize);
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
        warn!("capture ended with no strips");
        return;
    }
    let image = assemble_frames(&dev.strips, FRAME_WIDTH, true);
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
        dev.sink.on_deactivate_complete();
        return;
    }
    debug!("deactivating");
    dev.deactivating = true;
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

/// An opened AES2550/AES2810 sensor session.
///
/// All driver work happens on a dedicated worker thread; the methods here
/// enqueue a request and return, with outcomes delivered through the
/// session's [`ImageSink`].
pub struct Aes2550Driver<T: Transport> {
    events: EventLoopHandle<Session<T>>,
    closed_rx: Option<oneshot::Receiver<()>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Transport> Aes2550Driver<T> {
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
        };
        let event_loop = EventLoop::new(events.clone(), events_rx, session);
        let (worker, closed_rx) = aes::spawn_session("aes2550-session", event_loop)?;

        Ok(Aes2550Driver {
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
