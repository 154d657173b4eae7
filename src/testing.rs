//! Test doubles for driving sessions without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::error;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::drivers::img_driver::ImageSink;
use crate::image::Image;
use crate::ssm::SsmError;
use crate::usb::{Transport, TransferError};

/// One scripted exchange on the mock bulk pipe.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Expect a bulk OUT write of exactly these bytes.
    Out(Vec<u8>),
    /// Answer the next bulk IN read with these bytes.
    In(Vec<u8>),
    /// Fail the next bulk IN read.
    InError(TransferError),
    /// Park the next bulk IN read until the session cancels it.
    Hang,
}

/// Transport double that replays a fixed script.
///
/// Any deviation from the script fails the transfer, which surfaces in the
/// driver as an I/O abort the test will notice.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    script: Mutex<VecDeque<MockStep>>,
    cancelled: Notify,
}

impl MockTransport {
    pub fn new(steps: impl IntoIterator<Item = MockStep>) -> Self {
        MockTransport {
            inner: Arc::new(MockInner {
                script: Mutex::new(steps.into_iter().collect()),
                cancelled: Notify::new(),
            }),
        }
    }

    /// Steps the session has not consumed yet.
    pub fn remaining(&self) -> usize {
        self.inner.script.lock().unwrap().len()
    }

    fn pop(&self) -> Option<MockStep> {
        self.inner.script.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn claim_interface(&self, _interface: u8) -> io::Result<()> {
        Ok(())
    }

    async fn release_interface(&self, _interface: u8) -> io::Result<()> {
        Ok(())
    }

    async fn bulk_out(
        &self,
        _endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        match self.pop() {
            Some(MockStep::Out(expected)) if expected.as_slice() == data => Ok(data.len()),
            step => {
                error!(
                    "unscripted bulk OUT of {} bytes, next step {step:?}",
                    data.len()
                );
                Err(TransferError::Failed)
            }
        }
    }

    async fn bulk_in(
        &self,
        _endpoint: u8,
        len: usize,
        _timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransferError> {
        match self.pop() {
            Some(MockStep::In(mut data)) => {
                data.truncate(len);
                Ok(data)
            }
            Some(MockStep::InError(error)) => Err(error),
            Some(MockStep::Hang) => {
                self.inner.cancelled.notified().await;
                Err(TransferError::Cancelled)
            }
            step => {
                error!("unscripted bulk IN of {len} bytes, next step {step:?}");
                Err(TransferError::Failed)
            }
        }
    }

    fn cancel_in(&self) {
        self.inner.cancelled.notify_one();
    }
}

/// Everything a session reported through its sink, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    ActivateComplete(Result<(), SsmError>),
    FingerStatus(bool),
    ImageCaptured(Image),
    DeactivateComplete,
    CloseComplete,
    SessionError(SsmError),
}

/// Sink that forwards every callback onto a channel for tests to await.
pub struct RecordingSink {
    tx: UnboundedSender<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> (Self, UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RecordingSink { tx }, rx)
    }

    fn record(&self, event: SinkEvent) {
        let _ = self.tx.send(event);
    }
}

impl ImageSink for RecordingSink {
    fn on_activate_complete(&mut self, result: Result<(), SsmError>) {
        self.record(SinkEvent::ActivateComplete(result));
    }

    fn on_finger_status(&mut self, present: bool) {
        self.record(SinkEvent::FingerStatus(present));
    }

    fn on_image_captured(&mut self, image: Image) {
        self.record(SinkEvent::ImageCaptured(image));
    }

    fn on_deactivate_complete(&mut self) {
        self.record(SinkEvent::DeactivateComplete);
    }

    fn on_close_complete(&mut self) {
        self.record(SinkEvent::CloseComplete);
    }

    fn on_session_error(&mut self, error: SsmError) {
        self.record(SinkEvent::SessionError(error));
    }
}
