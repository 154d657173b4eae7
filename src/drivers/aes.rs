//! Helpers shared between the AuthenTec swipe drivers.
//!
//! Both families speak the same endpoint layout: commands go out on the
//! bulk OUT endpoint, responses and image data come back on bulk IN. The
//! helpers here run the transfer off the worker and queue the caller's
//! continuation back onto it with the outcome, so driver callbacks always
//! run with exclusive access to their session.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::drivers::img_driver::ImageSink;
use crate::ssm::{EventLoop, EventLoopHandle, Outcome, Ssm, SsmError};
use crate::usb::{Transport, TransferError};

pub(crate) const EP_IN: u8 = 0x81;
pub(crate) const EP_OUT: u8 = 0x02;
pub(crate) const USB_INTERFACE: u8 = 0;
pub(crate) const BULK_TIMEOUT: Duration = Duration::from_millis(4000);

/// The pieces of a driver session the shared helpers need.
pub(crate) trait AesSession: Send + Sized + 'static {
    type Transport: Transport;

    fn transport(&self) -> &Arc<Self::Transport>;
    fn events(&self) -> &EventLoopHandle<Self>;
    fn sink_mut(&mut self) -> &mut dyn ImageSink;
}

pub(crate) fn ssm_error(error: TransferError) -> SsmError {
    match error {
        TransferError::Cancelled => SsmError::Cancelled,
        TransferError::NoResources => SsmError::Resource,
        TransferError::TimedOut | TransferError::Disconnected | TransferError::Failed => {
            SsmError::Io
        }
    }
}

/// Write `cmd` to the command endpoint; `done` runs on the worker with the
/// outcome. A short write counts as an I/O failure.
pub(crate) fn send_cmd<D, F>(dev: &D, ssm: &Ssm<D>, cmd: &'static [u8], done: F)
where
    D: AesSession,
    F: FnOnce(&mut D, &Ssm<D>, Outcome) + Send + 'static,
{
    let transport = dev.transport().clone();
    let events = dev.events().clone();
    let ssm = ssm.clone();
    tokio::spawn(async move {
        let result = match transport.bulk_out(EP_OUT, cmd, BULK_TIMEOUT).await {
            Ok(written) if written == cmd.len() => Ok(()),
            Ok(written) => {
                debug!("short command write: {written} of {} bytes", cmd.len());
                Err(SsmError::Io)
            }
            Err(error) => {
                debug!("command write failed: {error}");
                Err(ssm_error(error))
            }
        };
        events.push(move |dev| done(dev, &ssm, result));
    });
}

/// Read a fixed-size response; anything shorter or longer is an I/O
/// failure. `timeout` of `None` waits until the device answers or the
/// session cancels the read.
pub(crate) fn read_response<D, F>(
    dev: &D,
    ssm: &Ssm<D>,
    len: usize,
    timeout: Option<Duration>,
    done: F,
) where
    D: AesSession,
    F: FnOnce(&mut D, &Ssm<D>, Result<Vec<u8>, SsmError>) + Send + 'static,
{
    let transport = dev.transport().clone();
    let events = dev.events().clone();
    let ssm = ssm.clone();
    tokio::spawn(async move {
        let result = match transport.bulk_in(EP_IN, len, timeout).await {
            Ok(data) if data.len() == len => Ok(data),
            Ok(data) => {
                debug!("short response: {} of {len} bytes", data.len());
                Err(SsmError::Io)
            }
            Err(error) => {
                debug!("response read failed: {error}");
                Err(ssm_error(error))
            }
        };
        events.push(move |dev| done(dev, &ssm, result));
    });
}

/// Read up to `len` stream bytes, passing through whatever arrived.
pub(crate) fn read_data<D, F>(dev: &D, ssm: &Ssm<D>, len: usize, done: F)
where
    D: AesSession,
    F: FnOnce(&mut D, &Ssm<D>, Result<Vec<u8>, SsmError>) + Send + 'static,
{
    let transport = dev.transport().clone();
    let events = dev.events().clone();
    let ssm = ssm.clone();
    tokio::spawn(async move {
        let result = transport
            .bulk_in(EP_IN, len, Some(BULK_TIMEOUT))
            .await
            .map_err(|error| {
                debug!("stream read failed: {error}");
                ssm_error(error)
            });
        events.push(move |dev| done(dev, &ssm, result));
    });
}

/// Continuation for command writes that advance the phase.
pub(crate) fn cmd_sent<D: AesSession>(_dev: &mut D, ssm: &Ssm<D>, result: Outcome) {
    match result {
        Ok(()) => ssm.next_state(),
        Err(error) => ssm.mark_aborted(error),
    }
}

/// Continuation for the final command of a phase.
pub(crate) fn complete_on_sent<D: AesSession>(_dev: &mut D, ssm: &Ssm<D>, result: Outcome) {
    match result {
        Ok(()) => ssm.mark_completed(),
        Err(error) => ssm.mark_aborted(error),
    }
}

/// Spawn the dedicated worker thread that owns a session.
///
/// The worker drains the session's event queue on a current-thread runtime;
/// once shut down it releases the claimed interface, reports the close and
/// resolves the returned receiver.
pub(crate) fn spawn_session<D: AesSession>(
    thread_name: &str,
    event_loop: EventLoop<D>,
) -> io::Result<(JoinHandle<()>, oneshot::Receiver<()>)> {
    let (closed_tx, closed_rx) = oneshot::channel();
    let worker = std::thread::Builder::new()
        .name(thread_name.into())
        .spawn(move || {
            let _ = catch_unwind(AssertUnwindSafe(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("tokio runtime");
                runtime.block_on(async move {
                    let mut session = event_loop.run().await;
                    if let Err(error) = session
                        .transport()
                        .release_interface(USB_INTERFACE)
                        .await
                    {
                        warn!("failed to release interface {USB_INTERFACE}: {error}");
                    }
                    session.sink_mut().on_close_complete();
                    let _ = closed_tx.send(());
                });
            }));
        })
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("failed to spawn session worker: {e}"),
            )
        })?;
    Ok((worker, closed_rx))
}
