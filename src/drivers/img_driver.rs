//! Shared surface between the sensor drivers and their host library.

use crate::image::Image;
use crate::ssm::SsmError;
use crate::usb::UsbId;

/// How a sensor family scans a finger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// The finger sweeps across a narrow sensor bar.
    Swipe,
    /// The finger rests on a full-size sensor.
    Press,
}

/// What the host wants the session to wait for; passed to `activate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateMode {
    AwaitFingerOn,
    Capture,
    AwaitFingerOff,
}

/// Registration data for one driver family.
#[derive(Debug, Clone, Copy)]
pub struct DriverInfo {
    pub name: &'static str,
    pub full_name: &'static str,
    pub id_table: &'static [UsbId],
    pub scan_kind: ScanKind,
    /// Frame width in pixels; image height varies with the swipe.
    pub img_width: usize,
    /// Minimum bozorth3 score considered a match for this sensor.
    pub bz3_threshold: u32,
}

/// Callbacks a session delivers from its worker.
///
/// Everything here runs on the session's worker thread, so implementations
/// should hand results off rather than block.
pub trait ImageSink: Send + 'static {
    /// The activate requested earlier has finished.
    fn on_activate_complete(&mut self, result: Result<(), SsmError>);

    /// A finger arrived on (`true`) or left (`false`) the sensor.
    fn on_finger_status(&mut self, present: bool);

    /// A swipe was captured and assembled.
    fn on_image_captured(&mut self, image: Image);

    /// The deactivation requested earlier has finished.
    fn on_deactivate_complete(&mut self);

    /// The session worker has torn down and released the device.
    fn on_close_complete(&mut self);

    /// A phase failed mid-session; the session is left deactivated.
    fn on_session_error(&mut self, error: SsmError);
}
