//! Image-capture drivers for AuthenTec swipe-style USB fingerprint sensors.
//!
//! Each opened sensor gets a session worker that serialises every piece of
//! driver work onto one thread; device phases (activate, finger detection,
//! capture, deactivate) run as sequential state machines on that worker and
//! report back through the session's [`ImageSink`]. Strip frames captured
//! from a swipe are reassembled into a single image of per-swipe height by
//! the [`assemble`] engine.

pub mod assemble;
pub mod drivers;
pub mod frames;
pub mod image;
pub mod ssm;
pub mod testing;
pub mod usb;

pub use drivers::{ActivateMode, Aes1660Driver, Aes2550Driver, DriverInfo, ImageSink, ScanKind};
pub use image::{Image, ImageFlags};
pub use ssm::SsmError;
pub use usb::{LibusbTransport, Transport, TransferError, UsbId};
