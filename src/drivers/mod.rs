//! Collection of supported sensor drivers.

mod aes;
pub mod aes1660;
pub mod aes2550;
pub mod img_driver;

pub use aes1660::Aes1660Driver;
pub use aes2550::Aes2550Driver;
pub use img_driver::{ActivateMode, DriverInfo, ImageSink, ScanKind};
