//! Command tables and wire constants for the AES1660 family.

use crate::frames::FrameFormat;
use crate::usb::UsbId;

pub const FRAME_WIDTH: usize = 128;
pub const FRAME_HEIGHT: usize = 8;
/// Packed 4-bit pixel block carried by one strip frame.
pub const STRIP_SIZE: usize = FRAME_WIDTH * FRAME_HEIGHT / 2;
/// Offset of the pixel data from the strip frame magic byte.
pub const STRIP_OFFSET: usize = 41;

/// Hard cap on frames per capture; bounds a swipe that never ends.
pub const MAX_FRAMES: usize = 400;
/// Minimum LUT-weighted brightness for "finger still on the sensor".
pub const SUM_THRESHOLD: u32 = 50;
/// Bulk read size for the strip stream.
pub const STRIP_READ_LEN: usize = 8192;

// Response opcodes.
pub const ID_MAGIC: u8 = 0x07;
pub const CALIBRATE_MAGIC: u8 = 0x06;
pub const INIT_ACK_MAGIC: u8 = 0x42;
pub const FD_MAGIC: u8 = 0x01;
pub const STRIP_MAGIC: u8 = 0x49;
pub const HEARTBEAT_MAGIC: u8 = 0xdb;
/// Init status reported once the device is fully programmed.
pub const INIT_DONE_STATUS: u8 = 0x23;

// Response sizes, header included.
pub const ID_RESPONSE_LEN: usize = 8;
pub const CALIBRATE_RESPONSE_LEN: usize = 4;
pub const INIT_ACK_LEN: usize = 4;
pub const FD_RESPONSE_LEN: usize = 4;

pub const FRAME_FORMAT: FrameFormat = FrameFormat {
    strip_magic: STRIP_MAGIC,
    heartbeat_magic: HEARTBEAT_MAGIC,
    len_big_endian: false,
};

/// Contrast stretch applied to raw samples while accumulating brightness.
/// Experimental values.
pub const COLOR_LUT: [u8; 16] = [
    0x0, 0x1, 0x5, 0x9, 0xc, 0xe, 0xf, 0xf, 0xf, 0xf, 0xf, 0xf, 0xf, 0xf, 0xf, 0xf,
];

// Host commands, framed like the responses: opcode, length, payload.
pub const SET_IDLE_CMD: &[u8] = &[0x0d, 0x00, 0x00];
pub const READ_ID_CMD: &[u8] = &[0x07, 0x00, 0x00];
pub const CALIBRATE_CMD: &[u8] = &[0x06, 0x00, 0x00];
pub const LED_BLINK_CMD: &[u8] = &[0x0b, 0x02, 0x00, 0x02, 0x01];
pub const LED_SOLID_CMD: &[u8] = &[0x0b, 0x02, 0x00, 0x01, 0x01];
pub const FINGER_DET_CMD: &[u8] = &[0x40, 0x01, 0x00, 0x01];
pub const CAPTURE_CMD: &[u8] = &[0x49, 0x01, 0x00, 0x01];

/// First register programming pass, run before calibration.
pub const INIT_SEQ_1: &[&[u8]] = &[
    &[0x42, 0x02, 0x00, 0x80, 0x01], // master reset
    &[0x42, 0x02, 0x00, 0x95, 0x18],
    &[0x42, 0x02, 0x00, 0xad, 0x00],
    &[0x42, 0x02, 0x00, 0xbd, 0x00],
    &[0x42, 0x02, 0x00, 0xbe, 0x00],
    &[0x42, 0x02, 0x00, 0xcf, 0x01],
];

/// Second pass, run after calibration settles the analog front end.
pub const INIT_SEQ_2: &[&[u8]] = &[
    &[0x42, 0x02, 0x00, 0x80, 0x12],
    &[0x42, 0x02, 0x00, 0x85, 0x3d],
    &[0x42, 0x02, 0x00, 0x8f, 0x07],
    &[0x42, 0x02, 0x00, 0xa8, 0x41],
    &[0x42, 0x02, 0x00, 0x81, 0x01],
];

pub const INIT_SEQS: [&[&[u8]]; 2] = [INIT_SEQ_1, INIT_SEQ_2];

pub const ID_TABLE: &[UsbId] = &[
    UsbId { vendor: 0x08ff, product: 0x1660 },
    UsbId { vendor: 0x08ff, product: 0x1680 },
    UsbId { vendor: 0x08ff, product: 0x1681 },
    UsbId { vendor: 0x08ff, product: 0x1682 },
    UsbId { vendor: 0x08ff, product: 0x1683 },
    UsbId { vendor: 0x08ff, product: 0x1684 },
    UsbId { vendor: 0x08ff, product: 0x1685 },
    UsbId { vendor: 0x08ff, product: 0x1686 },
    UsbId { vendor: 0x08ff, product: 0x1687 },
    UsbId { vendor: 0x08ff, product: 0x1688 },
    UsbId { vendor: 0x08ff, product: 0x1689 },
    UsbId { vendor: 0x08ff, product: 0x168a },
    UsbId { vendor: 0x08ff, product: 0x168b },
    UsbId { vendor: 0x08ff, product: 0x168c },
    UsbId { vendor: 0x08ff, product: 0x168d },
    UsbId { vendor: 0x08ff, product: 0x168e },
    UsbId { vendor: 0x08ff, product: 0x168f },
];
