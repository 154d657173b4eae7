//! Reassembly of swipe frames into a single contiguous image.
//!
//! A swipe sensor samples the finger at preprogrammed intervals, sending a
//! narrow frame each time. Unless the finger moves unreasonably fast the
//! frames overlap, and the number of useful frames depends on how long the
//! swipe lasted; both facts together mean the finished image has a height
//! known only after the overlap between every consecutive pair has been
//! measured. Scan direction is unknown as well, so both directions are
//! assembled and the one that lines up better wins.

use log::debug;

use crate::image::{Image, ImageFlags};

/// Rows in every frame produced by the supported sensors.
pub const FRAME_HEIGHT: usize = 8;

/// Expand packed 4-bit samples to one byte per pixel, stretching the 16
/// grey levels over the full byte range.
fn unpack_frame(packed: &[u8], out: &mut [u8]) {
    for (i, byte) in packed.iter().enumerate() {
        out[i * 2] = (byte >> 4) * 17;
        out[i * 2 + 1] = (byte & 0x0f) * 17;
    }
}

/// Find by how many rows the frame at `second` extends the image below the
/// frame at `first`.
///
/// For each candidate non-overlap `dy` the trailing `height - dy` rows of
/// the first frame are compared with the leading rows of the second; the
/// summed difference is normalised as `sum * 15 / count` so candidates of
/// different sizes compare fairly. Ties keep the smaller `dy`.
fn find_overlap(buf: &[u8], first: usize, second: usize, width: usize, height: usize) -> (usize, u32) {
    let mut not_overlapped = 0;
    let mut min_error = u32::MAX;
    for dy in 0..height {
        let count = (width * (height - dy)) as u32;
        let mut error: u32 = 0;
        for i in 0..count as usize {
            let a = buf[first + dy * width + i];
            let b = buf[second + i];
            error += u32::from(a.abs_diff(b));
        }
        error = error * 15 / count;
        if error < min_error {
            min_error = error;
            not_overlapped = dy;
        }
    }
    (not_overlapped, min_error)
}

/// Lay the frames into `out` back to back, then slide each one up over its
/// predecessor by the detected overlap.
///
/// Returns the merged height in rows and the summed minimum error over all
/// consecutive pairs, the figure of merit for the scan direction.
fn assemble(strips: &[Vec<u8>], width: usize, reverse: bool, out: &mut [u8]) -> (usize, u32) {
    let frame_size = width * FRAME_HEIGHT;
    let num = strips.len();
    for (i, strip) in strips.iter().enumerate() {
        let slot = if reverse { num - 1 - i } else { i };
        unpack_frame(strip, &mut out[slot * frame_size..(slot + 1) * frame_size]);
    }

    let mut image_height = FRAME_HEIGHT;
    let mut errors_sum = 0u32;
    let mut assembled = 0;
    let mut output = 0;
    for _ in 1..num {
        output += frame_size;
        let (not_overlapped, min_error) = find_overlap(out, assembled, output, width, FRAME_HEIGHT);
        errors_sum += min_error;
        image_height += not_overlapped;
        assembled += width * not_overlapped;
        out.copy_within(output..output + frame_size, assembled);
    }
    (image_height, errors_sum)
}

/// Merge a capture's strips into the finished image.
///
/// `strips` are packed 4-bit frames, `width * FRAME_HEIGHT / 2` bytes each,
/// in capture order. Both scan directions are assembled; the direction with
/// the smaller summed overlap error is the one the finger actually moved,
/// and a reverse win flips the emitted image on both axes.
pub fn assemble_frames(strips: &[Vec<u8>], width: usize, colors_inverted: bool) -> Image {
    assert!(!strips.is_empty(), "no strips to assemble");
    let frame_size = width * FRAME_HEIGHT;
    let mut forward = vec![0u8; strips.len() * frame_size];
    let mut reversed = vec![0u8; strips.len() * frame_size];
    let (forward_height, errors_sum) = assemble(strips, width, false, &mut forward);
    let (reversed_height, r_errors_sum) = assemble(strips, width, true, &mut reversed);

    let mut flags = ImageFlags {
        colors_inverted,
        ..Default::default()
    };
    let (mut data, height) = if r_errors_sum < errors_sum {
        debug!("reversed scan direction ({r_errors_sum} < {errors_sum})");
        flags.h_flipped = true;
        flags.v_flipped = true;
        (reversed, reversed_height)
    } else {
        debug!("normal scan direction ({errors_sum} <= {r_errors_sum})");
        (forward, forward_height)
    };
    data.truncate(height * width);
    Image {
        width,
        height,
        flags,
        data,
    }
}
