//! Finished fingerprint images handed to the session sink.

/// Presentation hints attached to a captured image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageFlags {
    /// Sample values grow with ridge distance instead of ridge darkness.
    pub colors_inverted: bool,
    /// Mirror horizontally before matching.
    pub h_flipped: bool,
    /// Mirror vertically before matching.
    pub v_flipped: bool,
}

/// A contiguous fingerprint image of fixed width and per-swipe height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub flags: ImageFlags,
    /// `width * height` samples, one byte per pixel, row major.
    pub data: Vec<u8>,
}
