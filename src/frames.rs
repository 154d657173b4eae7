//! Length-prefixed framing of the sensor bulk-IN stream.
//!
//! The sensors front every message with a 3-byte header: an opcode and two
//! length bytes covering the payload that follows. Bulk reads return the
//! stream in whatever chunks the endpoint happens to complete, so the
//! decoder keeps a reassembly buffer across reads and yields a message only
//! once the whole frame is in.

use log::debug;

/// Bytes in the `{magic, len, len}` header.
pub const FRAME_HEADER_LEN: usize = 3;

/// Wire-format parameters for one sensor family.
#[derive(Debug, Clone, Copy)]
pub struct FrameFormat {
    /// Opcode of an image-strip frame.
    pub strip_magic: u8,
    /// Opcode of a heartbeat frame.
    pub heartbeat_magic: u8,
    /// True when the high length byte precedes the low one.
    pub len_big_endian: bool,
}

/// One reassembled message from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An image strip; the payload layout is family specific.
    Strip(Vec<u8>),
    /// No strip data for the programmed interval.
    Heartbeat(Vec<u8>),
}

/// Opcode the decoder cannot classify; the length bytes after it cannot be
/// trusted, so the stream is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadMagic(pub u8);

/// Incremental frame reassembler.
#[derive(Debug)]
pub struct FrameDecoder {
    format: FrameFormat,
    buf: Vec<u8>,
    /// Bytes wanted before the next parse step: the header length until the
    /// header is in, then the full frame length.
    max: usize,
}

impl FrameDecoder {
    pub fn new(format: FrameFormat) -> Self {
        FrameDecoder {
            format,
            buf: Vec::with_capacity(FRAME_HEADER_LEN),
            max: FRAME_HEADER_LEN,
        }
    }

    /// Buffered bytes still waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed one bulk-IN completion, appending finished frames to `frames`.
    ///
    /// Every byte of `data` is consumed; residual bytes stay buffered for
    /// the next call and never exceed one frame.
    pub fn push(&mut self, mut data: &[u8], frames: &mut Vec<Frame>) -> Result<(), BadMagic> {
        loop {
            let want = self.max - self.buf.len();
            let take = want.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buf.len() < self.max {
                debug_assert!(data.is_empty());
                return Ok(());
            }

            if self.max == FRAME_HEADER_LEN {
                let magic = self.buf[0];
                if magic != self.format.strip_magic && magic != self.format.heartbeat_magic {
                    debug!("bogus frame magic {magic:#04x}");
                    self.reset();
                    return Err(BadMagic(magic));
                }
                let (hi, lo) = if self.format.len_big_endian {
                    (self.buf[1], self.buf[2])
                } else {
                    (self.buf[2], self.buf[1])
                };
                let len = usize::from(hi) << 8 | usize::from(lo);
                self.max = FRAME_HEADER_LEN + len;
                if len > 0 {
                    continue;
                }
            }

            let magic = self.buf[0];
            let payload = self.buf.split_off(FRAME_HEADER_LEN);
            frames.push(if magic == self.format.strip_magic {
                Frame::Strip(payload)
            } else {
                Frame::Heartbeat(payload)
            });
            self.reset();

            if data.is_empty() {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.max = FRAME_HEADER_LEN;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: FrameFormat = FrameFormat {
        strip_magic: 0x49,
        heartbeat_magic: 0xdb,
        len_big_endian: false,
    };

    const STREAM: [u8; 11] = [
        0x49, 0x04, 0x00, 0xa0, 0xa1, 0xa2, 0xa3, // strip, 4 payload bytes
        0xdb, 0x01, 0x00, 0xff, // heartbeat, 1 payload byte
    ];

    fn expected() -> Vec<Frame> {
        vec![
            Frame::Strip(vec![0xa0, 0xa1, 0xa2, 0xa3]),
            Frame::Heartbeat(vec![0xff]),
        ]
    }

    #[test]
    fn reframes_across_every_chunk_split() {
        for split in 0..=STREAM.len() {
            let mut decoder = FrameDecoder::new(FORMAT);
            let mut frames = Vec::new();
            decoder.push(&STREAM[..split], &mut frames).unwrap();
            decoder.push(&STREAM[split..], &mut frames).unwrap();
            assert_eq!(frames, expected(), "split at {split}");
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn reframes_byte_at_a_time() {
        let mut decoder = FrameDecoder::new(FORMAT);
        let mut frames = Vec::new();
        for byte in STREAM {
            decoder.push(&[byte], &mut frames).unwrap();
        }
        assert_eq!(frames, expected());
    }

    #[test]
    fn consumes_every_byte_it_is_given() {
        // Frames of assorted payload lengths, including empty.
        let lengths = [0usize, 1, 7, 300];
        let mut stream = Vec::new();
        for (i, len) in lengths.into_iter().enumerate() {
            stream.push(if i % 2 == 0 { 0x49 } else { 0xdb });
            stream.push((len & 0xff) as u8);
            stream.push((len >> 8) as u8);
            stream.extend(std::iter::repeat_n(i as u8, len));
        }
        for chunk in [1usize, 2, 3, 5, 64] {
            let mut decoder = FrameDecoder::new(FORMAT);
            let mut frames = Vec::new();
            for piece in stream.chunks(chunk) {
                decoder.push(piece, &mut frames).unwrap();
            }
            assert_eq!(frames.len(), lengths.len(), "chunk size {chunk}");
            let payload_total: usize = frames
                .iter()
                .map(|f| match f {
                    Frame::Strip(p) | Frame::Heartbeat(p) => p.len(),
                })
                .sum();
            assert_eq!(
                payload_total,
                stream.len() - FRAME_HEADER_LEN * frames.len()
            );
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn big_endian_lengths_are_honoured() {
        let format = FrameFormat {
            strip_magic: 0x0d,
            heartbeat_magic: 0xdb,
            len_big_endian: true,
        };
        let mut stream = vec![0x0d, 0x01, 0x02]; // length 0x0102
        stream.extend(std::iter::repeat_n(0x55, 0x0102));
        let mut decoder = FrameDecoder::new(format);
        let mut frames = Vec::new();
        decoder.push(&stream, &mut frames).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], Frame::Strip(vec![0x55; 0x0102]));
    }

    #[test]
    fn unknown_magic_is_a_protocol_error() {
        let mut decoder = FrameDecoder::new(FORMAT);
        let mut frames = Vec::new();
        assert_eq!(
            decoder.push(&[0x00, 0x01, 0x00], &mut frames),
            Err(BadMagic(0x00))
        );
        assert!(frames.is_empty());
    }
}
