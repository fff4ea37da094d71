//! Splits a continuous MJPEG byte stream into complete JPEG frames.
//!
//! A frame runs from a start-of-image marker (`FF D8`) to the first
//! end-of-image marker (`FF D9`) after it, inclusive. Bytes outside any frame
//! are a framing error: they are dropped, the error is returned to the caller
//! for logging, and parsing resumes at the next start marker.
//!
//! `FF D8` inside a frame is not treated as a new frame. Quantization and
//! Huffman tables may contain those bytes, and each capture session gets its
//! own demuxer, so a frame is never cut off mid-stream by a restart.

use bytes::{Buf, Bytes, BytesMut};
use nerdcam_common::{Error, Result};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Default upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Incremental JPEG frame splitter.
#[derive(Debug)]
pub struct FrameDemuxer {
    buf: BytesMut,
    max_frame_len: usize,
    /// Offset from which the end-marker search resumes.
    scanned: usize,
}

impl FrameDemuxer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_len,
            scanned: 0,
        }
    }

    /// Append bytes read from the capture process.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, a framing error, or `None` when more input is
    /// needed. Call repeatedly until it returns `None`.
    pub fn next_frame(&mut self) -> Option<Result<Bytes>> {
        let Some(start) = find(&self.buf, &SOI, 0) else {
            // A trailing FF may be the first half of the next start marker.
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let junk = self.buf.len() - keep;
            if junk == 0 {
                return None;
            }
            self.discard(junk);
            return Some(Err(Error::framing(format!(
                "{junk} bytes outside any frame"
            ))));
        };

        if start > 0 {
            self.discard(start);
            return Some(Err(Error::framing(format!(
                "{start} bytes before start of frame"
            ))));
        }

        let from = self.scanned.max(SOI.len());
        match find(&self.buf, &EOI, from) {
            Some(end) => {
                self.scanned = 0;
                Some(Ok(self.buf.split_to(end + EOI.len()).freeze()))
            }
            None => {
                if self.buf.len() > self.max_frame_len {
                    let len = self.buf.len();
                    self.discard(len);
                    return Some(Err(Error::framing(format!(
                        "frame exceeds {} bytes without an end marker",
                        self.max_frame_len
                    ))));
                }
                // Overlap by one byte so a marker split across reads is found.
                self.scanned = self.buf.len().saturating_sub(EOI.len() - 1);
                None
            }
        }
    }

    /// End of stream. Returns an error describing any truncated frame left
    /// in the buffer, which is discarded.
    pub fn finish(&mut self) -> Option<Error> {
        let len = self.buf.len();
        if len == 0 {
            return None;
        }
        self.discard(len);
        Some(Error::framing(format!(
            "stream ended inside a frame ({len} bytes discarded)"
        )))
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.scanned = 0;
    }
}

impl Default for FrameDemuxer {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
