// ===============================
// src/framer.rs
// ===============================
//
// Pemecah stream byte menjadi frame:
// - push()   : tambahkan byte mentah dari socket (tidak pernah blocking)
// - frames() : iterator lazy; bisa dipanggil ulang setelah push berikutnya
// - Frame    = byte sebelum terminator (NUL untuk encoding JSON)
// - Sisa tanpa terminator tetap di buffer sampai push berikutnya
//
use thiserror::Error;

/// One terminator-delimited message, terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame(pub Vec<u8>);

impl RawFrame {
    pub fn as_bytes(&self) -> &[u8] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame exceeds {max} bytes without terminator ({len} buffered), discarded")]
    Oversized { len: usize, max: usize },
}

pub const DEFAULT_TERMINATOR: u8 = 0x00;

#[derive(Debug)]
pub struct ProtocolFramer {
    buf: Vec<u8>,
    /// Start of the frame currently being assembled.
    start: usize,
    /// Everything in `start..scan` is known terminator-free.
    scan: usize,
    max_frame: usize,
    terminator: u8,
    /// Dropping the tail of an oversized frame until the next terminator.
    discarding: bool,
}

impl ProtocolFramer {
    pub fn new(max_frame: usize) -> Self {
        Self::with_terminator(max_frame, DEFAULT_TERMINATOR)
    }

    pub fn with_terminator(max_frame: usize, terminator: u8) -> Self {
        Self { buf: Vec::with_capacity(8 * 1024), start: 0, scan: 0, max_frame: max_frame.max(1), terminator, discarding: false }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // compact consumed prefix before growing
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scan -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize { self.buf.len() - self.start }

    pub fn frames(&mut self) -> Frames<'_> { Frames { framer: self } }

    pub fn next_frame(&mut self) -> Option<Result<RawFrame, FrameError>> {
        loop {
            let found = self.buf[self.scan..].iter().position(|b| *b == self.terminator);
            match found {
                Some(off) => {
                    let end = self.scan + off;
                    let len = end - self.start;
                    let was_discarding = std::mem::replace(&mut self.discarding, false);
                    let span = self.start..end;
                    self.start = end + 1;
                    self.scan = self.start;
                    if was_discarding {
                        continue;
                    }
                    if len > self.max_frame {
                        return Some(Err(FrameError::Oversized { len, max: self.max_frame }));
                    }
                    if len == 0 {
                        continue;
                    }
                    return Some(Ok(RawFrame(self.buf[span].to_vec())));
                }
                None => {
                    self.scan = self.buf.len();
                    let pending = self.buf.len() - self.start;
                    if pending > self.max_frame {
                        // truncate; the rest of this frame is dropped when its terminator shows up
                        self.buf.truncate(self.start);
                        self.scan = self.start;
                        if !self.discarding {
                            self.discarding = true;
                            return Some(Err(FrameError::Oversized { len: pending, max: self.max_frame }));
                        }
                    }
                    return None;
                }
            }
        }
    }
}

/// Lazy frame iterator over whatever is buffered right now.
pub struct Frames<'a> {
    framer: &'a mut ProtocolFramer,
}

impl Iterator for Frames<'_> {
    type Item = Result<RawFrame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> { self.framer.next_frame() }
}
