// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Zero-copy byte views and write sinks.
//!
//! `DataBuffer` is a position/limit read view: callers here only ever read
//! forward through a borrowed slice, they never interleave reads and writes
//! on the same region. `DataOutBuffer` is the write side: one
//! fixed-capacity implementation over externally owned memory (the socket
//! scratch area) and one growable implementation used as overflow when a
//! sized frame doesn't fit.

/// A read-only, position-tracked view over a byte slice.
///
/// Handed to a [`crate::service::Codec::decode`] implementation and to
/// [`crate::encoder::BlockEncoder`] as its source. `decode` must not retain
/// references to the underlying memory past the call; the borrow checker
/// enforces that directly since `DataBuffer<'a>` only lives as long as the
/// slice it was built from.
#[derive(Debug, Clone, Copy)]
pub struct DataBuffer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> DataBuffer<'a> {
    /// Wrap a byte slice for reading from the start.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// `true` once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread region, as a slice.
    pub fn as_slice(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    /// How many bytes have been consumed so far. Callers that decode in a
    /// loop use this to know how much to drain from the owning read buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Mark `n` bytes as consumed. `n` may not exceed `remaining()`.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.remaining(),
            "advanced DataBuffer past its remaining {} bytes by {}",
            self.remaining(),
            n
        );
        self.pos += n;
    }
}

/// A write sink an [`crate::encoder::Encoder`] streams bytes into.
///
/// Narrows the contract to exactly what an encoder needs: how much room is
/// left, a bulk copy from a `DataBuffer`, and a must-succeed `write`.
pub trait DataOutBuffer {
    /// Remaining capacity. `i64` (not `usize`) because a dynamic sink
    /// reports an effectively unbounded amount of room without needing a
    /// sentinel.
    fn available(&self) -> i64;

    /// Copy `min(src.remaining(), self.available())` bytes from `src`,
    /// advancing both. Returns the number of bytes copied.
    fn copy(&mut self, src: &mut DataBuffer<'_>) -> usize;

    /// Write `bytes` in full. This must fully succeed or raise a programming
    /// error: callers (encoders) are expected to have already checked
    /// `available()` before calling, so a short write here indicates a
    /// contract violation, not a recoverable I/O condition.
    fn write(&mut self, bytes: &[u8]);
}

/// A fixed-capacity sink over externally owned memory: the worker's
/// socket-backed write scratch area.
pub struct FixedOutBuffer<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> FixedOutBuffer<'a> {
    /// Wrap a scratch slice for writing from the start.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes written so far; the portion of the scratch area to flush to
    /// the socket.
    pub fn written(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }
}

impl DataOutBuffer for FixedOutBuffer<'_> {
    fn available(&self) -> i64 {
        (self.bytes.len() - self.pos) as i64
    }

    fn copy(&mut self, src: &mut DataBuffer<'_>) -> usize {
        let n = src.remaining().min(self.available().max(0) as usize);
        self.bytes[self.pos..self.pos + n].copy_from_slice(&src.as_slice()[..n]);
        self.pos += n;
        src.advance(n);
        n
    }

    fn write(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() as i64 <= self.available(),
            "write of {} bytes exceeds available {} bytes in fixed out buffer",
            bytes.len(),
            self.available()
        );
        self.bytes[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// A growable overflow sink used when a sized frame does not fit the
/// worker's scratch buffer.
#[derive(Debug, Default)]
pub struct DynamicOutBuffer {
    bytes: Vec<u8>,
}

impl DynamicOutBuffer {
    /// An empty overflow buffer, growing on demand.
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Pre-size the overflow buffer for a known frame length.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Consume this sink, yielding the accumulated bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl DataOutBuffer for DynamicOutBuffer {
    fn available(&self) -> i64 {
        i64::MAX
    }

    fn copy(&mut self, src: &mut DataBuffer<'_>) -> usize {
        let n = src.remaining();
        self.bytes.extend_from_slice(src.as_slice());
        src.advance(n);
        n
    }

    fn write(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_buffer_advances() {
        let mut buf = DataBuffer::new(b"hello world");
        assert_eq!(buf.remaining(), 11);
        buf.advance(6);
        assert_eq!(buf.as_slice(), b"world");
        assert!(!buf.is_empty());
        buf.advance(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn fixed_out_buffer_copy_truncates_to_available() {
        let mut scratch = [0u8; 4];
        let mut out = FixedOutBuffer::new(&mut scratch);
        let mut src = DataBuffer::new(b"hello world");

        let copied = out.copy(&mut src);
        assert_eq!(copied, 4);
        assert_eq!(out.written(), b"hell");
        assert_eq!(src.remaining(), 7);
    }

    #[test]
    #[should_panic(expected = "exceeds available")]
    fn fixed_out_buffer_write_past_capacity_panics() {
        let mut scratch = [0u8; 2];
        let mut out = FixedOutBuffer::new(&mut scratch);
        out.write(b"abc");
    }

    #[test]
    fn dynamic_out_buffer_grows_unbounded() {
        let mut out = DynamicOutBuffer::new();
        let mut src = DataBuffer::new(&[1u8; 70_000]);
        let copied = out.copy(&mut src);
        assert_eq!(copied, 70_000);
        assert_eq!(out.into_bytes().len(), 70_000);
    }
}
