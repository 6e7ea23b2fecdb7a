//! The framed byte buffer carrying one message.
//!
//! A [Stream] is a sequence of 512 byte frames taken from a shared pool. Frame 0 starts
//! with the 48 byte [StreamHead], the body follows. Appending past the tail takes a new
//! frame and never moves written bytes.
//!
//! Value encoding and decoding live in the `codec` submodule.

use std::fmt;
use xxhash_rust::xxh3::Xxh3;
use zerocopy::{FromBytes, IntoBytes};

mod codec;
pub use codec::MAX_VALUE_DEPTH;
mod frame;
pub use frame::FRAME_SIZE;
use frame::{Frame, acquire_frame, release_frame};
mod head;
pub use head::*;

/// A position inside the stream, as (frame index, byte index in frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    seg: usize,
    idx: usize,
}

impl Cursor {
    #[inline(always)]
    fn from_pos(pos: usize) -> Self {
        Self { seg: pos / FRAME_SIZE, idx: pos % FRAME_SIZE }
    }

    #[inline(always)]
    fn pos(&self) -> usize {
        self.seg * FRAME_SIZE + self.idx
    }
}

const BODY_START: Cursor = Cursor { seg: 0, idx: STREAM_HEAD_SIZE };

pub struct Stream {
    frames: Vec<Frame>,
    read: Cursor,
    // NOTE: write.idx < FRAME_SIZE and write.seg == frames.len() - 1 always hold
    write: Cursor,
}

impl Stream {
    #[inline]
    pub fn new() -> Self {
        let mut frame = acquire_frame();
        frame[..STREAM_HEAD_SIZE].copy_from_slice(StreamHead::template().as_bytes());
        let mut frames = Vec::with_capacity(1);
        frames.push(frame);
        Self { frames, read: BODY_START, write: BODY_START }
    }

    /// Build from the raw bytes of a complete stream, no check is performed
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < STREAM_HEAD_SIZE {
            return None;
        }
        let mut stream = Self::new();
        stream.set_head_bytes(&buf[..STREAM_HEAD_SIZE]);
        stream.put_bytes(&buf[STREAM_HEAD_SIZE..]);
        Some(stream)
    }

    /// Clear the body and restore the header template, keeps the first frame
    pub fn reset(&mut self) {
        while self.frames.len() > 1 {
            if let Some(frame) = self.frames.pop() {
                release_frame(frame);
            }
        }
        self.frames[0][..STREAM_HEAD_SIZE].copy_from_slice(StreamHead::template().as_bytes());
        self.read = BODY_START;
        self.write = BODY_START;
    }

    #[inline(always)]
    pub fn head(&self) -> &StreamHead {
        match StreamHead::ref_from_bytes(&self.frames[0][..STREAM_HEAD_SIZE]) {
            Ok(head) => head,
            Err(_) => unreachable!(),
        }
    }

    #[inline(always)]
    pub fn head_mut(&mut self) -> &mut StreamHead {
        match StreamHead::mut_from_bytes(&mut self.frames[0][..STREAM_HEAD_SIZE]) {
            Ok(head) => head,
            Err(_) => unreachable!(),
        }
    }

    #[inline]
    pub fn head_bytes(&self) -> &[u8] {
        &self.frames[0][..STREAM_HEAD_SIZE]
    }

    /// Overwrite the header, `buf` must hold at least 48 bytes
    #[inline]
    pub fn set_head_bytes(&mut self, buf: &[u8]) {
        self.frames[0][..STREAM_HEAD_SIZE].copy_from_slice(&buf[..STREAM_HEAD_SIZE]);
    }

    /// Copy routing fields (everything but length and checksum) from another stream
    pub fn copy_head_from(&mut self, other: &Stream) {
        let src = other.head();
        let dst = self.head_mut();
        dst.version = src.version;
        dst.status = src.status;
        dst.kind = src.kind;
        dst.priority = src.priority;
        dst.zone_id = src.zone_id;
        dst.target_id = src.target_id;
        dst.source_id = src.source_id;
        dst.gateway_id = src.gateway_id;
        dst.session_id = src.session_id;
        dst.callback_id = src.callback_id;
        dst.depth = src.depth;
    }

    #[inline]
    pub fn get_version(&self) -> u8 {
        self.head().version
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.head_mut().version = v;
    }

    #[inline]
    pub fn get_status_bit_debug(&self) -> bool {
        self.head().status & STATUS_BIT_DEBUG != 0
    }

    #[inline]
    pub fn set_status_bit_debug(&mut self, on: bool) {
        let head = self.head_mut();
        if on {
            head.status |= STATUS_BIT_DEBUG;
        } else {
            head.status &= !STATUS_BIT_DEBUG;
        }
    }

    /// Raw kind byte
    #[inline]
    pub fn get_kind(&self) -> u8 {
        self.head().kind
    }

    /// None for an unknown kind byte
    #[inline]
    pub fn kind(&self) -> Option<StreamKind> {
        StreamKind::from_repr(self.head().kind)
    }

    #[inline]
    pub fn set_kind(&mut self, kind: StreamKind) {
        self.head_mut().kind = kind as u8;
    }

    #[inline]
    pub fn get_priority(&self) -> u8 {
        self.head().priority
    }

    #[inline]
    pub fn set_priority(&mut self, v: u8) {
        self.head_mut().priority = v;
    }

    #[inline]
    pub fn get_length(&self) -> u32 {
        self.head().length.get()
    }

    #[inline]
    pub fn get_checksum(&self) -> u64 {
        self.head().checksum.get()
    }

    #[inline]
    pub fn get_zone_id(&self) -> u16 {
        self.head().zone_id.get()
    }

    #[inline]
    pub fn set_zone_id(&mut self, v: u16) {
        self.head_mut().zone_id.set(v);
    }

    #[inline]
    pub fn get_target_id(&self) -> u32 {
        self.head().target_id.get()
    }

    #[inline]
    pub fn set_target_id(&mut self, v: u32) {
        self.head_mut().target_id.set(v);
    }

    #[inline]
    pub fn get_source_id(&self) -> u32 {
        self.head().source_id.get()
    }

    #[inline]
    pub fn set_source_id(&mut self, v: u32) {
        self.head_mut().source_id.set(v);
    }

    #[inline]
    pub fn get_gateway_id(&self) -> u32 {
        self.head().gateway_id.get()
    }

    #[inline]
    pub fn set_gateway_id(&mut self, v: u32) {
        self.head_mut().gateway_id.set(v);
    }

    #[inline]
    pub fn get_session_id(&self) -> u64 {
        self.head().session_id.get()
    }

    #[inline]
    pub fn set_session_id(&mut self, v: u64) {
        self.head_mut().session_id.set(v);
    }

    #[inline]
    pub fn get_callback_id(&self) -> u64 {
        self.head().callback_id.get()
    }

    #[inline]
    pub fn set_callback_id(&mut self, v: u64) {
        self.head_mut().callback_id.set(v);
    }

    #[inline]
    pub fn get_depth(&self) -> u16 {
        self.head().depth.get()
    }

    #[inline]
    pub fn set_depth(&mut self, v: u16) {
        self.head_mut().depth.set(v);
    }

    /// Control streams carry callback id 0
    #[inline]
    pub fn is_control(&self) -> bool {
        self.get_callback_id() == 0
    }

    #[inline(always)]
    pub fn get_read_pos(&self) -> usize {
        self.read.pos()
    }

    /// Move the read cursor, fails when pos is beyond the written bytes
    #[inline]
    pub fn set_read_pos(&mut self, pos: usize) -> bool {
        if pos > self.write.pos() {
            return false;
        }
        self.read = Cursor::from_pos(pos);
        true
    }

    #[inline]
    pub fn set_read_pos_to_body_start(&mut self) {
        self.read = BODY_START;
    }

    #[inline(always)]
    pub fn get_write_pos(&self) -> usize {
        self.write.pos()
    }

    /// Move the write cursor inside the body, frames past the new tail return to the pool
    pub fn set_write_pos(&mut self, pos: usize) -> bool {
        if pos < STREAM_HEAD_SIZE {
            return false;
        }
        let cur = self.write.pos();
        if pos > cur {
            self.put_zeros(pos - cur);
            return true;
        }
        let target = Cursor::from_pos(pos);
        while self.frames.len() > target.seg + 1 {
            if let Some(frame) = self.frames.pop() {
                release_frame(frame);
            }
        }
        self.write = target;
        if self.read.pos() > pos {
            self.read = target;
        }
        true
    }

    /// Bytes left between the read and the write cursor
    #[inline(always)]
    pub fn readable(&self) -> usize {
        self.write.pos() - self.read.pos()
    }

    #[inline(always)]
    pub fn is_read_finish(&self) -> bool {
        self.read == self.write
    }

    #[inline(always)]
    fn grow(&mut self) {
        self.frames.push(acquire_frame());
        self.write.seg += 1;
        self.write.idx = 0;
    }

    #[inline(always)]
    pub(crate) fn put_byte(&mut self, b: u8) {
        self.frames[self.write.seg][self.write.idx] = b;
        self.write.idx += 1;
        if self.write.idx == FRAME_SIZE {
            self.grow();
        }
    }

    /// Append raw bytes to the body
    #[inline(always)]
    pub fn put_bytes(&mut self, b: &[u8]) {
        let end = self.write.idx + b.len();
        if end < FRAME_SIZE {
            self.frames[self.write.seg][self.write.idx..end].copy_from_slice(b);
            self.write.idx = end;
            return;
        }
        self.put_bytes_slow(b);
    }

    fn put_bytes_slow(&mut self, mut b: &[u8]) {
        while !b.is_empty() {
            let n = std::cmp::min(FRAME_SIZE - self.write.idx, b.len());
            let idx = self.write.idx;
            self.frames[self.write.seg][idx..idx + n].copy_from_slice(&b[..n]);
            self.write.idx += n;
            b = &b[n..];
            if self.write.idx == FRAME_SIZE {
                self.grow();
            }
        }
    }

    fn put_zeros(&mut self, mut n: usize) {
        while n > 0 {
            let m = std::cmp::min(FRAME_SIZE - self.write.idx, n);
            let idx = self.write.idx;
            self.frames[self.write.seg][idx..idx + m].fill(0);
            self.write.idx += m;
            n -= m;
            if self.write.idx == FRAME_SIZE {
                self.grow();
            }
        }
    }

    /// Overwrite already written bytes at an absolute position
    pub(crate) fn put_bytes_at(&mut self, pos: usize, b: &[u8]) -> bool {
        if pos + b.len() > self.write.pos() {
            return false;
        }
        let mut cur = Cursor::from_pos(pos);
        let mut b = b;
        while !b.is_empty() {
            let n = std::cmp::min(FRAME_SIZE - cur.idx, b.len());
            self.frames[cur.seg][cur.idx..cur.idx + n].copy_from_slice(&b[..n]);
            b = &b[n..];
            cur.seg += 1;
            cur.idx = 0;
        }
        true
    }

    /// Copy bytes at an absolute position without moving the read cursor
    pub(crate) fn peek_bytes_at(&self, pos: usize, out: &mut [u8]) -> bool {
        if pos + out.len() > self.write.pos() {
            return false;
        }
        let mut cur = Cursor::from_pos(pos);
        let mut off = 0;
        while off < out.len() {
            let n = std::cmp::min(FRAME_SIZE - cur.idx, out.len() - off);
            out[off..off + n].copy_from_slice(&self.frames[cur.seg][cur.idx..cur.idx + n]);
            off += n;
            cur.seg += 1;
            cur.idx = 0;
        }
        true
    }

    #[inline(always)]
    pub(crate) fn peek_byte(&self) -> Option<u8> {
        if self.read == self.write {
            return None;
        }
        Some(self.frames[self.read.seg][self.read.idx])
    }

    #[inline(always)]
    pub(crate) fn peek_byte_at(&self, pos: usize) -> Option<u8> {
        if pos >= self.write.pos() {
            return None;
        }
        let cur = Cursor::from_pos(pos);
        Some(self.frames[cur.seg][cur.idx])
    }

    #[inline(always)]
    fn advance(&mut self, n: usize) {
        let pos = self.read.pos() + n;
        self.read = Cursor::from_pos(pos);
    }

    /// Read `N` bytes, fails without moving on short read
    #[inline(always)]
    pub(crate) fn get_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        let end = self.read.idx + N;
        if end < FRAME_SIZE && (self.read.seg < self.write.seg || end <= self.write.idx) {
            out.copy_from_slice(&self.frames[self.read.seg][self.read.idx..end]);
            self.read.idx = end;
            return Some(out);
        }
        if !self.peek_bytes_at(self.read.pos(), &mut out) {
            return None;
        }
        self.advance(N);
        Some(out)
    }

    /// Read `n` bytes into a new vector, fails without moving on short read
    pub(crate) fn get_vec(&mut self, n: usize) -> Option<Vec<u8>> {
        if n > self.readable() {
            return None;
        }
        let mut out = vec![0u8; n];
        if !self.peek_bytes_at(self.read.pos(), &mut out) {
            return None;
        }
        self.advance(n);
        Some(out)
    }

    #[inline(always)]
    pub(crate) fn skip_bytes(&mut self, n: usize) -> bool {
        if n > self.readable() {
            return false;
        }
        self.advance(n);
        true
    }

    /// Iterate over the written bytes frame by frame, header included
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let last = self.write.seg;
        let last_len = self.write.idx;
        self.frames.iter().enumerate().filter_map(move |(i, frame)| {
            if i < last {
                Some(&frame[..])
            } else if i == last && last_len > 0 {
                Some(&frame[..last_len])
            } else {
                None
            }
        })
    }

    /// The whole stream as contiguous bytes
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.get_write_pos());
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Body bytes only
    pub fn body_to_vec(&self) -> Vec<u8> {
        let mut all = self.to_vec();
        all.drain(..STREAM_HEAD_SIZE);
        all
    }

    fn calc_checksum(&self) -> u64 {
        let mut hasher = Xxh3::new();
        let mut pos = 0;
        for seg in self.segments() {
            let end = pos + seg.len();
            if pos == 0 {
                hasher.update(&seg[..CHECKSUM_START]);
                hasher.update(&seg[CHECKSUM_END..]);
            } else {
                hasher.update(seg);
            }
            pos = end;
        }
        hasher.digest()
    }

    /// Fill length and checksum, call before sending
    pub fn build_stream_check(&mut self) {
        let len = self.get_write_pos() as u32;
        self.head_mut().length.set(len);
        let sum = self.calc_checksum();
        self.head_mut().checksum.set(sum);
    }

    /// Verify version, length and checksum of a received stream
    pub fn check_stream(&self) -> bool {
        let head = self.head();
        if head.version != STREAM_VERSION {
            return false;
        }
        let len = head.length.get() as usize;
        if len < STREAM_HEAD_SIZE || len != self.get_write_pos() {
            return false;
        }
        head.checksum.get() == self.calc_checksum()
    }
}

impl Default for Stream {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter() {
            let mut f = acquire_frame();
            f.copy_from_slice(&frame[..]);
            frames.push(f);
        }
        Self { frames, read: self.read, write: self.write }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            release_frame(frame);
        }
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        if self.get_write_pos() != other.get_write_pos() {
            return false;
        }
        self.segments().zip(other.segments()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Stream(kind={} session={} callback={} depth={} len={})",
            self.get_kind(),
            self.get_session_id(),
            self.get_callback_id(),
            self.get_depth(),
            self.get_write_pos()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stream() {
        let s = Stream::new();
        assert_eq!(s.get_version(), 1);
        assert_eq!(s.get_write_pos(), STREAM_HEAD_SIZE);
        assert_eq!(s.get_read_pos(), STREAM_HEAD_SIZE);
        assert!(s.is_control());
        assert!(s.is_read_finish());
    }

    #[test]
    fn test_head_fields() {
        let mut s = Stream::new();
        s.set_kind(StreamKind::RpcRequest);
        s.set_status_bit_debug(true);
        s.set_zone_id(3);
        s.set_target_id(4);
        s.set_source_id(5);
        s.set_gateway_id(6);
        s.set_session_id(7);
        s.set_callback_id(8);
        s.set_depth(9);
        s.set_priority(2);
        assert_eq!(s.kind(), Some(StreamKind::RpcRequest));
        assert!(s.get_status_bit_debug());
        s.set_status_bit_debug(false);
        assert!(!s.get_status_bit_debug());
        let bytes = s.to_vec();
        assert_eq!(bytes[2], 5);
        assert_eq!(&bytes[16..18], &3u16.to_le_bytes());
        assert_eq!(&bytes[18..22], &4u32.to_le_bytes());
        assert_eq!(&bytes[22..26], &5u32.to_le_bytes());
        assert_eq!(&bytes[26..30], &6u32.to_le_bytes());
        assert_eq!(&bytes[30..38], &7u64.to_le_bytes());
        assert_eq!(&bytes[38..46], &8u64.to_le_bytes());
        assert_eq!(&bytes[46..48], &9u16.to_le_bytes());

        let mut t = Stream::new();
        t.copy_head_from(&s);
        assert_eq!(t.get_callback_id(), 8);
        assert_eq!(t.get_depth(), 9);
        assert_eq!(t.get_priority(), 2);
    }

    #[test]
    fn test_grow_and_truncate() {
        let mut s = Stream::new();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        s.put_bytes(&data);
        assert_eq!(s.get_write_pos(), STREAM_HEAD_SIZE + 2000);
        assert_eq!(s.body_to_vec(), data);
        assert!(s.set_write_pos(600));
        assert_eq!(s.get_write_pos(), 600);
        assert_eq!(s.body_to_vec(), &data[..600 - STREAM_HEAD_SIZE]);
        assert!(!s.set_write_pos(10));
        s.reset();
        assert_eq!(s.get_write_pos(), STREAM_HEAD_SIZE);
    }

    #[test]
    fn test_frame_boundary_write() {
        let mut s = Stream::new();
        s.put_bytes(&[1u8; FRAME_SIZE - STREAM_HEAD_SIZE]);
        assert_eq!(s.get_write_pos(), FRAME_SIZE);
        s.put_byte(2);
        assert_eq!(s.get_write_pos(), FRAME_SIZE + 1);
        assert!(s.set_read_pos(FRAME_SIZE - 1));
        assert_eq!(s.get_array::<2>(), Some([1, 2]));
        assert_eq!(s.get_array::<1>(), None);
        assert!(!s.set_read_pos(FRAME_SIZE + 2));
    }

    #[test]
    fn test_checksum() {
        let mut s = Stream::new();
        s.set_kind(StreamKind::RpcRequest);
        s.set_callback_id(1);
        s.put_bytes(&[7u8; 700]);
        assert!(!s.check_stream());
        s.build_stream_check();
        assert!(s.check_stream());
        let raw = s.to_vec();
        assert_eq!(raw.len(), s.get_length() as usize);
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut flipped = raw.clone();
                flipped[byte] ^= 1 << bit;
                let t = Stream::from_bytes(&flipped).expect("from_bytes");
                assert!(!t.check_stream(), "flip byte {} bit {}", byte, bit);
            }
        }
        let t = Stream::from_bytes(&raw).expect("from_bytes");
        assert!(t.check_stream());
        assert_eq!(t, s);
        assert_eq!(s.clone(), s);
    }
}
