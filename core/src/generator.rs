//! Reassemble streams from arbitrary byte chunks

use crate::error::{ERR_STREAM, ERR_TRANSPORT_STREAM_LENGTH, RpcError};
use crate::stream::{STREAM_HEAD_SIZE, Stream};

/// Push-based reassembler.
///
/// The transport feeds whatever it received, every complete and verified stream is
/// handed to the callback. Never blocks.
pub struct StreamGenerator<F: FnMut(Stream)> {
    head: [u8; STREAM_HEAD_SIZE],
    head_len: usize,
    stream: Option<Stream>,
    expect_len: usize,
    max_len: usize,
    on_stream: F,
}

impl<F: FnMut(Stream)> StreamGenerator<F> {
    pub fn new(max_len: usize, on_stream: F) -> Self {
        Self {
            head: [0u8; STREAM_HEAD_SIZE],
            head_len: 0,
            stream: None,
            expect_len: 0,
            max_len,
            on_stream,
        }
    }

    /// Applies from the next stream head on
    #[inline]
    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }

    /// True when no partial stream is held
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.head_len == 0 && self.stream.is_none()
    }

    /// Drop any partial stream
    #[inline]
    pub fn reset(&mut self) {
        self.head_len = 0;
        self.stream = None;
        self.expect_len = 0;
    }

    /// Feed a chunk, on error the state is reset and the rest of the chunk discarded
    pub fn on_bytes(&mut self, mut buf: &[u8]) -> Result<(), RpcError> {
        while !buf.is_empty() {
            match self.stream.as_mut() {
                None => {
                    let n = std::cmp::min(STREAM_HEAD_SIZE - self.head_len, buf.len());
                    self.head[self.head_len..self.head_len + n].copy_from_slice(&buf[..n]);
                    self.head_len += n;
                    buf = &buf[n..];
                    if self.head_len < STREAM_HEAD_SIZE {
                        return Ok(());
                    }
                    let mut stream = Stream::new();
                    stream.set_head_bytes(&self.head);
                    let len = stream.get_length() as usize;
                    if len < STREAM_HEAD_SIZE {
                        self.reset();
                        return Err(ERR_STREAM.msg(format!("stream length {} too small", len)));
                    }
                    if len > self.max_len {
                        self.reset();
                        return Err(ERR_TRANSPORT_STREAM_LENGTH
                            .msg(format!("stream length {} exceeds {}", len, self.max_len)));
                    }
                    self.expect_len = len;
                    self.stream = Some(stream);
                }
                Some(stream) => {
                    let need = self.expect_len - stream.get_write_pos();
                    let n = std::cmp::min(need, buf.len());
                    stream.put_bytes(&buf[..n]);
                    buf = &buf[n..];
                }
            }
            if let Some(stream) = self.stream.as_ref() {
                if stream.get_write_pos() == self.expect_len {
                    if let Some(stream) = self.stream.take() {
                        self.head_len = 0;
                        self.expect_len = 0;
                        if !stream.check_stream() {
                            return Err(ERR_STREAM.msg("stream check failed"));
                        }
                        (self.on_stream)(stream);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamKind;

    fn build(callback_id: u64, body_len: usize) -> Vec<u8> {
        let mut s = Stream::new();
        s.set_kind(StreamKind::RpcRequest);
        s.set_callback_id(callback_id);
        s.write_string(&"z".repeat(body_len));
        s.build_stream_check();
        s.to_vec()
    }

    #[test]
    fn test_chunked() {
        let mut raw = Vec::new();
        raw.extend(build(1, 10));
        raw.extend(build(2, 1000));
        raw.extend(build(3, 0));
        for chunk in [1usize, 3, 47, 48, 49, 512, 4096] {
            let mut got = Vec::new();
            let mut g = StreamGenerator::new(1 << 20, |s: Stream| got.push(s.get_callback_id()));
            for c in raw.chunks(chunk) {
                g.on_bytes(c).expect("ok");
            }
            drop(g);
            assert_eq!(got, vec![1, 2, 3], "chunk {}", chunk);
        }
    }

    #[test]
    fn test_head_only_stream() {
        let mut s = Stream::new();
        s.set_kind(StreamKind::Ping);
        s.build_stream_check();
        let raw = s.to_vec();
        let mut count = 0;
        let mut g = StreamGenerator::new(1 << 20, |_s: Stream| count += 1);
        g.on_bytes(&raw).expect("ok");
        g.on_bytes(&raw).expect("ok");
        drop(g);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_reject() {
        let mut raw = build(1, 100);
        raw[60] ^= 0x01;
        let mut count = 0;
        let mut g = StreamGenerator::new(1 << 20, |_s: Stream| count += 1);
        assert!(g.on_bytes(&raw).is_err());
        // recovers for the next stream
        g.on_bytes(&build(2, 1)).expect("ok");
        drop(g);
        assert_eq!(count, 1);

        let raw = build(1, 300);
        let mut g = StreamGenerator::new(200, |_s: Stream| {});
        let e = g.on_bytes(&raw).unwrap_err();
        assert!(e == ERR_TRANSPORT_STREAM_LENGTH);

        let mut raw = build(1, 1);
        raw[4..8].copy_from_slice(&10u32.to_le_bytes());
        let mut g = StreamGenerator::new(200, |_s: Stream| {});
        assert!(g.on_bytes(&raw).unwrap_err() == ERR_STREAM);
    }

    #[test]
    fn test_partial_and_limit() {
        let raw = build(4, 300);
        let mut got = Vec::new();
        let mut g = StreamGenerator::new(1 << 20, |s: Stream| got.push(s.get_callback_id()));
        assert!(g.is_idle());
        g.on_bytes(&raw[..100]).expect("ok");
        assert!(!g.is_idle());
        // a lower limit does not cut the stream already accepted
        g.set_max_len(64);
        g.on_bytes(&raw[100..]).expect("ok");
        assert!(g.is_idle());
        assert!(g.on_bytes(&raw).unwrap_err() == ERR_TRANSPORT_STREAM_LENGTH);
        assert!(g.is_idle());
        drop(g);
        assert_eq!(got, vec![4]);
    }
}
