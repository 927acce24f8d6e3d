//! Length-prefixed framing for async byte streams.
//!
//! Packets are prefixed by a 4-byte little-endian frame length. Each frame
//! contains exactly one packet, so a frame that fails to decode can be
//! skipped without desynchronizing the frames that follow it. An inbound
//! frame over the size cap is never buffered; its payload is discarded as it
//! arrives and the reader resumes at the next frame.
//!
//! This module is generic over the transport type - it works with any type
//! that implements `AsyncRead + AsyncWrite + Unpin`, including TCP sockets,
//! Unix domain sockets, and `tokio::io::duplex` pipes in tests.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Packet, PacketTransport};

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;
const FRAME_LEN_PREFIX_SIZE: usize = 4;

/// Default cap on a single frame, applied to both directions.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

fn compact_recv_buffer(buf: &mut Vec<u8>, unread_start: &mut usize) {
    if *unread_start == buf.len() {
        buf.clear();
        *unread_start = 0;
        return;
    }

    if *unread_start >= RECV_BUF_COMPACT_THRESHOLD && *unread_start >= buf.len() / 2 {
        buf.drain(..*unread_start);
        *unread_start = 0;
    }
}

/// A length-prefixed packet stream over any async byte stream.
pub struct LengthPrefixedFramed<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
    /// Reused across sends to avoid reallocating.
    encode_buf: Vec<u8>,
    max_frame_len: usize,
    /// Bytes of an oversized inbound frame still to be discarded. The frame
    /// is too big to buffer, so its payload is thrown away as it arrives.
    skip_remaining: usize,
}

impl<S> LengthPrefixedFramed<S> {
    /// Create a new framed connection from an async stream.
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_len(stream, DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a framed connection with an explicit per-frame size cap.
    pub fn with_max_frame_len(stream: S, max_frame_len: usize) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
            encode_buf: Vec::with_capacity(1024),
            max_frame_len,
            skip_remaining: 0,
        }
    }

    /// Get a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Consume the framed wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Decode one packet out of the receive buffer, if a full frame is
    /// available. An over-cap frame errors immediately and arms
    /// `skip_remaining` so its payload is discarded as it arrives; the error
    /// costs only that frame.
    fn try_decode_one(&mut self) -> io::Result<Option<Packet>> {
        let unread = &self.buf[self.unread_start..];
        if unread.len() < FRAME_LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_le_bytes([unread[0], unread[1], unread[2], unread[3]]) as usize;
        if frame_len > self.max_frame_len {
            self.unread_start += FRAME_LEN_PREFIX_SIZE;
            self.skip_remaining = frame_len;
            compact_recv_buffer(&mut self.buf, &mut self.unread_start);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {frame_len} exceeds cap {}", self.max_frame_len),
            ));
        }
        let frame_end = self.unread_start + FRAME_LEN_PREFIX_SIZE + frame_len;
        if frame_end > self.buf.len() {
            return Ok(None);
        }

        let frame_start = self.unread_start + FRAME_LEN_PREFIX_SIZE;
        let result = Packet::from_bytes(&self.buf[frame_start..frame_end]);

        // Advance past the frame whether or not it decoded; a bad frame must
        // not take the frames behind it down with it.
        self.unread_start = frame_end;
        compact_recv_buffer(&mut self.buf, &mut self.unread_start);

        match result {
            Ok(pkt) => Ok(Some(pkt)),
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet decode: {e}"),
            )),
        }
    }

    /// Throw away buffered bytes belonging to an oversized frame.
    fn discard_skipped(&mut self) {
        if self.skip_remaining == 0 {
            return;
        }
        let unread = self.buf.len() - self.unread_start;
        let n = self.skip_remaining.min(unread);
        self.unread_start += n;
        self.skip_remaining -= n;
        compact_recv_buffer(&mut self.buf, &mut self.unread_start);
    }
}

impl<S> LengthPrefixedFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one packet, prefixed with a 4-byte little-endian frame length.
    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        self.encode_buf.clear();
        let bytes = packet
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.encode_buf.extend_from_slice(&bytes);

        if self.encode_buf.len() > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "encoded packet ({} bytes) exceeds frame cap ({})",
                    self.encode_buf.len(),
                    self.max_frame_len
                ),
            ));
        }

        let frame_len = self.encode_buf.len() as u32;
        self.stream.write_all(&frame_len.to_le_bytes()).await?;
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one packet, waiting until a full frame arrives or the stream
    /// closes. Returns `Ok(None)` on clean EOF.
    pub async fn recv(&mut self) -> io::Result<Option<Packet>> {
        loop {
            self.discard_skipped();
            if self.skip_remaining == 0 {
                match self.try_decode_one() {
                    Ok(Some(pkt)) => return Ok(Some(pkt)),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing =
                    self.buf.len().saturating_sub(self.unread_start) + self.skip_remaining;
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no complete frame"),
                    ));
                }
                return Ok(None);
            }
            compact_recv_buffer(&mut self.buf, &mut self.unread_start);
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

impl<S> PacketTransport for LengthPrefixedFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        LengthPrefixedFramed::send(self, packet).await
    }

    async fn recv(&mut self) -> io::Result<Option<Packet>> {
        LengthPrefixedFramed::recv(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallId, Value};

    fn call(id: u64) -> Packet {
        Packet::Call {
            id: CallId(id),
            ty: Some("T".into()),
            method: "m".into(),
            args: vec![Value::Int(id as i64)],
        }
    }

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = LengthPrefixedFramed::new(a);
        let mut right = LengthPrefixedFramed::new(b);

        left.send(&call(1)).await.unwrap();
        left.send(&call(2)).await.unwrap();

        assert_eq!(right.recv().await.unwrap(), Some(call(1)));
        assert_eq!(right.recv().await.unwrap(), Some(call(2)));
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = LengthPrefixedFramed::new(a);
        let mut right = LengthPrefixedFramed::new(b);

        left.send(&call(1)).await.unwrap();
        drop(left);

        assert_eq!(right.recv().await.unwrap(), Some(call(1)));
        assert_eq!(right.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_frame_does_not_desync_the_next_one() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(4096);
        let mut right = LengthPrefixedFramed::new(b);

        // A well-formed frame whose payload is garbage...
        let garbage = [0xffu8, 0xee, 0xdd];
        a.write_all(&(garbage.len() as u32).to_le_bytes())
            .await
            .unwrap();
        a.write_all(&garbage).await.unwrap();

        // ...followed by a valid packet.
        let good = call(3).to_bytes().unwrap();
        a.write_all(&(good.len() as u32).to_le_bytes())
            .await
            .unwrap();
        a.write_all(&good).await.unwrap();
        a.flush().await.unwrap();

        let err = right.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        assert_eq!(right.recv().await.unwrap(), Some(call(3)));
    }

    #[tokio::test]
    async fn overcap_inbound_frame_is_skipped_without_desync() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(4096);
        let mut right = LengthPrefixedFramed::with_max_frame_len(b, 64);

        a.write_all(&1024u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0u8; 1024]).await.unwrap();
        let good = call(3).to_bytes().unwrap();
        a.write_all(&(good.len() as u32).to_le_bytes())
            .await
            .unwrap();
        a.write_all(&good).await.unwrap();
        a.flush().await.unwrap();

        let err = right.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // The next recv must land on the frame behind it, not re-read the
        // oversized one.
        assert_eq!(right.recv().await.unwrap(), Some(call(3)));
    }

    #[tokio::test]
    async fn overcap_inbound_frame_is_discarded_as_it_trickles_in() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(4096);
        let mut right = LengthPrefixedFramed::with_max_frame_len(b, 64);

        // Header first, most of the payload still in flight.
        a.write_all(&1024u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0u8; 100]).await.unwrap();
        a.flush().await.unwrap();

        let err = right.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        a.write_all(&[0u8; 924]).await.unwrap();
        let good = call(7).to_bytes().unwrap();
        a.write_all(&(good.len() as u32).to_le_bytes())
            .await
            .unwrap();
        a.write_all(&good).await.unwrap();
        a.flush().await.unwrap();

        assert_eq!(right.recv().await.unwrap(), Some(call(7)));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_on_send() {
        let (a, _b) = tokio::io::duplex(4096);
        let mut left = LengthPrefixedFramed::with_max_frame_len(a, 16);
        let big = Packet::Success {
            id: CallId(1),
            result: Value::Str("x".repeat(64)),
        };
        let err = LengthPrefixedFramed::send(&mut left, &big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
