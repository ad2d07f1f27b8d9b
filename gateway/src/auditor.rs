// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Best-effort audit tap for PostgreSQL wire traffic.
//!
//! Every chunk that crosses a tunnel is inspected for a single frame header at
//! its start:
//!
//! ```text
//! +--------+---------------------+-------------------+
//! | Type   | Length (4 bytes)    | Body              |
//! | 1 byte | big-endian, incl.   | Length - 4 bytes  |
//! |        | the length itself   |                   |
//! +--------+---------------------+-------------------+
//! ```
//!
//! Simple-query (`Q`) bodies are logged verbatim on the `audit` target. All
//! other message types are only traced.
//!
//! # Limitations
//!
//! The decoder assumes a frame starts at the beginning of a chunk. Frames split
//! across reads, or several frames packed into one read, are not reassembled.
//! Decoding never fails the relay: whatever happens here, the bytes are passed
//! through untouched.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::constants::{FRAME_HEADER_LEN, SIMPLE_QUERY_TAG};

/// Result of looking at the head of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Not enough bytes for a header.
    Fragment,
    /// Declared length is smaller than the length field itself.
    Malformed { declared: u32 },
    SimpleQuery { query: String, truncated: bool },
    Other { tag: u8, declared: u32 },
}

/// Decodes the frame header at the start of `chunk`.
pub fn decode_frame(chunk: &[u8]) -> Frame {
    if chunk.len() < FRAME_HEADER_LEN {
        return Frame::Fragment;
    }

    let tag = chunk[0];
    let declared = BigEndian::read_u32(&chunk[1..FRAME_HEADER_LEN]);
    if declared < 4 {
        return Frame::Malformed { declared };
    }

    if tag != SIMPLE_QUERY_TAG {
        return Frame::Other { tag, declared };
    }

    let body_len = (declared - 4) as usize;
    let available = &chunk[FRAME_HEADER_LEN..];
    let body = &available[..body_len.min(available.len())];

    match body.iter().position(|b| *b == 0) {
        Some(end) => Frame::SimpleQuery {
            query: String::from_utf8_lossy(&body[..end]).into_owned(),
            truncated: false,
        },
        None => Frame::SimpleQuery {
            query: String::from_utf8_lossy(body).into_owned(),
            truncated: true,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client towards the database.
    Upstream,
    /// Database towards the client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// Per-tunnel audit counters, shared by every client of the tunnel.
#[derive(Debug, Default)]
pub struct AuditStats {
    queries: AtomicU64,
    malformed: AtomicU64,
}

impl AuditStats {
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Logs what one proxied client sends and receives.
#[derive(Debug, Clone)]
pub struct WireAuditor {
    tunnel: Arc<str>,
    peer: SocketAddr,
    stats: Arc<AuditStats>,
}

impl WireAuditor {
    pub fn new(tunnel: Arc<str>, peer: SocketAddr, stats: Arc<AuditStats>) -> Self {
        Self {
            tunnel,
            peer,
            stats,
        }
    }

    pub fn observe(&self, direction: Direction, chunk: &[u8]) -> Frame {
        let frame = decode_frame(chunk);

        match &frame {
            Frame::SimpleQuery { query, truncated } => {
                self.stats.queries.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    target: "audit",
                    tunnel = %self.tunnel,
                    peer = %self.peer,
                    %direction,
                    truncated,
                    "query: {}",
                    query
                );
            }
            Frame::Malformed { declared } => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tunnel = %self.tunnel,
                    peer = %self.peer,
                    %direction,
                    "[audit] invalid message length: {}",
                    declared
                );
            }
            Frame::Other { tag, declared } => {
                tracing::trace!(
                    "[audit] {} message {:?} ({} bytes) on {}",
                    direction,
                    char::from(*tag),
                    declared,
                    self.tunnel
                );
            }
            Frame::Fragment => {
                tracing::trace!("[audit] {} fragment ({} bytes)", direction, chunk.len());
            }
        }

        frame
    }
}

/// Stream wrapper that hands every completed read and write to a
/// [`WireAuditor`].
///
/// Wrap the upstream side: reads are then database-to-client traffic and
/// writes are client-to-database traffic.
pub struct AuditedStream<S> {
    inner: S,
    auditor: WireAuditor,
}

impl<S> AuditedStream<S> {
    pub fn new(inner: S, auditor: WireAuditor) -> Self {
        Self { inner, auditor }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AuditedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let chunk = &buf.filled()[before..];
            if !chunk.is_empty() {
                this.auditor.observe(Direction::Downstream, chunk);
            }
        }

        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AuditedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll
            && written > 0
        {
            this.auditor.observe(Direction::Upstream, &buf[..written]);
        }

        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(tag: u8, declared: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![tag, 0, 0, 0, 0];
        BigEndian::write_u32(&mut buf[1..5], declared);
        buf.extend_from_slice(body);
        buf
    }

    fn query(sql: &str) -> Vec<u8> {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        frame(b'Q', body.len() as u32 + 4, &body)
    }

    fn auditor() -> (WireAuditor, Arc<AuditStats>) {
        let stats = Arc::new(AuditStats::default());
        let peer: SocketAddr = "127.0.0.1:5432".parse().unwrap();
        (WireAuditor::new(Arc::from("brave-otter-01"), peer, stats.clone()), stats)
    }

    #[test]
    fn test_decode_simple_query() {
        assert_eq!(
            decode_frame(&query("SELECT 1")),
            Frame::SimpleQuery {
                query: "SELECT 1".to_string(),
                truncated: false
            }
        );
    }

    #[test]
    fn test_decode_short_length_is_malformed() {
        let chunk = frame(b'Q', 2, b"SELECT 1\0");
        assert_eq!(decode_frame(&chunk), Frame::Malformed { declared: 2 });
    }

    #[test]
    fn test_decode_fragment() {
        assert_eq!(decode_frame(b""), Frame::Fragment);
        assert_eq!(decode_frame(b"Q\0\0\0"), Frame::Fragment);
    }

    #[test]
    fn test_decode_other_message() {
        // Terminate
        let chunk = frame(b'X', 4, b"");
        assert_eq!(
            decode_frame(&chunk),
            Frame::Other {
                tag: b'X',
                declared: 4
            }
        );
    }

    #[test]
    fn test_decode_query_split_across_chunks_is_truncated() {
        let full = query("SELECT * FROM invoices");
        let (head, _) = full.split_at(12);

        assert_eq!(
            decode_frame(head),
            Frame::SimpleQuery {
                query: "SELECT ".to_string(),
                truncated: true
            }
        );
    }

    #[test]
    fn test_decode_only_first_frame_of_chunk() {
        let mut chunk = query("SELECT 1");
        chunk.extend(query("SELECT 2"));

        assert_eq!(
            decode_frame(&chunk),
            Frame::SimpleQuery {
                query: "SELECT 1".to_string(),
                truncated: false
            }
        );
    }

    #[test]
    fn test_observe_counts() {
        let (auditor, stats) = auditor();

        auditor.observe(Direction::Upstream, &query("SELECT 1"));
        auditor.observe(Direction::Upstream, &frame(b'Q', 2, b""));
        auditor.observe(Direction::Downstream, &frame(b'Z', 5, b"I"));

        assert_eq!(stats.queries(), 1);
        assert_eq!(stats.malformed(), 1);
    }

    #[tokio::test]
    async fn test_audited_stream_passes_bytes_through() {
        let (auditor, stats) = auditor();
        let (near, mut far) = tokio::io::duplex(1024);
        let mut stream = AuditedStream::new(near, auditor);

        let malformed = frame(b'Q', 2, b"junk");
        stream.write_all(&malformed).await.unwrap();
        stream.write_all(&query("SELECT 1")).await.unwrap();

        let mut received = vec![0u8; malformed.len()];
        far.read_exact(&mut received).await.unwrap();
        assert_eq!(received, malformed);

        far.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        assert_eq!(stats.queries(), 1);
        assert_eq!(stats.malformed(), 1);
    }
}
