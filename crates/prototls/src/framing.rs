// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix message framing over a connection.
//!
//! A stream connection has no message boundaries, so every message is
//! prefixed with its payload length:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Payload           |
//! +----------------+-------------------+
//! ```
//!
//! [`FramedPeer`] owns one connection plus an inbound and an outbound
//! buffer. Closing the peer closes the connection.
//!
//! ```text
//!  inbound:  [ consumed | len | payload... | len | partial...      ]
//!                       ^cursor
//!            pending = Some(n) once the 4-byte prefix at the cursor
//!            has been read; cleared only when n bytes are extracted
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut peer = FramedPeer::new(Box::new(conn));
//! peer.send(&"Thanks!".to_string())?;
//! peer.flush();
//!
//! peer.on_input();
//! while peer.has_packet() {
//!     let reply: String = peer.recv()?;
//! }
//! ```

use std::fmt;
use std::io;
use std::ops::Range;

use crate::connection::{BoxedConnection, Connection, Descriptor};
use crate::error::FramingError;
use crate::packet::Packet;

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Bytes requested from the connection per `on_input`.
pub const RECV_CHUNK_SIZE: usize = 1024;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Server-assigned peer identifier, unique per server run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of [`FramedPeer::flush`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// All queued bytes were written
    Complete,

    /// Nothing was queued
    Empty,

    /// Short write or error: the peer was closed and the queue discarded
    Closed,
}

/// Per-peer traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Messages extracted from the inbound buffer
    pub messages_received: u64,

    /// Messages queued for sending
    pub messages_sent: u64,

    /// Raw bytes read from the connection
    pub bytes_received: u64,

    /// Raw bytes written to the connection
    pub bytes_sent: u64,

    /// Length prefixes above the size limit
    pub frames_rejected: u64,
}

/// A connection paired with length-prefix framing buffers.
pub struct FramedPeer {
    id: PeerId,
    conn: BoxedConnection,
    inbound: Vec<u8>,
    cursor: usize,
    pending: Option<usize>,
    outbound: Vec<u8>,
    max_message_size: usize,
    stats: PeerStats,
}

impl FramedPeer {
    /// Wrap a connection. The peer takes ownership of it.
    pub fn new(conn: BoxedConnection) -> Self {
        Self {
            id: PeerId::default(),
            conn,
            inbound: Vec::with_capacity(RECV_CHUNK_SIZE),
            cursor: 0,
            pending: None,
            outbound: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stats: PeerStats::default(),
        }
    }

    pub fn with_id(mut self, id: PeerId) -> Self {
        self.id = id;
        self
    }

    /// Cap on payload length, in both directions.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote peer description.
    pub fn info(&self) -> &str {
        self.conn.info()
    }

    pub fn descriptor(&self) -> Option<Descriptor> {
        self.conn.descriptor()
    }

    pub fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Length of the message being assembled, once its prefix is known.
    pub fn pending_len(&self) -> Option<usize> {
        self.pending
    }

    /// Inbound bytes not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.inbound.len() - self.cursor
    }

    /// Outbound bytes not yet flushed.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the connection holds decoded input that has not been read yet.
    ///
    /// Such input does not make the descriptor readable again.
    pub fn has_buffered_input(&self) -> bool {
        self.conn.is_active() && self.conn.has_buffered_input()
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Read one chunk from the connection into the inbound buffer.
    ///
    /// End of stream or a hard error closes the peer. `WouldBlock` and
    /// `Interrupted` leave it untouched.
    pub fn on_input(&mut self) {
        if !self.conn.is_active() {
            return;
        }

        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        match self.conn.recv(&mut chunk) {
            Ok(0) => {
                log::debug!("[PEER] {} {} disconnected", self.id, self.conn.info());
                self.close();
            }
            Ok(n) => {
                self.compact();
                self.inbound.extend_from_slice(&chunk[..n]);
                self.stats.bytes_received += n as u64;
                if self.pending.is_none() {
                    self.read_message_size();
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("[PEER] {} {} read error: {}", self.id, self.conn.info(), e);
                self.close();
            }
        }
    }

    /// True iff a complete message is buffered.
    pub fn has_packet(&self) -> bool {
        self.pending
            .is_some_and(|len| self.inbound.len() - self.cursor >= len)
    }

    /// Extract and decode the next buffered message.
    ///
    /// The frame is consumed even when decoding fails.
    pub fn recv<P: Packet>(&mut self) -> Result<P, FramingError> {
        let frame = self.next_frame()?;
        let decoded = P::decode(&self.inbound[frame]);
        self.finish_frame();
        decoded.map_err(FramingError::Decode)
    }

    /// Extract the next buffered message as raw bytes.
    pub fn recv_bytes(&mut self) -> Result<Vec<u8>, FramingError> {
        let frame = self.next_frame()?;
        let payload = self.inbound[frame].to_vec();
        self.finish_frame();
        Ok(payload)
    }

    /// Drop the next buffered message without decoding it.
    pub fn skip_packet(&mut self) -> bool {
        if self.next_frame().is_err() {
            return false;
        }
        self.finish_frame();
        true
    }

    fn next_frame(&mut self) -> Result<Range<usize>, FramingError> {
        if !self.has_packet() {
            return Err(FramingError::NoPacket);
        }
        let len = self.pending.take().unwrap_or(0);
        let start = self.cursor;
        self.cursor += len;
        self.stats.messages_received += 1;
        log::trace!("[PEER] {} frame of {} bytes", self.id, len);
        Ok(start..start + len)
    }

    fn finish_frame(&mut self) {
        if self.cursor == self.inbound.len() {
            self.inbound.clear();
            self.cursor = 0;
        }
        self.read_message_size();
    }

    fn read_message_size(&mut self) {
        if self.pending.is_some() || self.inbound.len() - self.cursor < FRAME_HEADER_SIZE {
            return;
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.inbound[self.cursor..self.cursor + FRAME_HEADER_SIZE]);
        let len = u32::from_be_bytes(header) as usize;
        self.cursor += FRAME_HEADER_SIZE;

        if len > self.max_message_size {
            log::warn!(
                "[PEER] {} {} announced {} byte frame (limit {}), closing",
                self.id,
                self.conn.info(),
                len,
                self.max_message_size
            );
            self.stats.frames_rejected += 1;
            self.close();
            return;
        }

        self.pending = Some(len);
    }

    /// Drop the consumed prefix once it dominates the buffer.
    fn compact(&mut self) {
        if self.cursor > 0 && self.cursor * 2 >= self.inbound.len() {
            self.inbound.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue one message. Nothing is written until [`flush`](Self::flush).
    ///
    /// On error the outbound buffer is left exactly as before the call.
    pub fn send<P: Packet>(&mut self, packet: &P) -> Result<(), FramingError> {
        let start = self.outbound.len();
        self.outbound.extend_from_slice(&[0u8; FRAME_HEADER_SIZE]);

        if let Err(e) = packet.encode(&mut self.outbound) {
            self.outbound.truncate(start);
            return Err(FramingError::Encode(e));
        }

        let len = self.outbound.len() - start - FRAME_HEADER_SIZE;
        let max = self.max_message_size.min(u32::MAX as usize);
        if len > max {
            self.outbound.truncate(start);
            return Err(FramingError::FrameTooLarge { size: len, max });
        }

        self.outbound[start..start + FRAME_HEADER_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Queue one raw payload.
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        let max = self.max_message_size.min(u32::MAX as usize);
        if payload.len() > max {
            return Err(FramingError::FrameTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.outbound.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.outbound.extend_from_slice(payload);
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Write the whole outbound buffer in one `send`.
    ///
    /// A short write closes the peer and discards the remainder: the
    /// connection is treated as reliable-or-dead.
    pub fn flush(&mut self) -> FlushResult {
        if self.outbound.is_empty() {
            return FlushResult::Empty;
        }
        if !self.conn.is_active() {
            self.outbound.clear();
            return FlushResult::Closed;
        }

        let queued = self.outbound.len();
        let result = loop {
            match self.conn.send(&self.outbound) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        self.outbound.clear();
        match result {
            Ok(n) if n == queued => {
                self.stats.bytes_sent += n as u64;
                FlushResult::Complete
            }
            Ok(n) => {
                log::debug!(
                    "[PEER] {} {} short write ({}/{} bytes), closing",
                    self.id,
                    self.conn.info(),
                    n,
                    queued
                );
                self.stats.bytes_sent += n as u64;
                self.close();
                FlushResult::Closed
            }
            Err(e) => {
                log::debug!("[PEER] {} {} write error: {}", self.id, self.conn.info(), e);
                self.close();
                FlushResult::Closed
            }
        }
    }

    /// Push out bytes the connection itself still holds (TLS records).
    pub fn flush_transport(&mut self) {
        if !self.conn.is_active() || !self.conn.wants_write() {
            return;
        }
        match self.conn.flush_pending() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("[PEER] {} {} transport flush: {}", self.id, self.conn.info(), e);
                self.close();
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        self.conn.close();
    }
}

impl fmt::Debug for FramedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedPeer")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .field("buffered", &self.buffered_len())
            .field("pending", &self.pending)
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnection, MockHandle};
    use crate::error::PacketError;

    fn mock_peer() -> (FramedPeer, MockHandle) {
        let (conn, handle) = MockConnection::new();
        (FramedPeer::new(Box::new(conn)), handle)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    /// Feed everything queued in the mock, one `on_input` per chunk.
    fn pump(peer: &mut FramedPeer) {
        for _ in 0..64 {
            peer.on_input();
        }
    }

    struct Failing;

    impl Packet for Failing {
        fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
            out.extend_from_slice(b"partial");
            Err(PacketError::new("schema violation"))
        }

        fn decode(_payload: &[u8]) -> Result<Self, PacketError> {
            Err(PacketError::new("never decodes"))
        }
    }

    #[test]
    fn test_thanks_wire_format() {
        let (mut sender, out) = mock_peer();
        sender.send(&"Thanks!".to_string()).unwrap();
        assert_eq!(sender.flush(), FlushResult::Complete);

        let wire = out.written();
        assert_eq!(&wire[..4], &[0, 0, 0, 7]);
        assert_eq!(&wire[4..], b"Thanks!");

        let (mut receiver, input) = mock_peer();
        input.feed_read_data(&wire);
        receiver.on_input();
        assert!(receiver.has_packet());
        let text: String = receiver.recv().unwrap();
        assert_eq!(text, "Thanks!");
        assert!(!receiver.has_packet());
        assert_eq!(receiver.pending_len(), None);
        assert_eq!(receiver.buffered_len(), 0);
    }

    #[test]
    fn test_round_trip_resets_state() {
        for payload in [&b""[..], &b"x"[..], &[0u8; 1023][..], &[7u8; 5000][..]] {
            let (mut peer, input) = mock_peer();
            input.feed_read_data(&frame(payload));
            pump(&mut peer);
            assert!(peer.has_packet(), "len {}", payload.len());
            assert_eq!(peer.recv_bytes().unwrap(), payload);
            assert_eq!(peer.pending_len(), None);
            assert_eq!(peer.buffered_len(), 0);
            assert!(peer.is_active());
        }
    }

    #[test]
    fn test_partial_delivery_random_chunks() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let wire = frame(&payload);

        for _ in 0..20 {
            let (mut peer, input) = mock_peer();
            let mut offset = 0;
            while offset < wire.len() {
                assert!(!peer.has_packet());
                let step = fastrand::usize(1..=300).min(wire.len() - offset);
                input.feed_read_data(&wire[offset..offset + step]);
                offset += step;
                pump(&mut peer);
            }
            assert!(peer.has_packet());
            assert_eq!(peer.recv_bytes().unwrap(), payload);
            assert!(!peer.has_packet());
            assert!(matches!(peer.recv_bytes(), Err(FramingError::NoPacket)));
        }
    }

    #[test]
    fn test_split_length_prefix() {
        let (mut peer, input) = mock_peer();
        let wire = frame(b"hello");

        input.feed_read_data(&wire[..2]);
        peer.on_input();
        assert_eq!(peer.pending_len(), None);

        input.feed_read_data(&wire[2..5]);
        peer.on_input();
        assert_eq!(peer.pending_len(), Some(5));
        assert!(!peer.has_packet());

        input.feed_read_data(&wire[5..]);
        peer.on_input();
        assert!(peer.has_packet());
        assert_eq!(peer.recv_bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_back_to_back_messages() {
        let (mut sender, out) = mock_peer();
        sender.send(&"first".to_string()).unwrap();
        sender.send(&"second".to_string()).unwrap();
        assert_eq!(sender.stats().messages_sent, 2);
        assert_eq!(sender.flush(), FlushResult::Complete);
        assert_eq!(sender.outbound_len(), 0);

        let (mut receiver, input) = mock_peer();
        input.feed_read_data(&out.written());
        receiver.on_input();

        assert!(receiver.has_packet());
        assert_eq!(receiver.recv::<String>().unwrap(), "first");
        // Next length is parsed without another on_input.
        assert!(receiver.has_packet());
        assert_eq!(receiver.recv::<String>().unwrap(), "second");
        assert!(!receiver.has_packet());
        assert_eq!(receiver.stats().messages_received, 2);
    }

    #[test]
    fn test_eof_closes_peer() {
        let (mut peer, input) = mock_peer();
        input.disconnect();
        peer.on_input();
        assert!(!peer.is_active());
        assert_eq!(input.close_calls(), 1);

        // Further input is ignored once closed.
        peer.on_input();
        assert_eq!(input.close_calls(), 1);
    }

    #[test]
    fn test_read_error_closes_peer() {
        let (mut peer, input) = mock_peer();
        input.inject_read_error(io::ErrorKind::ConnectionReset);
        peer.on_input();
        assert!(!peer.is_active());
    }

    #[test]
    fn test_would_block_is_not_disconnect() {
        let (mut peer, input) = mock_peer();
        peer.on_input();
        assert!(peer.is_active());

        input.inject_read_error(io::ErrorKind::Interrupted);
        peer.on_input();
        assert!(peer.is_active());
    }

    #[test]
    fn test_oversized_frame_closes_peer() {
        let (conn, input) = MockConnection::new();
        let mut peer = FramedPeer::new(Box::new(conn)).with_max_message_size(16);
        input.feed_read_data(&frame(&[0u8; 17]));
        peer.on_input();
        assert!(!peer.is_active());
        assert!(!peer.has_packet());
        assert_eq!(peer.stats().frames_rejected, 1);
    }

    #[test]
    fn test_send_too_large_leaves_buffer_intact() {
        let (conn, _out) = MockConnection::new();
        let mut peer = FramedPeer::new(Box::new(conn)).with_max_message_size(4);
        peer.send_bytes(b"ok").unwrap();
        let before = peer.outbound_len();

        let err = peer.send(&b"too long".to_vec()).unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge { size: 8, max: 4 }));
        assert!(peer.send_bytes(b"12345").is_err());
        assert_eq!(peer.outbound_len(), before);
    }

    #[test]
    fn test_encode_failure_rolls_back() {
        let (mut peer, out) = mock_peer();
        peer.send(&"kept".to_string()).unwrap();
        let before = peer.outbound_len();

        let err = peer.send(&Failing).unwrap_err();
        assert!(matches!(err, FramingError::Encode(_)));
        assert_eq!(peer.outbound_len(), before);

        peer.flush();
        assert_eq!(out.written(), frame(b"kept"));
    }

    #[test]
    fn test_decode_failure_consumes_frame() {
        let (mut peer, input) = mock_peer();
        input.feed_read_data(&frame(b"bad"));
        input.feed_read_data(&frame(b"good"));
        pump(&mut peer);

        assert!(matches!(peer.recv::<Failing>(), Err(FramingError::Decode(_))));
        assert_eq!(peer.recv::<String>().unwrap(), "good");
    }

    #[test]
    fn test_skip_packet() {
        let (mut peer, input) = mock_peer();
        assert!(!peer.skip_packet());
        input.feed_read_data(&frame(b"ignored"));
        input.feed_read_data(&frame(b"next"));
        pump(&mut peer);

        assert!(peer.skip_packet());
        assert_eq!(peer.recv_bytes().unwrap(), b"next");
    }

    #[test]
    fn test_short_write_closes_and_discards() {
        let (mut peer, out) = mock_peer();
        out.set_write_limit(Some(5));
        peer.send(&"Thanks!".to_string()).unwrap();

        assert_eq!(peer.flush(), FlushResult::Closed);
        assert!(!peer.is_active());
        assert_eq!(peer.outbound_len(), 0);
        assert_eq!(out.written().len(), 5);
    }

    #[test]
    fn test_write_error_closes() {
        let (mut peer, out) = mock_peer();
        out.inject_write_error(io::ErrorKind::BrokenPipe);
        peer.send_bytes(b"x").unwrap();
        assert_eq!(peer.flush(), FlushResult::Closed);
        assert!(!peer.is_active());
    }

    #[test]
    fn test_flush_empty() {
        let (mut peer, out) = mock_peer();
        assert_eq!(peer.flush(), FlushResult::Empty);
        assert!(out.written().is_empty());
        assert!(peer.is_active());
    }

    #[test]
    fn test_flush_after_close_discards() {
        let (mut peer, out) = mock_peer();
        peer.send_bytes(b"late").unwrap();
        peer.close();
        assert_eq!(peer.flush(), FlushResult::Closed);
        assert!(out.written().is_empty());
    }

    #[test]
    fn test_compaction_bounds_buffer() {
        let (mut peer, input) = mock_peer();
        // Each round leaves a partial frame behind, so the buffer never
        // fully drains.
        let wire = frame(&[1u8; 600]);
        input.feed_read_data(&wire[..300]);
        peer.on_input();
        for _ in 0..50 {
            input.feed_read_data(&wire[300..]);
            input.feed_read_data(&wire[..300]);
            pump(&mut peer);
            assert!(peer.has_packet());
            assert_eq!(peer.recv_bytes().unwrap().len(), 600);
            assert!(peer.buffered_len() < wire.len());
        }
        assert!(peer.inbound.capacity() < 16 * RECV_CHUNK_SIZE);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut peer, handle) = mock_peer();
        peer.close();
        peer.close();
        assert!(!peer.is_active());
        assert_eq!(handle.close_calls(), 2);
    }
}
