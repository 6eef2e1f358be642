// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-reactor framed server.
//!
//! One thread owns the listener, the peer registry and every
//! [`FramedPeer`]. In secured mode, accepted sockets are handed to a
//! [`HandshakePool`] and come back through a [`HandoffQueue`] once their
//! handshake has succeeded; the queue is the only state shared across
//! threads.
//!
//! ```text
//!                 ┌──────────────────── reactor thread ───────────────────┐
//!   listener ───► │ accept ──plain──► admit ──► on_join                   │
//!                 │    │                 ▲                                │
//!                 │    └─secured─┐       │ drain                          │
//!                 │              ▼       │                                │
//!                 │   HandshakePool ──► HandoffQueue                      │
//!                 │                                                       │
//!                 │ peers: on_input ──► on_packet (per message) ──► reap  │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! Each tick:
//!
//! 1. Rebuild the readiness set. The listener is watched only while live
//!    peers plus in-flight handshakes are below `max_peers`.
//! 2. Wait up to `poll_interval` (zero when a peer holds decoded input).
//! 3. Accept one connection if the listener is readable.
//! 4. Admit every completed handshake from the handoff queue.
//! 5. Read from ready peers and dispatch every complete message.
//! 6. Reap inactive peers (swap-remove, order not preserved), calling
//!    `on_leave` exactly once for each.
//!
//! # Example
//!
//! ```ignore
//! struct Greeter;
//!
//! impl ServerHandler for Greeter {
//!     fn on_join(&mut self, peer: &mut FramedPeer) {
//!         let _ = peer.send(&"Welcome!".to_string());
//!         peer.flush();
//!     }
//!
//!     fn on_packet(&mut self, peer: &mut FramedPeer) {
//!         if let Ok(text) = peer.recv::<String>() {
//!             log::info!("{} says {}", peer.info(), text);
//!         }
//!     }
//! }
//!
//! let mut server = Server::new(ServerConfig::new(1234), Greeter)?;
//! server.serve()?;
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::connection::{BoxedConnection, Connection, TcpConnection};
use crate::error::{SecurityError, TransportError};
use crate::framing::{FramedPeer, PeerId};
use crate::handoff::HandoffQueue;
use crate::metrics::ServerMetrics;
use crate::pool::{HandshakePool, Job};
use crate::readiness::ReadinessSet;
use crate::tls::SecureConnection;

/// Application callbacks, all invoked on the reactor thread.
pub trait ServerHandler {
    /// A new peer is ready. Called once, before any `on_packet`.
    fn on_join(&mut self, peer: &mut FramedPeer) {
        let _ = peer;
    }

    /// One complete message is buffered on `peer`.
    ///
    /// The handler is expected to consume it with `recv`, `recv_bytes` or
    /// `skip_packet`. A message left in place is discarded with a warning.
    fn on_packet(&mut self, peer: &mut FramedPeer);

    /// The peer has gone inactive. Called once; last use of the peer.
    fn on_leave(&mut self, peer: &mut FramedPeer) {
        let _ = peer;
    }
}

/// Lifecycle of one server run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Closed,
}

/// Requests loop termination from any thread.
///
/// The loop exits after finishing the tick in progress.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Reactor-driven server dispatching framed messages to `H`.
pub struct Server<H: ServerHandler> {
    config: ServerConfig,
    handler: H,
    state: ServerState,
    listener: Option<BoxedConnection>,
    peers: Vec<FramedPeer>,
    readiness: ReadinessSet,
    pool: Option<HandshakePool>,
    handoff: Arc<HandoffQueue<BoxedConnection>>,
    /// Accepted connections not yet admitted (handshaking or queued)
    in_flight: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
    next_id: u64,
}

impl<H: ServerHandler> Server<H> {
    /// Validate `config` and start the handshake pool when security is on.
    pub fn new(config: ServerConfig, handler: H) -> Result<Self, TransportError> {
        config.validate()?;

        let pool = if config.is_secure() {
            Some(HandshakePool::new(config.handshake_workers)?)
        } else {
            None
        };

        Ok(Self {
            readiness: ReadinessSet::with_capacity(config.max_peers.min(1024) + 1),
            config,
            handler,
            state: ServerState::Idle,
            listener: None,
            peers: Vec::new(),
            pool,
            handoff: Arc::new(HandoffQueue::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ServerMetrics::new()),
            next_id: 0,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind and listen. Returns the bound address (useful with port 0).
    pub fn listen(&mut self) -> Result<SocketAddr, TransportError> {
        match self.state {
            ServerState::Listening => return self.local_addr().ok_or(TransportError::NotActive),
            ServerState::Closed => return Err(TransportError::NotActive),
            ServerState::Idle => {}
        }

        let mut listener: BoxedConnection = match &self.config.security {
            Some(ctx) => {
                if !ctx.can_serve() {
                    return Err(SecurityError::MissingServerIdentity.into());
                }
                Box::new(SecureConnection::new(Arc::clone(ctx)))
            }
            None => Box::new(TcpConnection::new()),
        };

        listener.bind(self.config.listen_port)?;
        listener.listen(self.config.backlog())?;
        listener.set_nonblocking()?;
        let addr = listener.local_addr().ok_or(TransportError::NotActive)?;

        log::info!(
            "[SERVER] listening on {} ({}, max {} peers)",
            addr,
            if self.config.is_secure() { "tls" } else { "tcp" },
            self.config.max_peers
        );

        self.listener = Some(listener);
        self.state = ServerState::Listening;
        Ok(addr)
    }

    /// Run the reactor until [`close`](Self::close) is requested, then shut down.
    pub fn run(&mut self) -> Result<(), TransportError> {
        if self.state != ServerState::Listening {
            return Err(TransportError::NotActive);
        }

        while !self.closed.load(Ordering::Acquire) {
            self.tick();
        }
        self.shutdown();
        Ok(())
    }

    /// [`listen`](Self::listen) if needed, then [`run`](Self::run).
    pub fn serve(&mut self) -> Result<(), TransportError> {
        self.listen()?;
        self.run()
    }

    /// Request termination; the loop exits after the current tick.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.closed))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Live peers, in registry order (not meaningful).
    pub fn peers(&self) -> impl Iterator<Item = &FramedPeer> {
        self.peers.iter()
    }

    /// Connections accepted but not yet admitted as peers.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    // ========================================================================
    // Reactor
    // ========================================================================

    /// Run one reactor iteration.
    pub fn tick(&mut self) {
        self.readiness.reset();

        let listener_fd = if self.has_capacity() {
            self.listener.as_ref().and_then(|l| l.descriptor())
        } else {
            None
        };
        if let Some(fd) = listener_fd {
            self.readiness.mark(fd);
        }

        let mut buffered = false;
        for peer in &self.peers {
            if let Some(fd) = peer.descriptor() {
                self.readiness.mark(fd);
            }
            buffered |= peer.has_buffered_input();
        }

        let timeout = if buffered {
            Duration::ZERO
        } else {
            self.config.poll_interval
        };
        if let Err(e) = self.readiness.wait(timeout) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                log::warn!("[SERVER] readiness wait failed: {}", e);
            }
            return;
        }

        if let Some(fd) = listener_fd {
            if self.readiness.can_read(fd) && self.has_capacity() {
                self.accept_one();
            }
        }

        self.drain_handoff();
        self.service_peers();
        self.reap();
    }

    fn has_capacity(&self) -> bool {
        self.peers.len() + self.in_flight.load(Ordering::Acquire) < self.config.max_peers
    }

    fn accept_one(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.is_would_block() => return,
            Err(e) => {
                self.metrics.record_accept_error();
                log::warn!("[SERVER] accept failed: {}", e);
                return;
            }
        };

        if self.pool.is_some() {
            self.submit_handshake(conn);
        } else {
            self.admit(conn);
        }
    }

    fn submit_handshake(&mut self, conn: BoxedConnection) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_handshake_started();

        let handoff = Arc::clone(&self.handoff);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);
        let closed = Arc::clone(&self.closed);
        let job: Job = Box::new(move || {
            let mut conn = conn;
            if closed.load(Ordering::Acquire) {
                log::debug!("[SERVER] shutting down, dropping {}", conn.info());
                conn.close();
                metrics.record_handshake_failed();
                in_flight.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            match conn.handshake() {
                Ok(()) => {
                    metrics.record_handshake_completed();
                    handoff.push(conn);
                }
                Err(e) => {
                    // Dropped silently: the application never sees this attempt.
                    log::debug!("[SERVER] dropping {}: {}", conn.info(), e);
                    conn.close();
                    metrics.record_handshake_failed();
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
        });

        if let Err(job) = pool.submit(job) {
            log::warn!("[SERVER] handshake pool closed, dropping connection");
            drop(job);
            self.metrics.record_handshake_failed();
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn drain_handoff(&mut self) {
        while let Some(conn) = self.handoff.try_pop_front() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.admit(conn);
        }
    }

    /// Register a ready connection as a peer and call `on_join`.
    fn admit(&mut self, mut conn: BoxedConnection) {
        if let Err(e) = conn.set_nonblocking() {
            log::debug!("[SERVER] cannot admit {}: {}", conn.info(), e);
            conn.close();
            return;
        }
        if self.config.nodelay {
            if let Err(e) = conn.set_nodelay(true) {
                log::debug!("[SERVER] TCP_NODELAY on {}: {}", conn.info(), e);
            }
        }

        self.next_id += 1;
        let mut peer = FramedPeer::new(conn)
            .with_id(PeerId(self.next_id))
            .with_max_message_size(self.config.max_message_size);

        self.metrics.record_peer_joined();
        log::debug!("[SERVER] peer {} {} joined", peer.id(), peer.info());
        self.handler.on_join(&mut peer);
        self.peers.push(peer);
    }

    fn service_peers(&mut self) {
        for peer in self.peers.iter_mut() {
            if !peer.is_active() {
                continue;
            }

            let readable = peer
                .descriptor()
                .is_some_and(|fd| self.readiness.can_read(fd));
            if readable || peer.has_buffered_input() {
                peer.on_input();
            }

            while peer.is_active() && peer.has_packet() {
                let before = peer.stats().messages_received;
                self.handler.on_packet(peer);
                self.metrics.record_packet_dispatched();

                if peer.stats().messages_received == before && peer.skip_packet() {
                    log::warn!(
                        "[SERVER] peer {} {}: handler left a message unread, discarded",
                        peer.id(),
                        peer.info()
                    );
                    self.metrics.record_packet_ignored();
                }
            }

            peer.flush_transport();
        }
    }

    fn reap(&mut self) {
        let mut index = 0;
        while index < self.peers.len() {
            if self.peers[index].is_active() {
                index += 1;
                continue;
            }
            let mut peer = self.peers.swap_remove(index);
            log::debug!("[SERVER] peer {} {} left", peer.id(), peer.info());
            self.handler.on_leave(&mut peer);
            self.metrics.record_peer_left();
        }
    }

    fn shutdown(&mut self) {
        // Queued handshake jobs see this and drop their connection.
        self.closed.store(true, Ordering::Release);

        for mut peer in self.peers.drain(..) {
            peer.close();
            self.handler.on_leave(&mut peer);
            self.metrics.record_peer_left();
        }

        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }

        // Joins the workers; only handshakes already running are waited for.
        self.pool.take();
        while let Some(mut conn) = self.handoff.try_pop_front() {
            conn.close();
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        self.state = ServerState::Closed;
        log::info!("[SERVER] closed");
    }
}

impl<H: ServerHandler> Drop for Server<H> {
    fn drop(&mut self) {
        if self.state == ServerState::Listening {
            self.shutdown();
        }
    }
}

impl<H: ServerHandler> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("local_addr", &self.local_addr())
            .field("peers", &self.peers.len())
            .field("in_flight", &self.in_flight())
            .field("secure", &self.config.is_secure())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnection, MockHandle};

    #[derive(Default)]
    struct Recorder {
        joined: Vec<PeerId>,
        packets: Vec<Vec<u8>>,
        left: Vec<PeerId>,
        ignore: bool,
    }

    impl ServerHandler for Recorder {
        fn on_join(&mut self, peer: &mut FramedPeer) {
            self.joined.push(peer.id());
        }

        fn on_packet(&mut self, peer: &mut FramedPeer) {
            if self.ignore {
                return;
            }
            if let Ok(payload) = peer.recv_bytes() {
                self.packets.push(payload);
            }
        }

        fn on_leave(&mut self, peer: &mut FramedPeer) {
            assert!(!peer.is_active());
            self.left.push(peer.id());
        }
    }

    fn server(max_peers: usize) -> Server<Recorder> {
        let config = ServerConfig::new(0)
            .with_max_peers(max_peers)
            .with_poll_interval(Duration::from_millis(5));
        Server::new(config, Recorder::default()).unwrap()
    }

    fn admit_mock(server: &mut Server<Recorder>) -> MockHandle {
        let (conn, handle) = MockConnection::new();
        server.admit(Box::new(conn));
        handle
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_new_validates_config() {
        let err = Server::new(ServerConfig::new(0).with_max_peers(0), Recorder::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_run_requires_listen() {
        let mut server = server(4);
        assert!(matches!(server.run(), Err(TransportError::NotActive)));
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[test]
    fn test_admit_assigns_ids_and_joins() {
        let mut server = server(4);
        admit_mock(&mut server);
        admit_mock(&mut server);

        assert_eq!(server.peer_count(), 2);
        assert_eq!(server.handler().joined, vec![PeerId(1), PeerId(2)]);
        assert_eq!(server.metrics().snapshot().peers_joined, 2);
    }

    #[test]
    fn test_buffered_messages_dispatched_in_one_tick() {
        let mut server = server(4);
        let handle = admit_mock(&mut server);

        let mut wire = frame(b"one");
        wire.extend(frame(b""));
        wire.extend(frame(b"three"));
        handle.feed_read_data(&wire);

        // The mock descriptor is never reported ready by poll(2); mark the
        // input as arrived by reading directly.
        server.peers[0].on_input();
        server.service_peers();

        assert_eq!(
            server.handler().packets,
            vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]
        );
        assert_eq!(server.metrics().snapshot().packets_dispatched, 3);
    }

    #[test]
    fn test_ignored_packet_discarded() {
        let mut server = server(4);
        server.handler_mut().ignore = true;
        let handle = admit_mock(&mut server);

        handle.feed_read_data(&frame(b"unread"));
        server.peers[0].on_input();
        server.service_peers();

        assert!(!server.peers[0].has_packet());
        assert_eq!(server.metrics().snapshot().packets_ignored, 1);
    }

    #[test]
    fn test_reap_calls_on_leave_once() {
        let mut server = server(4);
        let first = admit_mock(&mut server);
        let _second = admit_mock(&mut server);
        let third = admit_mock(&mut server);

        first.disconnect();
        third.disconnect();
        for peer in server.peers.iter_mut() {
            peer.on_input();
        }
        server.reap();
        server.reap();

        assert_eq!(server.peer_count(), 1);
        let mut left = server.handler().left.clone();
        left.sort();
        assert_eq!(left, vec![PeerId(1), PeerId(3)]);
        assert_eq!(server.peers().next().map(FramedPeer::id), Some(PeerId(2)));
        assert_eq!(server.metrics().live_peers(), 1);
    }

    #[test]
    fn test_capacity_counts_in_flight() {
        let mut server = server(2);
        admit_mock(&mut server);
        assert!(server.has_capacity());

        server.in_flight.fetch_add(1, Ordering::AcqRel);
        assert!(!server.has_capacity());

        server.in_flight.fetch_sub(1, Ordering::AcqRel);
        assert!(server.has_capacity());
    }

    #[test]
    fn test_handoff_drained_each_tick() {
        let mut server = server(8);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (conn, handle) = MockConnection::new();
            server.in_flight.fetch_add(1, Ordering::AcqRel);
            server.handoff.push(Box::new(conn) as BoxedConnection);
            handles.push(handle);
        }

        server.tick();

        assert_eq!(server.peer_count(), 3);
        assert_eq!(server.in_flight(), 0);
        assert_eq!(server.handler().joined.len(), 3);
    }

    #[test]
    fn test_close_and_shutdown() {
        let mut server = server(4);
        let addr = server.listen().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.listen().unwrap(), addr);

        admit_mock(&mut server);
        let handle = server.close_handle();
        handle.close();
        assert!(handle.is_closed());

        server.run().unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        assert_eq!(server.peer_count(), 0);
        assert_eq!(server.handler().left, vec![PeerId(1)]);
        assert!(server.local_addr().is_none());
        assert!(matches!(server.listen(), Err(TransportError::NotActive)));
    }

    #[test]
    fn test_secured_listen_requires_identity() {
        let ctx = crate::tls::SecurityConfig::new().build().unwrap();
        let config = ServerConfig::new(0).with_security(ctx).with_handshake_workers(1);
        let mut server = Server::new(config, Recorder::default()).unwrap();
        assert!(matches!(
            server.listen(),
            Err(TransportError::Security(SecurityError::MissingServerIdentity))
        ));
    }
}
