// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS session layered over a [`TcpConnection`].
//!
//! ```text
//!   Created ──handshake()──► Handshaking ──┬──► Established
//!                                          └──► Failed (transport closed)
//! ```
//!
//! The handshake works on blocking and non-blocking transports. Blocking
//! sockets get a short I/O timeout per attempt; non-blocking sockets wait on
//! a one-entry [`ReadinessSet`]. Either way the whole handshake is bounded
//! by the context's handshake timeout.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};
use socket2::Socket;

use super::verify::{self, VerifyResult};
use super::SecurityContext;
use crate::connection::{BoxedConnection, Connection, Descriptor, TcpConnection};
use crate::error::{SecurityError, TransportError, VerifyError};
use crate::readiness::ReadinessSet;

/// Granularity of handshake retries.
const HANDSHAKE_SLICE: Duration = Duration::from_millis(50);

/// Progress of the TLS handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Created,
    Handshaking,
    Established,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// TLS connection (client or server role).
pub struct SecureConnection {
    transport: TcpConnection,
    context: Arc<SecurityContext>,
    session: Option<rustls::Connection>,
    hostname: Option<String>,
    state: HandshakeState,
    /// Decrypted bytes held by the session and not yet returned by `recv`.
    plaintext: usize,
}

impl SecureConnection {
    /// IPv4 TLS connection sharing `context`.
    pub fn new(context: Arc<SecurityContext>) -> Self {
        Self::with_transport(context, TcpConnection::new())
    }

    /// TLS over a caller-supplied transport (e.g. [`TcpConnection::ipv6`]).
    ///
    /// An already-connected transport is not wrapped into a session; call
    /// [`connect`](Connection::connect) to start one.
    pub fn with_transport(context: Arc<SecurityContext>, transport: TcpConnection) -> Self {
        Self {
            transport,
            context,
            session: None,
            hostname: None,
            state: HandshakeState::Created,
            plaintext: 0,
        }
    }

    /// Server-role session over an accepted socket.
    pub(crate) fn server(
        context: Arc<SecurityContext>,
        mut transport: TcpConnection,
    ) -> Result<Self, TransportError> {
        let session = match context.server_config() {
            Ok(config) => ServerConnection::new(config)
                .map(|mut session| {
                    // Frames are bounded by the framing layer, not by rustls.
                    session.set_buffer_limit(None);
                    session
                })
                .map_err(SecurityError::from),
            Err(e) => Err(e),
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                transport.close();
                return Err(e.into());
            }
        };

        Ok(Self {
            transport,
            context,
            session: Some(rustls::Connection::Server(session)),
            hostname: None,
            state: HandshakeState::Created,
            plaintext: 0,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Hostname recorded by `connect` (client role only).
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn context(&self) -> &Arc<SecurityContext> {
        &self.context
    }

    pub fn transport(&self) -> &TcpConnection {
        &self.transport
    }

    /// Evaluate the peer certificate chain.
    ///
    /// Requires an established session. The hostname check only applies to
    /// the client role, against the name given to `connect`.
    pub fn verify(&self) -> Result<VerifyResult, VerifyError> {
        let session = match (&self.session, self.state) {
            (Some(session), HandshakeState::Established) => session,
            _ => return Err(VerifyError::NotEstablished),
        };

        let chain = session
            .peer_certificates()
            .ok_or(VerifyError::NoPeerCertificate)?;
        let result = verify::analyze(
            chain,
            self.hostname.as_deref(),
            self.context.chain_verifier(),
        )?;

        log::debug!("[TLS] {} verified: {}", self.transport.info(), result);
        Ok(result)
    }

    /// Returns the decrypted bytes already held by the session on success.
    fn drive_handshake(&mut self) -> io::Result<usize> {
        let deadline = Instant::now() + self.context.handshake_timeout();
        let nonblocking = self.transport.is_nonblocking();

        if !nonblocking {
            self.transport.set_io_timeout(Some(HANDSHAKE_SLICE))?;
        }
        let result = self.handshake_loop(deadline, nonblocking);
        if !nonblocking && self.transport.is_active() {
            let _ = self.transport.set_io_timeout(None);
        }
        result
    }

    fn handshake_loop(&mut self, deadline: Instant, nonblocking: bool) -> io::Result<usize> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let mut socket = self.transport.socket().ok_or_else(not_connected)?;
        let fd = socket.as_raw_fd();
        let mut readiness = ReadinessSet::with_capacity(1);
        // Application data can arrive in the same read as the peer's last
        // handshake flight; it is decrypted but never raises readiness.
        let mut held = 0;

        loop {
            match handshake_step(session, &mut socket, &mut held) {
                Ok(true) => return Ok(held),
                Ok(false) => {}
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timed out",
                ));
            }

            if nonblocking {
                readiness.reset();
                readiness.mark(fd);
                if let Err(e) = readiness.wait(HANDSHAKE_SLICE) {
                    if e.kind() != io::ErrorKind::Interrupted {
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// One round of handshake I/O. Returns true once the handshake is complete.
fn handshake_step(
    session: &mut rustls::Connection,
    socket: &mut &Socket,
    held: &mut usize,
) -> io::Result<bool> {
    while session.wants_write() {
        session.write_tls(socket)?;
    }
    if !session.is_handshaking() {
        return Ok(true);
    }

    if session.wants_read() {
        if session.read_tls(socket)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            ));
        }
        *held = process_packets(session, socket)?;
    }
    Ok(false)
}

/// Process received records; on error the pending alert is sent best-effort.
fn process_packets(session: &mut rustls::Connection, socket: &mut &Socket) -> io::Result<usize> {
    match session.process_new_packets() {
        Ok(state) => Ok(state.plaintext_bytes_to_read()),
        Err(e) => {
            let _ = session.write_tls(socket);
            Err(io::Error::new(io::ErrorKind::InvalidData, e))
        }
    }
}

/// Write out buffered TLS records until done or the socket pushes back.
fn flush_records(session: &mut rustls::Connection, socket: &mut &Socket) -> io::Result<()> {
    while session.wants_write() {
        if session.write_tls(socket)? == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
    }
    Ok(())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS session not active")
}

fn not_established() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS session not established")
}

impl Connection for SecureConnection {
    fn descriptor(&self) -> Option<Descriptor> {
        self.transport.descriptor()
    }

    fn info(&self) -> &str {
        self.transport.info()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    fn bind(&mut self, port: u16) -> Result<(), TransportError> {
        self.session = None;
        self.transport.bind(port)
    }

    fn listen(&mut self, backlog: i32) -> Result<(), TransportError> {
        self.transport.listen(backlog)
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.session = None;
        self.hostname = None;
        self.state = HandshakeState::Created;
        self.plaintext = 0;

        self.transport.connect(host, port)?;

        let name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => {
                self.transport.close();
                return Err(TransportError::InvalidServerName(host.to_string()));
            }
        };
        let session = match ClientConnection::new(self.context.client_config(), name) {
            Ok(mut session) => {
                session.set_buffer_limit(None);
                session
            }
            Err(e) => {
                self.transport.close();
                return Err(SecurityError::from(e).into());
            }
        };

        self.session = Some(rustls::Connection::Client(session));
        self.hostname = Some(host.to_string());
        Ok(())
    }

    fn accept(&self) -> Result<BoxedConnection, TransportError> {
        let transport = self.transport.accept_tcp()?;
        Ok(Box::new(SecureConnection::server(
            Arc::clone(&self.context),
            transport,
        )?))
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state != HandshakeState::Established {
            return Err(not_established());
        }
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let mut socket = self.transport.socket().ok_or_else(not_connected)?;

        let mut taken = 0;
        while taken < buf.len() {
            let n = session.writer().write(&buf[taken..])?;
            taken += n;
            match flush_records(session, &mut socket) {
                Ok(()) => {}
                // Records stay queued in the session; `flush_pending` finishes them.
                Err(e) if is_transient(&e) => {
                    if n == 0 {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(taken)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.state != HandshakeState::Established {
            return Err(not_established());
        }
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let mut socket = self.transport.socket().ok_or_else(not_connected)?;

        match session.reader().read(buf) {
            Ok(n) => {
                self.plaintext = self.plaintext.saturating_sub(n);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if session.read_tls(&mut socket)? == 0 {
            return Ok(0);
        }
        let available = process_packets(session, &mut socket)?;
        // Alerts and key updates may have been queued while processing.
        let _ = flush_records(session, &mut socket);

        let n = session.reader().read(buf)?;
        self.plaintext = available.saturating_sub(n);
        Ok(n)
    }

    fn handshake(&mut self) -> Result<(), TransportError> {
        match self.state {
            HandshakeState::Established => return Ok(()),
            HandshakeState::Failed => return Err(TransportError::NotActive),
            _ => {}
        }
        if self.session.is_none() || !self.transport.is_active() {
            return Err(TransportError::NotActive);
        }

        self.state = HandshakeState::Handshaking;
        match self.drive_handshake() {
            Ok(held) => {
                self.state = HandshakeState::Established;
                self.plaintext = held;
                log::debug!("[TLS] handshake with {} complete", self.transport.info());
                Ok(())
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                let peer = self.transport.info().to_string();
                log::debug!("[TLS] handshake with {} failed: {}", peer, e);
                self.transport.close();
                Err(TransportError::Handshake {
                    peer,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn has_buffered_input(&self) -> bool {
        self.plaintext > 0
    }

    fn wants_write(&self) -> bool {
        self.transport.is_active() && self.session.as_ref().is_some_and(|s| s.wants_write())
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let mut socket = self.transport.socket().ok_or_else(not_connected)?;
        flush_records(session, &mut socket)
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        self.transport.set_nonblocking()
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.transport.set_nodelay(nodelay)
    }

    fn close(&mut self) {
        if !self.transport.is_active() {
            return;
        }
        if let (Some(session), Some(mut socket)) = (self.session.as_mut(), self.transport.socket())
        {
            if self.state == HandshakeState::Established {
                session.send_close_notify();
                let _ = session.write_tls(&mut socket);
            }
        }
        self.session = None;
        self.plaintext = 0;
        self.transport.close();
    }

    fn is_secure(&self) -> bool {
        true
    }
}

impl fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match &self.session {
            Some(rustls::Connection::Client(_)) => "client",
            Some(rustls::Connection::Server(_)) => "server",
            None => "none",
        };
        f.debug_struct("SecureConnection")
            .field("transport", &self.transport)
            .field("role", &role)
            .field("hostname", &self.hostname)
            .field("state", &self.state)
            .finish()
    }
}
