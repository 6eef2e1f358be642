// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection trait and plain TCP implementation.
//!
//! [`Connection`] is the seam between the reactor and the byte stream it
//! drives. Plain sockets ([`TcpConnection`]) and TLS sessions
//! ([`SecureConnection`](crate::SecureConnection)) implement it, so the
//! server, the framing layer and the handshake pool handle both through a
//! [`BoxedConnection`].
//!
//! ```text
//!   active ──close()──► closed ──close()──► closed (no-op)
//! ```
//!
//! A connection owns its descriptor exclusively. `descriptor()` returning
//! `None` is the closed sentinel; the transition happens exactly once.
//!
//! # Example
//!
//! ```ignore
//! use prototls::{Connection, TcpConnection};
//!
//! let mut conn = TcpConnection::new();
//! conn.connect("localhost", 1234)?;
//! conn.send(b"\x00\x00\x00\x02hi")?;
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::TransportError;

/// Raw descriptor watched by the readiness set.
pub type Descriptor = RawFd;

/// Boxed connection for dynamic dispatch.
pub type BoxedConnection = Box<dyn Connection>;

/// Byte-stream connection over a socket descriptor.
///
/// # Result conventions
///
/// - `send`/`recv` return the number of bytes moved. `recv` returning
///   `Ok(0)` means the peer closed the stream.
/// - `WouldBlock` and `Interrupted` errors mean "nothing to do yet".
/// - Any other error means the connection is unusable.
pub trait Connection: Send + fmt::Debug {
    /// Descriptor, or `None` once closed.
    fn descriptor(&self) -> Option<Descriptor>;

    /// Remote peer description (`host:port` after connect, `ip:port` after accept).
    fn info(&self) -> &str;

    /// True iff the descriptor is valid.
    fn is_active(&self) -> bool {
        self.descriptor().is_some()
    }

    /// Local socket address, if bound or connected.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Create the socket and bind it to `port` on all interfaces.
    fn bind(&mut self, port: u16) -> Result<(), TransportError>;

    /// Start listening with the given backlog.
    fn listen(&mut self, backlog: i32) -> Result<(), TransportError>;

    /// Resolve `host` and connect to it.
    ///
    /// On failure the connection stays inactive.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Accept one pending connection.
    ///
    /// The new connection inherits this one's family, type and protocol.
    fn accept(&self) -> Result<BoxedConnection, TransportError>;

    /// Write bytes to the stream.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read bytes from the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Complete any session setup before application data flows.
    ///
    /// Plain connections have nothing to negotiate.
    fn handshake(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Decoded input is held above the socket and will not raise readiness.
    fn has_buffered_input(&self) -> bool {
        false
    }

    /// Output is held above the socket waiting for `flush_pending`.
    fn wants_write(&self) -> bool {
        false
    }

    /// Write out any output held above the socket.
    fn flush_pending(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Switch the descriptor to non-blocking mode.
    fn set_nonblocking(&mut self) -> io::Result<()>;

    /// Set TCP_NODELAY.
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Shut down and release the descriptor. Safe to call repeatedly.
    fn close(&mut self);

    /// True for TLS connections.
    fn is_secure(&self) -> bool {
        false
    }
}

// ============================================================================
// Plain TCP
// ============================================================================

/// Plain TCP connection backed by a `socket2::Socket`.
pub struct TcpConnection {
    socket: Option<Socket>,
    domain: Domain,
    ty: Type,
    protocol: Option<Protocol>,
    info: String,
    nonblocking: bool,
}

impl TcpConnection {
    /// IPv4 stream connection.
    pub fn new() -> Self {
        Self::with_family(Domain::IPV4, Type::STREAM, None)
    }

    /// IPv6 stream connection.
    pub fn ipv6() -> Self {
        Self::with_family(Domain::IPV6, Type::STREAM, None)
    }

    /// Connection with an explicit family/type/protocol triple.
    ///
    /// The triple is fixed for the lifetime of the connection.
    pub fn with_family(domain: Domain, ty: Type, protocol: Option<Protocol>) -> Self {
        Self {
            socket: None,
            domain,
            ty,
            protocol,
            info: String::new(),
            nonblocking: false,
        }
    }

    /// Socket family.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Underlying socket, if active.
    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    /// Whether `set_nonblocking` has been applied.
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Apply read and write timeouts to a blocking socket.
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let socket = self.active_socket()?;
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)
    }

    /// Accept one pending connection without boxing it.
    pub fn accept_tcp(&self) -> Result<TcpConnection, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotActive)?;
        let (stream, addr) = socket.accept().map_err(TransportError::Accept)?;
        // O_NONBLOCK is inherited from the listener on some platforms.
        stream
            .set_nonblocking(false)
            .map_err(TransportError::Accept)?;

        let info = describe(&addr);
        log::trace!("[NET] accepted {}", info);

        Ok(TcpConnection {
            socket: Some(stream),
            domain: self.domain,
            ty: self.ty,
            protocol: self.protocol,
            info,
            nonblocking: false,
        })
    }

    fn open(&self) -> Result<Socket, TransportError> {
        Socket::new(self.domain, self.ty, self.protocol).map_err(TransportError::Socket)
    }

    fn active_socket(&self) -> io::Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    fn matches_family(&self, addr: &SocketAddr) -> bool {
        if self.domain == Domain::IPV6 {
            addr.is_ipv6()
        } else {
            addr.is_ipv4()
        }
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for TcpConnection {
    fn descriptor(&self) -> Option<Descriptor> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn info(&self) -> &str {
        &self.info
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    fn bind(&mut self, port: u16) -> Result<(), TransportError> {
        self.close();
        let socket = self.open()?;

        let addr: SocketAddr = if self.domain == Domain::IPV6 {
            (Ipv6Addr::UNSPECIFIED, port).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, port).into()
        };

        socket
            .set_reuse_address(true)
            .and_then(|()| socket.bind(&addr.into()))
            .map_err(|source| TransportError::Bind { port, source })?;

        self.socket = Some(socket);
        Ok(())
    }

    fn listen(&mut self, backlog: i32) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotActive)?;
        socket.listen(backlog).map_err(TransportError::Listen)
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.close();
        self.info = format!("{}:{}", host, port);

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                target: self.info.clone(),
                source,
            })?
            .filter(|addr| self.matches_family(addr))
            .collect();

        if addrs.is_empty() {
            return Err(TransportError::Resolve {
                target: self.info.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "no address for this socket family",
                ),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            let socket = self.open()?;
            match socket.connect(&addr.into()) {
                Ok(()) => {
                    log::debug!("[NET] connected to {} ({})", self.info, addr);
                    self.socket = Some(socket);
                    self.nonblocking = false;
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("[NET] connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::Connect {
            target: self.info.clone(),
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")),
        })
    }

    fn accept(&self) -> Result<BoxedConnection, TransportError> {
        Ok(Box::new(self.accept_tcp()?))
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut socket = self.active_socket()?;
        socket.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.active_socket()?;
        socket.read(buf)
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        self.active_socket()?.set_nonblocking(true)?;
        self.nonblocking = true;
        Ok(())
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.active_socket()?.set_nodelay(nodelay)
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            // ENOTCONN on never-connected sockets is expected.
            let _ = socket.shutdown(Shutdown::Both);
            log::trace!("[NET] closed {}", self.info);
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("descriptor", &self.descriptor())
            .field("domain", &self.domain)
            .field("info", &self.info)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

fn describe(addr: &SockAddr) -> String {
    addr.as_socket()
        .map(|a| format!("{}:{}", a.ip(), a.port()))
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Mock connection for testing
// ============================================================================
