// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # prototls - framed TCP/TLS transport
//!
//! A small networking layer for length-prefixed message protocols: plain or
//! TLS stream connections, a framing layer, and a single-reactor server that
//! offloads TLS handshakes to a worker pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use prototls::{FramedPeer, Server, ServerConfig, ServerHandler};
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_packet(&mut self, peer: &mut FramedPeer) {
//!         if let Ok(payload) = peer.recv_bytes() {
//!             let _ = peer.send_bytes(&payload);
//!             peer.flush();
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), prototls::TransportError> {
//!     prototls::init();
//!     let mut server = Server::new(ServerConfig::new(1234), Echo)?;
//!     server.serve()?;
//!     prototls::deinit();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Application (ServerHandler)                  |
//! |              on_join | on_packet (one per message) | on_leave       |
//! +---------------------------------------------------------------------+
//! |                             Server                                  |
//! |   ReadinessSet (poll) | peer registry | HandshakePool | HandoffQueue|
//! +---------------------------------------------------------------------+
//! |                           FramedPeer                                |
//! |        | u32 length (big endian) | payload | ... + Packet codec     |
//! +---------------------------------------------------------------------+
//! |                    Connection (trait object)                        |
//! |        TcpConnection (socket2)  |  SecureConnection (rustls)        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Connection`] | Byte-stream seam implemented by plain and TLS connections |
//! | [`SecureConnection`] | TLS session with deferred certificate verification |
//! | [`SecurityContext`] | Immutable credentials shared by every TLS session |
//! | [`FramedPeer`] | Connection plus length-prefix framing buffers |
//! | [`Server`] | Reactor dispatching framed messages to a [`ServerHandler`] |
//!
//! The crate targets Unix: descriptors are raw file descriptors and the
//! readiness set wraps `poll(2)`.

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handoff;
pub mod metrics;
pub mod packet;
pub mod pool;
pub mod readiness;
pub mod server;
pub mod tls;

pub use config::ServerConfig;
pub use connection::{BoxedConnection, Connection, Descriptor, TcpConnection};
pub use error::{
    ConfigError, FramingError, PacketError, SecurityError, TransportError, VerifyError,
};
pub use framing::{FlushResult, FramedPeer, PeerId, PeerStats};
pub use handoff::HandoffQueue;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use packet::Packet;
pub use pool::HandshakePool;
pub use readiness::ReadinessSet;
pub use server::{CloseHandle, Server, ServerHandler, ServerState};
pub use tls::{
    HandshakeState, SecureConnection, SecurityConfig, SecurityContext, VerifyResult,
};

#[cfg(feature = "json")]
pub use packet::Json;

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Prepare the process for socket I/O. Idempotent.
///
/// `SIGPIPE` is ignored so that writing to a reset peer returns an error
/// instead of terminating the process.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    // SAFETY: installing SIG_IGN for SIGPIPE has no preconditions and does
    // not touch Rust-managed state.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    log::debug!("[NET] socket subsystem initialized");
}

/// Counterpart of [`init`]. Idempotent; the signal disposition is kept.
pub fn deinit() {
    if INITIALIZED.swap(false, Ordering::AcqRel) {
        log::debug!("[NET] socket subsystem released");
    }
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
