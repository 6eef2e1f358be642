// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! Errors are split by the layer that raises them:
//!
//! - [`TransportError`] - resolve/connect/bind/listen/accept and handshake failures
//! - [`SecurityError`] - credential loading and TLS configuration
//! - [`VerifyError`] - peer certificate verification that could not run
//! - [`FramingError`] - encode/decode failures on a [`FramedPeer`](crate::FramedPeer)
//! - [`PacketError`] - failures reported by a [`Packet`](crate::Packet) implementation
//! - [`ConfigError`] - invalid [`ServerConfig`](crate::ServerConfig) values

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::tls::VerifyResult;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {target}: {source}")]
    Resolve { target: String, source: io::Error },

    #[error("could not connect to {target}: {source}")]
    Connect { target: String, source: io::Error },

    #[error("could not bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("socket creation failed: {0}")]
    Socket(#[source] io::Error),

    #[error("connection is not active")]
    NotActive,

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when the underlying cause is a non-blocking "try again".
    pub fn is_would_block(&self) -> bool {
        match self {
            Self::Accept(e) | Self::Io(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// Credential loading and TLS configuration errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("cannot read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid PEM in {}: {reason}", .path.display())]
    Pem { path: PathBuf, reason: String },

    #[error("no certificates found in {}", .path.display())]
    NoCertificates { path: PathBuf },

    #[error("server role requires a local certificate and private key")]
    MissingServerIdentity,

    #[error("certificate and private key must be configured together")]
    IncompleteIdentity,

    #[error("certificate verifier: {0}")]
    Verifier(String),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Peer certificate verification could not produce a full result.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification requires an established session")]
    NotEstablished,

    #[error("peer presented no certificate")]
    NoPeerCertificate,

    #[error("malformed peer certificate: {0}")]
    MalformedCertificate(String),
}

impl VerifyError {
    /// Partial result for the failure cases that concern the peer certificate.
    ///
    /// `NotEstablished` has no result: nothing was inspected.
    pub fn partial_result(&self) -> Option<VerifyResult> {
        match self {
            Self::NotEstablished => None,
            Self::NoPeerCertificate | Self::MalformedCertificate(_) => Some(VerifyResult {
                malformed_certificate: true,
                ..VerifyResult::default()
            }),
        }
    }
}

/// Error reported by a [`Packet`](crate::Packet) encoder or decoder.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PacketError(pub String);

impl PacketError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Framing-layer errors raised to the caller of `send`/`recv`.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] PacketError),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] PacketError),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("no complete message buffered")]
    NoPacket,
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_peers must be at least 1")]
    NoPeers,

    #[error("handshake_workers must be at least 1 when security is enabled")]
    NoWorkers,

    #[error("max_message_size {0} must be between 1 and {max}", max = u32::MAX)]
    MessageSize(usize),

    #[error("poll_interval must be non-zero")]
    PollInterval,
}
