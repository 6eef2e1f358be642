// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use prototls::{
    CloseHandle, Connection, FramedPeer, PeerId, SecurityConfig, SecurityContext, Server,
    ServerConfig, ServerHandler, ServerMetrics, TcpConnection,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;

pub const GREETING: &str = "Welcome!";
pub const STEP: Duration = Duration::from_millis(50);

// ============================================================================
// Server harness
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Join(PeerId),
    Packet(PeerId, String),
    Leave(PeerId),
}

/// Greets every peer and reports callbacks over a channel.
pub struct EventSink {
    events: Sender<Event>,
}

impl ServerHandler for EventSink {
    fn on_join(&mut self, peer: &mut FramedPeer) {
        let _ = peer.send(&GREETING.to_string());
        peer.flush();
        let _ = self.events.send(Event::Join(peer.id()));
    }

    fn on_packet(&mut self, peer: &mut FramedPeer) {
        if let Ok(text) = peer.recv::<String>() {
            let _ = self.events.send(Event::Packet(peer.id(), text));
        }
    }

    fn on_leave(&mut self, peer: &mut FramedPeer) {
        let _ = self.events.send(Event::Leave(peer.id()));
    }
}

/// A server running on its own thread.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub metrics: Arc<ServerMetrics>,
    pub events: Receiver<Event>,
    close: CloseHandle,
    thread: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn start(config: ServerConfig) -> Self {
        let (tx, rx) = channel::unbounded();
        let mut server = Server::new(config, EventSink { events: tx }).unwrap();
        let addr = server.listen().unwrap();
        let metrics = server.metrics();
        let close = server.close_handle();
        let thread = thread::spawn(move || server.run().unwrap());

        Self {
            addr,
            metrics,
            events: rx,
            close,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn next_event(&self, timeout: Duration) -> Option<Event> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Close the server and collect the remaining events.
    pub fn stop(mut self) -> Vec<Event> {
        self.close.close();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
        self.events.try_iter().collect()
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.close.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn fast_config() -> ServerConfig {
    ServerConfig::new(0).with_poll_interval(Duration::from_millis(10))
}

// ============================================================================
// Clients
// ============================================================================

/// Blocking plain client with a short read timeout.
pub fn plain_client(port: u16) -> FramedPeer {
    let mut conn = TcpConnection::new();
    conn.connect("127.0.0.1", port).unwrap();
    conn.set_io_timeout(Some(STEP)).unwrap();
    FramedPeer::new(Box::new(conn))
}

/// Read one string message, giving up after `timeout`.
pub fn read_string(peer: &mut FramedPeer, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        if peer.has_packet() {
            return peer.recv::<String>().ok();
        }
        if !peer.is_active() || Instant::now() >= deadline {
            return None;
        }
        peer.on_input();
    }
}

pub fn send_string(peer: &mut FramedPeer, text: &str) {
    peer.send(&text.to_string()).unwrap();
    assert_eq!(peer.flush(), prototls::FlushResult::Complete);
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Test PKI
// ============================================================================

/// CA plus issued leaves, written as PEM files to a temporary directory.
pub struct Pki {
    dir: TempDir,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl Pki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "integration CA");
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let pki = Self {
            dir: TempDir::new().unwrap(),
            ca_cert,
            ca_key,
        };
        fs::write(pki.path("ca.pem"), pki.ca_cert.pem()).unwrap();
        pki
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Issue `<stem>.pem` / `<stem>-key.pem` for `names`.
    pub fn issue(&self, stem: &str, names: &[&str]) {
        let key = KeyPair::generate().unwrap();
        let sans: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let params = CertificateParams::new(sans).unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        fs::write(self.path(&format!("{}.pem", stem)), cert.pem()).unwrap();
        fs::write(self.path(&format!("{}-key.pem", stem)), key.serialize_pem()).unwrap();
    }

    pub fn server_context(&self, stem: &str, handshake_timeout: Duration) -> Arc<SecurityContext> {
        SecurityConfig::new()
            .with_cert_file(self.path(&format!("{}.pem", stem)))
            .with_key_file(self.path(&format!("{}-key.pem", stem)))
            .with_handshake_timeout(handshake_timeout)
            .build()
            .unwrap()
    }

    pub fn client_context(&self) -> Arc<SecurityContext> {
        SecurityContext::from_paths(self.path("ca.pem").to_str().unwrap(), "", "", "").unwrap()
    }
}

/// Connected, established TLS client wrapped in a peer.
pub fn tls_client(ctx: Arc<SecurityContext>, host: &str, port: u16) -> FramedPeer {
    let mut conn = prototls::SecureConnection::new(ctx);
    conn.connect(host, port).unwrap();
    conn.handshake().unwrap();
    conn.transport().set_io_timeout(Some(STEP)).unwrap();
    FramedPeer::new(Box::new(conn))
}
