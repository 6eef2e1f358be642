// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! prototls-echo - framed greeting server and client
//!
//! `serve` greets every joining peer and answers each message it receives.
//! `connect` dials a server (optionally over TLS), prints the certificate
//! verification flags, waits for the greeting and replies.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use prototls::packet::Json;
use prototls::{
    Connection, FramedPeer, SecureConnection, SecurityConfig, Server, ServerConfig,
    ServerHandler, TcpConnection, VerifyResult,
};
use serde::{Deserialize, Serialize};

/// prototls greeting server and client
#[derive(Parser, Debug)]
#[command(name = "prototls-echo")]
#[command(version)]
#[command(about = "Framed TCP/TLS greeting server and client")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Listen / connect port
    #[arg(short, long, default_value = "1234", global = true)]
    port: u16,

    /// Trust anchors (PEM)
    #[arg(long, global = true)]
    ca: Option<PathBuf>,

    /// Certificate revocation list (PEM)
    #[arg(long, global = true)]
    crl: Option<PathBuf>,

    /// Local certificate chain (PEM)
    #[arg(long, global = true)]
    cert: Option<PathBuf>,

    /// Local private key (PEM)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Use TLS
    #[arg(long, global = true)]
    tls: bool,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the greeting server
    Serve {
        /// Maximum concurrent peers
        #[arg(long, default_value = "1024")]
        max_peers: usize,

        /// Handshake worker threads
        #[arg(long, default_value = "8")]
        workers: usize,
    },

    /// Connect, verify, exchange one greeting
    Connect {
        /// Server host name
        #[arg(default_value = "localhost")]
        host: String,

        /// Reply sent after the greeting
        #[arg(short, long, default_value = "Thanks!")]
        message: String,

        /// Seconds to wait for each server message
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

/// Application payload carried in every frame.
#[derive(Serialize, Deserialize, Debug)]
struct Chat {
    text: String,
}

fn chat(text: impl Into<String>) -> Json<Chat> {
    Json(Chat { text: text.into() })
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    prototls::init();
    let result = run(&args);
    prototls::deinit();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &args.mode {
        Mode::Serve { max_peers, workers } => run_server(args, *max_peers, *workers),
        Mode::Connect {
            host,
            message,
            timeout,
        } => run_client(args, host, message, Duration::from_secs(*timeout)),
    }
}

fn security(args: &Args) -> SecurityConfig {
    let mut config = SecurityConfig::new();
    if let Some(path) = &args.ca {
        config = config.with_ca_file(path);
    }
    if let Some(path) = &args.crl {
        config = config.with_crl_file(path);
    }
    if let Some(path) = &args.cert {
        config = config.with_cert_file(path);
    }
    if let Some(path) = &args.key {
        config = config.with_key_file(path);
    }
    config
}

// ============================================================================
// Server
// ============================================================================

struct Greeter;

impl ServerHandler for Greeter {
    fn on_join(&mut self, peer: &mut FramedPeer) {
        println!("[+] {} {}", peer.id(), peer.info());
        if let Err(e) = peer.send(&chat("Welcome!")) {
            log::warn!("greeting {} failed: {}", peer.info(), e);
        }
        peer.flush();
    }

    fn on_packet(&mut self, peer: &mut FramedPeer) {
        match peer.recv::<Json<Chat>>() {
            Ok(Json(message)) => {
                println!("[<] {} {}: {}", peer.id(), peer.info(), message.text);
                let _ = peer.send(&chat(format!("got {} bytes", message.text.len())));
                peer.flush();
            }
            Err(e) => log::warn!("{} sent an unreadable message: {}", peer.info(), e),
        }
    }

    fn on_leave(&mut self, peer: &mut FramedPeer) {
        let stats = peer.stats();
        println!(
            "[-] {} {} ({} in / {} out)",
            peer.id(),
            peer.info(),
            stats.messages_received,
            stats.messages_sent
        );
    }
}

fn run_server(
    args: &Args,
    max_peers: usize,
    workers: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::new(args.port)
        .with_max_peers(max_peers)
        .with_handshake_workers(workers);
    if args.tls {
        config = config.with_security(security(args).build()?);
    }

    let mut server = Server::new(config, Greeter)?;
    let addr = server.listen()?;
    println!(
        "Listening on {} ({})",
        addr,
        if args.tls { "TLS" } else { "plain TCP" }
    );

    let close = server.close_handle();
    ctrlc::set_handler(move || close.close())?;
    println!("  Press Ctrl+C to stop\n");

    server.run()?;

    let snapshot = server.metrics().snapshot();
    println!(
        "\nServed {} peers, {} messages, {} failed handshakes",
        snapshot.peers_joined, snapshot.packets_dispatched, snapshot.handshakes_failed
    );
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

fn run_client(
    args: &Args,
    host: &str,
    message: &str,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn: Box<dyn Connection> = if args.tls {
        let mut conn = SecureConnection::new(security(args).build()?);
        conn.connect(host, args.port)?;
        conn.handshake()?;
        match conn.verify() {
            Ok(result) => print_flags(&result),
            Err(e) => {
                println!("Verification incomplete: {}", e);
                if let Some(partial) = e.partial_result() {
                    print_flags(&partial);
                }
            }
        }
        conn.transport().set_io_timeout(Some(Duration::from_millis(100)))?;
        Box::new(conn)
    } else {
        let mut conn = TcpConnection::new();
        conn.connect(host, args.port)?;
        conn.set_io_timeout(Some(Duration::from_millis(100)))?;
        Box::new(conn)
    };

    let mut peer = FramedPeer::new(conn);
    println!("Connected to {}", peer.info());

    let greeting = wait_for(&mut peer, timeout)?;
    println!("Server says: {}", greeting.text);

    peer.send(&chat(message))?;
    peer.flush();

    let reply = wait_for(&mut peer, timeout)?;
    println!("Server replied: {}", reply.text);

    peer.close();
    Ok(())
}

fn wait_for(peer: &mut FramedPeer, timeout: Duration) -> Result<Chat, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + timeout;
    while !peer.has_packet() {
        if !peer.is_active() {
            return Err("connection closed by server".into());
        }
        if Instant::now() >= deadline {
            return Err("timed out waiting for server".into());
        }
        peer.on_input();
    }
    let Json(message) = peer.recv::<Json<Chat>>()?;
    Ok(message)
}

fn print_flags(result: &VerifyResult) {
    println!("Certificate verification:");
    println!("  not trusted:           {}", result.not_trusted);
    println!("  unknown issuer:        {}", result.unknown_issuer);
    println!("  revoked:               {}", result.revoked);
    println!("  expired:               {}", result.expired);
    println!("  not yet active:        {}", result.not_yet_active);
    println!("  malformed certificate: {}", result.malformed_certificate);
    println!("  hostname mismatch:     {}", result.hostname_mismatch);
}
