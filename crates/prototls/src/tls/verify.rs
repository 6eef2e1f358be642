// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer certificate verification.
//!
//! The client handshake runs with [`DeferredVerifier`], which checks the
//! handshake signatures but accepts any chain. The chain is judged later by
//! [`analyze`], which decomposes the outcome into [`VerifyResult`] flags:
//!
//! | Flag                    | Source                                   |
//! |-------------------------|------------------------------------------|
//! | `not_trusted`           | webpki chain validation failed           |
//! | `unknown_issuer`        | no path to a trust anchor                |
//! | `revoked`               | serial listed in a loaded CRL            |
//! | `expired`               | `notAfter` in the past                   |
//! | `not_yet_active`        | `notBefore` in the future                |
//! | `malformed_certificate` | end-entity certificate does not parse    |
//! | `hostname_mismatch`     | SAN / CN does not cover the dialed host  |

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::*;

use crate::error::VerifyError;

/// Decomposed peer certificate status.
///
/// All flags false means the chain is trusted, current, unrevoked and
/// matches the hostname recorded at connect time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyResult {
    pub not_trusted: bool,
    pub unknown_issuer: bool,
    pub revoked: bool,
    pub expired: bool,
    pub not_yet_active: bool,
    pub malformed_certificate: bool,
    pub hostname_mismatch: bool,
}

impl VerifyResult {
    /// True when no flag is raised.
    pub fn is_valid(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.not_trusted, "not-trusted"),
            (self.unknown_issuer, "unknown-issuer"),
            (self.revoked, "revoked"),
            (self.expired, "expired"),
            (self.not_yet_active, "not-yet-active"),
            (self.malformed_certificate, "malformed-certificate"),
            (self.hostname_mismatch, "hostname-mismatch"),
        ];
        let raised: Vec<&str> = flags.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if raised.is_empty() {
            f.write_str("valid")
        } else {
            f.write_str(&raised.join(", "))
        }
    }
}

/// Evaluate a peer chain (end-entity first).
pub(crate) fn analyze(
    chain: &[CertificateDer<'static>],
    hostname: Option<&str>,
    verifier: Option<&WebPkiServerVerifier>,
) -> Result<VerifyResult, VerifyError> {
    let (end_entity, intermediates) = chain.split_first().ok_or(VerifyError::NoPeerCertificate)?;
    let (_, cert) = parse_x509_certificate(end_entity.as_ref())
        .map_err(|e| VerifyError::MalformedCertificate(e.to_string()))?;

    let mut result = VerifyResult::default();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let validity = cert.validity();
    result.not_yet_active = now < validity.not_before.timestamp();
    result.expired = now > validity.not_after.timestamp();

    match verifier {
        None => {
            result.not_trusted = true;
            result.unknown_issuer = true;
        }
        Some(verifier) => {
            // The name is checked separately below; any name works here.
            let name = hostname
                .and_then(|h| ServerName::try_from(h.to_string()).ok())
                .unwrap_or_else(|| ServerName::from(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));

            match verifier.verify_server_cert(end_entity, intermediates, &name, &[], UnixTime::now())
            {
                Ok(_) => {}
                Err(rustls::Error::InvalidCertificate(err)) => classify(err, &mut result),
                Err(err) => {
                    log::debug!("[TLS] chain verification: {}", err);
                    result.not_trusted = true;
                }
            }
        }
    }

    if let Some(host) = hostname {
        result.hostname_mismatch = !matches_hostname(&cert, host);
    }

    Ok(result)
}

fn classify(err: CertificateError, result: &mut VerifyResult) {
    match err {
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            return;
        }
        CertificateError::UnknownIssuer => result.unknown_issuer = true,
        CertificateError::Revoked => result.revoked = true,
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
            result.expired = true;
        }
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            result.not_yet_active = true;
        }
        CertificateError::BadEncoding => result.malformed_certificate = true,
        other => log::debug!("[TLS] chain rejected: {:?}", other),
    }
    result.not_trusted = true;
}

/// Whether `cert` covers `host` (SAN entries, or subject CN when there are none).
pub(crate) fn matches_hostname(cert: &X509Certificate<'_>, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    let ip = host.parse::<IpAddr>().ok();

    let mut dns_names = Vec::new();
    let mut ip_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(*dns),
                GeneralName::IPAddress(bytes) => ip_names.push(*bytes),
                _ => {}
            }
        }
    }

    if let Some(ip) = ip {
        let octets = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        if ip_names.iter().any(|b| *b == octets.as_slice()) {
            return true;
        }
    } else if dns_names.iter().any(|pattern| matches_pattern(pattern, host)) {
        return true;
    }

    if !dns_names.is_empty() || !ip_names.is_empty() {
        return false;
    }

    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| match ip {
            Some(_) => cn == host,
            None => matches_pattern(cn, host),
        })
}

/// Case-insensitive match with a single leading `*.` label wildcard.
fn matches_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}

// ============================================================================
// Handshake-time verifier
// ============================================================================

/// Checks handshake signatures, defers chain validation to `verify()`.
#[derive(Debug)]
pub(crate) struct DeferredVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeferredVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
