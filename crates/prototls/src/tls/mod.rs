// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS support using rustls.
//!
//! Credentials are loaded once into an immutable [`SecurityContext`] and
//! shared by every [`SecureConnection`] through an `Arc`. Dropping the last
//! reference releases them.
//!
//! ```text
//!   SecurityConfig ──build()──► Arc<SecurityContext>
//!                                  │
//!          ┌───────────────────────┼───────────────────────┐
//!          ▼                       ▼                       ▼
//!   SecureConnection        SecureConnection        SecureConnection
//!   (client role)           (listening)             (accepted, server role)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use prototls::tls::{SecurityConfig, SecureConnection};
//!
//! let ctx = SecurityConfig::new()
//!     .with_ca_file("ca-cert.pem")
//!     .build()?;
//!
//! let mut conn = SecureConnection::new(ctx);
//! conn.connect("localhost", 1234)?;
//! conn.handshake()?;
//! let result = conn.verify()?;
//! ```
//!
//! # Security Notes
//!
//! - Chain validation is deferred to [`SecureConnection::verify`]; the
//!   handshake itself only checks that the peer holds the presented key.
//!   Callers decide policy from the returned flags.
//! - Any of the four credential paths may be omitted. A server needs both a
//!   certificate and a key.

mod connection;
mod verify;

pub use connection::{HandshakeState, SecureConnection};
pub use verify::VerifyResult;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::SecurityError;
use verify::DeferredVerifier;

/// Default bound on one handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

/// Builder for a [`SecurityContext`].
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    ca_file: Option<PathBuf>,
    crl_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    builtin_roots: bool,
    handshake_timeout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            crl_file: None,
            cert_file: None,
            key_file: None,
            builtin_roots: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl SecurityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// PEM bundle of trust anchors.
    pub fn with_ca_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// PEM certificate revocation lists.
    pub fn with_crl_file(mut self, path: impl AsRef<Path>) -> Self {
        self.crl_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// PEM certificate chain presented to peers.
    pub fn with_cert_file(mut self, path: impl AsRef<Path>) -> Self {
        self.cert_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// PEM private key matching the certificate.
    pub fn with_key_file(mut self, path: impl AsRef<Path>) -> Self {
        self.key_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Also trust the bundled Mozilla root set.
    pub fn with_builtin_roots(mut self) -> Self {
        self.builtin_roots = true;
        self
    }

    /// Upper bound on one handshake, including retries on would-block.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Load every configured file and build the shared context.
    pub fn build(self) -> Result<Arc<SecurityContext>, SecurityError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        if self.builtin_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        if let Some(path) = &self.ca_file {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        let trust_anchors = roots.len();

        let crls = match &self.crl_file {
            Some(path) => load_crls(path)?,
            None => Vec::new(),
        };
        let revocation_lists = crls.len();

        let identity = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((load_certs(cert)?, load_key(key)?)),
            (None, None) => None,
            _ => return Err(SecurityError::IncompleteIdentity),
        };

        let chain_verifier = if roots.is_empty() {
            None
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .with_crls(crls)
                    .allow_unknown_revocation_status()
                    .build()
                    .map_err(|e| SecurityError::Verifier(e.to_string()))?;
            Some(verifier)
        };

        let client_builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredVerifier::new(Arc::clone(
                &provider,
            ))));
        let client = match &identity {
            Some((certs, key)) => {
                client_builder.with_client_auth_cert(certs.clone(), key.clone_key())?
            }
            None => client_builder.with_no_client_auth(),
        };

        let server = match identity {
            Some((certs, key)) => Some(Arc::new(
                ServerConfig::builder_with_provider(Arc::clone(&provider))
                    .with_safe_default_protocol_versions()?
                    .with_no_client_auth()
                    .with_single_cert(certs, key)?,
            )),
            None => None,
        };

        log::debug!(
            "[TLS] context ready: {} trust anchors, {} CRLs, server identity: {}",
            trust_anchors,
            revocation_lists,
            server.is_some()
        );

        Ok(Arc::new(SecurityContext {
            client: Arc::new(client),
            server,
            chain_verifier,
            handshake_timeout: self.handshake_timeout,
            trust_anchors,
            revocation_lists,
        }))
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// Immutable TLS credentials shared by every session.
pub struct SecurityContext {
    client: Arc<ClientConfig>,
    server: Option<Arc<ServerConfig>>,
    chain_verifier: Option<Arc<WebPkiServerVerifier>>,
    handshake_timeout: Duration,
    trust_anchors: usize,
    revocation_lists: usize,
}

impl SecurityContext {
    /// Build from the four credential paths; an empty path disables that item.
    pub fn from_paths(
        ca_path: &str,
        crl_path: &str,
        cert_path: &str,
        key_path: &str,
    ) -> Result<Arc<Self>, SecurityError> {
        let mut config = SecurityConfig::new();
        if !ca_path.is_empty() {
            config = config.with_ca_file(ca_path);
        }
        if !crl_path.is_empty() {
            config = config.with_crl_file(crl_path);
        }
        if !cert_path.is_empty() {
            config = config.with_cert_file(cert_path);
        }
        if !key_path.is_empty() {
            config = config.with_key_file(key_path);
        }
        config.build()
    }

    /// Whether accepted connections can be served (certificate and key present).
    pub fn can_serve(&self) -> bool {
        self.server.is_some()
    }

    pub fn trust_anchor_count(&self) -> usize {
        self.trust_anchors
    }

    pub fn revocation_list_count(&self) -> usize {
        self.revocation_lists
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub(crate) fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client)
    }

    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, SecurityError> {
        self.server
            .as_ref()
            .map(Arc::clone)
            .ok_or(SecurityError::MissingServerIdentity)
    }

    pub(crate) fn chain_verifier(&self) -> Option<&WebPkiServerVerifier> {
        self.chain_verifier.as_deref()
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("trust_anchors", &self.trust_anchors)
            .field("revocation_lists", &self.revocation_lists)
            .field("can_serve", &self.can_serve())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

// ============================================================================
// PEM loading
// ============================================================================

fn read_file(path: &Path) -> Result<Vec<u8>, SecurityError> {
    fs::read(path).map_err(|source| SecurityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn pem_error(path: &Path, e: impl fmt::Display) -> SecurityError {
    SecurityError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SecurityError> {
    let data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&data)
        .collect::<Result<_, _>>()
        .map_err(|e| pem_error(path, e))?;

    if certs.is_empty() {
        return Err(SecurityError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, SecurityError> {
    let data = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&data).map_err(|e| pem_error(path, e))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, SecurityError> {
    let data = read_file(path)?;
    CertificateRevocationListDer::pem_slice_iter(&data)
        .collect::<Result<_, _>>()
        .map_err(|e| pem_error(path, e))
}

// ============================================================================
// Test certificates
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::TestPki;
    use super::*;

    #[test]
    fn test_empty_config_builds_client_only() {
        let ctx = SecurityConfig::new().build().unwrap();
        assert!(!ctx.can_serve());
        assert_eq!(ctx.trust_anchor_count(), 0);
        assert!(ctx.chain_verifier().is_none());
        assert_eq!(ctx.handshake_timeout(), DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(matches!(
            ctx.server_config(),
            Err(SecurityError::MissingServerIdentity)
        ));
    }

    #[test]
    fn test_from_paths_empty_strings_disable() {
        let ctx = SecurityContext::from_paths("", "", "", "").unwrap();
        assert!(!ctx.can_serve());
    }

    #[test]
    fn test_full_context() {
        let pki = TestPki::new();
        pki.issue("server", &["localhost"], 10, false);
        pki.revoke(&[99]);

        let ctx = SecurityContext::from_paths(
            pki.path("ca.pem").to_str().unwrap(),
            pki.path("crl.pem").to_str().unwrap(),
            pki.path("server.pem").to_str().unwrap(),
            pki.path("server-key.pem").to_str().unwrap(),
        )
        .unwrap();

        assert!(ctx.can_serve());
        assert_eq!(ctx.trust_anchor_count(), 1);
        assert_eq!(ctx.revocation_list_count(), 1);
        assert!(ctx.chain_verifier().is_some());
        assert!(format!("{:?}", ctx).contains("can_serve: true"));
    }

    #[test]
    fn test_builtin_roots() {
        let ctx = SecurityConfig::new().with_builtin_roots().build().unwrap();
        assert!(ctx.trust_anchor_count() > 50);
    }

    #[test]
    fn test_missing_file() {
        let err = SecurityConfig::new()
            .with_ca_file("/nonexistent/ca.pem")
            .build()
            .unwrap_err();
        assert!(matches!(err, SecurityError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_file_without_certificates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "not a certificate\n").unwrap();

        let err = SecurityConfig::new().with_ca_file(&path).build().unwrap_err();
        assert!(matches!(err, SecurityError::NoCertificates { .. }));
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let pki = TestPki::new();
        pki.issue("server", &["localhost"], 10, false);

        let err = SecurityConfig::new()
            .with_cert_file(pki.path("server.pem"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SecurityError::IncompleteIdentity));
    }
}
