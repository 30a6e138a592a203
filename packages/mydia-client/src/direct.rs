//! Pinned direct transport.
//!
//! Home servers sit behind self-signed or rotating certificates, so the
//! direct transport ignores the WebPKI entirely and pins the leaf
//! certificate's SHA-256 fingerprint instead. The fingerprint observed at
//! pairing time is the trust anchor; a handshake with anything else fails.
//!
//! Unknown servers (no stored fingerprint) are only accepted when the caller
//! passes `allow_unknown` — and then pinning is the caller's job via
//! [`FingerprintStore::trust`] before the next connection. TOFU on this
//! path is interactive, never automatic.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::error::{ClientError, TransportError};
use crate::fingerprint::{fingerprint, fingerprints_equal, FingerprintStore};

/// Build an HTTP client whose TLS handshake enforces the pinned fingerprint
/// for `instance_id`.
pub fn create_client(
    fingerprints: &FingerprintStore,
    instance_id: &str,
    allow_unknown: bool,
) -> Result<reqwest::Client, ClientError> {
    let pinned = fingerprints.lookup(instance_id);
    if pinned.is_none() && !allow_unknown {
        tracing::debug!(instance_id, "No pinned certificate; connections will be refused");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(PinnedCertVerifier { pinned, allow_unknown, provider: provider.clone() });

    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Other(format!("TLS config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .build()
        .map_err(|e| ClientError::Transport(TransportError::Http(e)))
}

/// Certificate verifier that trusts exactly one fingerprint.
#[derive(Debug)]
struct PinnedCertVerifier {
    /// The stored fingerprint for this instance, if any.
    pinned: Option<String>,
    /// Accept an unpinned server (first connection before interactive trust).
    allow_unknown: bool,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let observed = fingerprint(end_entity.as_ref());
        match &self.pinned {
            Some(expected) if fingerprints_equal(expected, &observed) => {
                Ok(ServerCertVerified::assertion())
            }
            Some(_) => {
                tracing::warn!("TLS handshake refused: certificate fingerprint mismatch");
                Err(rustls::Error::General("certificate fingerprint mismatch".into()))
            }
            None if self.allow_unknown => Ok(ServerCertVerified::assertion()),
            None => Err(rustls::Error::General(
                "no pinned certificate for this server".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
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
