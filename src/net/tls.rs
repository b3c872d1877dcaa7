//! TLS towards backends.
//!
//! # Responsibilities
//! - Build a rustls client config from the route's TLS settings
//! - Run the handshake on freshly connected backend streams
//!
//! # Design Decisions
//! - The ring provider is selected explicitly, no process-wide default
//! - With `verify = false` any certificate chain is accepted; handshake
//!   signatures are still checked
//! - Shutdown never waits for the peer's close_notify; the stream is
//!   simply dropped

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio_rustls::TlsConnector;

use crate::config::UpstreamTlsSettings;
use crate::load_balancer::PeerPick;
use crate::net::BoxedStream;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read CA file {path}: {source}")]
    CaFile { path: String, source: io::Error },
    #[error("no certificates found in {0}")]
    EmptyCaFile(String),
    #[error("certificate verification needs a ca_file")]
    MissingRoots,
    #[error("invalid server name \"{0}\"")]
    ServerName(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Handshake driver for one route.
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl std::fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTls")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl UpstreamTls {
    pub fn from_settings(settings: &UpstreamTlsSettings) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let config = if settings.verify {
            let path = settings.ca_file.as_deref().ok_or(TlsError::MissingRoots)?;
            builder
                .with_root_certificates(load_roots(Path::new(path))?)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()
        };

        let server_name = settings
            .server_name
            .as_deref()
            .map(|name| {
                ServerName::try_from(name)
                    .map(|n| n.to_owned())
                    .map_err(|_| TlsError::ServerName(name.to_string()))
            })
            .transpose()?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Wrap `stream` in a client TLS session.
    pub async fn handshake(&self, stream: BoxedStream, peer: &PeerPick) -> io::Result<BoxedStream> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => peer_server_name(&peer.name)?,
        };
        let tls = self.connector.connect(name, stream).await?;
        Ok(Box::new(tls))
    }
}

fn peer_server_name(declared: &str) -> io::Result<ServerName<'static>> {
    let host = match declared.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => declared,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host)
        .map(|n| n.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| TlsError::CaFile {
        path: display.clone(),
        source,
    })?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|source| TlsError::CaFile {
            path: display.clone(),
            source,
        })?;
        roots.add(cert)?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyCaFile(display));
    }
    Ok(roots)
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
