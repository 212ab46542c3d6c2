//! TLS configuration for encrypted Bolt connections.
//!
//! Three trust modes: the system trust store, a user-supplied CA bundle, or
//! trust-all (insecure, for self-signed test clusters). The protocol floor
//! is TLS 1.2. An optional client-certificate provider is consulted on
//! every negotiation, so rotated certificates take effect without a restart.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::ring as crypto;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::{Error, Result};

use super::driver::{ClientCertificateProvider, TrustStrategy};

/// TLS protocol versions offered: 1.2 as the floor, 1.3 preferred.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Builds rustls client configurations for one driver.
pub(crate) struct TlsClient {
    strategy: TrustStrategy,
    client_certificate: Option<Arc<dyn ClientCertificateProvider>>,
    /// Cached config; only usable when no certificate provider is set.
    cached: Option<Arc<ClientConfig>>,
}

impl TlsClient {
    pub(crate) fn new(
        strategy: TrustStrategy,
        client_certificate: Option<Arc<dyn ClientCertificateProvider>>,
    ) -> Result<Self> {
        let mut client = Self {
            strategy,
            client_certificate,
            cached: None,
        };
        if client.client_certificate.is_none() {
            client.cached = Some(Arc::new(client.build_config()?));
        }
        Ok(client)
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>> {
        let config = match self.cached {
            Some(ref cached) => Arc::clone(cached),
            None => Arc::new(self.build_config()?),
        };
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Security(format!("invalid TLS server name {host:?}")))?;
        TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(|e| Error::Security(format!("TLS negotiation with {host} failed: {e}")))
    }

    fn build_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(crypto::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::Security(format!("TLS setup failed: {e}")))?;

        let wants_client_cert = self.client_certificate.as_deref();
        let finish = |builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>|
         -> Result<ClientConfig> {
            match wants_client_cert.and_then(|p| p.fetch()) {
                Some((certs_pem, key_pem)) => {
                    let certs = parse_cert_pem(&certs_pem)?;
                    let key = parse_key_pem(&key_pem)?;
                    builder
                        .with_client_auth_cert(certs, key)
                        .map_err(|e| Error::Security(format!("bad client certificate: {e}")))
                }
                None => Ok(builder.with_no_client_auth()),
            }
        };

        match self.strategy {
            TrustStrategy::TrustSystemCas => {
                let mut roots = RootCertStore::empty();
                let loaded = rustls_native_certs::load_native_certs();
                for cert in loaded.certs {
                    // Unparseable store entries are skipped, matching what
                    // browsers and the other drivers do.
                    let _ = roots.add(cert);
                }
                if roots.is_empty() {
                    return Err(Error::Security(
                        "system trust store yielded no usable CA certificates".to_string(),
                    ));
                }
                finish(builder.with_root_certificates(roots))
            }
            TrustStrategy::TrustCustomCas { ref certificates } => {
                let mut roots = RootCertStore::empty();
                for pem in certificates {
                    for cert in parse_cert_pem(pem)? {
                        roots
                            .add(cert)
                            .map_err(|e| Error::Security(format!("bad CA certificate: {e}")))?;
                    }
                }
                if roots.is_empty() {
                    return Err(Error::Security("custom CA bundle is empty".to_string()));
                }
                finish(builder.with_root_certificates(roots))
            }
            TrustStrategy::TrustAllCertificates => {
                let verifier = Arc::new(AcceptAnyCertificate {
                    schemes: provider
                        .signature_verification_algorithms
                        .supported_schemes(),
                });
                finish(
                    builder
                        .dangerous()
                        .with_custom_certificate_verifier(verifier),
                )
            }
        }
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient")
            .field("strategy", &self.strategy)
            .field(
                "client_certificate",
                &self.client_certificate.is_some(),
            )
            .finish()
    }
}

fn parse_cert_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Security(format!("unreadable certificate PEM: {e}")))?;
    Ok(certs)
}

fn parse_key_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Security(format!("unreadable private key PEM: {e}")))?
        .ok_or_else(|| Error::Security("no private key found in PEM".to_string()))
}

/// Verifier for the trust-all mode: accepts any chain, still checks nothing.
#[derive(Debug)]
struct AcceptAnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_all_builds_without_roots() {
        let client = TlsClient::new(TrustStrategy::TrustAllCertificates, None).unwrap();
        assert!(client.cached.is_some());
    }

    #[test]
    fn empty_custom_bundle_is_rejected() {
        let result = TlsClient::new(
            TrustStrategy::TrustCustomCas {
                certificates: vec![],
            },
            None,
        );
        assert!(matches!(result, Err(Error::Security(_))));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let result = TlsClient::new(
            TrustStrategy::TrustCustomCas {
                certificates: vec![b"not a certificate".to_vec()],
            },
            None,
        );
        assert!(matches!(result, Err(Error::Security(_))));
    }

    #[test]
    fn provider_presence_disables_config_caching() {
        #[derive(Debug)]
        struct NoCert;
        impl ClientCertificateProvider for NoCert {
            fn fetch(&self) -> Option<(Vec<u8>, Vec<u8>)> {
                None
            }
        }
        let client =
            TlsClient::new(TrustStrategy::TrustAllCertificates, Some(Arc::new(NoCert))).unwrap();
        assert!(client.cached.is_none());
    }
}
