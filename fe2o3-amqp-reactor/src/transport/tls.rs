//! Client side TLS with `tokio-rustls`

use std::sync::Arc;

use librustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{pem::PemObject, CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use super::{Error, TlsOptions, VerifyMode};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(librustls::crypto::ring::default_provider())
}

fn load_roots(tls: &TlsOptions) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    match &tls.ca_cert_path {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            let certs: Vec<CertificateDer<'static>> = if bytes.starts_with(b"-----BEGIN") {
                CertificateDer::pem_slice_iter(&bytes)
                    .collect::<Result<_, _>>()
                    .map_err(|err| Error::Security(format!("Invalid PEM certificate: {}", err)))?
            } else {
                vec![CertificateDer::from(bytes)]
            };
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|err| Error::Security(err.to_string()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Verifies the certificate chain but not the host name
#[derive(Debug)]
struct PeerVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, librustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(librustls::Error::InvalidCertificate(err))
                if format!("{:?}", err).starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            result => result,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, librustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, librustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate, only checking handshake signatures
#[derive(Debug)]
struct AnonymousVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnonymousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, librustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, librustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, librustls::Error> {
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

/// Builds the rustls client configuration for the given options
pub fn client_config(tls: &TlsOptions) -> Result<ClientConfig, Error> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::Security(err.to_string()))?;

    let config = match tls.verify_mode {
        VerifyMode::VerifyPeerName => builder
            .with_root_certificates(load_roots(tls)?)
            .with_no_client_auth(),
        VerifyMode::VerifyPeer => {
            let inner =
                WebPkiServerVerifier::builder_with_provider(Arc::new(load_roots(tls)?), provider)
                    .build()
                    .map_err(|err| Error::Security(err.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PeerVerifier { inner }))
                .with_no_client_auth()
        }
        VerifyMode::AnonymousPeer => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnonymousVerifier { provider }))
            .with_no_client_auth(),
    };
    Ok(config)
}

/// Performs the TLS handshake over an established TCP stream
pub async fn connect_tls(
    stream: TcpStream,
    domain: &str,
    tls: &TlsOptions,
) -> Result<TlsStream<TcpStream>, Error> {
    let config = client_config(tls)?;
    let connector = TlsConnector::from(Arc::new(config));
    let domain = ServerName::try_from(domain.to_string())
        .map_err(|err| Error::Security(err.to_string()))?;

    connector.connect(domain, stream).await.map_err(|err| {
        let is_tls_failure = err
            .get_ref()
            .map(|inner| inner.is::<librustls::Error>())
            .unwrap_or(false);
        match is_tls_failure {
            true => Error::Security(err.to_string()),
            false => Error::Io(err),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{client_config, TlsOptions, VerifyMode};

    #[test]
    fn test_every_verify_mode_builds_a_config() {
        for verify_mode in [
            VerifyMode::VerifyPeerName,
            VerifyMode::VerifyPeer,
            VerifyMode::AnonymousPeer,
        ] {
            let options = TlsOptions {
                ca_cert_path: None,
                verify_mode,
            };
            assert!(client_config(&options).is_ok());
        }
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        let options = TlsOptions {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            verify_mode: VerifyMode::VerifyPeerName,
        };
        assert!(client_config(&options).is_err());
    }
}
