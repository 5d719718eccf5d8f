//! TLS over TCP dialing.
//!
//! Blaze endpoints present self-signed or otherwise unverifiable
//! certificates, so the client config accepts any server certificate.
//! Handshake signatures are still checked against the presented key.
//!
//! # Example
//!
//! ```ignore
//! use blaze_client::transport::connect_tls;
//! use std::time::Duration;
//!
//! let stream = connect_tls("blaze.example.net", 10539, Duration::from_secs(10)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{BlazeError, Result};

/// Certificate verifier that trusts every server certificate.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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

/// Build a client config with certificate validation disabled.
pub fn insecure_client_config() -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| BlazeError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();
    Ok(config)
}

/// Open a TCP connection to `host:port` and run the TLS handshake.
///
/// # Errors
///
/// `Connection` for DNS/TCP failures and timeouts, `Tls` for an invalid
/// server name.
pub async fn connect_tls(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| BlazeError::Tls(format!("Invalid server name {host}: {e}")))?;
    let connector = TlsConnector::from(Arc::new(insecure_client_config()?));

    let dial = async {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        connector.connect(server_name, tcp).await
    };

    match tokio::time::timeout(connect_timeout, dial).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(BlazeError::Connection(format!(
            "Failed to connect to {host}:{port}: {e}"
        ))),
        Err(_) => Err(BlazeError::Connection(format!(
            "Timed out connecting to {host}:{port} after {connect_timeout:?}"
        ))),
    }
}
