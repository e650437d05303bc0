//! TLS helpers shared by the outbound proxy client (§4.3 "Proxy") and the
//! MitM leaf-certificate pipeline (§4.8): building a `rustls` client config
//! that honors `skip_cert_verify`/`cert_pin`, and wrapping a stream.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::TransportError;

/// Accepts any certificate chain. Used when `skip_cert_verify` is set on a
/// proxy policy or `skip_certificate_verification` is set for MitM
/// outbound legs (§4.1, §4.3).
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
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
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		vec![
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::ED25519,
			SignatureScheme::RSA_PSS_SHA256,
			SignatureScheme::RSA_PSS_SHA384,
			SignatureScheme::RSA_PSS_SHA512,
		]
	}
}

/// Accepts a chain only if the leaf certificate's DER bytes match `pinned`
/// (`cert_pin` on a proxy policy).
#[derive(Debug)]
struct PinnedCert {
	pinned: Vec<u8>,
	fallback: Arc<rustls::client::WebPkiServerVerifier>,
}

impl ServerCertVerifier for PinnedCert {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		server_name: &ServerName<'_>,
		ocsp_response: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		if end_entity.as_ref() == self.pinned.as_slice() {
			return Ok(ServerCertVerified::assertion());
		}
		self
			.fallback
			.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.fallback.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.fallback.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.fallback.supported_verify_schemes()
	}
}

fn root_store() -> rustls::RootCertStore {
	let mut store = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = store.add(cert);
	}
	store
}

/// Builds the `ClientConfig` for one outbound proxy connection, honoring
/// `skip_cert_verify` and `cert_pin` (§4.3 "Proxy").
pub fn client_config(skip_cert_verify: bool, cert_pin_der: Option<Vec<u8>>) -> Arc<ClientConfig> {
	let builder = ClientConfig::builder();

	let config = if skip_cert_verify {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify))
			.with_no_client_auth()
	} else if let Some(pinned) = cert_pin_der {
		let roots = Arc::new(root_store());
		let fallback = rustls::client::WebPkiServerVerifier::builder(roots)
			.build()
			.expect("default webpki verifier algorithms are always valid");
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(PinnedCert { pinned, fallback }))
			.with_no_client_auth()
	} else {
		builder.with_root_certificates(root_store()).with_no_client_auth()
	};

	Arc::new(config)
}

/// Wraps `stream` as a TLS client connection for `server_name` (SNI).
pub async fn connect<S>(config: Arc<ClientConfig>, server_name: &str, stream: S) -> Result<TlsStream<S>, TransportError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let name = ServerName::try_from(server_name.to_string()).map_err(|_| TransportError::DnsFailure(server_name.to_string()))?;
	let connector = TlsConnector::from(config);
	connector.connect(name, stream).await.map_err(TransportError::Io)
}
