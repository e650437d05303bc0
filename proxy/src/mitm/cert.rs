//! MitM leaf certificate minting (§4.8, §6.7). The CA keypair is loaded once
//! from the profile's base64 PKCS#12 bundle; leaf certificates are minted
//! on first use per hostname and cached for the process lifetime.

use crate::error::ConfigError;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::instrument;

/// A minted leaf certificate plus its private key, ready for
/// `rustls::ServerConfig::with_single_cert`.
#[derive(Clone)]
pub struct CertifiedKey {
	pub cert_der: CertificateDer<'static>,
	pub key_der: Vec<u8>,
}

/// Holds the CA keypair parsed out of the profile's `ca_p12`/`ca_passphrase`
/// and a hostname-keyed mint cache (§6.7 "CertificateStore").
pub struct CertificateStore {
	ca_cert_pem: String,
	ca_key_pair: KeyPair,
	cache: Mutex<HashMap<String, CertifiedKey>>,
}

impl CertificateStore {
	/// Decodes `ca_p12` (base64 PKCS#12) with `ca_passphrase`, extracting
	/// the CA certificate and private key.
	#[instrument(skip_all)]
	pub fn load(ca_p12_base64: &str, ca_passphrase: &str) -> Result<Self, ConfigError> {
		use base64::Engine;
		let der = base64::engine::general_purpose::STANDARD
			.decode(ca_p12_base64)
			.map_err(|e| ConfigError::FailedToLoadCertificate(format!("invalid base64: {e}")))?;

		let keystore = p12_keystore::KeyStore::from_pkcs12(&der, ca_passphrase)
			.map_err(|e| ConfigError::FailedToLoadCertificate(format!("invalid PKCS#12 bundle: {e}")))?;

		let (_, entry) = keystore
			.private_key_chain()
			.next()
			.ok_or_else(|| ConfigError::FailedToLoadCertificate("PKCS#12 bundle has no private key entry".into()))?;

		let cert_der = entry
			.chain()
			.first()
			.ok_or_else(|| ConfigError::FailedToLoadCertificate("PKCS#12 entry has no certificate".into()))?
			.as_der()
			.to_vec();
		let key_der = entry.key().to_vec();

		let _ = x509_parser::parse_x509_certificate(&cert_der).map_err(|e| ConfigError::FailedToLoadCertificate(format!("CA certificate unparsable: {e}")))?;

		let ca_cert_pem = pem_encode("CERTIFICATE", &cert_der);
		let ca_key_pair =
			KeyPair::try_from(PrivatePkcs8KeyDer::from(key_der)).map_err(|e| ConfigError::FailedToLoadCertificate(format!("CA private key unparsable: {e}")))?;

		Ok(Self {
			ca_cert_pem,
			ca_key_pair,
			cache: Mutex::new(HashMap::new()),
		})
	}

	/// Returns the cached leaf for `hostname`, minting and caching one
	/// signed by the CA if this is the first request for it.
	#[instrument(skip(self))]
	pub fn certificate_for(&self, hostname: &str) -> Result<CertifiedKey, ConfigError> {
		if let Some(existing) = self.cache.lock().expect("cert cache mutex poisoned").get(hostname) {
			return Ok(existing.clone());
		}

		let minted = self.mint(hostname)?;
		self
			.cache
			.lock()
			.expect("cert cache mutex poisoned")
			.insert(hostname.to_string(), minted.clone());
		Ok(minted)
	}

	fn mint(&self, hostname: &str) -> Result<CertifiedKey, ConfigError> {
		let issuer =
			Issuer::from_ca_cert_pem(&self.ca_cert_pem, self.ca_key_pair.clone_key()).map_err(|e| ConfigError::FailedToLoadCertificate(format!("bad CA issuer: {e}")))?;

		let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(|e| ConfigError::FailedToLoadCertificate(e.to_string()))?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, hostname);
		params.distinguished_name = dn;

		let leaf_key = KeyPair::generate().map_err(|e| ConfigError::FailedToLoadCertificate(e.to_string()))?;
		let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| ConfigError::FailedToLoadCertificate(e.to_string()))?;

		Ok(CertifiedKey {
			cert_der: cert.der().clone(),
			key_der: leaf_key.serialize_der(),
		})
	}
}

fn pem_encode(label: &str, der: &[u8]) -> String {
	use base64::Engine;
	let body = base64::engine::general_purpose::STANDARD.encode(der);
	let mut out = format!("-----BEGIN {label}-----\n");
	for chunk in body.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).expect("base64 alphabet is ascii"));
		out.push('\n');
	}
	out.push_str(&format!("-----END {label}-----\n"));
	out
}

impl CertifiedKey {
	pub fn into_rustls(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
		(vec![self.cert_der], PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der)))
	}
}
