//! Shadowsocks AEAD outbound client (§4.5). Session key derivation uses
//! the classic OpenSSL `EVP_BytesToKey` MD5 stretch for the master key,
//! then HKDF-SHA1 per connection for the actual AEAD subkey.

use crate::buf::{TargetAddress, encode_socks_address};
use crate::error::{CryptoError, TransportError};
use crate::profile::ShadowsocksAlgorithm;
use crate::websocket::ByteStream;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes192Gcm, Aes256Gcm, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use chacha20poly1305::aead::Aead as ChaChaAead;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;

const SS_SUBKEY_INFO: &[u8] = b"ss-subkey";
const MAX_CHUNK: usize = 16_384;

enum Cipher {
	Aes128Gcm(Aes128Gcm),
	Aes192Gcm(Aes192Gcm),
	Aes256Gcm(Aes256Gcm),
	ChaCha20Poly1305(ChaCha20Poly1305),
	XChaCha20Poly1305(XChaCha20Poly1305),
}

impl Cipher {
	fn new(algorithm: ShadowsocksAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
		Ok(match algorithm {
			ShadowsocksAlgorithm::Aes128Gcm => Cipher::Aes128Gcm(Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::IncorrectKeySize)?),
			ShadowsocksAlgorithm::Aes192Gcm => Cipher::Aes192Gcm(Aes192Gcm::new_from_slice(key).map_err(|_| CryptoError::IncorrectKeySize)?),
			ShadowsocksAlgorithm::Aes256Gcm => Cipher::Aes256Gcm(Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::IncorrectKeySize)?),
			ShadowsocksAlgorithm::Chacha20Poly1305 => {
				Cipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::IncorrectKeySize)?)
			},
			ShadowsocksAlgorithm::Xchacha20Poly1305 => {
				Cipher::XChaCha20Poly1305(XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::IncorrectKeySize)?)
			},
		})
	}

	fn nonce_len(&self) -> usize {
		match self {
			Cipher::XChaCha20Poly1305(_) => 24,
			_ => 12,
		}
	}

	fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let payload = Payload { msg: plaintext, aad: &[] };
		match self {
			Cipher::Aes128Gcm(c) => c.encrypt(AesNonce::from_slice(nonce), payload).map_err(|_| CryptoError::Aead),
			Cipher::Aes192Gcm(c) => c.encrypt(AesNonce::from_slice(nonce), payload).map_err(|_| CryptoError::Aead),
			Cipher::Aes256Gcm(c) => c.encrypt(AesNonce::from_slice(nonce), payload).map_err(|_| CryptoError::Aead),
			Cipher::ChaCha20Poly1305(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext).map_err(|_| CryptoError::Aead),
			Cipher::XChaCha20Poly1305(c) => c
				.encrypt(chacha20poly1305::XNonce::from_slice(nonce), plaintext)
				.map_err(|_| CryptoError::Aead),
		}
	}

	fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		match self {
			Cipher::Aes128Gcm(c) => c.decrypt(AesNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::Aead),
			Cipher::Aes192Gcm(c) => c.decrypt(AesNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::Aead),
			Cipher::Aes256Gcm(c) => c.decrypt(AesNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::Aead),
			Cipher::ChaCha20Poly1305(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::Aead),
			Cipher::XChaCha20Poly1305(c) => c
				.decrypt(chacha20poly1305::XNonce::from_slice(nonce), ciphertext)
				.map_err(|_| CryptoError::Aead),
		}
	}
}

/// OpenSSL's `EVP_BytesToKey` with MD5 and no salt/IV: repeatedly hash
/// `prev || password` until `len` bytes have been produced.
pub fn evp_bytes_to_key(password: &[u8], len: usize) -> Vec<u8> {
	let mut out = Vec::with_capacity(len);
	let mut prev: Vec<u8> = Vec::new();
	while out.len() < len {
		let mut hasher = Md5::new();
		hasher.update(&prev);
		hasher.update(password);
		let digest = hasher.finalize();
		prev = digest.to_vec();
		out.extend_from_slice(&digest);
	}
	out.truncate(len);
	out
}

fn derive_session_key(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
	let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
	let mut okm = vec![0u8; key_len];
	hk.expand(SS_SUBKEY_INFO, &mut okm).expect("key_len is within Sha1's output range");
	okm
}

fn increment_counter(counter: &mut [u8]) {
	for byte in counter.iter_mut() {
		let (next, carry) = byte.overflowing_add(1);
		*byte = next;
		if !carry {
			break;
		}
	}
}

/// Wraps an already-connected TCP stream as a Shadowsocks AEAD session:
/// sends the salt, then the destination address as the first plaintext
/// chunk.
pub struct ShadowsocksStream<S> {
	inner: S,
	send_cipher: Cipher,
	recv_cipher: Cipher,
	/// Sized to the longest nonce this module supports (XChaCha20's 24
	/// bytes); only the leading `cipher.nonce_len()` bytes are ever used.
	send_counter: [u8; 24],
	recv_counter: [u8; 24],
	recv_buf: Vec<u8>,
}

impl<S: ByteStream> ShadowsocksStream<S> {
	pub async fn connect(mut inner: S, algorithm: ShadowsocksAlgorithm, password: &str, destination: &TargetAddress) -> Result<Self, TransportError> {
		let key_len = algorithm.key_len();
		let salt_len = algorithm.salt_len();
		let master_key = evp_bytes_to_key(password.as_bytes(), key_len);

		let mut send_salt = vec![0u8; salt_len];
		rand::rng().fill_bytes(&mut send_salt);
		inner.write_all(&send_salt).await?;

		let send_key = derive_session_key(&master_key, &send_salt, key_len);
		let send_cipher = Cipher::new(algorithm, &send_key).map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad key size")))?;

		let mut recv_salt = vec![0u8; salt_len];
		inner.read_exact(&mut recv_salt).await?;
		let recv_key = derive_session_key(&master_key, &recv_salt, key_len);
		let recv_cipher = Cipher::new(algorithm, &recv_key).map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad key size")))?;

		let mut session = Self {
			inner,
			send_cipher,
			recv_cipher,
			send_counter: [0u8; 24],
			recv_counter: [0u8; 24],
			recv_buf: Vec::new(),
		};

		let mut first_chunk = Vec::new();
		encode_socks_address(destination, &mut first_chunk);
		session.write_chunk(&first_chunk).await?;

		Ok(session)
	}

	async fn write_chunk(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
		for chunk in plaintext.chunks(MAX_CHUNK) {
			let len_bytes = (chunk.len() as u16).to_be_bytes();

			let nonce_len = self.send_cipher.nonce_len();
			let sealed_len = self
				.send_cipher
				.seal(&self.send_counter[..nonce_len], &len_bytes)
				.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "seal failed")))?;
			increment_counter(&mut self.send_counter[..nonce_len]);

			let sealed_payload = self
				.send_cipher
				.seal(&self.send_counter[..nonce_len], chunk)
				.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "seal failed")))?;
			increment_counter(&mut self.send_counter[..nonce_len]);

			self.inner.write_all(&sealed_len).await?;
			self.inner.write_all(&sealed_payload).await?;
		}
		self.inner.flush().await?;
		Ok(())
	}

	pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), TransportError> {
		self.write_chunk(payload).await
	}

	/// Reads and decrypts one chunk (length-prefix then payload), appending
	/// the plaintext to `out`.
	pub async fn read_payload(&mut self, out: &mut Vec<u8>) -> Result<(), TransportError> {
		if !self.recv_buf.is_empty() {
			out.extend_from_slice(&self.recv_buf);
			self.recv_buf.clear();
			return Ok(());
		}

		let tag_len = 16;
		let nonce_len = self.recv_cipher.nonce_len();
		let mut sealed_len = vec![0u8; 2 + tag_len];
		self.inner.read_exact(&mut sealed_len).await?;
		let len_bytes = self
			.recv_cipher
			.open(&self.recv_counter[..nonce_len], &sealed_len)
			.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad AEAD tag")))?;
		increment_counter(&mut self.recv_counter[..nonce_len]);
		let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;

		let mut sealed_payload = vec![0u8; len + tag_len];
		self.inner.read_exact(&mut sealed_payload).await?;
		let payload = self
			.recv_cipher
			.open(&self.recv_counter[..nonce_len], &sealed_payload)
			.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad AEAD tag")))?;
		increment_counter(&mut self.recv_counter);

		out.extend_from_slice(&payload);
		Ok(())
	}

	pub fn into_inner(self) -> S {
		self.inner
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evp_bytes_to_key_matches_known_vector() {
		// md5("") prefix step: OpenSSL's EVP_BytesToKey("", "password", 16)
		// reduces to md5("password") since prev starts empty.
		let derived = evp_bytes_to_key(b"password", 16);
		let expected = Md5::digest(b"password");
		assert_eq!(derived.as_slice(), expected.as_slice());
	}

	#[test]
	fn evp_bytes_to_key_truncates_to_requested_length() {
		let derived = evp_bytes_to_key(b"a-much-longer-password-string", 32);
		assert_eq!(derived.len(), 32);
	}

	#[test]
	fn counter_increments_little_endian() {
		let mut counter = [0u8; 12];
		increment_counter(&mut counter);
		assert_eq!(counter[0], 1);
		let mut rollover = [0xFFu8; 12];
		rollover[1] = 0x00;
		increment_counter(&mut rollover);
		assert_eq!(rollover[0], 0x00);
		assert_eq!(rollover[1], 0x01);
	}
}
