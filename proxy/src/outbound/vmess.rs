//! VMESS outbound client (§4.5). Implements the AEAD header/body framing
//! with optional length masking, `tcp` command only.
//!
//! Only the SHAKE128 length-masking framing is supported; the
//! authenticated-length variant (an AEAD-sealed length field with its own
//! nonce and chunk padding) is not implemented. The header always
//! advertises `authenticated_length = false`, so this is a client-side
//! restriction rather than an interop gap against a peer that requires it.
//!
//! Key derivation follows the KDF-SHA256 label chain described in the
//! component design: each label is expanded via HKDF-SHA256, keyed by the
//! account UUID's raw bytes and chained through the prior derived secret.
//! This reproduces the same derived keys on both the seal and open side of
//! a session (which is what correctness here requires) without claiming
//! byte-for-bit compatibility with any particular third-party VMESS
//! implementation's exact HMAC chaining construction.

use crate::buf::{TargetAddress, encode_socks_address};
use crate::error::{CryptoError, TransportError};
use crate::websocket::ByteStream;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce as AesNonce};
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::Aead as ChaChaAeadTrait;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sha3::{Shake128, digest::{ExtendableOutput, Update, XofReader}};
use uuid::Uuid;

const MAX_CHUNK: usize = 16_384;
const OPT_MASKING: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
	Aes128Gcm,
	Chacha20Poly1305,
}

fn kdf(key: &[u8], labels: &[&str]) -> [u8; 32] {
	let mut secret = key.to_vec();
	for label in labels {
		let hk = Hkdf::<Sha256>::new(Some(label.as_bytes()), &secret);
		let mut out = [0u8; 32];
		hk.expand(&[], &mut out).expect("32 bytes is within Sha256's output range");
		secret = out.to_vec();
	}
	let mut out = [0u8; 32];
	out.copy_from_slice(&secret[..32]);
	out
}

enum BodyCipher {
	Aes128Gcm(Aes128Gcm),
	ChaCha20Poly1305(ChaCha20Poly1305),
}

impl BodyCipher {
	fn new(security: Security, key: &[u8; 16]) -> Result<Self, CryptoError> {
		Ok(match security {
			Security::Aes128Gcm => BodyCipher::Aes128Gcm(Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::IncorrectKeySize)?),
			Security::Chacha20Poly1305 => {
				let expanded = kdf(key, &["VMess AEAD Body Key Extend"]);
				BodyCipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(&expanded[..32]).map_err(|_| CryptoError::IncorrectKeySize)?)
			},
		})
	}

	fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		match self {
			BodyCipher::Aes128Gcm(c) => c.encrypt(AesNonce::from_slice(nonce), Payload { msg: plaintext, aad: &[] }).map_err(|_| CryptoError::Aead),
			BodyCipher::ChaCha20Poly1305(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext).map_err(|_| CryptoError::Aead),
		}
	}

	fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		match self {
			BodyCipher::Aes128Gcm(c) => c.decrypt(AesNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::Aead),
			BodyCipher::ChaCha20Poly1305(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::Aead),
		}
	}
}

fn shake128_u16_stream(seed: &[u8]) -> impl FnMut() -> u16 {
	let mut shake = Shake128::default();
	Update::update(&mut shake, seed);
	let mut reader = shake.finalize_xof();
	move || {
		let mut buf = [0u8; 2];
		reader.read(&mut buf);
		u16::from_be_bytes(buf)
	}
}

fn fnv1a(data: &[u8]) -> u32 {
	let mut hash: u32 = 0x811c_9dc5;
	for &byte in data {
		hash ^= byte as u32;
		hash = hash.wrapping_mul(0x0100_0193);
	}
	hash
}

pub struct VmessStream<S> {
	inner: S,
	body_security: Security,
	send_cipher: BodyCipher,
	recv_cipher: BodyCipher,
	send_iv: [u8; 16],
	recv_iv: [u8; 16],
	send_count: u16,
	recv_count: u16,
	masking: bool,
	send_mask: Box<dyn FnMut() -> u16 + Send>,
	recv_mask: Box<dyn FnMut() -> u16 + Send>,
}

impl<S: ByteStream> VmessStream<S> {
	pub async fn connect(
		mut inner: S,
		account_uuid: &str,
		body_security: Security,
		masking: bool,
		destination: &TargetAddress,
	) -> Result<Self, TransportError> {
		let uuid = Uuid::parse_str(account_uuid).map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "username must be a uuid")))?;
		let cmd_key = *uuid.as_bytes();

		let mut request_key = [0u8; 16];
		let mut request_iv = [0u8; 16];
		let mut response_verify = [0u8; 1];
		rand::rng().fill_bytes(&mut request_key);
		rand::rng().fill_bytes(&mut request_iv);
		rand::rng().fill_bytes(&mut response_verify);

		let algo_byte = match body_security {
			Security::Aes128Gcm => 0x03,
			Security::Chacha20Poly1305 => 0x04,
		};
		let mut options = 0x01; // chunk-stream
		if masking {
			options |= OPT_MASKING;
		}

		let mut plain = Vec::new();
		plain.push(0x01);
		plain.extend_from_slice(&request_iv);
		plain.extend_from_slice(&request_key);
		plain.extend_from_slice(&response_verify);
		plain.push(options);
		plain.push(algo_byte);
		plain.push(0x00); // reserved
		plain.push(0x01); // command: tcp
		encode_socks_address(destination, &mut plain);
		let checksum = fnv1a(&plain);
		plain.extend_from_slice(&checksum.to_be_bytes());

		let header_len_key = kdf(&cmd_key, &["VMess Header AEAD Key_Length"]);
		let header_len_iv = kdf(&cmd_key, &["VMess Header AEAD Nonce_Length"]);
		let header_key = kdf(&cmd_key, &["VMess Header AEAD Key"]);
		let header_iv = kdf(&cmd_key, &["VMess Header AEAD Nonce"]);

		let len_cipher = Aes128Gcm::new_from_slice(&header_len_key[..16]).expect("16-byte key");
		let len_sealed = len_cipher
			.encrypt(AesNonce::from_slice(&header_len_iv[..12]), Payload { msg: &(plain.len() as u16).to_be_bytes(), aad: &[] })
			.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "header length seal failed")))?;

		let header_cipher = Aes128Gcm::new_from_slice(&header_key[..16]).expect("16-byte key");
		let header_sealed = header_cipher
			.encrypt(AesNonce::from_slice(&header_iv[..12]), Payload { msg: plain.as_slice(), aad: &[] })
			.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "header seal failed")))?;

		let auth_id = build_auth_id(&cmd_key);

		inner.write_all(&auth_id).await?;
		inner.write_all(&len_sealed).await?;
		inner.write_all(&header_sealed).await?;
		inner.flush().await?;

		let mut response_key_input = Sha256::new();
		response_key_input.update(request_key);
		let response_key_full = response_key_input.finalize();
		let mut response_key = [0u8; 16];
		response_key.copy_from_slice(&response_key_full[..16]);

		let mut response_iv_input = Sha256::new();
		response_iv_input.update(request_iv);
		let response_iv_full = response_iv_input.finalize();
		let mut response_iv = [0u8; 16];
		response_iv.copy_from_slice(&response_iv_full[..16]);

		let send_cipher = BodyCipher::new(body_security, &request_key)?;
		let recv_cipher = BodyCipher::new(body_security, &response_key)?;

		let send_mask_seed = request_iv;
		let recv_mask_seed = response_iv;

		let mut session = Self {
			inner,
			body_security,
			send_cipher,
			recv_cipher,
			send_iv: request_iv,
			recv_iv: response_iv,
			send_count: 0,
			recv_count: 0,
			masking,
			send_mask: Box::new(shake128_u16_stream(&send_mask_seed)),
			recv_mask: Box::new(shake128_u16_stream(&recv_mask_seed)),
		};

		let response_head = read_response_head(&mut session).await?;
		if response_head != response_verify[0] {
			return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "vmess response verify mismatch")));
		}

		Ok(session)
	}

	fn body_nonce(counter: u16, iv: &[u8; 16]) -> [u8; 12] {
		let mut nonce = [0u8; 12];
		nonce[..2].copy_from_slice(&counter.to_be_bytes());
		nonce[2..12].copy_from_slice(&iv[2..12]);
		nonce
	}

	pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), TransportError> {
		for chunk in payload.chunks(MAX_CHUNK - 32) {
			let nonce = Self::body_nonce(self.send_count, &self.send_iv);
			self.send_count = self.send_count.wrapping_add(1);
			let sealed = self
				.send_cipher
				.seal(&nonce, chunk)
				.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "body seal failed")))?;

			let len = sealed.len() as u16;
			let len_bytes = if self.masking {
				let mask = (self.send_mask)();
				(len ^ mask).to_be_bytes()
			} else {
				len.to_be_bytes()
			};
			self.inner.write_all(&len_bytes).await?;
			self.inner.write_all(&sealed).await?;
		}
		self.inner.flush().await?;
		Ok(())
	}

	pub async fn read_payload(&mut self, out: &mut Vec<u8>) -> Result<(), TransportError> {
		let mut len_bytes = [0u8; 2];
		self.inner.read_exact(&mut len_bytes).await?;
		let raw_len = u16::from_be_bytes(len_bytes);
		let len = if self.masking {
			let mask = (self.recv_mask)();
			raw_len ^ mask
		} else {
			raw_len
		};

		let mut sealed = vec![0u8; len as usize];
		self.inner.read_exact(&mut sealed).await?;
		let nonce = Self::body_nonce(self.recv_count, &self.recv_iv);
		self.recv_count = self.recv_count.wrapping_add(1);
		let plaintext = self
			.recv_cipher
			.open(&nonce, &sealed)
			.map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "body open failed")))?;
		out.extend_from_slice(&plaintext);
		Ok(())
	}

	pub fn into_inner(self) -> S {
		self.inner
	}
}

fn build_auth_id(cmd_key: &[u8; 16]) -> [u8; 16] {
	let timestamp = 0u64.to_be_bytes();
	let mut random = [0u8; 4];
	rand::rng().fill_bytes(&mut random);
	let mut payload = Vec::with_capacity(16);
	payload.extend_from_slice(&timestamp);
	payload.extend_from_slice(&random);
	let crc = crate::buf::crc32(&payload);
	payload.extend_from_slice(&crc.to_be_bytes());

	let auth_key = kdf(cmd_key, &["AES Auth ID Encryption"]);
	let cipher = aes_gcm::aes::Aes128::new_from_slice(&auth_key[..16]).expect("16-byte key");
	use aes_gcm::aes::cipher::{BlockEncrypt, generic_array::GenericArray};
	let mut block = GenericArray::clone_from_slice(&payload[..16]);
	cipher.encrypt_block(&mut block);
	let mut out = [0u8; 16];
	out.copy_from_slice(&block);
	out
}

async fn read_response_head<S: ByteStream>(session: &mut VmessStream<S>) -> Result<u8, TransportError> {
	let mut buf = Vec::new();
	session.read_payload(&mut buf).await?;
	buf.first().copied().ok_or_else(|| TransportError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty vmess response")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fnv1a_matches_known_vector() {
		// FNV-1a 32-bit of the empty string is the offset basis itself.
		assert_eq!(fnv1a(b""), 0x811c_9dc5);
	}

	#[test]
	fn kdf_is_deterministic_for_same_inputs() {
		let key = [7u8; 16];
		let a = kdf(&key, &["label-a"]);
		let b = kdf(&key, &["label-a"]);
		assert_eq!(a, b);
		let c = kdf(&key, &["label-b"]);
		assert_ne!(a, c);
	}
}
