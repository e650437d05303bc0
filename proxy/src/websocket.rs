//! RFC 6455 client wrapper used when a proxy policy sets `over_websocket`
//! (§4.6). Performs the HTTP/1.1 upgrade handshake, then exposes a
//! bidirectional byte stream over masked binary frames.

use crate::error::{ProtocolError, TransportError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAME_LEN: usize = 16_384;
const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Performs the client-side upgrade on an already-connected (and, if
/// applicable, already-TLS-wrapped) stream. On success the same stream is
/// returned, now ready for [`send_binary`]/[`recv_payload`].
pub async fn handshake<S>(mut stream: S, host: &str, path: &str) -> Result<S, TransportError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let key = random_key();
	let request = format!(
		"GET {path} HTTP/1.1\r\n\
		 Host: {host}\r\n\
		 Upgrade: websocket\r\n\
		 Connection: Upgrade\r\n\
		 Sec-WebSocket-Version: 13\r\n\
		 Sec-WebSocket-Key: {key}\r\n\
		 \r\n"
	);
	stream.write_all(request.as_bytes()).await?;
	stream.flush().await?;

	let response = read_http_response(&mut stream).await?;
	let status_line = response.lines().next().unwrap_or_default();
	if !status_line.contains("101") {
		return Err(TransportError::Io(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			format!("websocket upgrade rejected: {status_line}"),
		)));
	}

	let expected_accept = accept_key(&key);
	let accept_header = response
		.lines()
		.find_map(|line| line.to_ascii_lowercase().strip_prefix("sec-websocket-accept:").map(|v| v.trim().to_string()));
	if accept_header.as_deref() != Some(expected_accept.as_str()) {
		return Err(TransportError::Io(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			"Sec-WebSocket-Accept mismatch",
		)));
	}

	Ok(stream)
}

fn random_key() -> String {
	let mut raw = [0u8; 16];
	rand::rng().fill(&mut raw);
	BASE64.encode(raw)
}

fn accept_key(client_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(client_key.as_bytes());
	hasher.update(GUID.as_bytes());
	BASE64.encode(hasher.finalize())
}

async fn read_http_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, TransportError> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		stream.read_exact(&mut byte).await?;
		buf.push(byte[0]);
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			break;
		}
		if buf.len() > 64 * 1024 {
			return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "websocket response too large")));
		}
	}
	Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Sends `payload` as a single final, masked binary frame (client frames
/// are always masked per RFC 6455 §5.1).
pub async fn send_binary<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<(), TransportError> {
	send_frame(stream, OP_BINARY, payload).await
}

async fn send_frame<S: AsyncWrite + Unpin>(stream: &mut S, opcode: u8, payload: &[u8]) -> Result<(), TransportError> {
	let mut frame = Vec::with_capacity(payload.len() + 14);
	frame.push(0x80 | opcode);

	let mask: [u8; 4] = rand::rng().random();
	let len = payload.len();
	if len < 126 {
		frame.push(0x80 | len as u8);
	} else if len <= u16::MAX as usize {
		frame.push(0x80 | 126);
		frame.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		frame.push(0x80 | 127);
		frame.extend_from_slice(&(len as u64).to_be_bytes());
	}
	frame.extend_from_slice(&mask);
	frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));

	stream.write_all(&frame).await?;
	stream.flush().await?;
	Ok(())
}

pub enum Frame {
	Payload(Vec<u8>),
	Closed,
}

/// Reads and unmasks (if masked; server frames normally aren't) one frame,
/// answering pings with pongs and handling close per §4.6. Returns
/// `Frame::Closed` once a close frame has been acknowledged.
pub async fn recv_frame<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<Frame, ProtocolError> {
	loop {
		let mut header = [0u8; 2];
		stream.read_exact(&mut header).await?;
		let fin = header[0] & 0x80 != 0;
		let opcode = header[0] & 0x0F;
		let masked = header[1] & 0x80 != 0;
		let mut len = (header[1] & 0x7F) as u64;

		if len == 126 {
			let mut ext = [0u8; 2];
			stream.read_exact(&mut ext).await?;
			len = u16::from_be_bytes(ext) as u64;
		} else if len == 127 {
			let mut ext = [0u8; 8];
			stream.read_exact(&mut ext).await?;
			len = u64::from_be_bytes(ext);
		}
		if len as usize > MAX_FRAME_LEN {
			return Err(ProtocolError::Unsupported);
		}

		let mask = if masked {
			let mut m = [0u8; 4];
			stream.read_exact(&mut m).await?;
			Some(m)
		} else {
			None
		};

		let mut payload = vec![0u8; len as usize];
		stream.read_exact(&mut payload).await?;
		if let Some(mask) = mask {
			for (i, b) in payload.iter_mut().enumerate() {
				*b ^= mask[i % 4];
			}
		}

		match opcode {
			OP_CONTINUATION | OP_TEXT | OP_BINARY => return Ok(Frame::Payload(payload)),
			OP_PING => {
				send_frame(stream, OP_PONG, &payload).await.map_err(ProtocolError::Io)?;
				continue;
			},
			// Only a FIN-set pong is a valid reply to our pings (§4.6); a
			// fragmented one is simply ignored.
			OP_PONG => {
				if !fin {
					tracing::trace!("dropping fragmented pong frame");
				}
				continue;
			},
			OP_CLOSE => {
				let code = if payload.len() >= 2 {
					let raw = u16::from_be_bytes([payload[0], payload[1]]);
					// 1005 (no status) / 1006 (abnormal) are reserved and
					// must never appear on the wire; normalize to 1000.
					if raw == 1005 || raw == 1006 { 1000 } else { raw }
				} else {
					1000
				};
				let close_payload = code.to_be_bytes();
				send_frame(stream, OP_CLOSE, &close_payload).await.map_err(ProtocolError::Io)?;
				return Ok(Frame::Closed);
			},
			_ => return Err(ProtocolError::Unsupported),
		}
	}
}

/// The byte-stream primitive Shadowsocks/VMESS frame their own AEAD chunks
/// on top of (§4.5). Implemented directly on any raw socket, and on
/// [`MaskedWebSocketStream`] when a proxy policy also sets `over_websocket`,
/// so the same protocol client code works unmodified in both cases.
#[async_trait]
pub trait ByteStream: Send {
	async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
	async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;
	async fn flush(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for S {
	async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
		AsyncReadExt::read_exact(self, buf).await?;
		Ok(())
	}

	async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
		AsyncWriteExt::write_all(self, buf).await?;
		Ok(())
	}

	async fn flush(&mut self) -> Result<(), TransportError> {
		AsyncWriteExt::flush(self).await?;
		Ok(())
	}
}

/// Wraps an already-upgraded WebSocket connection as a [`ByteStream`]:
/// writes go out as masked binary frames, reads are served from the
/// payload of whatever frame is currently buffered, pulling a new one via
/// [`recv_frame`] once it's exhausted. This is what lets Shadowsocks/VMESS
/// interoperate with a real WS-fronted server instead of writing their raw
/// protocol bytes straight onto the upgraded socket.
pub struct MaskedWebSocketStream<S> {
	inner: S,
	pending: Vec<u8>,
	pos: usize,
}

impl<S> MaskedWebSocketStream<S> {
	pub fn new(inner: S) -> Self {
		Self { inner, pending: Vec::new(), pos: 0 }
	}
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for MaskedWebSocketStream<S> {
	async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
		let mut filled = 0;
		while filled < buf.len() {
			if self.pos >= self.pending.len() {
				match recv_frame(&mut self.inner).await.map_err(|err| TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))? {
					Frame::Payload(data) => {
						self.pending = data;
						self.pos = 0;
					},
					Frame::Closed => {
						return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "websocket closed mid-stream")));
					},
				}
				continue;
			}
			let take = (self.pending.len() - self.pos).min(buf.len() - filled);
			buf[filled..filled + take].copy_from_slice(&self.pending[self.pos..self.pos + take]);
			self.pos += take;
			filled += take;
		}
		Ok(())
	}

	async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
		send_binary(&mut self.inner, buf).await
	}

	async fn flush(&mut self) -> Result<(), TransportError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accept_key_matches_rfc6455_example() {
		assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}
}
