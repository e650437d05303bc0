//! Outbound protocol clients (§4.5) and the policy-driven dispatch that
//! chains TCP connect → optional TLS → optional WebSocket → protocol
//! handshake (§4.3 "Proxy").

pub mod http_connect;
pub mod shadowsocks;
pub mod socks5;
pub mod vmess;

use crate::buf::TargetAddress;
use crate::error::TransportError;
use crate::profile::{ProxyConfig, ProxyProtocol};
use crate::websocket::ByteStream;
use crate::{tls, websocket};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::instrument;

/// A connected outbound leg, post-handshake. The glue stage (§4.7 step 8)
/// talks to every policy kind through this instead of caring whether the
/// wire underneath is raw bytes, Shadowsocks AEAD chunks or VMESS frames.
#[async_trait]
pub trait OutboundTransport: Send {
	async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError>;
	async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError>;
	async fn shutdown(&mut self) -> Result<(), TransportError>;
}

pub type BoxedOutbound = Box<dyn OutboundTransport>;

/// Plain byte streams (HTTP-CONNECT and SOCKS5 hand back the raw
/// post-handshake stream, TLS-wrapped or not) read in fixed-size chunks.
struct RawTransport<S> {
	inner: S,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> OutboundTransport for RawTransport<S> {
	async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
		let mut buf = vec![0u8; 16 * 1024];
		let n = self.inner.read(&mut buf).await?;
		buf.truncate(n);
		Ok(buf)
	}

	async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError> {
		self.inner.write_all(data).await?;
		self.inner.flush().await?;
		Ok(())
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		self.inner.shutdown().await?;
		Ok(())
	}
}

struct WebSocketTransport<S> {
	inner: S,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> OutboundTransport for WebSocketTransport<S> {
	async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
		match websocket::recv_frame(&mut self.inner).await {
			Ok(websocket::Frame::Payload(data)) => Ok(data),
			Ok(websocket::Frame::Closed) => Ok(Vec::new()),
			Err(err) => Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))),
		}
	}

	async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError> {
		websocket::send_binary(&mut self.inner, data).await
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		self.inner.shutdown().await?;
		Ok(())
	}
}

struct ShadowsocksTransport<S> {
	inner: shadowsocks::ShadowsocksStream<S>,
}

#[async_trait]
impl<S: ByteStream> OutboundTransport for ShadowsocksTransport<S> {
	async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
		let mut out = Vec::new();
		self.inner.read_payload(&mut out).await?;
		Ok(out)
	}

	async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError> {
		self.inner.write_payload(data).await
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		Ok(())
	}
}

struct VmessTransport<S> {
	inner: vmess::VmessStream<S>,
}

#[async_trait]
impl<S: ByteStream> OutboundTransport for VmessTransport<S> {
	async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
		let mut out = Vec::new();
		self.inner.read_payload(&mut out).await?;
		Ok(out)
	}

	async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError> {
		self.inner.write_payload(data).await
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		Ok(())
	}
}

/// Connects to `cfg.server_host:cfg.server_port`, optionally wrapping with
/// TLS and WebSocket, then runs the configured protocol handshake against
/// `destination` (§4.3 "Proxy", §4.5).
#[instrument(skip(cfg), fields(server = %cfg.server_host, protocol = ?cfg.protocol))]
pub async fn connect(cfg: &ProxyConfig, destination: &TargetAddress) -> Result<BoxedOutbound, TransportError> {
	let tcp = TcpStream::connect((cfg.server_host.as_str(), cfg.server_port)).await.map_err(TransportError::Io)?;
	tcp.set_nodelay(true).ok();

	if cfg.over_tls {
		let cert_pin = cfg.cert_pin.as_deref().and_then(|hex| crate::buf::from_hex(hex).ok());
		let tls_config = tls::client_config(cfg.skip_cert_verify, cert_pin);
		let tls_stream: TlsStream<TcpStream> = tls::connect(tls_config, cfg.tls_server_name(), tcp).await?;
		finish_connect(cfg, destination, tls_stream).await
	} else {
		finish_connect(cfg, destination, tcp).await
	}
}

async fn finish_connect<S>(cfg: &ProxyConfig, destination: &TargetAddress, stream: S) -> Result<BoxedOutbound, TransportError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	if cfg.over_websocket {
		let path = cfg.websocket_path.as_deref().unwrap_or("/");
		let stream = websocket::handshake(stream, cfg.tls_server_name(), path).await?;
		run_protocol(cfg, destination, stream, true).await
	} else {
		run_protocol(cfg, destination, stream, false).await
	}
}

async fn run_protocol<S>(cfg: &ProxyConfig, destination: &TargetAddress, stream: S, over_websocket: bool) -> Result<BoxedOutbound, TransportError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let credentials = match (&cfg.username, &cfg.password_ref) {
		(Some(u), Some(p)) if cfg.authenticate => Some((u.clone(), p.clone())),
		_ => None,
	};

	// Shadowsocks/VMESS frame their own AEAD chunks on top of a `ByteStream`
	// (§4.3/§4.5): a raw socket normally, or a masked WebSocket byte stream
	// when the policy also sets `overWebsocket`, so their wire bytes never
	// hit the upgraded connection unmasked.
	match cfg.protocol.unwrap_or(ProxyProtocol::Http) {
		ProxyProtocol::Http => {
			let creds = credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
			let stream = http_connect::connect(stream, destination, creds).await.map_err(protocol_to_transport)?;
			Ok(wrap_raw(stream, over_websocket))
		},
		ProxyProtocol::Socks5 => {
			let creds = credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
			let stream = socks5::connect(stream, destination, creds).await.map_err(protocol_to_transport)?;
			Ok(wrap_raw(stream, over_websocket))
		},
		ProxyProtocol::Ss => {
			let algorithm = cfg
				.ss_algorithm
				.ok_or_else(|| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "shadowsocks policy missing ss-algorithm")))?;
			let password = cfg.password_ref.as_deref().unwrap_or_default();
			if over_websocket {
				let framed = websocket::MaskedWebSocketStream::new(stream);
				let session = shadowsocks::ShadowsocksStream::connect(framed, algorithm, password, destination).await?;
				Ok(Box::new(ShadowsocksTransport { inner: session }))
			} else {
				let session = shadowsocks::ShadowsocksStream::connect(stream, algorithm, password, destination).await?;
				Ok(Box::new(ShadowsocksTransport { inner: session }))
			}
		},
		ProxyProtocol::Vmess => {
			let uuid = cfg.username.as_deref().unwrap_or_default();
			let security = vmess::Security::Aes128Gcm;
			if over_websocket {
				let framed = websocket::MaskedWebSocketStream::new(stream);
				let session = vmess::VmessStream::connect(framed, uuid, security, true, destination).await?;
				Ok(Box::new(VmessTransport { inner: session }))
			} else {
				let session = vmess::VmessStream::connect(stream, uuid, security, true, destination).await?;
				Ok(Box::new(VmessTransport { inner: session }))
			}
		},
	}
}

fn wrap_raw<S>(stream: S, over_websocket: bool) -> BoxedOutbound
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	if over_websocket {
		Box::new(WebSocketTransport { inner: stream })
	} else {
		Box::new(RawTransport { inner: stream })
	}
}

fn protocol_to_transport(err: crate::error::ProtocolError) -> TransportError {
	TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}
