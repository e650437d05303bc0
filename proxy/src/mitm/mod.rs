//! TLS MitM (§4.8): inline ClientHello/HTTP sniffing, SNI-scoped TLS
//! interception, and the HTTP capture pipeline layered above it.

pub mod capture;
pub mod cert;

use crate::error::{ConfigError, TransportError};
use crate::profile::MitMSettings;
use cert::CertificateStore;
use rustls::ServerConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, instrument, warn};

/// What the first bytes off the inbound socket look like, decided once
/// before any handler layout is chosen (§4.8, §9 "Pipelines and handler
/// ordering": no post-hoc reordering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
	Tls,
	PlaintextHttp,
	Unknown,
}

/// `0x16 0x03 0x0{1..3}` is a TLS record header carrying a ClientHello;
/// an uppercase ASCII letter followed by a space is an HTTP method line
/// start often enough to treat as cleartext HTTP for this purpose.
pub fn sniff(prefix: &[u8]) -> Sniff {
	if prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && (0x01..=0x03).contains(&prefix[2]) {
		return Sniff::Tls;
	}
	if prefix.first().is_some_and(u8::is_ascii_uppercase) {
		return Sniff::PlaintextHttp;
	}
	Sniff::Unknown
}

/// Peeks the first few bytes of `stream` without consuming them, by reading
/// into a small buffer and handing back both the sniff result and the
/// bytes already read (the caller must prepend them to anything read
/// afterward since the socket itself can't be un-read).
pub async fn sniff_stream<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Sniff, Vec<u8>), TransportError> {
	let mut buf = vec![0u8; 5];
	let n = stream.read(&mut buf).await?;
	buf.truncate(n);
	Ok((sniff(&buf), buf))
}

/// Reads the remainder of the TLS record whose 5-byte header is `header`
/// (as returned by [`sniff_stream`]), so the ClientHello can be fully
/// parsed for its SNI extension.
pub async fn read_client_hello_record<S: AsyncRead + Unpin>(stream: &mut S, header: &[u8]) -> Result<Vec<u8>, TransportError> {
	if header.len() < 5 {
		return Ok(Vec::new());
	}
	let len = u16::from_be_bytes([header[3], header[4]]) as usize;
	let mut body = vec![0u8; len];
	stream.read_exact(&mut body).await?;
	Ok(body)
}

/// Extracts the `server_name` extension's hostname from a ClientHello
/// record body (the bytes following the 5-byte TLS record header).
/// Returns `None` on any malformed or absent field — SNI-less ClientHellos
/// are handled by the caller falling back to the CONNECT destination.
pub fn parse_sni(record_body: &[u8]) -> Option<String> {
	// Handshake header: type(1) + length(3).
	let body = record_body.get(4..)?;
	// client_version(2) + random(32).
	let body = body.get(34..)?;
	let (session_id_len, body) = take_u8_prefixed(body)?;
	let _ = session_id_len;
	let (_, body) = take_u16_prefixed(body)?;
	let (_, body) = take_u8_prefixed(body)?;
	let (extensions, _) = take_u16_prefixed(body)?;

	let mut rest = extensions;
	while rest.len() >= 4 {
		let ext_type = u16::from_be_bytes([rest[0], rest[1]]);
		let ext_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
		let ext_data = rest.get(4..4 + ext_len)?;
		if ext_type == 0x0000 {
			return parse_server_name_extension(ext_data);
		}
		rest = &rest[4 + ext_len..];
	}
	None
}

fn take_u8_prefixed(data: &[u8]) -> Option<(&[u8], &[u8])> {
	let len = *data.first()? as usize;
	let rest = data.get(1..)?;
	Some((rest.get(..len)?, rest.get(len..)?))
}

fn take_u16_prefixed(data: &[u8]) -> Option<(&[u8], &[u8])> {
	let len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
	let rest = data.get(2..)?;
	Some((rest.get(..len)?, rest.get(len..)?))
}

fn parse_server_name_extension(data: &[u8]) -> Option<String> {
	let (list, _) = take_u16_prefixed(data)?;
	let name_type = *list.first()?;
	if name_type != 0x00 {
		return None;
	}
	let (name, _) = take_u16_prefixed(list.get(1..)?)?;
	String::from_utf8(name.to_vec()).ok()
}

/// Re-presents bytes already consumed from a socket (by [`sniff_stream`]/
/// [`read_client_hello_record`]) ahead of the socket's remaining, unread
/// bytes, so a TLS handshake or HTTP parser sees the whole stream.
pub struct PrefixedStream<S> {
	prefix: std::io::Cursor<Vec<u8>>,
	inner: S,
}

impl<S> PrefixedStream<S> {
	pub fn new(prefix: Vec<u8>, inner: S) -> Self {
		Self {
			prefix: std::io::Cursor::new(prefix),
			inner,
		}
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
	fn poll_read(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> std::task::Poll<std::io::Result<()>> {
		let this = self.get_mut();
		if (this.prefix.position() as usize) < this.prefix.get_ref().len() {
			use std::io::Read;
			let before = buf.filled().len();
			let n = this.prefix.read(buf.initialize_unfilled()).unwrap_or(0);
			buf.set_filled(before + n);
			return std::task::Poll::Ready(Ok(()));
		}
		std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
	fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}
	fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}
	fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

/// Decides whether `sni` falls under any configured MitM hostname pattern
/// and, if so, mints (or reuses) a leaf certificate and builds the
/// `rustls::ServerConfig` the inbound TLS handler presents.
#[instrument(skip(settings, store))]
pub fn server_config_for(settings: &MitMSettings, store: &CertificateStore, sni: &str) -> Result<Option<Arc<ServerConfig>>, ConfigError> {
	if !settings.enabled() || !settings.matches_hostname(sni) {
		return Ok(None);
	}

	let certified = store.certificate_for(sni)?;
	let (chain, key) = certified.into_rustls();
	let mut config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(chain, key)
		.map_err(|e| ConfigError::FailedToLoadCertificate(e.to_string()))?;
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(Some(Arc::new(config)))
}

/// Wraps the inbound socket as a TLS server using the minted certificate.
pub async fn accept_inbound_tls<S>(config: Arc<ServerConfig>, stream: S) -> Result<tokio_rustls::server::TlsStream<S>, TransportError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	TlsAcceptor::from(config).accept(stream).await.map_err(TransportError::Io)
}

/// Wraps the outbound socket as a TLS client, honoring
/// `skip_certificate_verification` for the MitM-origin leg (§4.3, §4.8
/// step 2: "TLS client handler on the outbound side").
pub async fn connect_outbound_tls<S>(skip_cert_verify: bool, server_name: &str, stream: S) -> Result<tokio_rustls::client::TlsStream<S>, TransportError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let config = crate::tls::client_config(skip_cert_verify, None);
	let name = rustls::pki_types::ServerName::try_from(server_name.to_string()).map_err(|_| TransportError::DnsFailure(server_name.to_string()))?;
	TlsConnector::from(config).connect(name, stream).await.map_err(TransportError::Io)
}

/// Runs the HTTP capture pipeline over one already-established bidirectional
/// pair: reads one request off `inbound`, forwards it to `outbound`, reads
/// the matching response back, decompresses it, logs the pair, and forwards
/// the (re-encoded, unchanged) response back to `inbound` (§4.8 step 3).
///
/// This gateway doesn't mutate captured bodies, so "encode"/"transform" just
/// means replaying the original bytes once they've been parsed and logged.
#[instrument(skip_all)]
pub async fn capture_one_exchange<I, O>(inbound: &mut I, outbound: &mut O) -> Result<bool, TransportError>
where
	I: AsyncRead + AsyncWrite + Unpin,
	O: AsyncRead + AsyncWrite + Unpin,
{
	let mut request_buf = Vec::new();
	if !read_until_parsed(inbound, &mut request_buf, capture::parse_request).await? {
		return Ok(false);
	}
	outbound.write_all(&request_buf).await?;
	outbound.flush().await?;
	let (request, _) = capture::parse_request(&request_buf).expect("just parsed above");

	let mut response_buf = Vec::new();
	if !read_until_parsed(outbound, &mut response_buf, capture::parse_response).await? {
		warn!("outbound closed before a response arrived");
		return Ok(false);
	}
	inbound.write_all(&response_buf).await?;
	inbound.flush().await?;
	let (response, _) = capture::parse_response(&response_buf).expect("just parsed above");

	let decoded = capture::decompress(&response.headers, &response.body).await;
	capture::log_pair(&request, &response, &decoded);
	info!(url = %request.url, "captured exchange replayed");
	Ok(true)
}

async fn read_until_parsed<S, T>(stream: &mut S, buf: &mut Vec<u8>, parse: impl Fn(&[u8]) -> Option<(T, usize)>) -> Result<bool, TransportError>
where
	S: AsyncRead + Unpin,
{
	let mut chunk = [0u8; 4096];
	loop {
		if let Some((_, consumed)) = parse(buf) {
			buf.truncate(consumed);
			return Ok(true);
		}
		let n = stream.read(&mut chunk).await?;
		if n == 0 {
			return Ok(!buf.is_empty() && parse(buf).is_some());
		}
		buf.extend_from_slice(&chunk[..n]);
		if buf.len() > 8 * 1024 * 1024 {
			return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "captured request/response too large")));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sniffs_tls_client_hello_prefix() {
		assert_eq!(sniff(&[0x16, 0x03, 0x01, 0x00, 0x00]), Sniff::Tls);
	}

	#[test]
	fn sniffs_plaintext_http_method() {
		assert_eq!(sniff(b"GET / HTTP/1.1"), Sniff::PlaintextHttp);
	}

	#[test]
	fn unknown_prefix_is_neither() {
		assert_eq!(sniff(&[0x00, 0x01]), Sniff::Unknown);
	}

	fn synthetic_client_hello(hostname: &str) -> Vec<u8> {
		let mut server_name_entry = vec![0x00];
		server_name_entry.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
		server_name_entry.extend_from_slice(hostname.as_bytes());

		let mut server_name_list = (server_name_entry.len() as u16).to_be_bytes().to_vec();
		server_name_list.extend_from_slice(&server_name_entry);

		let mut extension = vec![0x00, 0x00];
		extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
		extension.extend_from_slice(&server_name_list);

		let mut extensions = (extension.len() as u16).to_be_bytes().to_vec();
		extensions.extend_from_slice(&extension);

		let mut hello_body = vec![0x03, 0x03];
		hello_body.extend_from_slice(&[0u8; 32]);
		hello_body.push(0x00);
		hello_body.extend_from_slice(&[0x00, 0x00]);
		hello_body.push(0x01);
		hello_body.push(0x00);
		hello_body.extend_from_slice(&extensions);

		let mut handshake = vec![0x01];
		handshake.extend_from_slice(&(hello_body.len() as u32).to_be_bytes()[1..]);
		handshake.extend_from_slice(&hello_body);
		handshake
	}

	#[test]
	fn extracts_sni_from_client_hello() {
		let body = synthetic_client_hello("a.example.com");
		assert_eq!(parse_sni(&body), Some("a.example.com".to_string()));
	}

	#[test]
	fn prefixed_stream_replays_prefix_before_socket_bytes() {
		use tokio::io::AsyncReadExt;
		let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
		rt.block_on(async {
			let (mut client, server) = tokio::io::duplex(64);
			client.write_all(b"world").await.unwrap();
			let mut prefixed = PrefixedStream::new(b"hello".to_vec(), server);
			let mut out = [0u8; 10];
			prefixed.read_exact(&mut out).await.unwrap();
			assert_eq!(&out, b"helloworld");
		});
	}
}
