//! HTTP proxy inbound server (§4.4 "HTTP proxy server").

use crate::buf::TargetAddress;
use crate::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// What the dispatcher should do once the outbound leg is connected.
pub enum Handshake {
	/// `CONNECT host:port` — reply `200 Connection Established` then splice
	/// raw bytes both ways.
	Connect(TargetAddress),
	/// A non-tunnel request (`GET http://host/path HTTP/1.1`, or a relative
	/// request with a `Host:` header) — replay `request` to the outbound
	/// peer before splicing, and don't send a reply of our own.
	Plain { destination: TargetAddress, request: Vec<u8> },
}

/// Reads one HTTP/1.1 request line + headers off `stream` and determines
/// the destination.
pub async fn read_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Handshake, ProtocolError> {
	let raw = read_request_head(stream).await?;
	let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::UnexpectedRead)?;
	let mut lines = text.split("\r\n");
	let request_line = lines.next().ok_or(ProtocolError::UnexpectedRead)?;
	let mut parts = request_line.split_whitespace();
	let method = parts.next().ok_or(ProtocolError::UnexpectedRead)?;
	let target = parts.next().ok_or(ProtocolError::UnexpectedRead)?;

	if method.eq_ignore_ascii_case("CONNECT") {
		let destination = parse_authority(target)?;
		return Ok(Handshake::Connect(destination));
	}

	let host_header = text
		.split("\r\n")
		.skip(1)
		.find_map(|line| line.to_ascii_lowercase().strip_prefix("host:").map(|v| v.trim().to_string()));

	let destination = if let Some(authority) = target.strip_prefix("http://") {
		let (authority, _) = authority.split_once('/').unwrap_or((authority, ""));
		parse_authority(authority)?
	} else if let Some(host) = host_header {
		parse_authority(&host)?
	} else {
		return Err(ProtocolError::UnexpectedRead);
	};

	Ok(Handshake::Plain { destination, request: raw })
}

fn parse_authority(authority: &str) -> Result<TargetAddress, ProtocolError> {
	if let Some((host, port)) = authority.rsplit_once(':') {
		if let Ok(port) = port.parse() {
			return TargetAddress::domain(host, port);
		}
	}
	TargetAddress::domain(authority, 80)
}

async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, ProtocolError> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		stream.read_exact(&mut byte).await?;
		buf.push(byte[0]);
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			break;
		}
		if buf.len() > 64 * 1024 {
			return Err(ProtocolError::UnexpectedRead);
		}
	}
	Ok(buf)
}

/// Replies `200 Connection Established` to a `CONNECT` client (§4.4).
pub async fn send_connect_established<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), ProtocolError> {
	stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
	stream.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn parses_connect_target() {
		let (mut client, mut server) = duplex(1024);
		client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await.unwrap();
		drop(client);
		let handshake = read_handshake(&mut server).await.unwrap();
		match handshake {
			Handshake::Connect(dest) => assert_eq!(dest, TargetAddress::domain("example.com", 443).unwrap()),
			_ => panic!("expected Connect"),
		}
	}

	#[tokio::test]
	async fn parses_absolute_uri_non_tunnel_request() {
		let (mut client, mut server) = duplex(1024);
		client.write_all(b"GET http://a.apple.com/ HTTP/1.1\r\nHost: a.apple.com\r\n\r\n").await.unwrap();
		drop(client);
		let handshake = read_handshake(&mut server).await.unwrap();
		match handshake {
			Handshake::Plain { destination, request } => {
				assert_eq!(destination, TargetAddress::domain("a.apple.com", 80).unwrap());
				assert!(request.starts_with(b"GET http://a.apple.com/"));
			},
			_ => panic!("expected Plain"),
		}
	}
}
