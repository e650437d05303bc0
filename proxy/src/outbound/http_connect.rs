//! HTTP-CONNECT outbound client (§4.5).

use crate::buf::TargetAddress;
use crate::error::ProtocolError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Emits `CONNECT host:port HTTP/1.1`, optionally with HTTP basic auth, and
/// requires a `2xx` status line. The stream is raw afterward.
pub async fn connect<S>(mut stream: S, destination: &TargetAddress, credentials: Option<(&str, &str)>) -> Result<S, ProtocolError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let authority = destination.to_string();
	let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
	if let Some((user, pass)) = credentials {
		let token = BASE64.encode(format!("{user}:{pass}"));
		request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
	}
	request.push_str("\r\n");

	stream.write_all(request.as_bytes()).await?;
	stream.flush().await?;

	let status_line = read_status_line(&mut stream).await?;
	let code: u16 = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|c| c.parse().ok())
		.ok_or(ProtocolError::UnexpectedRead)?;
	if !(200..300).contains(&code) {
		return Err(ProtocolError::ReplyFailed(crate::error::ReplyFailure::GeneralFailure));
	}

	Ok(stream)
}

async fn read_status_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, ProtocolError> {
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
	let text = String::from_utf8_lossy(&buf);
	Ok(text.lines().next().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn succeeds_on_2xx() {
		let (mut client, mut server) = duplex(1024);
		let dest = TargetAddress::domain("example.com", 443).unwrap();

		let server_task = tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			let n = server.read(&mut buf).await.unwrap();
			assert!(String::from_utf8_lossy(&buf[..n]).starts_with("CONNECT example.com:443"));
			server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
		});

		connect(&mut client, &dest, None).await.unwrap();
		server_task.await.unwrap();
	}

	#[tokio::test]
	async fn fails_on_4xx() {
		let (mut client, mut server) = duplex(1024);
		let dest = TargetAddress::domain("example.com", 443).unwrap();

		let server_task = tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			let _ = server.read(&mut buf).await.unwrap();
			server.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
		});

		let err = connect(&mut client, &dest, None).await.unwrap_err();
		assert!(matches!(err, ProtocolError::ReplyFailed(_)));
		server_task.await.unwrap();
	}
}
