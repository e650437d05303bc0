//! SOCKS5 outbound client (RFC 1928/1929, §4.5).

use crate::buf::{TargetAddress, decode_socks_address, encode_socks_address};
use crate::error::{AuthFailure, ProtocolError, ReplyFailure};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

pub async fn connect<S>(mut stream: S, destination: &TargetAddress, credentials: Option<(&str, &str)>) -> Result<S, ProtocolError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let offered_methods: &[u8] = if credentials.is_some() { &[METHOD_NO_AUTH, METHOD_USER_PASS] } else { &[METHOD_NO_AUTH] };
	let mut greeting = vec![VERSION, offered_methods.len() as u8];
	greeting.extend_from_slice(offered_methods);
	stream.write_all(&greeting).await?;

	let mut selection = [0u8; 2];
	stream.read_exact(&mut selection).await?;
	if selection[0] != VERSION {
		return Err(ProtocolError::UnsupportedProtocolVersion);
	}

	match selection[1] {
		METHOD_NO_AUTH => {},
		METHOD_USER_PASS => {
			let (user, pass) = credentials.ok_or(ProtocolError::AuthenticationFailed(AuthFailure::NoValidMethod))?;
			sub_negotiate(&mut stream, user, pass).await?;
		},
		METHOD_NO_ACCEPTABLE => return Err(ProtocolError::AuthenticationFailed(AuthFailure::NoValidMethod)),
		_ => return Err(ProtocolError::AuthenticationFailed(AuthFailure::MethodNotImplemented)),
	}

	let mut request = BytesMut::new();
	request.put_u8(VERSION);
	request.put_u8(CMD_CONNECT);
	request.put_u8(0x00);
	encode_socks_address(destination, &mut request);
	stream.write_all(&request).await?;

	let mut reply_head = [0u8; 4];
	stream.read_exact(&mut reply_head).await?;
	if reply_head[0] != VERSION {
		return Err(ProtocolError::UnsupportedProtocolVersion);
	}
	if reply_head[1] != 0x00 {
		return Err(ProtocolError::ReplyFailed(ReplyFailure::from_socks5_code(reply_head[1])));
	}

	// Discard the bound address the server reports; we don't act on it.
	read_bound_address(&mut stream, reply_head[3]).await?;

	Ok(stream)
}

async fn sub_negotiate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, user: &str, pass: &str) -> Result<(), ProtocolError> {
	let mut req = vec![0x01, user.len() as u8];
	req.extend_from_slice(user.as_bytes());
	req.push(pass.len() as u8);
	req.extend_from_slice(pass.as_bytes());
	stream.write_all(&req).await?;

	let mut reply = [0u8; 2];
	stream.read_exact(&mut reply).await?;
	if reply[1] != 0x00 {
		return Err(ProtocolError::AuthenticationFailed(AuthFailure::IncorrectCredentials));
	}
	Ok(())
}

async fn read_bound_address<S: AsyncRead + Unpin>(stream: &mut S, atyp: u8) -> Result<(), ProtocolError> {
	let len = match atyp {
		0x01 => 4 + 2,
		0x04 => 16 + 2,
		0x03 => {
			let mut len_byte = [0u8; 1];
			stream.read_exact(&mut len_byte).await?;
			len_byte[0] as usize + 2
		},
		_ => return Err(ProtocolError::InvalidAddressType),
	};
	let mut discard = vec![0u8; len];
	stream.read_exact(&mut discard).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn connects_without_auth() {
		let (mut client, mut server) = duplex(1024);
		let dest = TargetAddress::domain("example.com", 80).unwrap();

		let server_task = tokio::spawn(async move {
			let mut greeting = [0u8; 3];
			server.read_exact(&mut greeting).await.unwrap();
			assert_eq!(greeting, [0x05, 0x01, 0x00]);
			server.write_all(&[0x05, 0x00]).await.unwrap();

			let mut head = [0u8; 3];
			server.read_exact(&mut head).await.unwrap();
			let mut rest = [0u8; 1 + 11 + 2];
			server.read_exact(&mut rest).await.unwrap();

			server.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
		});

		connect(&mut client, &dest, None).await.unwrap();
		server_task.await.unwrap();
	}

	#[tokio::test]
	async fn connection_refused_maps_to_reply_error() {
		let (mut client, mut server) = duplex(1024);
		let dest = TargetAddress::domain("example.com", 80).unwrap();

		let server_task = tokio::spawn(async move {
			let mut greeting = [0u8; 3];
			server.read_exact(&mut greeting).await.unwrap();
			server.write_all(&[0x05, 0x00]).await.unwrap();
			let mut head = [0u8; 3];
			server.read_exact(&mut head).await.unwrap();
			let mut rest = [0u8; 1 + 11 + 2];
			server.read_exact(&mut rest).await.unwrap();
			server.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
		});

		let err = connect(&mut client, &dest, None).await.unwrap_err();
		assert!(matches!(err, ProtocolError::ReplyFailed(ReplyFailure::ConnectionRefused)));
		server_task.await.unwrap();
	}
}
