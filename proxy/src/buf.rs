//! Byte-buffer and address codec: network integer helpers, the
//! SOCKS-style address wire format shared by the SOCKS5 inbound/outbound
//! code and the Shadowsocks/VMESS destination prefix, and small hex/crc
//! helpers used by the VMESS auth-id frame.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The destination of an outbound connection: either a hostname to be
/// resolved, or a concrete socket address. Spec invariant: port is never
/// zero, and a `DomainPort` host is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddress {
	DomainPort { host: String, port: u16 },
	SocketAddress(SocketAddr),
}

impl TargetAddress {
	pub fn domain(host: impl Into<String>, port: u16) -> Result<Self, ProtocolError> {
		let host = host.into();
		if host.is_empty() || port == 0 {
			return Err(ProtocolError::InvalidAddressType);
		}
		Ok(TargetAddress::DomainPort { host, port })
	}

	pub fn socket(addr: SocketAddr) -> Result<Self, ProtocolError> {
		if addr.port() == 0 {
			return Err(ProtocolError::InvalidAddressType);
		}
		Ok(TargetAddress::SocketAddress(addr))
	}

	pub fn port(&self) -> u16 {
		match self {
			TargetAddress::DomainPort { port, .. } => *port,
			TargetAddress::SocketAddress(addr) => addr.port(),
		}
	}

	/// The pattern(s) the rule engine matches against: the bare hostname
	/// for `DomainPort`, the IP literal for `SocketAddress`. DNS-resolved
	/// IPs are appended separately by the dispatcher (§4.7 step 3).
	pub fn host_pattern(&self) -> String {
		match self {
			TargetAddress::DomainPort { host, .. } => host.clone(),
			TargetAddress::SocketAddress(addr) => addr.ip().to_string(),
		}
	}
}

impl std::fmt::Display for TargetAddress {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TargetAddress::DomainPort { host, port } => write!(f, "{host}:{port}"),
			TargetAddress::SocketAddress(addr) => write!(f, "{addr}"),
		}
	}
}

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Writes `addr` in the SOCKS5 address wire format (RFC 1928 §5): one
/// address-type byte, the address, then a big-endian port. Shared by the
/// SOCKS5 client/server and the Shadowsocks/VMESS destination prefix.
pub fn encode_socks_address(addr: &TargetAddress, out: &mut impl BufMut) {
	match addr {
		TargetAddress::SocketAddress(SocketAddr::V4(v4)) => {
			out.put_u8(ATYP_V4);
			out.put_slice(&v4.ip().octets());
			out.put_u16(v4.port());
		},
		TargetAddress::SocketAddress(SocketAddr::V6(v6)) => {
			out.put_u8(ATYP_V6);
			out.put_slice(&v6.ip().octets());
			out.put_u16(v6.port());
		},
		TargetAddress::DomainPort { host, port } => {
			out.put_u8(ATYP_DOMAIN);
			out.put_u8(host.len() as u8);
			out.put_slice(host.as_bytes());
			out.put_u16(*port);
		},
	}
}

/// Inverse of [`encode_socks_address`]. Consumes only the bytes it needs
/// from `buf`.
pub fn decode_socks_address(buf: &mut impl Buf) -> Result<TargetAddress, ProtocolError> {
	if !buf.has_remaining() {
		return Err(ProtocolError::UnexpectedRead);
	}
	let atyp = buf.get_u8();
	match atyp {
		ATYP_V4 => {
			if buf.remaining() < 6 {
				return Err(ProtocolError::UnexpectedRead);
			}
			let mut octets = [0u8; 4];
			buf.copy_to_slice(&mut octets);
			let port = buf.get_u16();
			TargetAddress::socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
		},
		ATYP_V6 => {
			if buf.remaining() < 18 {
				return Err(ProtocolError::UnexpectedRead);
			}
			let mut octets = [0u8; 16];
			buf.copy_to_slice(&mut octets);
			let port = buf.get_u16();
			TargetAddress::socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
		},
		ATYP_DOMAIN => {
			if !buf.has_remaining() {
				return Err(ProtocolError::UnexpectedRead);
			}
			let len = buf.get_u8() as usize;
			if buf.remaining() < len + 2 {
				return Err(ProtocolError::UnexpectedRead);
			}
			let mut host = vec![0u8; len];
			buf.copy_to_slice(&mut host);
			let host = String::from_utf8(host).map_err(|_| ProtocolError::InvalidAddressType)?;
			let port = buf.get_u16();
			TargetAddress::domain(host, port)
		},
		_ => Err(ProtocolError::InvalidAddressType),
	}
}

pub fn to_hex(bytes: &[u8]) -> String {
	hex::encode(bytes)
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
	hex::decode(s)
}

pub fn crc32(bytes: &[u8]) -> u32 {
	crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BytesMut;
	use std::net::Ipv6Addr;

	fn roundtrip(addr: TargetAddress) {
		let mut buf = BytesMut::new();
		encode_socks_address(&addr, &mut buf);
		let mut reader = buf.freeze();
		let decoded = decode_socks_address(&mut reader).unwrap();
		assert_eq!(decoded, addr);
	}

	#[test]
	fn roundtrips_v4() {
		roundtrip(TargetAddress::socket("1.2.3.4:80".parse().unwrap()).unwrap());
	}

	#[test]
	fn roundtrips_v6() {
		let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443);
		roundtrip(TargetAddress::socket(addr).unwrap());
	}

	#[test]
	fn roundtrips_domain() {
		roundtrip(TargetAddress::domain("example.com", 443).unwrap());
	}

	#[test]
	fn rejects_zero_port() {
		assert!(TargetAddress::domain("example.com", 0).is_err());
	}

	#[test]
	fn rejects_empty_host() {
		assert!(TargetAddress::domain("", 443).is_err());
	}
}
