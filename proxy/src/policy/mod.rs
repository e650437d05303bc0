//! Policy layer (§4.3): turns a resolved [`Policy`] plus a destination into
//! a connected outbound leg, or an immediate terminal response for the two
//! synthetic policies that never touch the network.

use crate::buf::TargetAddress;
use crate::error::TransportError;
use crate::outbound::{self, BoxedOutbound, OutboundTransport};
use crate::profile::{Policy, PolicyKind};
use async_trait::async_trait;
use tracing::instrument;

/// A single-pixel, transparent GIF (§4.3 "REJECT-TINYGIF"): served as the
/// entire response body for any connection matched to that policy.
pub const TINY_GIF: &[u8] = &[
	0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00,
	0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

/// Outcome of dispatching one connection through the resolved policy.
pub enum Outcome {
	Connected(BoxedOutbound),
	Rejected,
	/// Serves `body` then closes; used for REJECT-TINYGIF.
	RespondAndClose(&'static [u8]),
}

/// Raw-TCP transport used by the DIRECT policy; reuses the same
/// [`OutboundTransport`] interface as every proxied policy so the glue
/// stage (§4.7 step 8) doesn't special-case it.
struct DirectTransport {
	inner: tokio::net::TcpStream,
}

#[async_trait]
impl OutboundTransport for DirectTransport {
	async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
		use tokio::io::AsyncReadExt;
		let mut buf = vec![0u8; 16 * 1024];
		let n = self.inner.read(&mut buf).await?;
		buf.truncate(n);
		Ok(buf)
	}

	async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError> {
		use tokio::io::AsyncWriteExt;
		self.inner.write_all(data).await?;
		Ok(())
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		use tokio::io::AsyncWriteExt;
		self.inner.shutdown().await?;
		Ok(())
	}
}

/// Connects to `destination` per `policy.kind` (§4.3). `destination` should
/// already carry a resolved IP where the dispatcher did DNS resolution
/// (§4.7 step 3); DIRECT and proxied policies both just dial it.
#[instrument(skip(policy), fields(policy = %policy.name))]
pub async fn make_connection(policy: &Policy, destination: &TargetAddress) -> Result<Outcome, TransportError> {
	match &policy.kind {
		PolicyKind::Reject => Ok(Outcome::Rejected),
		PolicyKind::RejectTinyGif => Ok(Outcome::RespondAndClose(TINY_GIF)),
		PolicyKind::Direct => {
			let addr = direct_socket_addr(destination)?;
			let tcp = tokio::net::TcpStream::connect(addr).await.map_err(TransportError::Io)?;
			tcp.set_nodelay(true).ok();
			Ok(Outcome::Connected(Box::new(DirectTransport { inner: tcp })))
		},
		PolicyKind::Proxy(cfg) => {
			let stream = outbound::connect(cfg, destination).await?;
			Ok(Outcome::Connected(stream))
		},
	}
}

fn direct_socket_addr(destination: &TargetAddress) -> Result<std::net::SocketAddr, TransportError> {
	match destination {
		TargetAddress::SocketAddress(addr) => Ok(*addr),
		TargetAddress::DomainPort { host, .. } => Err(TransportError::DnsFailure(host.clone())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::profile::{Policy, PolicyKind};

	#[tokio::test]
	async fn reject_never_touches_the_network() {
		let policy = Policy {
			name: "REJECT".into(),
			kind: PolicyKind::Reject,
		};
		let dest = TargetAddress::domain("example.com", 80).unwrap();
		let outcome = make_connection(&policy, &dest).await.unwrap();
		assert!(matches!(outcome, Outcome::Rejected));
	}

	#[tokio::test]
	async fn reject_tinygif_serves_fixed_body() {
		let policy = Policy {
			name: "REJECT-TINYGIF".into(),
			kind: PolicyKind::RejectTinyGif,
		};
		let dest = TargetAddress::domain("example.com", 80).unwrap();
		let outcome = make_connection(&policy, &dest).await.unwrap();
		match outcome {
			Outcome::RespondAndClose(body) => assert_eq!(body, TINY_GIF),
			_ => panic!("expected RespondAndClose"),
		}
	}

	#[tokio::test]
	async fn direct_requires_a_resolved_socket_address() {
		let policy = Policy {
			name: "DIRECT".into(),
			kind: PolicyKind::Direct,
		};
		let dest = TargetAddress::domain("example.com", 80).unwrap();
		let err = make_connection(&policy, &dest).await.unwrap_err();
		assert!(matches!(err, TransportError::DnsFailure(_)));
	}
}
