//! Bidirectional splice (§4.7 step 8, §5 "Ordering guarantees" and
//! "Backpressure"): pairs an inbound byte stream with a connected
//! [`OutboundTransport`], forwarding each side's reads to the other's
//! writes until both directions have gone quiet.

use crate::error::TransportError;
use crate::outbound::OutboundTransport;
use gatekeeper_core::shutdown::Shutdown;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK: usize = 16 * 1024;

/// Splices `inbound` and `outbound` until both sides report EOF, one side
/// errors, or `shutdown` fires. `pending` is written to `outbound` first,
/// e.g. the bytes a SOCKS5/HTTP client sent during the handshake (§4.4
/// point 4, §5 "buffered client writes ... replayed ... before any raw
/// bytes flow back").
///
/// Each direction's read is only attempted while its own side is still
/// open; writes report backpressure to `read`'s caller the ordinary way
/// tokio does (a full outbound write buffer simply delays the next
/// inbound read, bounding how far ahead one side can get).
pub async fn splice<I>(inbound: &mut I, outbound: &mut dyn OutboundTransport, pending: Vec<u8>, shutdown: &Shutdown) -> Result<(), TransportError>
where
	I: AsyncRead + AsyncWrite + Unpin,
{
	if !pending.is_empty() {
		outbound.write_chunk(&pending).await?;
	}

	let mut inbound_open = true;
	let mut outbound_open = true;
	let mut buf = vec![0u8; CHUNK];

	while inbound_open || outbound_open {
		tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			result = inbound.read(&mut buf), if inbound_open => {
				let n = result?;
				if n == 0 {
					inbound_open = false;
					let _ = outbound.shutdown().await;
				} else {
					outbound.write_chunk(&buf[..n]).await?;
				}
			},
			result = outbound.read_chunk(), if outbound_open => {
				let chunk = result?;
				if chunk.is_empty() {
					outbound_open = false;
					let _ = inbound.shutdown().await;
				} else {
					inbound.write_all(&chunk).await?;
					inbound.flush().await?;
				}
			},
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::{Arc, Mutex};
	use tokio::io::duplex;

	struct EchoOnce {
		replies: std::collections::VecDeque<Vec<u8>>,
		written: Arc<Mutex<Vec<u8>>>,
	}

	#[async_trait]
	impl OutboundTransport for EchoOnce {
		async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
			Ok(self.replies.pop_front().unwrap_or_default())
		}
		async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransportError> {
			self.written.lock().unwrap().extend_from_slice(data);
			Ok(())
		}
		async fn shutdown(&mut self) -> Result<(), TransportError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn forwards_pending_then_splices_both_directions() {
		let (mut client, mut server) = duplex(1024);
		let written = Arc::new(Mutex::new(Vec::new()));
		let mut outbound = EchoOnce {
			replies: vec![b"reply".to_vec()].into(),
			written: written.clone(),
		};
		let (_, shutdown) = gatekeeper_core::shutdown::new();

		client.write_all(b"hello").await.unwrap();
		drop(client);

		splice(&mut server, &mut outbound, b"pending".to_vec(), &shutdown).await.unwrap();
		assert_eq!(*written.lock().unwrap(), b"pendinghello".to_vec());
	}
}
