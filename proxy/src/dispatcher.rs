//! Connection dispatcher (§4.7): resolve → rule-match → policy-select →
//! connect → splice, shared by both inbound protocols. One [`Shared`] is
//! built once at startup and handed (behind an `Arc`) to every accepted
//! connection's task.

use crate::buf::TargetAddress;
use crate::cli::OutboundMode;
use crate::dns::Resolver;
use crate::error::{ConfigError, ProtocolError, ReplyFailure, TransportError};
use crate::glue;
use crate::inbound::{http_proxy, socks5};
use crate::mitm::{self, cert::CertificateStore};
use crate::outbound::BoxedOutbound;
use crate::policy::{self, Outcome};
use crate::profile::{DIRECT, Policy, PolicyKind, Profile, RuleKind};
use crate::rules::RuleEngine;
use gatekeeper_core::ConnectionId;
use gatekeeper_core::shutdown::Shutdown;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, instrument, warn};

/// Shared, read-mostly state every accepted connection dispatches through
/// (§5 "Shared resources").
pub struct Shared {
	pub profile: Arc<Profile>,
	pub rule_engine: Arc<RuleEngine>,
	pub resolver: Arc<Resolver>,
	pub mitm: Option<Arc<CertificateStore>>,
	pub outbound_mode: OutboundMode,
}

impl Shared {
	fn mitm_active(&self) -> bool {
		self.mitm.is_some() && self.profile.mitm.enabled()
	}
}

struct Resolved {
	policy: Policy,
	ips: Vec<IpAddr>,
}

fn direct_policy() -> Policy {
	Policy {
		name: DIRECT.to_string(),
		kind: PolicyKind::Direct,
	}
}

/// Steps 2-6: DNS resolution (always, since a `DIRECT` outcome needs a
/// concrete socket address to dial regardless of outbound mode) plus, when
/// not in `direct` mode, rule matching and policy resolution.
async fn resolve(shared: &Shared, destination: &TargetAddress) -> Resolved {
	let ips = match destination {
		TargetAddress::DomainPort { host, .. } => shared.resolver.resolve_both(host).await,
		TargetAddress::SocketAddress(_) => Vec::new(),
	};

	if shared.outbound_mode == OutboundMode::Direct {
		return Resolved { policy: direct_policy(), ips };
	}

	let mut patterns = vec![destination.host_pattern()];
	patterns.extend(ips.iter().map(ToString::to_string));

	let rule_name = if shared.outbound_mode == OutboundMode::Proxy {
		shared.profile.rules.iter().find(|r| matches!(r.kind, RuleKind::Final)).map(|r| r.policy.as_str())
	} else {
		shared.rule_engine.resolve(&patterns).await.map(|r| r.policy.as_str())
	};

	let name = rule_name.expect("a profile without a FINAL rule is rejected at load time");
	let policy = shared
		.profile
		.resolve_policy(name)
		.cloned()
		.expect("rule/policy-group references are validated at profile load time");
	Resolved { policy, ips }
}

fn pick_direct_destination(destination: &TargetAddress, ips: &[IpAddr]) -> Result<TargetAddress, TransportError> {
	match destination {
		TargetAddress::SocketAddress(_) => Ok(destination.clone()),
		TargetAddress::DomainPort { host, port } => {
			let ip = ips.first().copied().ok_or_else(|| TransportError::DnsFailure(host.clone()))?;
			TargetAddress::socket(SocketAddr::new(ip, *port)).map_err(|_| TransportError::DnsFailure(host.clone()))
		},
	}
}

fn protocol_to_transport(err: ProtocolError) -> TransportError {
	TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

fn config_to_transport(err: ConfigError) -> TransportError {
	TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

/// Steps 2-7: resolves `destination` and connects the outbound leg.
async fn resolve_and_connect(shared: &Shared, destination: &TargetAddress) -> Result<Outcome, TransportError> {
	let resolved = resolve(shared, destination).await;
	let connect_destination = if matches!(resolved.policy.kind, PolicyKind::Direct) {
		pick_direct_destination(destination, &resolved.ips)?
	} else {
		destination.clone()
	};
	policy::make_connection(&resolved.policy, &connect_destination).await
}

/// Step 8 for a CONNECT-style tunnel (HTTP `CONNECT` or SOCKS5), with the
/// optional MitM/capture insertion of §4.8. `stream` is borrowed, not
/// owned — TLS termination wraps `&mut TcpStream`, which itself implements
/// `AsyncRead`/`AsyncWrite`, so ownership is never required.
async fn serve_tunnel(shared: &Shared, stream: &mut TcpStream, mut outbound: BoxedOutbound, pending: Vec<u8>, destination: &TargetAddress, shutdown: &Shutdown) -> Result<(), TransportError> {
	if !pending.is_empty() {
		outbound.write_chunk(&pending).await?;
	}

	if !shared.mitm_active() {
		return glue::splice(stream, outbound.as_mut(), Vec::new(), shutdown).await;
	}
	let store = shared.mitm.as_ref().expect("checked by mitm_active");

	let (sniff_result, prefix) = mitm::sniff_stream(stream).await?;
	if sniff_result != mitm::Sniff::Tls {
		let mut prefixed = mitm::PrefixedStream::new(prefix, &mut *stream);
		return glue::splice(&mut prefixed, outbound.as_mut(), Vec::new(), shutdown).await;
	}

	let record_body = mitm::read_client_hello_record(stream, &prefix).await?;
	let sni = mitm::parse_sni(&record_body).unwrap_or_else(|| destination.host_pattern());
	let mut full_prefix = prefix;
	full_prefix.extend_from_slice(&record_body);

	let config = mitm::server_config_for(&shared.profile.mitm, store, &sni).map_err(config_to_transport)?;
	let Some(config) = config else {
		let mut prefixed = mitm::PrefixedStream::new(full_prefix, &mut *stream);
		return glue::splice(&mut prefixed, outbound.as_mut(), Vec::new(), shutdown).await;
	};

	let prefixed_inbound = mitm::PrefixedStream::new(full_prefix, &mut *stream);
	let mut tls_inbound = mitm::accept_inbound_tls(config, prefixed_inbound).await?;

	// The already-connected `outbound` leg speaks whatever the resolved
	// policy put on the wire (raw bytes, Shadowsocks/VMESS frames, ...), none
	// of which can host a second TLS layer. MitM terminates the client's TLS
	// here and re-dials the real destination directly for the outbound TLS
	// leg (§4.8 step 2), so the policy-resolved leg is simply dropped.
	outbound.shutdown().await.ok();
	let raw = TcpStream::connect((destination.host_pattern().as_str(), destination.port())).await.map_err(TransportError::Io)?;
	raw.set_nodelay(true).ok();
	let mut tls_outbound = mitm::connect_outbound_tls(shared.profile.mitm.skip_certificate_verification, &sni, raw).await?;

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => return Ok(()),
			more = mitm::capture_one_exchange(&mut tls_inbound, &mut tls_outbound) => {
				if !more? {
					return Ok(());
				}
			}
		}
	}
}

#[instrument(skip(shared, stream, shutdown), fields(conn = %ConnectionId::next()))]
pub async fn handle_http_proxy(shared: Arc<Shared>, mut stream: TcpStream, shutdown: Shutdown) {
	if let Err(err) = run_http_proxy(&shared, &mut stream, &shutdown).await {
		warn!(error = %err, "http proxy connection failed");
	}
}

async fn run_http_proxy(shared: &Shared, stream: &mut TcpStream, shutdown: &Shutdown) -> Result<(), TransportError> {
	let handshake = http_proxy::read_handshake(stream).await.map_err(protocol_to_transport)?;

	match handshake {
		http_proxy::Handshake::Connect(destination) => {
			let outcome = resolve_and_connect(shared, &destination).await;
			let outbound = match outcome {
				Ok(Outcome::Connected(outbound)) => outbound,
				_ => {
					stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.ok();
					stream.shutdown().await.ok();
					return Ok(());
				},
			};
			http_proxy::send_connect_established(stream).await.map_err(protocol_to_transport)?;
			info!(destination = %destination, "http CONNECT tunnel established");
			serve_tunnel(shared, stream, outbound, Vec::new(), &destination, shutdown).await
		},
		http_proxy::Handshake::Plain { destination, request } => {
			let outcome = resolve_and_connect(shared, &destination).await?;
			match outcome {
				Outcome::Rejected => {
					stream.shutdown().await.ok();
					Ok(())
				},
				Outcome::RespondAndClose(body) => {
					stream.write_all(body).await?;
					stream.flush().await?;
					stream.shutdown().await.ok();
					Ok(())
				},
				Outcome::Connected(mut outbound) => {
					if let Some((parsed, _)) = mitm::capture::parse_request(&request) {
						info!(method = %parsed.method, url = %parsed.url, "http non-tunnel request");
					}
					outbound.write_chunk(&request).await?;
					glue::splice(stream, outbound.as_mut(), Vec::new(), shutdown).await
				},
			}
		},
	}
}

#[instrument(skip(shared, stream, shutdown), fields(conn = %ConnectionId::next()))]
pub async fn handle_socks5(shared: Arc<Shared>, mut stream: TcpStream, shutdown: Shutdown) {
	if let Err(err) = run_socks5(&shared, &mut stream, &shutdown).await {
		warn!(error = %err, "socks5 connection failed");
	}
}

async fn run_socks5(shared: &Shared, stream: &mut TcpStream, shutdown: &Shutdown) -> Result<(), TransportError> {
	socks5::negotiate(stream, None).await.map_err(protocol_to_transport)?;

	let destination = match socks5::read_connect_request(stream).await {
		Ok(dest) => dest,
		Err(ProtocolError::ReplyFailed(failure)) => {
			socks5::send_reply(stream, Err(failure)).await.ok();
			return Ok(());
		},
		Err(err) => return Err(protocol_to_transport(err)),
	};

	let outcome = resolve_and_connect(shared, &destination).await;
	match outcome {
		Ok(Outcome::Connected(outbound)) => {
			let bound = stream.local_addr().map_err(TransportError::Io)?;
			socks5::send_reply(stream, Ok(bound)).await.map_err(protocol_to_transport)?;
			info!(destination = %destination, "socks5 tunnel established");
			serve_tunnel(shared, stream, outbound, Vec::new(), &destination, shutdown).await
		},
		Ok(Outcome::Rejected) => {
			socks5::send_reply(stream, Err(ReplyFailure::NotAllowed)).await.ok();
			Ok(())
		},
		Ok(Outcome::RespondAndClose(body)) => {
			socks5::send_reply(stream, Err(ReplyFailure::HostUnreachable)).await.ok();
			stream.write_all(body).await.ok();
			Ok(())
		},
		Err(_) => {
			socks5::send_reply(stream, Err(ReplyFailure::HostUnreachable)).await.ok();
			Ok(())
		},
	}
}
