use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gatekeeper::cli::Cli;
use gatekeeper::dispatcher::{self, Shared};
use gatekeeper::mitm::cert::CertificateStore;
use gatekeeper::profile::serializer;
use gatekeeper::rules::RuleEngine;
use gatekeeper::{dns, geoip};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_INVALID_PROFILE: u8 = 1;
const EXIT_BIND_FAILED: u8 = 2;
const EXIT_PANIC: u8 = 3;

fn main() -> ExitCode {
	let default_hook = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_hook(info);
		std::process::exit(EXIT_PANIC as i32);
	}));

	let code = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to start tokio runtime")
		.block_on(run());
	ExitCode::from(code)
}

async fn run() -> u8 {
	let cli = Cli::parse();

	let text = match std::fs::read_to_string(&cli.profile) {
		Ok(text) => text,
		Err(err) => {
			eprintln!("failed to read profile {:?}: {err}", cli.profile);
			return EXIT_INVALID_PROFILE;
		},
	};
	let profile = match serializer::parse(&text) {
		Ok(profile) => profile,
		Err(err) => {
			eprintln!("invalid profile {:?}: {err}", cli.profile);
			return EXIT_INVALID_PROFILE;
		},
	};

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(profile.basic.log_level.to_tracing().to_string())))
		.with_ansi(false)
		.with_writer(std::io::stderr)
		.init();

	// §6.6: GeoIP is an external collaborator; the core only ever sees it
	// through `GeoIpLookup`, and never wires an actual database in.
	let geoip = geoip::null();
	let profile = Arc::new(profile);
	let rule_engine = Arc::new(RuleEngine::new(profile.clone(), geoip));

	let resolver = match dns::Resolver::from_system_config() {
		Ok(resolver) => Arc::new(resolver),
		Err(err) => {
			eprintln!("failed to initialize DNS resolver: {err}");
			return EXIT_INVALID_PROFILE;
		},
	};

	// §6.7: a configured hostname pattern without a loadable CA bundle
	// disables MitM for the process rather than failing every matching
	// connection individually — logged once here instead of on each hit.
	let mitm = if profile.mitm.enabled() {
		match (&profile.mitm.ca_p12, &profile.mitm.ca_passphrase) {
			(Some(p12), Some(passphrase)) => match CertificateStore::load(p12, passphrase) {
				Ok(store) => Some(Arc::new(store)),
				Err(err) => {
					warn!(error = %err, "failed to load MitM CA bundle, MitM disabled");
					None
				},
			},
			_ => {
				warn!("mitm hostnames configured without a ca_p12/ca_passphrase, MitM disabled");
				None
			},
		}
	} else {
		None
	};

	let (shutdown_handle, shutdown) = gatekeeper_core::shutdown::new();
	let shared = Arc::new(Shared {
		profile: profile.clone(),
		rule_engine,
		resolver,
		mitm,
		outbound_mode: cli.outbound_mode,
	});

	let mut listeners = Vec::new();
	if let (Some(addr), Some(port)) = (&profile.basic.http_listen_address, profile.basic.http_listen_port) {
		match TcpListener::bind((addr.as_str(), port)).await {
			Ok(listener) => listeners.push((listener, ListenerKind::Http)),
			Err(err) => {
				eprintln!("failed to bind HTTP listener on {addr}:{port}: {err}");
				return EXIT_BIND_FAILED;
			},
		}
	}
	if let (Some(addr), Some(port)) = (&profile.basic.socks_listen_address, profile.basic.socks_listen_port) {
		match TcpListener::bind((addr.as_str(), port)).await {
			Ok(listener) => listeners.push((listener, ListenerKind::Socks5)),
			Err(err) => {
				eprintln!("failed to bind SOCKS5 listener on {addr}:{port}: {err}");
				return EXIT_BIND_FAILED;
			},
		}
	}
	if listeners.is_empty() {
		eprintln!("profile configures neither an HTTP nor a SOCKS5 listener");
		return EXIT_BIND_FAILED;
	}

	let mut accept_tasks = tokio::task::JoinSet::new();
	for (listener, kind) in listeners {
		let shared = shared.clone();
		let shutdown = shutdown.clone();
		accept_tasks.spawn(accept_loop(listener, kind, shared, shutdown));
	}

	let ctrl_c = tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		info!("received shutdown signal");
		shutdown_handle.trigger();
	});

	while accept_tasks.join_next().await.is_some() {}
	ctrl_c.abort();
	EXIT_OK
}

#[derive(Clone, Copy)]
enum ListenerKind {
	Http,
	Socks5,
}

async fn accept_loop(listener: TcpListener, kind: ListenerKind, shared: Arc<Shared>, shutdown: gatekeeper_core::shutdown::Shutdown) {
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => return,
			accepted = listener.accept() => {
				let (stream, _peer) = match accepted {
					Ok(pair) => pair,
					Err(err) => {
						error!(error = %err, "accept failed");
						continue;
					},
				};
				stream.set_nodelay(true).ok();
				let shared = shared.clone();
				let shutdown = shutdown.clone();
				match kind {
					ListenerKind::Http => { tokio::spawn(dispatcher::handle_http_proxy(shared, stream, shutdown)); },
					ListenerKind::Socks5 => { tokio::spawn(dispatcher::handle_socks5(shared, stream, shutdown)); },
				}
			}
		}
	}
}
