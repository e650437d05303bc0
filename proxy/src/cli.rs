//! Command-line interface (§6.4).

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", about = "A TCP proxy gateway: rule-based dispatch over HTTP/SOCKS5 inbound listeners.")]
pub struct Cli {
	/// Path to the text profile (§4.1).
	#[arg(long)]
	pub profile: PathBuf,

	/// How much of the dispatcher pipeline to run per connection (§4.7 step 2).
	#[arg(long, value_enum, default_value_t = OutboundMode::Direct)]
	pub outbound_mode: OutboundMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum OutboundMode {
	/// Every connection is dialed directly; DNS-for-rules, rule matching
	/// and policy groups are never consulted.
	Direct,
	/// Every connection is forced through the profile's `FINAL` rule's
	/// policy, bypassing per-rule matching but still resolving DNS.
	Proxy,
	/// Full pipeline: DNS resolve, rule match, policy resolution.
	Rule,
}
