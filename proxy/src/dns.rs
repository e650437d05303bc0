//! DNS resolution for dispatcher step 3 (§4.7): parallel A/AAAA lookups
//! merged into one address list. A resolution failure is logged and simply
//! yields no extra patterns — the bare hostname alone still reaches the
//! rule engine.

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use std::net::IpAddr;
use tracing::{debug, instrument};

pub struct Resolver {
	inner: TokioResolver,
}

impl Resolver {
	pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Self {
		let mut builder = hickory_resolver::Resolver::builder_with_config(config, TokioConnectionProvider::default());
		*builder.options_mut() = opts;
		Self { inner: builder.build() }
	}

	pub fn from_system_config() -> Result<Self, hickory_resolver::ResolveError> {
		let inner = hickory_resolver::Resolver::builder_tokio()?.build();
		Ok(Self { inner })
	}

	/// Issues A and AAAA lookups concurrently and merges the results,
	/// preserving `[v4...,v6...]` order. DNS failure is not fatal; an empty
	/// vec is returned and the caller still has the bare hostname to match
	/// against (§4.7 step 3).
	#[instrument(skip(self))]
	pub async fn resolve_both(&self, host: &str) -> Vec<IpAddr> {
		let (v4, v6) = tokio::join!(self.inner.ipv4_lookup(host), self.inner.ipv6_lookup(host));

		let mut addrs = Vec::new();
		match v4 {
			Ok(lookup) => addrs.extend(lookup.iter().map(|r| IpAddr::V4(r.0))),
			Err(err) => debug!(%host, error = %err, "A lookup failed"),
		}
		match v6 {
			Ok(lookup) => addrs.extend(lookup.iter().map(|r| IpAddr::V6(r.0))),
			Err(err) => debug!(%host, error = %err, "AAAA lookup failed"),
		}
		addrs
	}
}
