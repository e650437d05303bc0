//! Lazy hydration of `DOMAIN-SET`/`RULE-SET` rule bodies (§4.2). Each
//! referenced URL is fetched at most once per process and memoized; a
//! failed fetch is treated as an empty resource rather than a fatal error,
//! matching the profile's "external resource" being best-effort.

use crate::profile::RuleKind;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalResource {
	Domains(Vec<String>),
	Rules(Vec<RuleKind>),
}

pub struct ExternalResourceStore {
	client: reqwest::Client,
	cache: Mutex<HashMap<String, ExternalResource>>,
}

impl ExternalResourceStore {
	pub fn new() -> Self {
		Self {
			client: reqwest::Client::new(),
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub async fn domain_set(&self, url: &str) -> Vec<String> {
		match self.get_or_fetch(url, ExternalResource::Domains(Vec::new())).await {
			ExternalResource::Domains(domains) => domains,
			ExternalResource::Rules(_) => Vec::new(),
		}
	}

	pub async fn rule_set(&self, url: &str) -> Vec<RuleKind> {
		match self.get_or_fetch(url, ExternalResource::Rules(Vec::new())).await {
			ExternalResource::Rules(rules) => rules,
			ExternalResource::Domains(_) => Vec::new(),
		}
	}

	async fn get_or_fetch(&self, url: &str, empty: ExternalResource) -> ExternalResource {
		{
			let cache = self.cache.lock().await;
			if let Some(cached) = cache.get(url) {
				return cached.clone();
			}
		}

		let parsed = match self.fetch(url).await {
			Ok(body) => match &empty {
				ExternalResource::Domains(_) => ExternalResource::Domains(parse_domain_lines(&body)),
				ExternalResource::Rules(_) => ExternalResource::Rules(parse_rule_lines(&body)),
			},
			Err(err) => {
				warn!(%url, error = %err, "failed to fetch external rule resource, treating as empty");
				empty
			},
		};

		self.cache.lock().await.insert(url.to_string(), parsed.clone());
		parsed
	}

	async fn fetch(&self, url: &str) -> Result<String, reqwest::Error> {
		self.client.get(url).send().await?.error_for_status()?.text().await
	}
}

fn is_skippable(line: &str) -> bool {
	line.is_empty() || line.starts_with('#') || line.starts_with(';')
}

fn parse_domain_lines(body: &str) -> Vec<String> {
	body.lines().map(str::trim).filter(|l| !is_skippable(l)).map(str::to_string).collect()
}

/// Parses one `DOMAIN,<expr>[,<policy>]`-style line into just its
/// `RuleKind`; the trailing policy field (if present) is irrelevant to
/// matching a `RULE-SET` sub-rule.
fn parse_rule_line_kind(line: &str) -> Option<RuleKind> {
	let mut parts = line.split(',').map(str::trim);
	let kind = parts.next()?.to_uppercase();
	match kind.as_str() {
		"DOMAIN" => Some(RuleKind::Domain { expr: parts.next()?.to_string() }),
		"DOMAIN-SUFFIX" => Some(RuleKind::DomainSuffix { expr: parts.next()?.to_string() }),
		"DOMAIN-KEYWORD" => Some(RuleKind::DomainKeyword { expr: parts.next()?.to_string() }),
		"GEOIP" => Some(RuleKind::GeoIp { iso_code: parts.next()?.to_uppercase() }),
		_ => None,
	}
}

fn parse_rule_lines(body: &str) -> Vec<RuleKind> {
	body
		.lines()
		.map(str::trim)
		.filter(|l| !is_skippable(l))
		.filter_map(parse_rule_line_kind)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_domain_lines_skipping_comments() {
		let body = "example.com\n# comment\n; also comment\n\napple.com\n";
		assert_eq!(parse_domain_lines(body), vec!["example.com".to_string(), "apple.com".to_string()]);
	}

	#[test]
	fn parses_rule_set_lines() {
		let body = "DOMAIN-SUFFIX,apple.com,DIRECT\nGEOIP,US,DIRECT\n";
		let rules = parse_rule_lines(body);
		assert_eq!(rules, vec![
			RuleKind::DomainSuffix { expr: "apple.com".into() },
			RuleKind::GeoIp { iso_code: "US".into() },
		]);
	}
}
