//! The rule engine (§4.2): ordered matching over a profile's rule list,
//! external `DOMAIN-SET`/`RULE-SET` resource hydration, and the LRU
//! pattern → rule cache sitting in front of it.

pub mod external;

use crate::geoip::SharedGeoIp;
use crate::profile::{Profile, Rule, RuleKind};
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::instrument;

pub use external::{ExternalResource, ExternalResourceStore};

/// Evaluates `rule.kind` against one resolved pattern (a hostname or an IP
/// literal rendered as a string — see [`crate::buf::TargetAddress::host_pattern`]).
/// Boxed because `RULE-SET` recurses into sub-rules through an async call.
fn matches_kind<'a>(
	kind: &'a RuleKind,
	pattern: &'a str,
	geoip: &'a SharedGeoIp,
	external: &'a ExternalResourceStore,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
	Box::pin(async move {
		match kind {
			RuleKind::Domain { expr } => expr == pattern,
			RuleKind::DomainSuffix { expr } => domain_suffix_matches(expr, pattern),
			RuleKind::DomainKeyword { expr } => pattern.contains(expr.as_str()),
			RuleKind::DomainSet { url } => external.domain_set(url).await.iter().any(|d| domain_suffix_matches(d, pattern)),
			RuleKind::RuleSet { url } => {
				let mut matched = false;
				for sub in external.rule_set(url).await {
					if matches_kind(&sub, pattern, geoip, external).await {
						matched = true;
						break;
					}
				}
				matched
			},
			RuleKind::GeoIp { iso_code } => pattern
				.parse::<IpAddr>()
				.ok()
				.and_then(|ip| geoip.lookup(ip))
				.is_some_and(|code| code.eq_ignore_ascii_case(iso_code)),
			RuleKind::Final => true,
		}
	})
}

/// `pattern == e` or `"." + pattern` ends with `e` (§4.2). Matches
/// `apple.com` against both `apple.com` and `a.apple.com`, but not
/// `xapple.com`.
fn domain_suffix_matches(suffix: &str, pattern: &str) -> bool {
	pattern == suffix || pattern.ends_with(&format!(".{suffix}"))
}

/// Scans `profile.rules` in order against every `pattern`, remembering the
/// first `FINAL` seen but not short-circuiting on it, per §4.2 "Ordering".
#[instrument(skip(profile, geoip, external, patterns), fields(patterns = patterns.len()))]
async fn evaluate<'a>(profile: &'a Profile, patterns: &[String], geoip: &SharedGeoIp, external: &ExternalResourceStore) -> Option<&'a Rule> {
	let mut final_rule = None;
	for rule in &profile.rules {
		if rule.disabled {
			continue;
		}
		if matches!(rule.kind, RuleKind::Final) {
			final_rule.get_or_insert(rule);
			continue;
		}
		let mut hit = false;
		for pattern in patterns {
			if matches_kind(&rule.kind, pattern, geoip, external).await {
				hit = true;
				break;
			}
		}
		if hit {
			return Some(rule);
		}
	}
	final_rule
}

/// Front-end over [`evaluate`]: an LRU cache keyed by each pattern tried,
/// capacity from `BasicSettings::rule_cache_size` (default 100, §3
/// "Lifecycle"). A cache hit on any pattern short-circuits the scan.
pub struct RuleEngine {
	profile: std::sync::Arc<Profile>,
	geoip: SharedGeoIp,
	external: ExternalResourceStore,
	cache: Mutex<LruCache<String, usize>>,
}

impl RuleEngine {
	pub fn new(profile: std::sync::Arc<Profile>, geoip: SharedGeoIp) -> Self {
		let capacity = NonZeroUsize::new(profile.basic.rule_cache_size.max(1)).expect("non-zero by construction");
		Self {
			profile,
			geoip,
			external: ExternalResourceStore::new(),
			cache: Mutex::new(LruCache::new(capacity)),
		}
	}

	/// Resolves `patterns` to a single rule, consulting the LRU cache first
	/// (§4.2 "LRU cache"). Returns `None` only if the profile has no `FINAL`
	/// rule, which [`Profile::check_final_and_duplicates`] should have
	/// already ruled out for any profile reaching the dispatcher.
	#[instrument(skip(self, patterns), fields(patterns = patterns.len()))]
	pub async fn resolve(&self, patterns: &[String]) -> Option<&Rule> {
		{
			let mut cache = self.cache.lock().expect("rule cache lock poisoned");
			for pattern in patterns {
				if let Some(&idx) = cache.get(pattern) {
					return self.profile.rules.get(idx);
				}
			}
		}

		let chosen = evaluate(&self.profile, patterns, &self.geoip, &self.external).await?;
		let idx = self.profile.rules.iter().position(|r| std::ptr::eq(r, chosen))?;

		let mut cache = self.cache.lock().expect("rule cache lock poisoned");
		for pattern in patterns {
			cache.put(pattern.clone(), idx);
		}
		self.profile.rules.get(idx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::geoip;
	use crate::profile::{BasicSettings, MitMSettings, Policy, PolicyKind};
	use std::sync::Arc;

	fn rule(kind: RuleKind, policy: &str) -> Rule {
		Rule {
			kind,
			policy: policy.to_string(),
			disabled: false,
		}
	}

	fn profile_with(rules: Vec<Rule>) -> Arc<Profile> {
		Arc::new(
			Profile {
				version: "1".into(),
				basic: BasicSettings::default(),
				mitm: MitMSettings::default(),
				rules,
				policies: vec![
					Policy { name: "DIRECT".into(), kind: PolicyKind::Direct },
					Policy { name: "REJECT".into(), kind: PolicyKind::Reject },
				],
				policy_groups: vec![],
			}
			.fill_builtins(),
		)
	}

	#[test]
	fn domain_suffix_excludes_prefix_collision() {
		assert!(domain_suffix_matches("apple.com", "apple.com"));
		assert!(domain_suffix_matches("apple.com", "a.apple.com"));
		assert!(!domain_suffix_matches("apple.com", "xapple.com"));
	}

	#[tokio::test]
	async fn first_matching_rule_wins_and_final_is_fallback() {
		let profile = profile_with(vec![
			rule(RuleKind::DomainSuffix { expr: "apple.com".into() }, "REJECT"),
			rule(RuleKind::Final, "DIRECT"),
		]);
		let engine = RuleEngine::new(profile, geoip::null());

		let chosen = engine.resolve(&["a.apple.com".to_string()]).await.unwrap();
		assert_eq!(chosen.policy, "REJECT");

		let chosen = engine.resolve(&["example.com".to_string()]).await.unwrap();
		assert_eq!(chosen.policy, "DIRECT");
	}

	#[tokio::test]
	async fn disabled_rule_never_matches() {
		let mut disabled = rule(RuleKind::Domain { expr: "example.com".into() }, "REJECT");
		disabled.disabled = true;
		let profile = profile_with(vec![disabled, rule(RuleKind::Final, "DIRECT")]);
		let engine = RuleEngine::new(profile, geoip::null());

		let chosen = engine.resolve(&["example.com".to_string()]).await.unwrap();
		assert_eq!(chosen.policy, "DIRECT");
	}

	#[tokio::test]
	async fn cache_hit_short_circuits_scan() {
		let profile = profile_with(vec![
			rule(RuleKind::Domain { expr: "example.com".into() }, "REJECT"),
			rule(RuleKind::Final, "DIRECT"),
		]);
		let engine = RuleEngine::new(profile, geoip::null());

		let first = engine.resolve(&["example.com".to_string()]).await.unwrap().policy.clone();
		let second = engine.resolve(&["example.com".to_string()]).await.unwrap().policy.clone();
		assert_eq!(first, second);
	}
}
