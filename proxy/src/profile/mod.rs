//! The typed profile: basic settings, MitM settings, rules, policies and
//! policy groups (§3). Parsing/emitting the INI-like text form lives in
//! [`serializer`]; this module only holds the validated, in-memory shape.

pub mod serializer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ConfigError;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const REJECT_TINYGIF: &str = "REJECT-TINYGIF";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
	pub version: String,
	pub basic: BasicSettings,
	pub mitm: MitMSettings,
	pub rules: Vec<Rule>,
	pub policies: Vec<Policy>,
	pub policy_groups: Vec<PolicyGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Verbose,
	Notify,
	Warning,
}

impl Default for LogLevel {
	fn default() -> Self {
		LogLevel::Notify
	}
}

impl LogLevel {
	pub fn to_tracing(self) -> tracing::Level {
		match self {
			LogLevel::Verbose => tracing::Level::DEBUG,
			LogLevel::Notify => tracing::Level::INFO,
			LogLevel::Warning => tracing::Level::WARN,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BasicSettings {
	#[serde(default)]
	pub log_level: LogLevel,
	#[serde(default)]
	pub dns_servers: Vec<String>,
	#[serde(default)]
	pub exceptions: Vec<String>,
	#[serde(default)]
	pub http_listen_address: Option<String>,
	#[serde(default)]
	pub http_listen_port: Option<u16>,
	#[serde(default)]
	pub socks_listen_address: Option<String>,
	#[serde(default)]
	pub socks_listen_port: Option<u16>,
	#[serde(default)]
	pub exclude_simple_hostnames: bool,
	/// Rule-match LRU cache capacity; default 100 per §3 "Lifecycle".
	#[serde(default = "default_rule_cache_size")]
	pub rule_cache_size: usize,
}

fn default_rule_cache_size() -> usize {
	100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MitMSettings {
	#[serde(default)]
	pub skip_certificate_verification: bool,
	#[serde(default)]
	pub hostnames: Vec<String>,
	#[serde(default)]
	pub ca_passphrase: Option<String>,
	/// base64-encoded PKCS#12 bundle.
	#[serde(default)]
	pub ca_p12: Option<String>,
}

impl MitMSettings {
	pub fn enabled(&self) -> bool {
		!self.hostnames.is_empty()
	}

	/// Wildcard-aware hostname match (`*.example.com` matches
	/// `a.example.com` but not `example.com`).
	pub fn matches_hostname(&self, sni: &str) -> bool {
		self
			.hostnames
			.iter()
			.any(|pattern| hostname_pattern_matches(pattern, sni))
	}
}

pub fn hostname_pattern_matches(pattern: &str, candidate: &str) -> bool {
	match pattern.strip_prefix("*.") {
		Some(suffix) => candidate.ends_with(suffix) && candidate.len() > suffix.len() && candidate.as_bytes()[candidate.len() - suffix.len() - 1] == b'.',
		None => pattern.eq_ignore_ascii_case(candidate),
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
	pub kind: RuleKind,
	pub policy: String,
	#[serde(default)]
	pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RuleKind {
	Domain { expr: String },
	DomainSuffix { expr: String },
	DomainKeyword { expr: String },
	DomainSet { url: String },
	RuleSet { url: String },
	GeoIp { iso_code: String },
	Final,
}

impl RuleKind {
	pub fn external_url(&self) -> Option<&str> {
		match self {
			RuleKind::DomainSet { url } | RuleKind::RuleSet { url } => Some(url),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
	pub name: String,
	pub kind: PolicyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PolicyKind {
	Direct,
	Reject,
	RejectTinyGif,
	Proxy(ProxyConfig),
}

impl PolicyKind {
	pub fn builtin_type_name(&self) -> Option<&'static str> {
		match self {
			PolicyKind::Direct => Some("direct"),
			PolicyKind::Reject => Some("reject"),
			PolicyKind::RejectTinyGif => Some("reject-tinygif"),
			PolicyKind::Proxy(_) => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
	Http,
	Socks5,
	Ss,
	Vmess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShadowsocksAlgorithm {
	Aes128Gcm,
	Aes192Gcm,
	Aes256Gcm,
	Chacha20Poly1305,
	Xchacha20Poly1305,
}

impl ShadowsocksAlgorithm {
	pub fn key_len(self) -> usize {
		match self {
			ShadowsocksAlgorithm::Aes128Gcm => 16,
			ShadowsocksAlgorithm::Aes192Gcm => 24,
			ShadowsocksAlgorithm::Aes256Gcm => 32,
			ShadowsocksAlgorithm::Chacha20Poly1305 => 32,
			ShadowsocksAlgorithm::Xchacha20Poly1305 => 32,
		}
	}

	pub fn salt_len(self) -> usize {
		match self {
			ShadowsocksAlgorithm::Xchacha20Poly1305 => 32,
			_ => self.key_len(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
	pub server_host: String,
	pub server_port: u16,
	pub protocol: Option<ProxyProtocol>,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password_ref: Option<String>,
	#[serde(default)]
	pub authenticate: bool,
	#[serde(default)]
	pub prefer_http_tunnel: bool,
	#[serde(default)]
	pub over_tls: bool,
	#[serde(default)]
	pub over_websocket: bool,
	#[serde(default)]
	pub websocket_path: Option<String>,
	#[serde(default)]
	pub skip_cert_verify: bool,
	#[serde(default)]
	pub sni: Option<String>,
	#[serde(default)]
	pub cert_pin: Option<String>,
	#[serde(default)]
	pub ss_algorithm: Option<ShadowsocksAlgorithm>,
}

impl ProxyConfig {
	pub fn tls_server_name(&self) -> &str {
		self.sni.as_deref().unwrap_or(&self.server_host)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyGroup {
	pub name: String,
	pub policies: Vec<String>,
}

impl PolicyGroup {
	/// The currently-selected member: the first entry (§3 "PolicyGroup").
	pub fn selected(&self) -> Option<&str> {
		self.policies.first().map(String::as_str)
	}
}

impl Profile {
	/// Adds the three built-in policies when the profile doesn't already
	/// declare them (§4.1 "Builtin policies ... are synthesized if
	/// absent").
	pub fn fill_builtins(mut self) -> Self {
		for (name, kind) in [
			(DIRECT, PolicyKind::Direct),
			(REJECT, PolicyKind::Reject),
			(REJECT_TINYGIF, PolicyKind::RejectTinyGif),
		] {
			if !self.policies.iter().any(|p| p.name == name) {
				self.policies.push(Policy {
					name: name.to_string(),
					kind,
				});
			}
		}
		self
	}

	/// Unique policy names and exactly one `FINAL` rule. Does not check
	/// that every rule/group reference resolves — callers with access to
	/// source line numbers (the serializer) do that themselves so the
	/// error carries an accurate line.
	pub fn check_final_and_duplicates(&self) -> Result<(), ConfigError> {
		let mut seen = HashMap::new();
		for p in &self.policies {
			if seen.insert(p.name.clone(), ()).is_some() {
				return Err(ConfigError::InvalidFile {
					line: 0,
					description: format!("duplicate policy name {:?}", p.name),
				});
			}
		}

		let final_count = self.rules.iter().filter(|r| matches!(r.kind, RuleKind::Final)).count();
		if final_count != 1 {
			return Err(ConfigError::InvalidFile {
				line: 0,
				description: format!("profile must have exactly one FINAL rule, found {final_count}"),
			});
		}
		Ok(())
	}

	/// True if `name` resolves to a policy or a policy group.
	pub fn resolves(&self, name: &str) -> bool {
		self.policies.iter().any(|p| p.name == name) || self.policy_groups.iter().any(|g| g.name == name)
	}

	/// Checks every rule's `policy` and every policy-group member
	/// resolves, reporting `line: 0` for each (callers with real line
	/// numbers should use [`Profile::resolves`] directly instead).
	fn check_all_references(&self) -> Result<(), ConfigError> {
		for r in &self.rules {
			if !self.resolves(&r.policy) {
				return Err(ConfigError::UnknownPolicy {
					line: 0,
					name: r.policy.clone(),
				});
			}
		}
		for g in &self.policy_groups {
			for member in &g.policies {
				if !self.resolves(member) {
					return Err(ConfigError::UnknownPolicy {
						line: 0,
						name: member.clone(),
					});
				}
			}
		}
		Ok(())
	}

	/// Convenience composition of [`Profile::fill_builtins`],
	/// [`Profile::check_final_and_duplicates`] and reference checking, for
	/// callers (tests, programmatic construction) that don't have source
	/// line numbers to report.
	pub fn validate_and_fill_builtins(self) -> Result<Self, ConfigError> {
		let profile = self.fill_builtins();
		profile.check_final_and_duplicates()?;
		profile.check_all_references()?;
		Ok(profile)
	}

	pub fn policy_by_name(&self, name: &str) -> Option<&Policy> {
		self.policies.iter().find(|p| p.name == name)
	}

	pub fn policy_group_by_name(&self, name: &str) -> Option<&PolicyGroup> {
		self.policy_groups.iter().find(|g| g.name == name)
	}

	/// Resolves `name` to a concrete policy, following one level of
	/// policy-group indirection (§4.7 step 5).
	pub fn resolve_policy(&self, name: &str) -> Option<&Policy> {
		if let Some(policy) = self.policy_by_name(name) {
			return Some(policy);
		}
		let group = self.policy_group_by_name(name)?;
		let selected = group.selected()?;
		self.policy_by_name(selected)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn minimal_profile() -> Profile {
		Profile {
			version: "1.0".into(),
			basic: BasicSettings::default(),
			mitm: MitMSettings::default(),
			rules: vec![Rule {
				kind: RuleKind::Final,
				policy: DIRECT.into(),
				disabled: false,
			}],
			policies: vec![],
			policy_groups: vec![],
		}
	}

	#[test]
	fn fills_builtin_policies() {
		let profile = minimal_profile().validate_and_fill_builtins().unwrap();
		assert!(profile.policy_by_name(DIRECT).is_some());
		assert!(profile.policy_by_name(REJECT).is_some());
		assert!(profile.policy_by_name(REJECT_TINYGIF).is_some());
	}

	#[test]
	fn rejects_missing_final() {
		let mut profile = minimal_profile();
		profile.rules.clear();
		assert!(profile.validate_and_fill_builtins().is_err());
	}

	#[test]
	fn rejects_duplicate_final() {
		let mut profile = minimal_profile();
		profile.rules.push(Rule {
			kind: RuleKind::Final,
			policy: DIRECT.into(),
			disabled: false,
		});
		assert!(profile.validate_and_fill_builtins().is_err());
	}

	#[test]
	fn rejects_unknown_policy_reference() {
		let mut profile = minimal_profile();
		profile.rules.insert(
			0,
			Rule {
				kind: RuleKind::Domain { expr: "example.com".into() },
				policy: "NOPE".into(),
				disabled: false,
			},
		);
		assert!(profile.validate_and_fill_builtins().is_err());
	}

	#[test]
	fn wildcard_mitm_hostname_matches_subdomain_not_apex() {
		let mitm = MitMSettings {
			hostnames: vec!["*.example.com".into()],
			..Default::default()
		};
		assert!(mitm.matches_hostname("a.example.com"));
		assert!(!mitm.matches_hostname("example.com"));
		assert!(!mitm.matches_hostname("evilexample.com"));
	}
}
