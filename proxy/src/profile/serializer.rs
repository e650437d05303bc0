//! The INI-like text profile format (§4.1): parses section-delimited
//! `key = value` lines into a [`Profile`], and emits a canonical form back.

use super::{
	BasicSettings, LogLevel, MitMSettings, Policy, PolicyGroup, PolicyKind, Profile, ProxyConfig,
	ProxyProtocol, Rule, RuleKind, ShadowsocksAlgorithm,
};
use crate::error::{ConfigError, RuleParseError};
use std::collections::HashMap;

const LIST_KEYS: &[&str] = &["dns-servers", "exceptions", "hostnames"];

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	String(String),
	Number(i64),
	Bool(bool),
	List(Vec<Value>),
}

impl Value {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_u16(&self) -> Option<u16> {
		match self {
			Value::Number(n) => u16::try_from(*n).ok(),
			_ => None,
		}
	}

	pub fn as_string_list(&self) -> Vec<String> {
		match self {
			Value::List(items) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
			Value::String(s) => vec![s.clone()],
			_ => vec![],
		}
	}
}

fn typed_scalar(key: &str, raw: &str) -> Value {
	if key.ends_with("port") {
		if let Ok(n) = raw.parse::<i64>() {
			return Value::Number(n);
		}
	}
	match raw {
		"true" => Value::Bool(true),
		"false" => Value::Bool(false),
		_ => Value::String(raw.to_string()),
	}
}

fn typed_value(key: &str, raw: &str) -> Value {
	if LIST_KEYS.contains(&key) {
		Value::List(raw.split(',').map(|part| typed_scalar(key, part.trim())).collect())
	} else {
		typed_scalar(key, raw)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
	General,
	MitM,
	Policies,
	PolicyGroup,
	Rule,
}

fn section_for_header(header: &str) -> Option<Section> {
	match header {
		"General" => Some(Section::General),
		"MitM" => Some(Section::MitM),
		"Policies" => Some(Section::Policies),
		"Policy Group" => Some(Section::PolicyGroup),
		"Rule" => Some(Section::Rule),
		_ => None,
	}
}

fn header_for_section(section: Section) -> &'static str {
	match section {
		Section::General => "General",
		Section::MitM => "MitM",
		Section::Policies => "Policies",
		Section::PolicyGroup => "Policy Group",
		Section::Rule => "Rule",
	}
}

/// Table-driven camelCase (JSON intermediate representation) <-> kebab-case
/// (wire) key mapping, plus the section-header aliases named in §4.1.
const SECTION_ALIASES: &[(&str, &str)] = &[
	("basicSettings", "General"),
	("manInTheMiddleSettings", "MitM"),
	("policies", "Policies"),
	("policyGroups", "Policy Group"),
	("routingRules", "Rule"),
];

pub fn json_field_for_section(header: &str) -> Option<&'static str> {
	SECTION_ALIASES.iter().find(|(_, h)| *h == header).map(|(j, _)| *j)
}

pub fn section_for_json_field(field: &str) -> Option<&'static str> {
	SECTION_ALIASES.iter().find(|(j, _)| *j == field).map(|(_, h)| *h)
}

pub fn kebab_to_camel(key: &str) -> String {
	let mut out = String::with_capacity(key.len());
	let mut upper_next = false;
	for ch in key.chars() {
		if ch == '-' {
			upper_next = true;
			continue;
		}
		if upper_next {
			out.extend(ch.to_uppercase());
			upper_next = false;
		} else {
			out.push(ch);
		}
	}
	out
}

pub fn camel_to_kebab(key: &str) -> String {
	let mut out = String::with_capacity(key.len() + 4);
	for ch in key.chars() {
		if ch.is_uppercase() {
			out.push('-');
			out.extend(ch.to_lowercase());
		} else {
			out.push(ch);
		}
	}
	out
}

fn split_line(line: &str, line_no: usize) -> Result<(String, String), ConfigError> {
	let (k, v) = line.split_once('=').ok_or_else(|| ConfigError::InvalidFile {
		line: line_no,
		description: format!("expected key = value, got {line:?}"),
	})?;
	Ok((k.trim().to_string(), v.trim().to_string()))
}

struct RawSections {
	general: HashMap<String, Value>,
	mitm: HashMap<String, Value>,
	policies: Vec<(usize, String, String)>,
	policy_groups: Vec<(usize, String, String)>,
	rules: Vec<(usize, String)>,
}

fn scan(text: &str) -> Result<RawSections, ConfigError> {
	let mut lines = text.lines().enumerate();
	let (_, first) = lines.next().ok_or_else(|| ConfigError::InvalidFile {
		line: 1,
		description: "empty file".into(),
	})?;
	let first = first.trim();
	let version_prefix = "profile-tools-version:";
	if !first.starts_with(version_prefix) {
		return Err(ConfigError::InvalidFile {
			line: 1,
			description: "first line must start with 'profile-tools-version:'".into(),
		});
	}
	if first[version_prefix.len()..].trim().is_empty() {
		return Err(ConfigError::InvalidFile {
			line: 1,
			description: "missing version token".into(),
		});
	}

	let mut section: Option<Section> = None;
	let mut saw_any_header = false;
	let mut general = HashMap::new();
	let mut mitm = HashMap::new();
	let mut policies = Vec::new();
	let mut policy_groups = Vec::new();
	let mut rules = Vec::new();

	for (idx, raw) in lines {
		let line_no = idx + 1;
		let trimmed = raw.trim();

		if trimmed.starts_with('[') && trimmed.ends_with(']') {
			let header = &trimmed[1..trimmed.len() - 1];
			// Unknown sections are an opaque pass-through per §4.1; their
			// lines are simply skipped since nothing reads them.
			section = section_for_header(header);
			saw_any_header = true;
			continue;
		}

		let Some(current) = section else {
			if trimmed.is_empty() || trimmed.starts_with('#') || saw_any_header {
				continue;
			}
			return Err(ConfigError::InvalidFile {
				line: line_no,
				description: format!("content outside any section: {trimmed:?}"),
			});
		};

		match current {
			Section::General | Section::MitM => {
				if trimmed.is_empty() || trimmed.starts_with('#') {
					continue;
				}
				let (k, v) = split_line(trimmed, line_no)?;
				let value = typed_value(&k, &v);
				if current == Section::General {
					general.insert(k, value);
				} else {
					mitm.insert(k, value);
				}
			},
			Section::Policies => {
				if trimmed.is_empty() || trimmed.starts_with('#') {
					continue;
				}
				let (k, v) = split_line(trimmed, line_no)?;
				policies.push((line_no, k, v));
			},
			Section::PolicyGroup => {
				if trimmed.is_empty() || trimmed.starts_with('#') {
					continue;
				}
				let (k, v) = split_line(trimmed, line_no)?;
				policy_groups.push((line_no, k, v));
			},
			Section::Rule => {
				if trimmed.is_empty() {
					continue;
				}
				rules.push((line_no, trimmed.to_string()));
			},
		}
	}

	Ok(RawSections {
		general,
		mitm,
		policies,
		policy_groups,
		rules,
	})
}

fn build_basic_settings(kv: HashMap<String, Value>) -> BasicSettings {
	let mut settings = BasicSettings::default();
	if let Some(v) = kv.get("log-level").and_then(Value::as_str) {
		settings.log_level = match v {
			"verbose" => LogLevel::Verbose,
			"warning" => LogLevel::Warning,
			_ => LogLevel::Notify,
		};
	}
	if let Some(v) = kv.get("dns-servers") {
		settings.dns_servers = v.as_string_list();
	}
	if let Some(v) = kv.get("exceptions") {
		settings.exceptions = v.as_string_list();
	}
	if let Some(v) = kv.get("http-listen-address").and_then(Value::as_str) {
		settings.http_listen_address = Some(v.to_string());
	}
	if let Some(v) = kv.get("http-listen-port").and_then(Value::as_u16) {
		settings.http_listen_port = Some(v);
	}
	if let Some(v) = kv.get("socks-listen-address").and_then(Value::as_str) {
		settings.socks_listen_address = Some(v.to_string());
	}
	if let Some(v) = kv.get("socks-listen-port").and_then(Value::as_u16) {
		settings.socks_listen_port = Some(v);
	}
	if let Some(v) = kv.get("exclude-simple-hostnames").and_then(Value::as_bool) {
		settings.exclude_simple_hostnames = v;
	}
	if let Some(Value::Number(n)) = kv.get("rule-cache-size") {
		if let Ok(n) = usize::try_from(*n) {
			settings.rule_cache_size = n;
		}
	}
	settings
}

fn build_mitm_settings(kv: HashMap<String, Value>) -> MitMSettings {
	let mut settings = MitMSettings::default();
	if let Some(v) = kv.get("skip-certificate-verification").and_then(Value::as_bool) {
		settings.skip_certificate_verification = v;
	}
	if let Some(v) = kv.get("hostnames") {
		settings.hostnames = v.as_string_list();
	}
	if let Some(v) = kv.get("ca-passphrase").and_then(Value::as_str) {
		settings.ca_passphrase = Some(v.to_string());
	}
	if let Some(v) = kv.get("ca-p12").and_then(Value::as_str) {
		settings.ca_p12 = Some(v.to_string());
	}
	settings
}

const RESERVED_POLICIES: &[(&str, &str)] = &[
	(super::DIRECT, "direct"),
	(super::REJECT, "reject"),
	(super::REJECT_TINYGIF, "reject-tinygif"),
];

fn reserved_type_for(name: &str) -> Option<&'static str> {
	RESERVED_POLICIES
		.iter()
		.find(|(n, _)| n.eq_ignore_ascii_case(name))
		.map(|(_, t)| *t)
}

fn parse_policy_line(line_no: usize, name: &str, value: &str) -> Result<Policy, ConfigError> {
	let mut parts = value.split(',').map(str::trim);
	let ty = parts.next().ok_or_else(|| ConfigError::RuleParse(RuleParseError::MissingField("type".into())))?;
	let ty_lower = ty.to_lowercase();

	if let Some(reserved_ty) = reserved_type_for(name) {
		if !ty_lower.eq_ignore_ascii_case(reserved_ty) {
			return Err(ConfigError::InvalidFile {
				line: line_no,
				description: format!(
					"{name:?} is a builtin policy name and must have type {reserved_ty:?}, got {ty:?}"
				),
			});
		}
	}

	let kind = match ty_lower.as_str() {
		"direct" => PolicyKind::Direct,
		"reject" => PolicyKind::Reject,
		"reject-tinygif" => PolicyKind::RejectTinyGif,
		_ => {
			let protocol = match ty_lower.as_str() {
				"http" => ProxyProtocol::Http,
				"socks5" => ProxyProtocol::Socks5,
				"ss" => ProxyProtocol::Ss,
				"vmess" => ProxyProtocol::Vmess,
				other => return Err(ConfigError::RuleParse(RuleParseError::Unsupported(other.to_string()))),
			};
			PolicyKind::Proxy(build_proxy_config(protocol, parts)?)
		},
	};

	Ok(Policy {
		name: name.to_string(),
		kind,
	})
}

fn build_proxy_config<'a>(
	protocol: ProxyProtocol,
	pairs: impl Iterator<Item = &'a str>,
) -> Result<ProxyConfig, ConfigError> {
	let mut cfg = ProxyConfig {
		protocol: Some(protocol),
		..Default::default()
	};
	let mut server_host = None;
	let mut server_port = None;

	for pair in pairs {
		if pair.is_empty() {
			continue;
		}
		let (k, v) = pair.split_once('=').ok_or_else(|| {
			ConfigError::RuleParse(RuleParseError::MissingField(format!("malformed field {pair:?}")))
		})?;
		let (k, v) = (k.trim(), v.trim());
		match k {
			"server-host" => server_host = Some(v.to_string()),
			"server-port" => {
				server_port = Some(v.parse::<u16>().map_err(|_| {
					ConfigError::RuleParse(RuleParseError::WrongType {
						field: "server-port".into(),
						expected: "u16".into(),
						actual: v.into(),
					})
				})?)
			},
			"username" => {
				if protocol == ProxyProtocol::Vmess && uuid::Uuid::parse_str(v).is_err() {
					return Err(ConfigError::RuleParse(RuleParseError::WrongType {
						field: "username".into(),
						expected: "uuid".into(),
						actual: v.into(),
					}));
				}
				cfg.username = Some(v.to_string());
			},
			"password-ref" => cfg.password_ref = Some(v.to_string()),
			"authenticate" => cfg.authenticate = v == "true",
			"prefer-http-tunnel" => cfg.prefer_http_tunnel = v == "true",
			"over-tls" => cfg.over_tls = v == "true",
			"over-websocket" => cfg.over_websocket = v == "true",
			"websocket-path" => cfg.websocket_path = Some(v.to_string()),
			"skip-cert-verify" => cfg.skip_cert_verify = v == "true",
			"sni" => cfg.sni = Some(v.to_string()),
			"cert-pin" => cfg.cert_pin = Some(v.to_string()),
			"ss-algorithm" => {
				cfg.ss_algorithm = Some(match v {
					"aes-128-gcm" => ShadowsocksAlgorithm::Aes128Gcm,
					"aes-192-gcm" => ShadowsocksAlgorithm::Aes192Gcm,
					"aes-256-gcm" => ShadowsocksAlgorithm::Aes256Gcm,
					"chacha20-poly1305" => ShadowsocksAlgorithm::Chacha20Poly1305,
					"xchacha20-poly1305" => ShadowsocksAlgorithm::Xchacha20Poly1305,
					other => return Err(ConfigError::RuleParse(RuleParseError::Unsupported(other.to_string()))),
				});
			},
			other => {
				return Err(ConfigError::RuleParse(RuleParseError::Unsupported(other.to_string())));
			},
		}
	}

	cfg.server_host = server_host.ok_or_else(|| ConfigError::RuleParse(RuleParseError::MissingField("server-host".into())))?;
	cfg.server_port = server_port.ok_or_else(|| ConfigError::RuleParse(RuleParseError::MissingField("server-port".into())))?;
	Ok(cfg)
}

const KNOWN_GROUP_TYPES: &[&str] = &["select", "url-test", "fallback", "load-balance"];

fn parse_policy_group_line(name: &str, value: &str) -> Result<PolicyGroup, ConfigError> {
	let parts: Vec<&str> = value.split(',').map(str::trim).collect();
	let (ty, rest): (&str, &[&str]) = match parts.first() {
		Some(first) if KNOWN_GROUP_TYPES.contains(&first.to_lowercase().as_str()) => (first, &parts[1..]),
		_ => ("select", &parts[..]),
	};
	if !ty.eq_ignore_ascii_case("select") {
		return Err(ConfigError::RuleParse(RuleParseError::Unsupported(ty.to_string())));
	}
	let policies = rest
		.iter()
		.filter(|p| !p.is_empty() && !p.contains('='))
		.map(|p| p.to_string())
		.collect();
	Ok(PolicyGroup {
		name: name.to_string(),
		policies,
	})
}

fn looks_like_url(s: &str) -> bool {
	s.contains("://")
}

fn parse_rule_line(line_no: usize, raw: &str) -> Result<Rule, ConfigError> {
	let (disabled, body) = match raw.strip_prefix('#') {
		Some(rest) => (true, rest.trim()),
		None => (false, raw),
	};
	let parts: Vec<&str> = body.split(',').map(str::trim).collect();
	let ty = parts.first().copied().unwrap_or_default().to_uppercase();

	let kind = match ty.as_str() {
		"FINAL" => {
			if parts.len() < 2 {
				return Err(ConfigError::RuleParse(RuleParseError::MissingField("policy".into())));
			}
			return Ok(Rule {
				kind: RuleKind::Final,
				policy: parts[1].to_string(),
				disabled,
			});
		},
		"DOMAIN" | "DOMAIN-SUFFIX" | "DOMAIN-KEYWORD" => {
			if parts.len() < 3 {
				return Err(ConfigError::RuleParse(RuleParseError::MissingField("expr/policy".into())));
			}
			let expr = parts[1].to_string();
			match ty.as_str() {
				"DOMAIN" => RuleKind::Domain { expr },
				"DOMAIN-SUFFIX" => RuleKind::DomainSuffix { expr },
				_ => RuleKind::DomainKeyword { expr },
			}
		},
		"DOMAIN-SET" | "RULE-SET" => {
			if parts.len() < 3 {
				return Err(ConfigError::RuleParse(RuleParseError::MissingField("url/policy".into())));
			}
			if !looks_like_url(parts[1]) {
				return Err(ConfigError::RuleParse(RuleParseError::InvalidExternalUrl(parts[1].to_string())));
			}
			let url = parts[1].to_string();
			if ty == "DOMAIN-SET" {
				RuleKind::DomainSet { url }
			} else {
				RuleKind::RuleSet { url }
			}
		},
		"GEOIP" => {
			if parts.len() < 3 {
				return Err(ConfigError::RuleParse(RuleParseError::MissingField("iso-code/policy".into())));
			}
			RuleKind::GeoIp {
				iso_code: parts[1].to_uppercase(),
			}
		},
		other => return Err(ConfigError::RuleParse(RuleParseError::Unsupported(other.to_string()))),
	};

	let policy = parts.get(2).ok_or_else(|| ConfigError::RuleParse(RuleParseError::MissingField("policy".into())))?;

	Ok(Rule {
		kind,
		policy: policy.to_string(),
		disabled,
	})
}

/// Parses a full profile text. See §4.1 for the grammar and the failure
/// taxonomy this returns.
pub fn parse(text: &str) -> Result<Profile, ConfigError> {
	let first_line = text.lines().next().unwrap_or_default().trim();
	let version = first_line
		.strip_prefix("profile-tools-version:")
		.map(str::trim)
		.unwrap_or_default()
		.to_string();

	let raw = scan(text)?;

	let basic = build_basic_settings(raw.general);
	let mitm = build_mitm_settings(raw.mitm);

	let policies = raw
		.policies
		.iter()
		.map(|(line, name, value)| parse_policy_line(*line, name, value))
		.collect::<Result<Vec<_>, _>>()?;

	let policy_groups = raw
		.policy_groups
		.iter()
		.map(|(_, name, value)| parse_policy_group_line(name, value))
		.collect::<Result<Vec<_>, _>>()?;

	let rules_with_lines = raw
		.rules
		.iter()
		.map(|(line, text)| parse_rule_line(*line, text).map(|r| (*line, r)))
		.collect::<Result<Vec<_>, _>>()?;

	let profile = Profile {
		version,
		basic,
		mitm,
		rules: rules_with_lines.iter().map(|(_, r)| r.clone()).collect(),
		policies,
		policy_groups,
	}
	.fill_builtins();

	profile.check_final_and_duplicates()?;

	for (line, rule) in &rules_with_lines {
		if !profile.resolves(&rule.policy) {
			return Err(ConfigError::UnknownPolicy {
				line: *line,
				name: rule.policy.clone(),
			});
		}
	}
	for group in &profile.policy_groups {
		for member in &group.policies {
			if !profile.resolves(member) {
				// Policy-group cross references don't carry a dedicated
				// source line in `PolicyGroup`, so report the group's own
				// declaration line instead.
				let line = raw
					.policy_groups
					.iter()
					.find(|(_, name, _)| name == &group.name)
					.map(|(line, _, _)| *line)
					.unwrap_or(0);
				return Err(ConfigError::UnknownPolicy {
					line,
					name: member.clone(),
				});
			}
		}
	}

	Ok(profile)
}

/// Emits the canonical text form: version banner, fixed section order,
/// keys sorted lexicographically within `[General]`/`[MitM]`/`[Policies]`/
/// `[Policy Group]`. `[Rule]` lines keep their original order since rule
/// priority is meaningful.
pub fn emit(profile: &Profile) -> String {
	let mut out = String::new();
	out.push_str("profile-tools-version: ");
	out.push_str(&profile.version);
	out.push('\n');

	out.push_str(&format!("\n[{}]\n", header_for_section(Section::General)));
	emit_general(&mut out, &profile.basic);

	out.push_str(&format!("\n[{}]\n", header_for_section(Section::MitM)));
	emit_mitm(&mut out, &profile.mitm);

	out.push_str(&format!("\n[{}]\n", header_for_section(Section::Policies)));
	let mut sorted_policies: Vec<&Policy> = profile.policies.iter().collect();
	sorted_policies.sort_by(|a, b| a.name.cmp(&b.name));
	for p in sorted_policies {
		out.push_str(&format!("{} = {}\n", p.name, emit_policy_kind(&p.kind)));
	}

	out.push_str(&format!("\n[{}]\n", header_for_section(Section::PolicyGroup)));
	let mut sorted_groups: Vec<&PolicyGroup> = profile.policy_groups.iter().collect();
	sorted_groups.sort_by(|a, b| a.name.cmp(&b.name));
	for g in sorted_groups {
		out.push_str(&format!("{} = select, {}\n", g.name, g.policies.join(", ")));
	}

	out.push_str(&format!("\n[{}]\n", header_for_section(Section::Rule)));
	for r in &profile.rules {
		let prefix = if r.disabled { "#" } else { "" };
		out.push_str(&format!("{prefix}{}\n", emit_rule(r)));
	}

	out
}

fn emit_general(out: &mut String, basic: &BasicSettings) {
	let mut lines = Vec::new();
	lines.push(("dns-servers".to_string(), basic.dns_servers.join(", ")));
	lines.push(("exceptions".to_string(), basic.exceptions.join(", ")));
	lines.push((
		"exclude-simple-hostnames".to_string(),
		basic.exclude_simple_hostnames.to_string(),
	));
	if let Some(v) = &basic.http_listen_address {
		lines.push(("http-listen-address".to_string(), v.clone()));
	}
	if let Some(v) = basic.http_listen_port {
		lines.push(("http-listen-port".to_string(), v.to_string()));
	}
	lines.push((
		"log-level".to_string(),
		match basic.log_level {
			LogLevel::Verbose => "verbose",
			LogLevel::Notify => "notify",
			LogLevel::Warning => "warning",
		}
		.to_string(),
	));
	lines.push(("rule-cache-size".to_string(), basic.rule_cache_size.to_string()));
	if let Some(v) = &basic.socks_listen_address {
		lines.push(("socks-listen-address".to_string(), v.clone()));
	}
	if let Some(v) = basic.socks_listen_port {
		lines.push(("socks-listen-port".to_string(), v.to_string()));
	}
	lines.sort_by(|a, b| a.0.cmp(&b.0));
	for (k, v) in lines {
		out.push_str(&format!("{k} = {v}\n"));
	}
}

fn emit_mitm(out: &mut String, mitm: &MitMSettings) {
	let mut lines = Vec::new();
	if let Some(v) = &mitm.ca_p12 {
		lines.push(("ca-p12".to_string(), v.clone()));
	}
	if let Some(v) = &mitm.ca_passphrase {
		lines.push(("ca-passphrase".to_string(), v.clone()));
	}
	lines.push(("hostnames".to_string(), mitm.hostnames.join(", ")));
	lines.push((
		"skip-certificate-verification".to_string(),
		mitm.skip_certificate_verification.to_string(),
	));
	lines.sort_by(|a, b| a.0.cmp(&b.0));
	for (k, v) in lines {
		out.push_str(&format!("{k} = {v}\n"));
	}
}

fn emit_policy_kind(kind: &PolicyKind) -> String {
	match kind {
		PolicyKind::Direct => "direct".to_string(),
		PolicyKind::Reject => "reject".to_string(),
		PolicyKind::RejectTinyGif => "reject-tinygif".to_string(),
		PolicyKind::Proxy(cfg) => {
			let protocol = match cfg.protocol {
				Some(ProxyProtocol::Http) => "http",
				Some(ProxyProtocol::Socks5) => "socks5",
				Some(ProxyProtocol::Ss) => "ss",
				Some(ProxyProtocol::Vmess) => "vmess",
				None => "http",
			};
			let mut fields = vec![
				format!("server-host = {}", cfg.server_host),
				format!("server-port = {}", cfg.server_port),
			];
			if let Some(v) = &cfg.username {
				fields.push(format!("username = {v}"));
			}
			if let Some(v) = &cfg.password_ref {
				fields.push(format!("password-ref = {v}"));
			}
			if cfg.authenticate {
				fields.push("authenticate = true".to_string());
			}
			if cfg.prefer_http_tunnel {
				fields.push("prefer-http-tunnel = true".to_string());
			}
			if cfg.over_tls {
				fields.push("over-tls = true".to_string());
			}
			if cfg.over_websocket {
				fields.push("over-websocket = true".to_string());
			}
			if let Some(v) = &cfg.websocket_path {
				fields.push(format!("websocket-path = {v}"));
			}
			if cfg.skip_cert_verify {
				fields.push("skip-cert-verify = true".to_string());
			}
			if let Some(v) = &cfg.sni {
				fields.push(format!("sni = {v}"));
			}
			if let Some(v) = &cfg.cert_pin {
				fields.push(format!("cert-pin = {v}"));
			}
			if let Some(algorithm) = cfg.ss_algorithm {
				let algorithm = match algorithm {
					ShadowsocksAlgorithm::Aes128Gcm => "aes-128-gcm",
					ShadowsocksAlgorithm::Aes192Gcm => "aes-192-gcm",
					ShadowsocksAlgorithm::Aes256Gcm => "aes-256-gcm",
					ShadowsocksAlgorithm::Chacha20Poly1305 => "chacha20-poly1305",
					ShadowsocksAlgorithm::Xchacha20Poly1305 => "xchacha20-poly1305",
				};
				fields.push(format!("ss-algorithm = {algorithm}"));
			}
			format!("{protocol}, {}", fields.join(", "))
		},
	}
}

fn emit_rule(rule: &Rule) -> String {
	match &rule.kind {
		RuleKind::Domain { expr } => format!("DOMAIN,{expr},{}", rule.policy),
		RuleKind::DomainSuffix { expr } => format!("DOMAIN-SUFFIX,{expr},{}", rule.policy),
		RuleKind::DomainKeyword { expr } => format!("DOMAIN-KEYWORD,{expr},{}", rule.policy),
		RuleKind::DomainSet { url } => format!("DOMAIN-SET,{url},{}", rule.policy),
		RuleKind::RuleSet { url } => format!("RULE-SET,{url},{}", rule.policy),
		RuleKind::GeoIp { iso_code } => format!("GEOIP,{iso_code},{}", rule.policy),
		RuleKind::Final => format!("FINAL,{}", rule.policy),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = "profile-tools-version: 1\n\n[General]\nhttp-listen-address = 0.0.0.0\nhttp-listen-port = 6152\n\n[MitM]\nhostnames = *.example.com\n\n[Policies]\nProxy1 = ss, server-host = 1.2.3.4, server-port = 8388, ss-algorithm = aes-128-gcm\n\n[Policy Group]\nAuto = select, Proxy1, DIRECT\n\n[Rule]\nDOMAIN-SUFFIX,apple.com,REJECT\n#DOMAIN,disabled.example.com,DIRECT\nFINAL,DIRECT\n";

	#[test]
	fn parses_sample_profile() {
		let profile = parse(SAMPLE).unwrap();
		assert_eq!(profile.version, "1");
		assert_eq!(profile.basic.http_listen_port, Some(6152));
		assert!(profile.mitm.matches_hostname("a.example.com"));
		assert!(profile.policy_by_name("Proxy1").is_some());
		assert_eq!(profile.policy_groups[0].selected(), Some("Proxy1"));
		assert_eq!(profile.rules.len(), 3);
		assert!(profile.rules[1].disabled);
	}

	#[test]
	fn rejects_missing_version_banner() {
		let err = parse("[General]\n").unwrap_err();
		assert!(matches!(err, ConfigError::InvalidFile { line: 1, .. }));
	}

	#[test]
	fn rejects_unknown_policy_reference_with_line() {
		let text = "profile-tools-version: 1\n\n[Rule]\nFINAL,NOPE\n";
		let err = parse(text).unwrap_err();
		assert_eq!(err, ConfigError::UnknownPolicy { line: 4, name: "NOPE".into() });
	}

	#[test]
	fn rejects_reserved_name_with_mismatched_type() {
		let text = "profile-tools-version: 1\n\n[Policies]\nDIRECT = ss, server-host = 1.2.3.4, server-port = 80\n\n[Rule]\nFINAL,DIRECT\n";
		let err = parse(text).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidFile { .. }));
	}

	#[test]
	fn requires_vmess_username_to_be_uuid() {
		let text = "profile-tools-version: 1\n\n[Policies]\nP = vmess, server-host = h, server-port = 443, username = not-a-uuid\n\n[Rule]\nFINAL,DIRECT\n";
		let err = parse(text).unwrap_err();
		assert!(matches!(err, ConfigError::RuleParse(RuleParseError::WrongType { .. })));
	}

	#[test]
	fn emit_then_parse_round_trips() {
		let profile = parse(SAMPLE).unwrap();
		let emitted = emit(&profile);
		let reparsed = parse(&emitted).unwrap();
		assert_eq!(profile.basic, reparsed.basic);
		assert_eq!(profile.mitm, reparsed.mitm);
		assert_eq!(profile.rules, reparsed.rules);
	}

	#[test]
	fn kebab_camel_roundtrip() {
		assert_eq!(kebab_to_camel("http-listen-address"), "httpListenAddress");
		assert_eq!(camel_to_kebab("httpListenAddress"), "http-listen-address");
	}

	#[test]
	fn section_aliases_are_fixed() {
		assert_eq!(section_for_json_field("basicSettings"), Some("General"));
		assert_eq!(json_field_for_section("Rule"), Some("routingRules"));
	}
}
