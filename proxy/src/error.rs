//! Error taxonomy. Each domain gets its own closed `thiserror` enum instead
//! of one kitchen-sink error, matching how the teacher keeps small error
//! types per concern (`http::Error`, `outbound::openapi::ParseError`)
//! rather than a single catch-all.

use thiserror::Error;

/// Errors raised while parsing or validating a text profile (§4.1, §7
/// "Configuration").
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
	#[error("line {line}: {description}")]
	InvalidFile { line: usize, description: String },

	#[error("line {line}: unknown policy {name:?}")]
	UnknownPolicy { line: usize, name: String },

	#[error("rule parse error: {0}")]
	RuleParse(#[from] RuleParseError),

	#[error("data corrupted")]
	DataCorrupted,

	#[error("failed to load certificate: {0}")]
	FailedToLoadCertificate(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleParseError {
	#[error("missing field {0:?}")]
	MissingField(String),
	#[error("unsupported rule type {0:?}")]
	Unsupported(String),
	#[error("invalid external resource url {0:?}")]
	InvalidExternalUrl(String),
	#[error("wrong type for {field}: expected {expected}, got {actual}")]
	WrongType {
		field: String,
		expected: String,
		actual: String,
	},
}

/// Protocol-level errors (§7 "Protocol"). Each variant is closed and maps
/// directly onto a wire status where the inbound protocol has one (SOCKS5
/// reply codes, HTTP status lines).
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("unsupported protocol version")]
	UnsupportedProtocolVersion,
	#[error("invalid reserved byte")]
	InvalidReservedByte,
	#[error("invalid address type")]
	InvalidAddressType,
	#[error("authentication failed: {0}")]
	AuthenticationFailed(#[from] AuthFailure),
	#[error("reply failed: {0}")]
	ReplyFailed(#[from] ReplyFailure),
	#[error("unexpected read")]
	UnexpectedRead,
	#[error("rejected by rule")]
	RejectedByRule,
	#[error("unsupported destination for this policy")]
	Unsupported,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
	#[error("incorrect credentials")]
	IncorrectCredentials,
	#[error("no valid authentication method offered")]
	NoValidMethod,
	#[error("method not implemented")]
	MethodNotImplemented,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFailure {
	#[error("general SOCKS server failure")]
	GeneralFailure,
	#[error("connection not allowed by ruleset")]
	NotAllowed,
	#[error("network unreachable")]
	NetworkUnreachable,
	#[error("host unreachable")]
	HostUnreachable,
	#[error("connection refused")]
	ConnectionRefused,
	#[error("TTL expired")]
	TtlExpired,
	#[error("command not supported")]
	CommandUnsupported,
	#[error("address type not supported")]
	AddressTypeUnsupported,
	#[error("unassigned")]
	Unassigned,
}

impl ReplyFailure {
	/// The byte a SOCKS5 server writes back to the client for this failure
	/// (RFC 1928 §6).
	pub fn socks5_code(self) -> u8 {
		match self {
			ReplyFailure::GeneralFailure => 0x01,
			ReplyFailure::NotAllowed => 0x02,
			ReplyFailure::NetworkUnreachable => 0x03,
			ReplyFailure::HostUnreachable => 0x04,
			ReplyFailure::ConnectionRefused => 0x05,
			ReplyFailure::TtlExpired => 0x06,
			ReplyFailure::CommandUnsupported => 0x07,
			ReplyFailure::AddressTypeUnsupported => 0x08,
			ReplyFailure::Unassigned => 0x09,
		}
	}

	pub fn from_socks5_code(code: u8) -> Self {
		match code {
			0x01 => ReplyFailure::GeneralFailure,
			0x02 => ReplyFailure::NotAllowed,
			0x03 => ReplyFailure::NetworkUnreachable,
			0x04 => ReplyFailure::HostUnreachable,
			0x05 => ReplyFailure::ConnectionRefused,
			0x06 => ReplyFailure::TtlExpired,
			0x07 => ReplyFailure::CommandUnsupported,
			0x08 => ReplyFailure::AddressTypeUnsupported,
			_ => ReplyFailure::Unassigned,
		}
	}
}

/// Crypto errors (§7 "Crypto"). Fatal to the affected connection.
#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("incorrect key size")]
	IncorrectKeySize,
	#[error("payload too large")]
	PayloadTooLarge,
	#[error("invalid packet size")]
	InvalidPacketSize,
	#[error("AEAD seal/open failed")]
	Aead,
	#[error("invalid response verify code")]
	InvalidResponse,
}

/// Transport errors (§7 "Transport"). Fatal to the affected connection,
/// logged at `warning`.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("dns resolution failed for {0:?}")]
	DnsFailure(String),
	#[error("connect timed out after {0:?}")]
	ConnectTimeout(std::time::Duration),
	#[error("peer reset the connection")]
	PeerReset,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Shutdown-path errors (§7 "Shutdown").
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownError {
	#[error("connection pool has shut down")]
	ShutDown,
	#[error("outbound connect request timed out")]
	ConnectionRequestTimeout,
}

/// Top-level union, used only at call sites that must return a single
/// error type across domains (e.g. the dispatcher).
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Shutdown(#[from] ShutdownError),
}
