//! GeoIP lookups used by the `GEOIP` rule kind (§4.2, §6.6). Wrapped behind
//! a small trait so the rule engine and its tests don't depend on an actual
//! MaxMind database being present on disk.

use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

pub trait GeoIpLookup: Send + Sync {
	/// The ISO 3166-1 alpha-2 country code for `ip`, if the database has one.
	fn lookup(&self, ip: IpAddr) -> Option<String>;
}

pub struct MaxMindGeoIp {
	reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindGeoIp {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, maxminddb::MaxMindDBError> {
		let reader = maxminddb::Reader::open_readfile(path)?;
		Ok(Self { reader })
	}
}

impl GeoIpLookup for MaxMindGeoIp {
	fn lookup(&self, ip: IpAddr) -> Option<String> {
		let city: geoip2::Country = self.reader.lookup(ip).ok()?;
		city.country?.iso_code.map(str::to_string)
	}
}

/// No database configured: every lookup misses. Used when the profile
/// doesn't reference `GEOIP` rules, so startup never requires a database.
pub struct NullGeoIp;

impl GeoIpLookup for NullGeoIp {
	fn lookup(&self, _ip: IpAddr) -> Option<String> {
		None
	}
}

pub type SharedGeoIp = Arc<dyn GeoIpLookup>;

pub fn null() -> SharedGeoIp {
	Arc::new(NullGeoIp)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_lookup_always_misses() {
		let geoip = null();
		assert_eq!(geoip.lookup("1.1.1.1".parse().unwrap()), None);
	}

	struct FakeGeoIp;
	impl GeoIpLookup for FakeGeoIp {
		fn lookup(&self, ip: IpAddr) -> Option<String> {
			if ip.is_loopback() {
				Some("US".to_string())
			} else {
				None
			}
		}
	}

	#[test]
	fn fake_lookup_used_through_trait_object() {
		let geoip: SharedGeoIp = Arc::new(FakeGeoIp);
		assert_eq!(geoip.lookup("127.0.0.1".parse().unwrap()), Some("US".to_string()));
	}
}
