//! Relay Directory
//!
//! In-memory snapshot of the relay list: every WireGuard relay with its
//! resolved location and capabilities, the advertised port ranges and the
//! in-tunnel gateway addresses.
//!
//! The directory is built from the relay list document and never mutated
//! afterwards. A refresh builds a new directory and swaps it into the
//! [`SharedDirectory`]; selections already running keep the `Arc` they
//! were handed.

use crate::keys::PublicKey;
use crate::location::Location;
use crate::obfuscation::ObfuscationMethod;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Relay list document as served by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayListDocument {
    /// Locations keyed by "country-city" code (e.g. "se-got")
    pub locations: HashMap<String, ServerLocation>,
    pub wireguard: WireguardSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLocation {
    pub country: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardSection {
    pub ipv4_gateway: Ipv4Addr,
    #[serde(default)]
    pub ipv6_gateway: Option<Ipv6Addr>,
    /// Raw `[start, end]` pairs
    #[serde(default)]
    pub port_ranges: Vec<Vec<u16>>,
    #[serde(default)]
    pub shadowsocks_port_ranges: Vec<Vec<u16>>,
    #[serde(default)]
    pub relays: Vec<ServerRelay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRelay {
    pub hostname: String,
    /// Location key into [`RelayListDocument::locations`]
    pub location: String,
    pub active: bool,
    #[serde(default)]
    pub owned: bool,
    #[serde(default)]
    pub provider: String,
    pub weight: u64,
    pub ipv4_addr_in: Ipv4Addr,
    #[serde(default)]
    pub ipv6_addr_in: Option<Ipv6Addr>,
    pub public_key: PublicKey,
    #[serde(default = "default_true")]
    pub include_in_country: bool,
    #[serde(default)]
    pub daita: bool,
    #[serde(default)]
    pub shadowsocks_extra_addr_in: Option<Vec<IpAddr>>,
    #[serde(default)]
    pub features: Option<RelayFeatures>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFeatures {
    #[serde(default)]
    pub quic: Option<QuicFeature>,
    #[serde(default)]
    pub lwo: Option<LwoFeature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuicFeature {
    pub addr_in: Vec<IpAddr>,
    pub domain: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwoFeature {}

/// A relay with its resolved location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub hostname: String,
    pub location: Location,
    pub active: bool,
    pub owned: bool,
    pub provider: String,
    pub weight: u64,
    pub ipv4_addr_in: Ipv4Addr,
    pub ipv6_addr_in: Option<Ipv6Addr>,
    pub public_key: PublicKey,
    pub include_in_country: bool,
    pub daita: bool,
    /// Extra ingress addresses accepting shadowsocks on any port
    pub shadowsocks_extra_addr_in: Vec<IpAddr>,
    pub quic: Option<QuicFeature>,
    pub capabilities: BTreeSet<ObfuscationMethod>,
}

impl Relay {
    pub fn supports(&self, method: ObfuscationMethod) -> bool {
        self.capabilities.contains(&method)
    }

    pub fn has_shadowsocks_ingress(&self) -> bool {
        !self.shadowsocks_extra_addr_in.is_empty()
    }

    pub fn has_ipv6_shadowsocks_ingress(&self) -> bool {
        self.shadowsocks_extra_addr_in.iter().any(IpAddr::is_ipv6)
    }

    pub fn has_ipv6_quic_ingress(&self) -> bool {
        self.quic
            .as_ref()
            .is_some_and(|quic| quic.addr_in.iter().any(IpAddr::is_ipv6))
    }

    fn from_server_relay(relay: ServerRelay, locations: &HashMap<String, ServerLocation>) -> Option<Self> {
        let server_location = locations.get(&relay.location)?;
        let (country_code, city_code) = relay.location.split_once('-')?;
        if country_code.is_empty() || city_code.is_empty() {
            return None;
        }

        let location = Location {
            country: server_location.country.clone(),
            country_code: country_code.to_string(),
            city: server_location.city.clone(),
            city_code: city_code.to_string(),
            latitude: server_location.latitude,
            longitude: server_location.longitude,
        };

        let features = relay.features.unwrap_or_default();
        let mut capabilities = BTreeSet::from([
            ObfuscationMethod::Off,
            ObfuscationMethod::UdpOverTcp,
            ObfuscationMethod::Shadowsocks,
        ]);
        if features.quic.is_some() {
            capabilities.insert(ObfuscationMethod::Quic);
        }
        if features.lwo.is_some() {
            capabilities.insert(ObfuscationMethod::Lwo);
        }

        Some(Self {
            hostname: relay.hostname,
            location,
            active: relay.active,
            owned: relay.owned,
            provider: relay.provider,
            weight: relay.weight,
            ipv4_addr_in: relay.ipv4_addr_in,
            ipv6_addr_in: relay.ipv6_addr_in,
            public_key: relay.public_key,
            include_in_country: relay.include_in_country,
            daita: relay.daita,
            shadowsocks_extra_addr_in: relay.shadowsocks_extra_addr_in.unwrap_or_default(),
            quic: features.quic,
            capabilities,
        })
    }
}

/// Validated, non-overlapping port ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRanges(Vec<RangeInclusive<u16>>);

impl PortRanges {
    /// Parse raw `[start, end]` pairs.
    ///
    /// Entries that are not pairs, are inverted, or overlap an earlier
    /// accepted range are dropped.
    pub fn from_raw(raw: &[Vec<u16>]) -> Self {
        let mut ranges: Vec<RangeInclusive<u16>> = Vec::with_capacity(raw.len());
        for pair in raw {
            let &[start, end] = pair.as_slice() else {
                debug!("Dropping malformed port range {:?}", pair);
                continue;
            };
            if start > end {
                debug!("Dropping inverted port range {}-{}", start, end);
                continue;
            }
            if ranges.iter().any(|r| start <= *r.end() && *r.start() <= end) {
                debug!("Dropping overlapping port range {}-{}", start, end);
                continue;
            }
            ranges.push(start..=end);
        }
        Self(ranges)
    }

    pub fn ranges(&self) -> &[RangeInclusive<u16>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|range| range.contains(&port))
    }

    /// Total number of ports across all ranges
    pub fn port_count(&self) -> u32 {
        self.0
            .iter()
            .map(|r| u32::from(*r.end()) - u32::from(*r.start()) + 1)
            .sum()
    }

    /// Port at `index` in the flattened ranges
    pub fn port_at(&self, mut index: u32) -> Option<u16> {
        for range in &self.0 {
            let len = u32::from(*range.end()) - u32::from(*range.start()) + 1;
            if index < len {
                return u16::try_from(u32::from(*range.start()) + index).ok();
            }
            index -= len;
        }
        None
    }

    /// Uniform pick over every advertised port, so larger ranges are
    /// proportionally more likely.
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u16> {
        let count = self.port_count();
        if count == 0 {
            return None;
        }
        self.port_at(rng.gen_range(0..count))
    }
}

/// Immutable relay directory snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayDirectory {
    relays: Vec<Relay>,
    port_ranges: PortRanges,
    shadowsocks_port_ranges: PortRanges,
    ipv4_gateway: Ipv4Addr,
    ipv6_gateway: Option<Ipv6Addr>,
}

impl RelayDirectory {
    /// Build a directory from the relay list document
    pub fn from_document(document: RelayListDocument) -> Self {
        let RelayListDocument { locations, wireguard } = document;
        let total = wireguard.relays.len();

        let relays: Vec<Relay> = wireguard
            .relays
            .into_iter()
            .filter_map(|relay| {
                let hostname = relay.hostname.clone();
                let mapped = Relay::from_server_relay(relay, &locations);
                if mapped.is_none() {
                    warn!("Dropping relay {} with unknown location", hostname);
                }
                mapped
            })
            .collect();

        debug!("Mapped {} of {} relays", relays.len(), total);

        Self {
            relays,
            port_ranges: PortRanges::from_raw(&wireguard.port_ranges),
            shadowsocks_port_ranges: PortRanges::from_raw(&wireguard.shadowsocks_port_ranges),
            ipv4_gateway: wireguard.ipv4_gateway,
            ipv6_gateway: wireguard.ipv6_gateway,
        }
    }

    pub fn from_json(content: &str) -> Result<Self, DirectoryError> {
        let document: RelayListDocument =
            serde_json::from_str(content).map_err(|e| DirectoryError::ParseError(e.to_string()))?;
        Ok(Self::from_document(document))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, DirectoryError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| DirectoryError::IoError(e.to_string()))?;
        let directory = Self::from_json(&content)?;
        info!("Loaded relay list with {} relays", directory.relays.len());
        Ok(directory)
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn port_ranges(&self) -> &PortRanges {
        &self.port_ranges
    }

    pub fn shadowsocks_port_ranges(&self) -> &PortRanges {
        &self.shadowsocks_port_ranges
    }

    pub fn ipv4_gateway(&self) -> Ipv4Addr {
        self.ipv4_gateway
    }

    pub fn ipv6_gateway(&self) -> Option<Ipv6Addr> {
        self.ipv6_gateway
    }

    pub fn find(&self, hostname: &str) -> Option<&Relay> {
        self.relays.iter().find(|relay| relay.hostname == hostname)
    }

    /// Subset of this directory keeping only relays accepted by `keep`.
    /// Port ranges and gateways are carried over unchanged.
    pub fn filtered(&self, keep: impl Fn(&Relay) -> bool) -> Self {
        Self {
            relays: self.relays.iter().filter(|r| keep(r)).cloned().collect(),
            port_ranges: self.port_ranges.clone(),
            shadowsocks_port_ranges: self.shadowsocks_port_ranges.clone(),
            ipv4_gateway: self.ipv4_gateway,
            ipv6_gateway: self.ipv6_gateway,
        }
    }
}

/// Current directory, swapped wholesale on refresh
#[derive(Debug)]
pub struct SharedDirectory {
    current: RwLock<Arc<RelayDirectory>>,
}

impl SharedDirectory {
    pub fn new(directory: RelayDirectory) -> Self {
        Self {
            current: RwLock::new(Arc::new(directory)),
        }
    }

    /// The directory selections should run against
    pub fn snapshot(&self) -> Arc<RelayDirectory> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a refreshed directory
    pub fn replace(&self, directory: RelayDirectory) {
        info!("Relay directory refreshed ({} relays)", directory.relays.len());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(directory);
    }
}

/// Relay list errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Active, weight 100 relay at the given location
    pub(crate) fn relay(hostname: &str, country: &str, city: &str) -> Relay {
        let locations = HashMap::from([(
            format!("{}-{}", country, city),
            ServerLocation {
                country: country.to_uppercase(),
                city: city.to_uppercase(),
                latitude: 57.7,
                longitude: 11.9,
            },
        )]);
        Relay::from_server_relay(server_relay(hostname, &format!("{}-{}", country, city)), &locations)
            .expect("fixture location is known")
    }

    pub(crate) fn server_relay(hostname: &str, location: &str) -> ServerRelay {
        ServerRelay {
            hostname: hostname.to_string(),
            location: location.to_string(),
            active: true,
            owned: true,
            provider: "31173".to_string(),
            weight: 100,
            ipv4_addr_in: Ipv4Addr::new(185, 213, 154, 68),
            ipv6_addr_in: Some(Ipv6Addr::LOCALHOST),
            public_key: PublicKey::from_bytes([7u8; 32]),
            include_in_country: true,
            daita: false,
            shadowsocks_extra_addr_in: None,
            features: None,
        }
    }

    pub(crate) const SAMPLE_RELAY_LIST: &str = r#"{
        "locations": {
            "se-got": { "country": "Sweden", "city": "Gothenburg", "latitude": 57.70887, "longitude": 11.97456 },
            "se-sto": { "country": "Sweden", "city": "Stockholm", "latitude": 59.3289, "longitude": 18.0649 },
            "de-fra": { "country": "Germany", "city": "Frankfurt", "latitude": 50.110924, "longitude": 8.682127 }
        },
        "wireguard": {
            "ipv4_gateway": "10.64.0.1",
            "ipv6_gateway": "fc00:bbbb:bbbb:bb01::1",
            "port_ranges": [[53, 53], [4000, 33433], [33565, 51820], [52000, 60000]],
            "shadowsocks_port_ranges": [[100, 200], [1000, 2000]],
            "relays": [
                {
                    "hostname": "se-got-wg-001", "location": "se-got", "active": true, "owned": true,
                    "provider": "31173", "weight": 500, "ipv4_addr_in": "185.213.154.68",
                    "ipv6_addr_in": "2a03:1b20:5:f011::a09f", "include_in_country": true,
                    "public_key": "veGD6/aEY6sMfN3Ls7YWPmNgu3AheO7nQqsFT47YSws=",
                    "shadowsocks_extra_addr_in": ["185.213.154.100"],
                    "features": { "quic": { "addr_in": ["185.213.154.101", "2a03:1b20:5:f011::b"], "domain": "se-got.example.net", "token": "t" } }
                },
                {
                    "hostname": "se-sto-wg-002", "location": "se-sto", "active": true, "owned": false,
                    "provider": "M247", "weight": 100, "ipv4_addr_in": "185.65.135.71",
                    "include_in_country": true, "daita": true,
                    "public_key": "5y66WShsFXqM5gKmGn4TqGdaURbMd5kgYiT0Gbv4NlM=",
                    "features": { "lwo": {} }
                },
                {
                    "hostname": "de-fra-wg-001", "location": "de-fra", "active": true, "owned": false,
                    "provider": "M247", "weight": 100, "ipv4_addr_in": "185.209.196.70",
                    "include_in_country": true,
                    "public_key": "HWDd4/aAETTA6Bae+o4ysf8cqaMzUIhY1ffv4u7R5VQ="
                },
                {
                    "hostname": "de-fra-wg-002", "location": "de-fra", "active": false, "owned": true,
                    "provider": "31173", "weight": 100, "ipv4_addr_in": "185.209.196.71",
                    "public_key": "HWDd4/aAETTA6Bae+o4ysf8cqaMzUIhY1ffv4u7R5VQ="
                },
                {
                    "hostname": "xx-nowhere-wg-001", "location": "xx-nowhere", "active": true,
                    "weight": 100, "ipv4_addr_in": "10.0.0.1",
                    "public_key": "HWDd4/aAETTA6Bae+o4ysf8cqaMzUIhY1ffv4u7R5VQ="
                }
            ]
        }
    }"#;

    pub(crate) fn sample_directory() -> RelayDirectory {
        RelayDirectory::from_json(SAMPLE_RELAY_LIST).expect("sample relay list parses")
    }

    #[test]
    fn test_parse_sample_relay_list() {
        let directory = sample_directory();

        // Relay with unknown location is dropped
        assert_eq!(directory.relays().len(), 4);
        assert!(directory.find("xx-nowhere-wg-001").is_none());
        assert_eq!(directory.ipv4_gateway(), Ipv4Addr::new(10, 64, 0, 1));

        let got = directory.find("se-got-wg-001").unwrap();
        assert_eq!(got.location.country_code, "se");
        assert_eq!(got.location.city_code, "got");
        assert!(got.supports(ObfuscationMethod::Quic));
        assert!(!got.supports(ObfuscationMethod::Lwo));
        assert!(got.has_shadowsocks_ingress());
        assert!(got.has_ipv6_quic_ingress());

        let sto = directory.find("se-sto-wg-002").unwrap();
        assert!(sto.supports(ObfuscationMethod::Lwo));
        assert!(sto.daita);
    }

    #[test]
    fn test_port_ranges_drop_invalid_entries() {
        let ranges = PortRanges::from_raw(&[
            vec![53, 53],
            vec![100, 50],
            vec![4000],
            vec![4000, 5000],
            vec![4500, 4600],
        ]);

        assert_eq!(ranges.ranges(), &[53..=53, 4000..=5000]);
        assert_eq!(ranges.port_count(), 1 + 1001);
        assert!(ranges.contains(4321));
        assert!(!ranges.contains(75));
    }

    #[test]
    fn test_port_at_walks_flattened_ranges() {
        let ranges = PortRanges::from_raw(&[vec![10, 12], vec![20, 21]]);

        assert_eq!(ranges.port_at(0), Some(10));
        assert_eq!(ranges.port_at(2), Some(12));
        assert_eq!(ranges.port_at(3), Some(20));
        assert_eq!(ranges.port_at(4), Some(21));
        assert_eq!(ranges.port_at(5), None);
    }

    #[test]
    fn test_pick_random_port_in_ranges() {
        let directory = sample_directory();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let port = directory.port_ranges().pick_random(&mut rng).unwrap();
            assert!(directory.port_ranges().contains(port));
        }
        assert_eq!(PortRanges::default().pick_random(&mut rng), None);
    }

    #[test]
    fn test_filtered_is_subset() {
        let directory = sample_directory();
        let quic_only = directory.filtered(|r| r.supports(ObfuscationMethod::Quic));

        assert_eq!(quic_only.relays().len(), 1);
        assert_eq!(quic_only.port_ranges(), directory.port_ranges());
    }

    #[test]
    fn test_shared_directory_replace_keeps_old_snapshot() {
        let shared = SharedDirectory::new(sample_directory());
        let before = shared.snapshot();

        shared.replace(sample_directory().filtered(|r| r.location.country_code == "de"));

        assert_eq!(before.relays().len(), 4);
        assert_eq!(shared.snapshot().relays().len(), 2);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.json");
        std::fs::write(&path, SAMPLE_RELAY_LIST).unwrap();

        assert_eq!(RelayDirectory::from_json_file(&path).unwrap().relays().len(), 4);
        assert!(matches!(
            RelayDirectory::from_json_file(&dir.path().join("missing.json")),
            Err(DirectoryError::IoError(_))
        ));
    }
}
