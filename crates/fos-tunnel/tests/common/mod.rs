//! Shared fixtures for the integration tests

#![allow(dead_code)]

use fos_tunnel::{
    ConnectionPlanner, NextRelaySelection, NoBypass, PreparedAttempt, RelayDirectory, Settings,
    SharedDirectory, State, StaticSettingsReader, TunnelSettings,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;

const PUBLIC_KEY: &str = "veGD6/aEY6sMfN3Ls7YWPmNgu3AheO7nQqsFT47YSws=";

/// Relay entry: hostname, "country-city" location, active, weight
pub type RelaySpec<'a> = (&'a str, &'a str, bool, u64);

/// Directory with the given relays and the usual WireGuard port ranges
pub fn directory(relays: &[RelaySpec<'_>]) -> RelayDirectory {
    let relays: Vec<_> = relays
        .iter()
        .enumerate()
        .map(|(index, (hostname, location, active, weight))| {
            json!({
                "hostname": hostname,
                "location": location,
                "active": active,
                "owned": index % 2 == 0,
                "provider": "31173",
                "weight": weight,
                "ipv4_addr_in": format!("185.213.154.{}", index + 1),
                "public_key": PUBLIC_KEY,
            })
        })
        .collect();

    let document = json!({
        "locations": {
            "se-got": { "country": "Sweden", "city": "Gothenburg", "latitude": 57.7, "longitude": 11.9 },
            "se-sto": { "country": "Sweden", "city": "Stockholm", "latitude": 59.3, "longitude": 18.0 },
            "de-fra": { "country": "Germany", "city": "Frankfurt", "latitude": 50.1, "longitude": 8.6 }
        },
        "wireguard": {
            "ipv4_gateway": "10.64.0.1",
            "port_ranges": [[53, 53], [4000, 33433], [33565, 51820], [52000, 60000]],
            "shadowsocks_port_ranges": [[100, 200]],
            "relays": relays
        }
    });

    RelayDirectory::from_json(&document.to_string()).expect("fixture relay list parses")
}

pub fn default_directory() -> RelayDirectory {
    directory(&[
        ("se-got-wg-001", "se-got", true, 100),
        ("se-sto-wg-001", "se-sto", true, 100),
        ("de-fra-wg-001", "de-fra", true, 100),
    ])
}

/// Attempt planned against [`default_directory`] with default settings
pub fn prepared_attempt() -> PreparedAttempt {
    let reader = StaticSettingsReader(Settings::with_new_key(TunnelSettings::default()));
    let directory = SharedDirectory::new(default_directory());
    ConnectionPlanner::new(&reader, &directory, &NoBypass)
        .plan(
            &State::Initial,
            &NextRelaySelection::Random,
            None,
            &mut StdRng::seed_from_u64(1),
        )
        .expect("fixture attempt plans")
}
