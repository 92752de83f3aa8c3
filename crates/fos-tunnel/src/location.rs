//! Relay locations and location selectors

use crate::directory::Relay;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Geographic location of a relay, resolved from the relay list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Country display name
    pub country: String,
    /// Lowercase country code (e.g. "se")
    pub country_code: String,
    /// City display name
    pub city: String,
    /// Lowercase city code (e.g. "got")
    pub city_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Where the user wants to connect
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSelector {
    Country(String),
    City(String, String),
    Hostname(String, String, String),
    /// Id of a user-defined custom list
    CustomList(String),
}

impl LocationSelector {
    pub fn country(country: impl Into<String>) -> Self {
        Self::Country(country.into())
    }

    pub fn city(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self::City(country.into(), city.into())
    }

    pub fn hostname(
        country: impl Into<String>,
        city: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self::Hostname(country.into(), city.into(), hostname.into())
    }

    /// Check whether `relay` lies inside this selection.
    ///
    /// Country matches only count relays flagged `include_in_country`.
    /// Custom lists are resolved through `custom_lists`; an unknown id or a
    /// list nested inside another list matches nothing.
    pub fn matches(&self, relay: &Relay, custom_lists: &[CustomList]) -> bool {
        match self {
            Self::CustomList(id) => custom_lists
                .iter()
                .find(|list| &list.id == id)
                .is_some_and(|list| {
                    list.locations
                        .iter()
                        .any(|location| location.matches_geographic(relay))
                }),
            geographic => geographic.matches_geographic(relay),
        }
    }

    fn matches_geographic(&self, relay: &Relay) -> bool {
        let location = &relay.location;
        match self {
            Self::Country(country) => {
                location.country_code == *country && relay.include_in_country
            }
            Self::City(country, city) => {
                location.country_code == *country && location.city_code == *city
            }
            Self::Hostname(country, city, hostname) => {
                location.country_code == *country
                    && location.city_code == *city
                    && relay.hostname == *hostname
            }
            Self::CustomList(_) => false,
        }
    }
}

impl fmt::Display for LocationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Country(country) => write!(f, "{}", country),
            Self::City(country, city) => write!(f, "{}-{}", country, city),
            Self::Hostname(_, _, hostname) => write!(f, "{}", hostname),
            Self::CustomList(id) => write!(f, "custom list {}", id),
        }
    }
}

/// Named, user-defined group of locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomList {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub locations: Vec<LocationSelector>,
}
