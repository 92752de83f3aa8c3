//! Relay constraints
//!
//! A [`Constraint`] is either unrestricted or pins a value that must match
//! exactly. [`RelayConstraints`] bundles the user's location, port,
//! ownership and provider filters.

use crate::location::LocationSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Either no restriction or an exact value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint<T> {
    #[default]
    Any,
    Only(T),
}

impl<T> Constraint<T> {
    pub fn is_any(&self) -> bool {
        matches!(self, Constraint::Any)
    }

    /// Pinned value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Constraint::Any => None,
            Constraint::Only(value) => Some(value),
        }
    }

    pub fn as_ref(&self) -> Constraint<&T> {
        match self {
            Constraint::Any => Constraint::Any,
            Constraint::Only(value) => Constraint::Only(value),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Constraint<U> {
        match self {
            Constraint::Any => Constraint::Any,
            Constraint::Only(value) => Constraint::Only(f(value)),
        }
    }

    /// `Any` passes everything, `Only` defers to `matcher`
    pub fn matches_with(&self, matcher: impl FnOnce(&T) -> bool) -> bool {
        match self {
            Constraint::Any => true,
            Constraint::Only(value) => matcher(value),
        }
    }
}

impl<T: PartialEq> Constraint<T> {
    pub fn matches(&self, other: &T) -> bool {
        self.matches_with(|value| value == other)
    }
}

impl<T> From<Option<T>> for Constraint<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Constraint::Any, Constraint::Only)
    }
}

impl<T: fmt::Display> fmt::Display for Constraint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Any => write!(f, "any"),
            Constraint::Only(value) => write!(f, "{}", value),
        }
    }
}

/// Hosting ownership filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    #[default]
    Any,
    /// Servers owned by the operator
    Owned,
    /// Servers rented from a hosting provider
    Rented,
}

impl Ownership {
    pub fn matches(&self, owned: bool) -> bool {
        match self {
            Ownership::Any => true,
            Ownership::Owned => owned,
            Ownership::Rented => !owned,
        }
    }
}

/// User-chosen relay filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConstraints {
    #[serde(default)]
    pub location: Constraint<LocationSelector>,
    #[serde(default)]
    pub port: Constraint<u16>,
    #[serde(default)]
    pub ownership: Ownership,
    #[serde(default)]
    pub providers: Constraint<BTreeSet<String>>,
}

impl RelayConstraints {
    /// Constraints pinned to a location, everything else unrestricted
    pub fn with_location(location: LocationSelector) -> Self {
        Self {
            location: Constraint::Only(location),
            ..Self::default()
        }
    }

    pub fn provider_matches(&self, provider: &str) -> bool {
        self.providers.matches_with(|providers| providers.contains(provider))
    }
}

impl fmt::Display for RelayConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "location: {}, port: {}", self.location, self.port)
    }
}
