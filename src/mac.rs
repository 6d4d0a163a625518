//! MAC addresses as they appear on the wire.
//!
//! Six colon separated hex byte pairs.
//! Comparisons are case-insensitive; the canonical form is uppercase.

use std::{fmt::Display, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

static MAC_EXACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}$").expect("MAC regex is valid")
});

static MAC_ANYWHERE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}\b").expect("MAC regex is valid")
});

/// A canonicalized (uppercase) MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse a MAC address, accepting any case and surrounding whitespace.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();

        if MAC_EXACT.is_match(trimmed) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(Error::InvalidMac(format!("`{input}` is not a MAC address")))
        }
    }

    /// Find the first MAC formatted substring within a line.
    pub fn extract(line: &str) -> Option<Self> {
        MAC_ANYWHERE
            .find(line)
            .map(|found| Self(found.as_str().to_ascii_uppercase()))
    }

    /// Find every MAC formatted substring within a line, in order.
    pub fn extract_all(line: &str) -> Vec<Self> {
        MAC_ANYWHERE
            .find_iter(line)
            .map(|found| Self(found.as_str().to_ascii_uppercase()))
            .collect()
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
