//! Input validation for country codes and registry prefixes.
//!
//! Everything that crosses a trust boundary (CLI arguments, the persisted
//! registry, registry responses) is validated here before it reaches the
//! firewall layer.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A two-letter country identifier, always stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CountryCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 2 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!(
                "Invalid country code '{}': expected two ASCII letters",
                s
            ));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for CountryCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CountryCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse a list of country codes, failing on the first invalid entry.
pub fn parse_country_codes<S: AsRef<str>>(codes: &[S]) -> anyhow::Result<Vec<CountryCode>> {
    let mut parsed: Vec<CountryCode> = Vec::with_capacity(codes.len());
    for code in codes {
        let cc: CountryCode = code.as_ref().parse().map_err(|e: String| anyhow::anyhow!(e))?;
        if !parsed.contains(&cc) {
            parsed.push(cc);
        }
    }
    Ok(parsed)
}

/// Parse one IPv4 prefix in strict dotted-quad CIDR notation.
///
/// Octets must be 0-255, the optional mask 0-32 and written as plain digits.
/// A bare address is accepted as a /32.
pub fn parse_ipv4_prefix(entry: &str) -> Option<Ipv4Net> {
    let entry = entry.trim();
    let (addr_part, mask_part) = match entry.split_once('/') {
        Some((addr, mask)) => (addr, Some(mask)),
        None => (entry, None),
    };

    if addr_part.split('.').count() != 4 {
        return None;
    }
    let addr: Ipv4Addr = addr_part.parse().ok()?;

    let mask = match mask_part {
        Some(m) => {
            if m.is_empty() || m.len() > 2 || !m.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let value: u8 = m.parse().ok()?;
            if value > 32 {
                return None;
            }
            value
        }
        None => 32,
    };

    Ipv4Net::new(addr, mask).ok()
}

/// Outcome of validating a raw prefix array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedPrefixes {
    pub accepted: Vec<Ipv4Net>,
    pub rejected: usize,
}

impl ValidatedPrefixes {
    /// Fraction of entries that were dropped, in `[0, 1]`.
    pub fn rejected_ratio(&self) -> f64 {
        let total = self.accepted.len() + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.rejected as f64 / total as f64
        }
    }
}

/// Validate every raw entry, keeping registry order and counting rejects.
pub fn validate_prefixes<S: AsRef<str>>(entries: &[S]) -> ValidatedPrefixes {
    let mut result = ValidatedPrefixes {
        accepted: Vec::with_capacity(entries.len()),
        rejected: 0,
    };
    for entry in entries {
        match parse_ipv4_prefix(entry.as_ref()) {
            Some(net) => result.accepted.push(net),
            None => result.rejected += 1,
        }
    }
    result
}
