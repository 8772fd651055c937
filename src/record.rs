//! Record model shared by producers, the controller and the backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::DnsError;

/// Type of a desired record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address record.
    #[serde(rename = "A")]
    A,
    /// IPv6 address record.
    #[serde(rename = "AAAA")]
    Aaaa,
    /// Canonical name record.
    #[serde(rename = "CNAME")]
    Cname,
    /// Symbolic reference to alias-target records; never published as-is.
    #[serde(rename = "_alias")]
    Alias,
}

impl RecordType {
    /// Wire/display form of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Alias => "_alias",
        }
    }

    /// Whether the type names an address record.
    pub fn is_address(&self) -> bool {
        matches!(self, RecordType::A | RecordType::Aaaa)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            "_ALIAS" => Ok(RecordType::Alias),
            _ => Err(DnsError::InvalidRecordType(s.to_string())),
        }
    }
}

/// A single desired record contributed by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// Record type.
    pub record_type: RecordType,
    /// Owner name, or the symbolic key for alias targets.
    pub fqdn: String,
    /// Address, CNAME target, or alias key for `_alias` records.
    pub value: String,
    /// Only consumed during alias expansion, never published.
    #[serde(default)]
    pub alias_target: bool,
    /// Producer-chosen TTL in seconds.
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl Record {
    /// A published record.
    pub fn new(record_type: RecordType, fqdn: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            record_type,
            fqdn: fqdn.into(),
            value: value.into(),
            alias_target: false,
            ttl: None,
        }
    }

    /// An `_alias` reference from `fqdn` to the alias targets stored under `key`.
    pub fn alias(fqdn: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(RecordType::Alias, fqdn, key)
    }

    /// A record only visible to alias expansion, indexed by `key`.
    pub fn alias_target(
        record_type: RecordType,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            alias_target: true,
            ..Self::new(record_type, key, value)
        }
    }

    /// Set a producer TTL.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Key under which this record is published.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type, &self.fqdn)
    }
}

/// `(type, fqdn)` pair identifying a replaceable set of values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Record type.
    pub record_type: RecordType,
    /// Canonical FQDN (lowercase, trailing dot).
    pub fqdn: String,
}

impl RecordKey {
    /// Build a key, canonicalizing the name.
    pub fn new(record_type: RecordType, fqdn: &str) -> Self {
        Self {
            record_type,
            fqdn: normalize_fqdn(fqdn),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.fqdn)
    }
}

/// Append a trailing dot when absent.
pub fn ensure_dot_suffix(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{s}.")
    }
}

/// Rewrite the escaped wildcard label (`\052`) some providers return.
pub fn fix_wildcards(s: &str) -> String {
    s.replace("\\052", "*")
}

/// Canonical FQDN: ASCII-lowercase, wildcard escapes rewritten, trailing dot.
pub fn normalize_fqdn(s: &str) -> String {
    ensure_dot_suffix(&fix_wildcards(s.trim()).to_ascii_lowercase())
}

/// Canonical form of an alias key, used on both sides of the lookup.
pub fn normalize_alias_key(s: &str) -> String {
    s.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `fqdn` equals `zone` or lies below it on a label boundary.
pub fn is_within_zone(fqdn: &str, zone: &str) -> bool {
    let fqdn = normalize_fqdn(fqdn);
    let zone = normalize_fqdn(zone);
    if zone == "." {
        return true;
    }
    fqdn == zone || fqdn.ends_with(&format!(".{zone}"))
}

/// Sort values ascending and drop duplicates.
///
/// Some providers reject duplicate values in a set, so duplicates are
/// dropped with a warning rather than passed through.
pub fn normalize_values(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    let before = values.len();
    values.dedup();
    if values.len() != before {
        warn!(
            dropped = before - values.len(),
            "skipping duplicate record values"
        );
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fqdn_lowercases_and_adds_dot() {
        assert_eq!(normalize_fqdn("API.Example.COM"), "api.example.com.");
        assert_eq!(normalize_fqdn("api.example.com."), "api.example.com.");
    }

    #[test]
    fn test_normalize_fqdn_rewrites_wildcard_escape() {
        assert_eq!(normalize_fqdn("\\052.example.com."), "*.example.com.");
    }

    #[test]
    fn test_record_type_parse() {
        assert_eq!("aaaa".parse::<RecordType>().unwrap(), RecordType::Aaaa);
        assert_eq!("_alias".parse::<RecordType>().unwrap(), RecordType::Alias);
        assert!("MX".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_record_type_serde_names() {
        let json = serde_json::to_string(&RecordType::Alias).unwrap();
        assert_eq!(json, "\"_alias\"");
        let parsed: RecordType = serde_json::from_str("\"AAAA\"").unwrap();
        assert_eq!(parsed, RecordType::Aaaa);
    }

    #[test]
    fn test_normalize_values_sorts_and_dedupes() {
        let values = vec![
            "10.0.0.2".to_string(),
            "10.0.0.1".to_string(),
            "10.0.0.2".to_string(),
        ];
        assert_eq!(normalize_values(values), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_is_within_zone() {
        assert!(is_within_zone("api.example.com", "example.com."));
        assert!(is_within_zone("example.com.", "example.com"));
        assert!(!is_within_zone("badexample.com.", "example.com."));
        assert!(!is_within_zone("example.org.", "example.com."));
    }

    #[test]
    fn test_record_key_is_case_insensitive() {
        let a = Record::new(RecordType::A, "API.example.com", "1.1.1.1").key();
        let b = Record::new(RecordType::A, "api.example.com.", "1.1.1.1").key();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "A/api.example.com.");
    }

    #[test]
    fn test_alias_key_normalization() {
        assert_eq!(normalize_alias_key("Node-A/External"), "node-a/external");
        assert_eq!(normalize_alias_key("node-a/external."), "node-a/external");
    }
}
