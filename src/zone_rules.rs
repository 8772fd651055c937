//! Zone rules decide which backend zone owns a name.
//!
//! Rule grammar, one rule per string:
//!
//! ```text
//! *  or  */*        wildcard
//! <name>            zone with this name
//! */<id>            zone with this id
//! <name>/<id>       zone with this name and id
//! ```
//!
//! No rules at all means wildcard.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::Zone;
use crate::error::DnsError;
use crate::record::{ensure_dot_suffix, normalize_fqdn};

/// One `(name?, id?)` rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZoneRule {
    /// Zone name, with trailing dot.
    pub name: Option<String>,
    /// Provider zone id.
    pub id: Option<String>,
}

impl ZoneRule {
    /// True when every field set on the rule matches the zone.
    pub fn matches(&self, zone: &dyn Zone) -> bool {
        if self.name.is_none() && self.id.is_none() {
            return false;
        }
        if let Some(name) = &self.name {
            if normalize_fqdn(name) != normalize_fqdn(zone.name()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if id != zone.id() {
                return false;
            }
        }
        true
    }
}

/// Rules plus the wildcard flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRuleSet {
    /// Explicit rules.
    pub rules: Vec<ZoneRule>,
    /// Manage every unambiguous zone without an explicit match.
    pub wildcard: bool,
}

impl Default for ZoneRuleSet {
    fn default() -> Self {
        Self::wildcard()
    }
}

impl ZoneRuleSet {
    /// Rule set matching every zone.
    pub fn wildcard() -> Self {
        Self {
            rules: Vec::new(),
            wildcard: true,
        }
    }

    /// Parse rule strings. Blank strings are ignored; no rules means wildcard.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, DnsError> {
        let mut rules = Vec::new();
        let mut wildcard = false;

        for spec in specs {
            let spec = spec.as_ref().trim();
            if spec.is_empty() {
                continue;
            }

            let (name, id) = match spec.split_once('/') {
                Some((name, id)) => (name.trim(), Some(id.trim())),
                None => (spec, None),
            };
            if name.is_empty() || id.is_some_and(|id| id.is_empty() || id.contains('/')) {
                return Err(DnsError::InvalidZoneRule(spec.to_string()));
            }

            match (name, id) {
                ("*", None) | ("*", Some("*")) => wildcard = true,
                ("*", Some(id)) => rules.push(ZoneRule {
                    name: None,
                    id: Some(id.to_string()),
                }),
                (name, None) | (name, Some("*")) => rules.push(ZoneRule {
                    name: Some(ensure_dot_suffix(name)),
                    id: None,
                }),
                (name, Some(id)) => rules.push(ZoneRule {
                    name: Some(ensure_dot_suffix(name)),
                    id: Some(id.to_string()),
                }),
            }
        }

        if rules.is_empty() {
            wildcard = true;
        }

        Ok(Self { rules, wildcard })
    }

    /// True when at least one rule matches the zone.
    pub fn matches_explicitly(&self, zone: &dyn Zone) -> bool {
        self.rules.iter().any(|rule| rule.matches(zone))
    }
}

/// Routes names to zones for one reconcile tick.
#[derive(Debug, Default)]
pub struct ZoneMatcher {
    /// zone name -> zones with that name
    by_name: HashMap<String, Vec<Arc<dyn Zone>>>,
    /// zone name -> candidates after applying the rules
    candidates: HashMap<String, Vec<Arc<dyn Zone>>>,
}

impl ZoneMatcher {
    /// Group zones by name and apply the rule set to each group.
    pub fn new(rules: &ZoneRuleSet, zones: Vec<Arc<dyn Zone>>) -> Self {
        let mut by_name: HashMap<String, Vec<Arc<dyn Zone>>> = HashMap::new();
        for zone in zones {
            by_name
                .entry(normalize_fqdn(zone.name()))
                .or_default()
                .push(zone);
        }

        let mut candidates = HashMap::new();
        for (name, zones) in &by_name {
            let mut matches: Vec<Arc<dyn Zone>> = zones
                .iter()
                .filter(|zone| rules.matches_explicitly(zone.as_ref()))
                .cloned()
                .collect();

            if matches.is_empty() && rules.wildcard {
                matches = zones.clone();
            }

            if matches.len() > 1 {
                warn!(
                    zone = %name,
                    count = matches.len(),
                    "found multiple zones for name, won't manage zone (provide a zone id rule)"
                );
            }
            candidates.insert(name.clone(), matches);
        }

        Self {
            by_name,
            candidates,
        }
    }

    /// Longest zone name that is a suffix of `fqdn`, among all listed zones.
    fn longest_suffix(&self, fqdn: &str) -> Option<String> {
        let mut name = fqdn.to_string();
        loop {
            if self.by_name.contains_key(&name) {
                return Some(name);
            }
            if name == "." {
                return None;
            }
            match name.find('.') {
                Some(dot) if dot + 1 < name.len() => name = name[dot + 1..].to_string(),
                _ => name = ".".to_string(),
            }
        }
    }

    /// The single zone owning `fqdn`.
    pub fn find_zone(&self, fqdn: &str) -> Result<Arc<dyn Zone>, DnsError> {
        let fqdn = normalize_fqdn(fqdn);
        let Some(zone_name) = self.longest_suffix(&fqdn) else {
            return Err(DnsError::NoZoneForFqdn(fqdn));
        };

        let candidates = self
            .candidates
            .get(&zone_name)
            .map(Vec::as_slice)
            .unwrap_or_default();
        match candidates {
            [zone] => {
                debug!(fqdn = %fqdn, zone = %zone.cache_key(), "routed name to zone");
                Ok(zone.clone())
            }
            [] => Err(DnsError::NoZoneForFqdn(fqdn)),
            many => Err(DnsError::AmbiguousZone {
                fqdn,
                zone: zone_name,
                count: many.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryProvider;
    use crate::backend::DnsProvider;

    async fn zones(specs: &[(&str, &str)]) -> Vec<Arc<dyn Zone>> {
        let provider = MemoryProvider::new("mem");
        for (name, id) in specs {
            provider.add_zone(name, id);
        }
        provider.list_zones().await.unwrap()
    }

    #[test]
    fn test_parse_grammar() {
        let rules = ZoneRuleSet::parse(&["example.com", "*/Z123", "example.org/Z9"]).unwrap();
        assert!(!rules.wildcard);
        assert_eq!(
            rules.rules,
            vec![
                ZoneRule {
                    name: Some("example.com.".to_string()),
                    id: None
                },
                ZoneRule {
                    name: None,
                    id: Some("Z123".to_string())
                },
                ZoneRule {
                    name: Some("example.org.".to_string()),
                    id: Some("Z9".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_parse_wildcards() {
        assert!(ZoneRuleSet::parse(&["*"]).unwrap().wildcard);
        assert!(ZoneRuleSet::parse(&["*/*"]).unwrap().wildcard);
        assert!(ZoneRuleSet::parse::<&str>(&[]).unwrap().wildcard);
        assert!(ZoneRuleSet::parse(&[""]).unwrap().wildcard);

        let mixed = ZoneRuleSet::parse(&["*", "example.com"]).unwrap();
        assert!(mixed.wildcard);
        assert_eq!(mixed.rules.len(), 1);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ZoneRuleSet::parse(&["/Z1"]).is_err());
        assert!(ZoneRuleSet::parse(&["example.com/"]).is_err());
        assert!(ZoneRuleSet::parse(&["a/b/c"]).is_err());
    }

    #[tokio::test]
    async fn test_id_rule_disambiguates_shared_name() {
        let zones = zones(&[("example.com.", "z1"), ("example.com.", "z2")]).await;
        let rules = ZoneRuleSet::parse(&["example.com/z2"]).unwrap();
        let matcher = ZoneMatcher::new(&rules, zones);

        let zone = matcher.find_zone("api.example.com.").unwrap();
        assert_eq!(zone.id(), "z2");
    }

    #[tokio::test]
    async fn test_shared_name_without_rule_is_refused() {
        let zones = zones(&[("example.com.", "z1"), ("example.com.", "z2")]).await;
        let matcher = ZoneMatcher::new(&ZoneRuleSet::wildcard(), zones);

        assert!(matches!(
            matcher.find_zone("api.example.com."),
            Err(DnsError::AmbiguousZone { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_longest_suffix_wins() {
        let zones = zones(&[("example.com.", "z1"), ("k8s.example.com.", "z2")]).await;
        let matcher = ZoneMatcher::new(&ZoneRuleSet::wildcard(), zones);

        assert_eq!(matcher.find_zone("api.k8s.example.com").unwrap().id(), "z2");
        assert_eq!(matcher.find_zone("www.example.com.").unwrap().id(), "z1");
        assert_eq!(matcher.find_zone("example.com.").unwrap().id(), "z1");
    }

    #[tokio::test]
    async fn test_no_zone_for_name() {
        let zones = zones(&[("example.com.", "z1")]).await;
        let matcher = ZoneMatcher::new(&ZoneRuleSet::wildcard(), zones);

        assert!(matches!(
            matcher.find_zone("api.example.org."),
            Err(DnsError::NoZoneForFqdn(_))
        ));
    }

    #[tokio::test]
    async fn test_unmatched_zone_not_managed_without_wildcard() {
        let zones = zones(&[("example.com.", "z1"), ("example.org.", "z2")]).await;
        let rules = ZoneRuleSet::parse(&["example.com"]).unwrap();
        let matcher = ZoneMatcher::new(&rules, zones);

        assert!(matcher.find_zone("api.example.com.").is_ok());
        assert!(matches!(
            matcher.find_zone("api.example.org."),
            Err(DnsError::NoZoneForFqdn(_))
        ));
    }
}
