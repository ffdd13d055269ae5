//! Proxy/credential assignment for distributed jobs
//!
//! The full table is computed before any replication starts and is never
//! mutated afterwards; each replication gets an `Arc` to its row.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Egress proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProxy {
    /// Display name
    pub name: String,
    /// Proxy URL handed to the transport factory
    pub url: String,
    /// Declared region
    #[serde(default)]
    pub location: Option<String>,
}

impl NetworkProxy {
    /// Create proxy
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            location: None,
        }
    }

    /// With region
    #[inline]
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Credential set merged into a replication's context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    /// Display name
    pub name: String,
    /// Declared region, used by location affinity
    #[serde(default)]
    pub location: Option<String>,
    /// Headers added to direct requests
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Cookies added to direct requests
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl CredentialSet {
    /// Create empty credential set
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// With region
    #[inline]
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// With header
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// With cookie
    #[inline]
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }
}

/// How replications are paired with proxies and credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    /// Replication `i` takes proxy `i % P` and credential `i % C`
    #[default]
    RoundRobin,
    /// Credential round-robin; proxy chosen from those sharing its region
    LocationAffinity,
}

/// Read-only (proxy, credential) pair for one replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Replication index
    pub replication: usize,
    /// Assigned proxy
    pub proxy: Option<NetworkProxy>,
    /// Assigned credentials
    pub credential: Option<CredentialSet>,
}

impl Assignment {
    /// Region of the assigned proxy, else of the credential
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.proxy
            .as_ref()
            .and_then(|p| p.location.as_deref())
            .or_else(|| self.credential.as_ref().and_then(|c| c.location.as_deref()))
    }
}

/// Build the assignment table for `count` replications
#[must_use]
pub fn assign(
    proxies: &[NetworkProxy],
    credentials: &[CredentialSet],
    policy: RotationPolicy,
    count: usize,
) -> Vec<Arc<Assignment>> {
    let mut regional_cursor: HashMap<&str, usize> = HashMap::new();
    (0..count)
        .map(|i| {
            let credential = (!credentials.is_empty()).then(|| &credentials[i % credentials.len()]);
            let round_robin = (!proxies.is_empty()).then(|| &proxies[i % proxies.len()]);
            let proxy = match (policy, credential.and_then(|c| c.location.as_deref())) {
                (RotationPolicy::LocationAffinity, Some(region)) => {
                    let local: Vec<&NetworkProxy> = proxies
                        .iter()
                        .filter(|p| p.location.as_deref() == Some(region))
                        .collect();
                    if local.is_empty() {
                        round_robin
                    } else {
                        let cursor = regional_cursor.entry(region).or_insert(0);
                        let chosen = local[*cursor % local.len()];
                        *cursor += 1;
                        Some(chosen)
                    }
                }
                _ => round_robin,
            };
            Arc::new(Assignment {
                replication: i,
                proxy: proxy.cloned(),
                credential: credential.cloned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies() -> Vec<NetworkProxy> {
        vec![
            NetworkProxy::new("us-1", "http://us1:8080").with_location("us"),
            NetworkProxy::new("eu-1", "http://eu1:8080").with_location("eu"),
            NetworkProxy::new("eu-2", "http://eu2:8080").with_location("eu"),
        ]
    }

    #[test]
    fn round_robin_cycles_both_pools() {
        let creds = vec![CredentialSet::new("alice"), CredentialSet::new("bob")];
        let table = assign(&proxies(), &creds, RotationPolicy::RoundRobin, 5);
        let names: Vec<_> = table
            .iter()
            .map(|a| {
                (
                    a.proxy.as_ref().unwrap().name.as_str(),
                    a.credential.as_ref().unwrap().name.as_str(),
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("us-1", "alice"),
                ("eu-1", "bob"),
                ("eu-2", "alice"),
                ("us-1", "bob"),
                ("eu-1", "alice"),
            ]
        );
    }

    #[test]
    fn location_affinity_matches_regions() {
        let creds = vec![
            CredentialSet::new("berlin").with_location("eu"),
            CredentialSet::new("austin").with_location("us"),
            CredentialSet::new("nowhere").with_location("apac"),
        ];
        let table = assign(&proxies(), &creds, RotationPolicy::LocationAffinity, 6);
        let proxy = |i: usize| table[i].proxy.as_ref().unwrap().name.clone();
        assert_eq!(proxy(0), "eu-1");
        assert_eq!(proxy(1), "us-1");
        assert_eq!(proxy(3), "eu-2");
        assert_eq!(proxy(4), "us-1");
        // no apac proxy: falls back to round-robin
        assert_eq!(proxy(2), "eu-2");
        assert_eq!(table[0].location(), Some("eu"));
    }

    #[test]
    fn empty_proxy_pool_still_assigns_credentials() {
        let creds = vec![CredentialSet::new("only")];
        let table = assign(&[], &creds, RotationPolicy::RoundRobin, 2);
        assert!(table.iter().all(|a| a.proxy.is_none()));
        assert_eq!(table[1].credential.as_ref().unwrap().name, "only");
    }
}
