//! Sender domain policy.

use crate::config::Config;
use crate::db::Repository;
use crate::error::Error;
use crate::utils::is_plausible_address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedVerdict {
    allowed: bool,
    expires_at: Instant,
}

/// Result of [`DomainPolicy::is_domain_allowed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainVerdict {
    pub allowed: bool,
    pub reason: &'static str,
}

impl DomainVerdict {
    fn new(allowed: bool, reason: &'static str) -> Self {
        Self { allowed, reason }
    }
}

/// Decides whether mail from a domain is ingested.
///
/// In whitelist mode the `domain_rules` table is authoritative and unknown domains
/// are denied; otherwise the configured `allowed_domains` list is. Verdicts are
/// cached per domain until the TTL runs out or the rule is edited.
pub struct DomainPolicy {
    repo: Arc<dyn Repository>,
    whitelist_enabled: bool,
    allowed_domains: Vec<String>,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedVerdict>>,
}

impl DomainPolicy {
    pub fn new(config: &Config, repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            whitelist_enabled: config.whitelist_enabled,
            allowed_domains: config.allowed_domains.clone(),
            ttl: config.domain_cache_ttl(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_domain_allowed(&self, address: &str) -> Result<DomainVerdict, Error> {
        let address = address.trim().to_lowercase();
        let Some(domain) = domain_of(&address) else {
            return Ok(DomainVerdict::new(false, "invalid address"));
        };

        if let Some(allowed) = self.cached(domain) {
            return Ok(DomainVerdict::new(
                allowed,
                if allowed {
                    "domain allowed"
                } else {
                    "domain blocked"
                },
            ));
        }

        let verdict = if self.whitelist_enabled {
            match self.repo.find_domain_rule(domain).await? {
                Some(rule) if rule.is_allowed => DomainVerdict::new(true, "domain on whitelist"),
                Some(_) => DomainVerdict::new(false, "domain on blacklist"),
                None => DomainVerdict::new(false, "domain not on whitelist"),
            }
        } else if self.allowed_domains.iter().any(|d| d == domain) {
            DomainVerdict::new(true, "domain in allowed list")
        } else {
            DomainVerdict::new(false, "domain not in allowed list")
        };

        self.remember(domain, verdict.allowed);
        Ok(verdict)
    }

    fn cached(&self, domain: &str) -> Option<bool> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(domain)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.allowed)
    }

    fn remember(&self, domain: &str, allowed: bool) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                domain.to_string(),
                CachedVerdict {
                    allowed,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }

    /// Drops the cached verdict of one domain after its rule changed.
    pub fn invalidate(&self, domain: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&domain.trim().to_lowercase());
        }
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut cache) = self.cache.lock() else {
            return 0;
        };
        let before = cache.len();
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
        before - cache.len()
    }
}

fn domain_of(address: &str) -> Option<&str> {
    if !is_plausible_address(address) {
        return None;
    }
    let (_, domain) = address.rsplit_once('@')?;
    is_valid_domain(domain).then_some(domain)
}

/// Hostname syntax: dot separated labels of letters, digits and inner hyphens.
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
