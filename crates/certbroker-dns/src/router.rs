//! Routes names to the most specific configured zone

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::client::{ZoneClient, ZoneConfig};
use crate::error::DnsError;
use crate::record::{DnsRecord, RecordChange};
use crate::DnsService;

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `name` equals `zone` or lies below it on a label boundary
fn within_zone(name: &str, zone: &str) -> bool {
    name == zone || name.ends_with(&format!(".{}", zone))
}

/// A set of zones, each served by its own [`DnsService`]
#[derive(Clone, Default)]
pub struct ZoneRouter {
    zones: Vec<(String, Arc<dyn DnsService>)>,
}

impl ZoneRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`ZoneClient`] per configured zone
    pub fn from_configs(configs: &[ZoneConfig]) -> Result<Self, DnsError> {
        let mut router = Self::new();
        for config in configs {
            let client = ZoneClient::new(config)?;
            router.insert(&config.base_domain, Arc::new(client));
        }
        Ok(router)
    }

    pub fn insert(&mut self, base_domain: &str, service: Arc<dyn DnsService>) {
        let base_domain = normalize(base_domain);
        self.zones.retain(|(zone, _)| *zone != base_domain);
        self.zones.push((base_domain, service));
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(|(zone, _)| zone.as_str())
    }

    /// Zone with the longest base domain containing `fqdn`
    pub fn resolve(&self, fqdn: &str) -> Option<(&str, Arc<dyn DnsService>)> {
        let name = normalize(fqdn);
        self.zones
            .iter()
            .filter(|(zone, _)| within_zone(&name, zone))
            .max_by_key(|(zone, _)| zone.len())
            .map(|(zone, service)| (zone.as_str(), Arc::clone(service)))
    }

    fn route(&self, zone: &str) -> Result<(String, Arc<dyn DnsService>), DnsError> {
        let (base, service) = self
            .resolve(zone)
            .ok_or_else(|| DnsError::NoZone(zone.to_string()))?;
        debug!(zone, base, "Routing DNS request");
        Ok((base.to_string(), service))
    }
}

#[async_trait]
impl DnsService for ZoneRouter {
    async fn list(&self, zone: &str) -> Result<Vec<DnsRecord>, DnsError> {
        let (base, service) = self.route(zone)?;
        service.list(&base).await
    }

    async fn add(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError> {
        let (base, service) = self.route(zone)?;
        let records = requalify(records, zone);
        service.add(&base, &records).await
    }

    async fn update(&self, zone: &str, changes: &[RecordChange]) -> Result<(), DnsError> {
        let (base, service) = self.route(zone)?;
        let changes: Vec<RecordChange> = changes
            .iter()
            .map(|c| RecordChange {
                old: requalify_one(&c.old, zone),
                new: requalify_one(&c.new, zone),
            })
            .collect();
        service.update(&base, &changes).await
    }

    async fn delete(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError> {
        let (base, service) = self.route(zone)?;
        let records = requalify(records, zone);
        service.delete(&base, &records).await
    }
}

/// Relative names are relative to the zone the caller named, which may sit
/// below the configured base domain.
fn requalify_one(record: &DnsRecord, zone: &str) -> DnsRecord {
    DnsRecord {
        name: record.qualified_name(zone),
        ..record.clone()
    }
}

fn requalify(records: &[DnsRecord], zone: &str) -> Vec<DnsRecord> {
    records.iter().map(|r| requalify_one(r, zone)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockDnsService;
    use mockall::predicate::eq;

    fn mock() -> Arc<dyn DnsService> {
        Arc::new(MockDnsService::new())
    }

    #[test]
    fn test_resolve_longest_suffix() {
        let mut router = ZoneRouter::new();
        router.insert("example.com", mock());
        router.insert("dev.example.com.", mock());
        router.insert("example.org", mock());

        assert_eq!(router.resolve("www.example.com").unwrap().0, "example.com");
        assert_eq!(router.resolve("a.b.dev.example.com").unwrap().0, "dev.example.com");
        assert_eq!(router.resolve("dev.example.com.").unwrap().0, "dev.example.com");
        assert_eq!(router.resolve("Example.ORG").unwrap().0, "example.org");
        assert!(router.resolve("notexample.com").is_none());
        assert!(router.resolve("example.net").is_none());
    }

    #[test]
    fn test_insert_replaces_zone() {
        let mut router = ZoneRouter::new();
        router.insert("example.com", mock());
        router.insert("example.com.", mock());
        assert_eq!(router.zones().count(), 1);
    }

    #[tokio::test]
    async fn test_routes_to_base_zone() {
        let mut inner = MockDnsService::new();
        inner
            .expect_add()
            .withf(|zone, records| {
                zone == "example.com" && records.len() == 1 && records[0].name == "_x.dev.example.com."
            })
            .times(1)
            .returning(|_, _| Ok(()));
        inner
            .expect_list()
            .with(eq("example.com"))
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut router = ZoneRouter::new();
        router.insert("example.com", Arc::new(inner));

        let record = DnsRecord::cname("_x", "target.example.net.", 300);
        router.add("dev.example.com", &[record]).await.unwrap();
        assert!(router.list("dev.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let router = ZoneRouter::new();
        let err = router.list("example.com").await.unwrap_err();
        assert!(matches!(err, DnsError::NoZone(_)));
    }
}
