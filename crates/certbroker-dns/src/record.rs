//! Resource records in presentation form

use std::str::FromStr;

use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::txt::RDataParser;
use serde::{Deserialize, Serialize};

use crate::error::DnsError;

pub const DEFAULT_TTL: u32 = 300;

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

/// One resource record: `{name, type, content, ttl}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Owner name, absolute (trailing dot) or relative to the zone
    pub name: String,

    #[serde(rename = "type")]
    pub record_type: String,

    /// RDATA in zone-file syntax
    pub content: String,

    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

/// Replace `old` with `new` in one atomic update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    pub old: DnsRecord,
    pub new: DnsRecord,
}

impl DnsRecord {
    pub fn new(
        name: impl Into<String>,
        record_type: impl Into<String>,
        content: impl Into<String>,
        ttl: u32,
    ) -> Self {
        Self {
            name: name.into(),
            record_type: record_type.into(),
            content: content.into(),
            ttl,
        }
    }

    pub fn cname(name: impl Into<String>, target: impl Into<String>, ttl: u32) -> Self {
        Self::new(name, "CNAME", target, ttl)
    }

    /// Owner name made fully qualified relative to `zone`
    pub fn qualified_name(&self, zone: &str) -> String {
        qualify(&self.name, zone)
    }

    /// Same owner, type and content. TTL is ignored, as are trailing dots
    /// and the case of names.
    pub fn same_entry(&self, other: &DnsRecord, zone: &str) -> bool {
        if !self
            .qualified_name(zone)
            .eq_ignore_ascii_case(&other.qualified_name(zone))
        {
            return false;
        }
        if !self.record_type.eq_ignore_ascii_case(&other.record_type) {
            return false;
        }

        let a = self.content.trim().trim_end_matches('.');
        let b = other.content.trim().trim_end_matches('.');
        if carries_name(&self.record_type) {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    }

    pub(crate) fn record_type(&self) -> Result<RecordType, DnsError> {
        RecordType::from_str(&self.record_type.to_ascii_uppercase())
            .map_err(|e| DnsError::InvalidRecord(format!("{}: {}", self.record_type, e)))
    }

    /// Wire record with class IN
    pub(crate) fn to_record(&self, zone: &str) -> Result<Record, DnsError> {
        let name = Name::from_ascii(self.qualified_name(zone))
            .map_err(|e| DnsError::InvalidRecord(format!("{}: {}", self.name, e)))?;
        let record_type = self.record_type()?;
        let rdata = RData::try_from_str(record_type, self.content.trim()).map_err(|e| {
            DnsError::InvalidRecord(format!("{} {}: {}", self.record_type, self.content, e))
        })?;

        Ok(Record::from_rdata(name, self.ttl, rdata))
    }

    /// Presentation form of a received record. Records without RDATA are
    /// skipped.
    pub(crate) fn from_record(record: &Record) -> Option<Self> {
        let data = record.data()?;
        Some(Self {
            name: record.name().to_ascii(),
            record_type: record.record_type().to_string(),
            content: data.to_string(),
            ttl: record.ttl(),
        })
    }
}

/// Make `name` absolute within `zone`. `@` and the empty name denote the apex.
pub fn qualify(name: &str, zone: &str) -> String {
    let zone = zone.trim().trim_end_matches('.');
    let name = name.trim();

    if name.is_empty() || name == "@" {
        return format!("{}.", zone);
    }
    if name.ends_with('.') {
        return name.to_string();
    }
    if name.eq_ignore_ascii_case(zone)
        || name
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", zone.to_ascii_lowercase()))
    {
        return format!("{}.", name);
    }
    format!("{}.{}.", name, zone)
}

/// `name` as an absolute domain name, never joined to a zone
pub fn absolute(name: &str) -> String {
    let name = name.trim().trim_end_matches('.');
    format!("{}.", name)
}

fn carries_name(record_type: &str) -> bool {
    matches!(
        record_type.to_ascii_uppercase().as_str(),
        "CNAME" | "NS" | "PTR" | "DNAME" | "ANAME"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("@", "example.com"), "example.com.");
        assert_eq!(qualify("", "example.com."), "example.com.");
        assert_eq!(qualify("www", "example.com"), "www.example.com.");
        assert_eq!(qualify("www.example.com", "example.com"), "www.example.com.");
        assert_eq!(qualify("other.org.", "example.com"), "other.org.");
        assert_eq!(qualify("example.com", "example.com."), "example.com.");
        // Not a label boundary
        assert_eq!(qualify("notexample.com", "example.com"), "notexample.com.example.com.");
    }

    #[test]
    fn test_absolute() {
        assert_eq!(absolute("a1b2.dcv.ca.example.net"), "a1b2.dcv.ca.example.net.");
        assert_eq!(absolute("a1b2.dcv.ca.example.net."), "a1b2.dcv.ca.example.net.");
        assert_eq!(absolute(" target.example.com "), "target.example.com.");
    }

    #[test]
    fn test_same_entry_ignores_ttl_and_trailing_dots() {
        let a = DnsRecord::cname("_abc.www", "xyz.dcv.example.net.", 300);
        let b = DnsRecord::cname("_abc.www.example.com.", "XYZ.dcv.example.net", 60);
        assert!(a.same_entry(&b, "example.com"));

        let c = DnsRecord::cname("_abc.www", "other.dcv.example.net", 300);
        assert!(!a.same_entry(&c, "example.com"));

        let txt_a = DnsRecord::new("www", "TXT", "Token", 300);
        let txt_b = DnsRecord::new("www", "txt", "token", 300);
        assert!(!txt_a.same_entry(&txt_b, "example.com"));
    }

    #[test]
    fn test_to_record() {
        let record = DnsRecord::new("www", "A", "192.0.2.10", 120)
            .to_record("example.com")
            .unwrap();
        assert_eq!(record.name().to_ascii(), "www.example.com.");
        assert_eq!(record.record_type(), RecordType::A);
        assert_eq!(record.ttl(), 120);

        let back = DnsRecord::from_record(&record).unwrap();
        assert_eq!(back.content, "192.0.2.10");
        assert_eq!(back.record_type, "A");
    }

    #[test]
    fn test_invalid_record() {
        assert!(matches!(
            DnsRecord::new("www", "A", "not-an-ip", 120).to_record("example.com"),
            Err(DnsError::InvalidRecord(_))
        ));
        assert!(matches!(
            DnsRecord::new("www", "BOGUS", "x", 120).to_record("example.com"),
            Err(DnsError::InvalidRecord(_))
        ));
    }
}
