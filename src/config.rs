//! YAML configuration file
//!
//! Every section is optional. Durations are given in seconds.

use anyhow::{Context, Result};
use certbroker_ca::CaConfig;
use certbroker_cert::{
    IssuanceSettings, NotifySettings, ScheduleSettings, SmtpSettings, SyncSettings,
    ValidationSettings,
};
use certbroker_dns::ZoneConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://./certbroker.db?mode=rwc";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Overridden by `--database-url` / `CERTBROKER_DATABASE_URL`
    pub database_url: Option<String>,
    pub api: ApiSection,
    pub ca: Option<CaConfig>,
    pub zones: Vec<ZoneConfig>,
    pub smtp: Option<SmtpSettings>,
    pub notify: NotifySection,
    pub polling: PollingSection,
    pub schedule: ScheduleSection,
    /// Upper bound on concurrent CA calls of one fan-out
    pub fan_out_limit: usize,
    pub sync_page_size: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            api: ApiSection::default(),
            ca: None,
            zones: Vec::new(),
            smtp: None,
            notify: NotifySection::default(),
            polling: PollingSection::default(),
            schedule: ScheduleSection::default(),
            fan_out_limit: certbroker_cert::fanout::DEFAULT_FAN_OUT_LIMIT,
            sync_page_size: certbroker_cert::sync::SYNC_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub bind_addr: String,
    pub enable_cors: bool,
    /// Required `iss` claim of bearer tokens
    pub jwt_issuer: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            enable_cors: false,
            jwt_issuer: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub window_days: i64,
    pub cadence_days: i64,
    /// Send every notice here instead of to the requester
    pub override_recipient: Option<String>,
}

impl Default for NotifySection {
    fn default() -> Self {
        let defaults = NotifySettings::default();
        Self {
            window_days: defaults.window_days,
            cadence_days: defaults.cadence_days,
            override_recipient: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub collect_timeout_secs: u64,
    pub collect_interval_secs: u64,
    pub dcv_timeout_secs: u64,
    pub dcv_interval_secs: u64,
    /// Validate domains whose DCV expires within this many days
    pub dcv_horizon_days: u64,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            collect_timeout_secs: 300,
            collect_interval_secs: 1,
            dcv_timeout_secs: 600,
            dcv_interval_secs: 10,
            dcv_horizon_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub full_sync_secs: u64,
    pub pending_sync_secs: u64,
    pub expiry_secs: u64,
    pub validation_secs: u64,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        let defaults = ScheduleSettings::default();
        Self {
            full_sync_secs: defaults.full_sync.as_secs(),
            pending_sync_secs: defaults.pending_sync.as_secs(),
            expiry_secs: defaults.expiry.as_secs(),
            validation_secs: defaults.validation.as_secs(),
        }
    }
}

impl BrokerConfig {
    /// Load `path`, or the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&yaml).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        if config.fan_out_limit == 0 {
            anyhow::bail!("fan_out_limit must be at least 1");
        }
        Ok(config)
    }

    pub fn database_url(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.database_url.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
    }

    /// CA section with the password from the environment, if given
    pub fn ca_config(&self, password: Option<&str>) -> Result<CaConfig> {
        let mut ca = self
            .ca
            .clone()
            .context("No `ca` section in the configuration file")?;
        if let Some(password) = password {
            ca.password = password.to_string();
        }
        if ca.password.is_empty() {
            anyhow::bail!("No CA password configured (set CERTBROKER_CA_PASSWORD)");
        }
        Ok(ca)
    }

    pub fn issuance_settings(&self) -> IssuanceSettings {
        let mut settings = IssuanceSettings {
            collect_timeout: Duration::from_secs(self.polling.collect_timeout_secs),
            collect_interval: Duration::from_secs(self.polling.collect_interval_secs),
            fan_out_limit: self.fan_out_limit,
            ..Default::default()
        };
        if let Some(ca) = &self.ca {
            settings.ssl_profile = ca.ssl.clone();
            settings.smime_profile = ca.smime.clone();
        }
        settings
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.sync_page_size,
            fan_out_limit: self.fan_out_limit,
        }
    }

    pub fn validation_settings(&self) -> ValidationSettings {
        ValidationSettings {
            status_timeout: Duration::from_secs(self.polling.dcv_timeout_secs),
            status_interval: Duration::from_secs(self.polling.dcv_interval_secs),
            horizon_days: self.polling.dcv_horizon_days,
            fan_out_limit: self.fan_out_limit,
            ..Default::default()
        }
    }

    pub fn notify_settings(&self) -> NotifySettings {
        NotifySettings {
            window_days: self.notify.window_days,
            cadence_days: self.notify.cadence_days,
            override_recipient: self.notify.override_recipient.clone(),
        }
    }

    pub fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            full_sync: Duration::from_secs(self.schedule.full_sync_secs),
            pending_sync: Duration::from_secs(self.schedule.pending_sync_secs),
            expiry: Duration::from_secs(self.schedule.expiry_secs),
            validation: Duration::from_secs(self.schedule.validation_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
database_url: "postgres://certbroker@db/certbroker"
api:
  bind_addr: "0.0.0.0:9000"
ca:
  base_url: "https://ca.example.net/api"
  login: "broker"
  customer_uri: "acme-corp"
  ssl:
    org_id: 1234
    cert_type: 99
    term: 365
zones:
  - base_domain: "example.com"
    read_nameserver: "10.0.0.53:53"
    tsig_key_name: "broker-key"
    tsig_secret: "c2VjcmV0"
    tsig_algorithm: "hmac-md5"
smtp:
  host: "smtp.example.com"
  from: "pki@example.com"
notify:
  override_recipient: "pki-team@example.com"
polling:
  collect_timeout_secs: 60
fan_out_limit: 4
"#;

    #[test]
    fn test_parse_full_config() {
        let config = BrokerConfig::parse(FULL).unwrap();

        assert_eq!(config.api.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].tsig_algorithm, "hmac-md5");
        assert_eq!(config.smtp.as_ref().unwrap().host, "smtp.example.com");
        assert!(config.smtp.as_ref().unwrap().starttls);

        let issuance = config.issuance_settings();
        assert_eq!(issuance.collect_timeout, Duration::from_secs(60));
        assert_eq!(issuance.collect_interval, Duration::from_secs(1));
        assert_eq!(issuance.ssl_profile.org_id, 1234);
        assert_eq!(issuance.fan_out_limit, 4);

        assert_eq!(config.sync_settings().fan_out_limit, 4);
        assert_eq!(
            config.notify_settings().override_recipient.as_deref(),
            Some("pki-team@example.com")
        );
        assert_eq!(config.notify_settings().window_days, 30);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = BrokerConfig::load(None).unwrap();
        assert!(config.ca.is_none());
        assert!(config.zones.is_empty());
        assert_eq!(config.sync_page_size, 200);
        assert_eq!(config.validation_settings().status_timeout, Duration::from_secs(600));
        assert_eq!(config.schedule_settings().full_sync, Duration::from_secs(6 * 60 * 60));
        assert_eq!(config.database_url(None), DEFAULT_DATABASE_URL);
        assert_eq!(config.database_url(Some("sqlite::memory:")), "sqlite::memory:");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = BrokerConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.database_url(None),
            "postgres://certbroker@db/certbroker"
        );
    }

    #[test]
    fn test_ca_password_from_environment() {
        let config = BrokerConfig::parse(FULL).unwrap();

        assert!(config.ca_config(None).is_err());
        let ca = config.ca_config(Some("hunter2")).unwrap();
        assert_eq!(ca.password, "hunter2");
        assert_eq!(ca.customer_uri, "acme-corp");

        assert!(BrokerConfig::default().ca_config(Some("x")).is_err());
    }

    #[test]
    fn test_rejects_zero_fan_out() {
        assert!(BrokerConfig::parse("fan_out_limit: 0\n").is_err());
        assert!(BrokerConfig::parse("zones: [").is_err());
    }
}
