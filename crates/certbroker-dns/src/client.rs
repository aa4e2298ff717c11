//! RFC 2136 dynamic updates and AXFR listing against one nameserver pair

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, Record, RecordType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DnsError;
use crate::record::{qualify, DnsRecord, RecordChange};
use crate::transport::{self, DEFAULT_TIMEOUT};
use crate::tsig::TsigSigner;
use crate::DnsService;

fn default_algorithm() -> String {
    "hmac-sha256".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

/// One managed zone: where to read it, where to write it, and the TSIG key
#[derive(Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Zone apex, e.g. `example.com`
    pub base_domain: String,

    /// Nameserver answering AXFR (often a hidden primary)
    pub read_nameserver: String,

    /// Nameserver accepting updates; defaults to the read nameserver
    #[serde(default)]
    pub write_nameserver: Option<String>,

    pub tsig_key_name: String,

    /// Base64 shared secret
    pub tsig_secret: String,

    #[serde(default = "default_algorithm")]
    pub tsig_algorithm: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ZoneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneConfig")
            .field("base_domain", &self.base_domain)
            .field("read_nameserver", &self.read_nameserver)
            .field("write_nameserver", &self.write_nameserver)
            .field("tsig_key_name", &self.tsig_key_name)
            .field("tsig_algorithm", &self.tsig_algorithm)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// TSIG-signing zone client
#[derive(Debug)]
pub struct ZoneClient {
    read_server: String,
    write_server: String,
    signer: Arc<TsigSigner>,
    timeout: Duration,
}

impl ZoneClient {
    pub fn new(config: &ZoneConfig) -> Result<Self, DnsError> {
        let signer = TsigSigner::from_config(
            &config.tsig_key_name,
            &config.tsig_secret,
            &config.tsig_algorithm,
        )?;

        Ok(Self::with_signer(
            &config.read_nameserver,
            config
                .write_nameserver
                .as_deref()
                .unwrap_or(&config.read_nameserver),
            signer,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn with_signer(
        read_server: &str,
        write_server: &str,
        signer: TsigSigner,
        timeout: Duration,
    ) -> Self {
        Self {
            read_server: read_server.to_string(),
            write_server: write_server.to_string(),
            signer: Arc::new(signer),
            timeout,
        }
    }

    /// Full zone contents via AXFR.
    ///
    /// Envelopes that fail (bad RCODE, bad signature) are skipped and the
    /// transfer continues until the closing SOA or the end of the stream. If
    /// nothing could be read, the last envelope error is returned instead of
    /// an empty list.
    pub async fn list(&self, zone: &str) -> Result<Vec<DnsRecord>, DnsError> {
        let query = Self::build_axfr(zone, 0)?;
        let mut envelopes =
            transport::stream(&self.read_server, query, self.timeout, self.signer.clone()).await?;

        let mut records = Vec::new();
        let mut started = false;
        let mut complete = false;
        let mut last_error = None;

        while let Some(envelope) = envelopes.next().await {
            let response = match envelope {
                Ok(response) => response,
                Err(e) => match transport::exchange_error(&self.read_server, e) {
                    e @ DnsError::Tsig(_) => {
                        warn!(zone, "Skipping zone transfer envelope: {}", e);
                        last_error = Some(e);
                        continue;
                    }
                    // timeout or closed connection: nothing more will arrive
                    e => {
                        debug!(zone, "Zone transfer stream ended: {}", e);
                        last_error.get_or_insert(e);
                        break;
                    }
                },
            };

            let answers = match read_envelope(response.into_message()) {
                Ok(answers) => answers,
                Err(e) => {
                    warn!(zone, "Skipping zone transfer envelope: {}", e);
                    last_error = Some(e);
                    continue;
                }
            };

            if !started {
                if answers.first().map(Record::record_type) != Some(RecordType::SOA) {
                    debug!(zone, "Skipping zone transfer envelope: {}", DnsError::SoaMissing);
                    continue;
                }
                started = true;
                if let Some(soa) = answers.first().and_then(DnsRecord::from_record) {
                    records.push(soa);
                }
                complete = collect_answers(&answers[1..], &mut records);
            } else {
                complete = collect_answers(&answers, &mut records);
            }

            if complete {
                break;
            }
        }

        if !complete {
            warn!(zone, "Zone transfer ended without closing SOA");
        }
        if records.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        debug!(zone, count = records.len(), "Zone transfer finished");
        Ok(records)
    }

    pub async fn add(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError> {
        self.send_update(zone, &[], records).await
    }

    pub async fn delete(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError> {
        self.send_update(zone, records, &[]).await
    }

    /// Replace each `old` with its `new` in a single message
    pub async fn update(&self, zone: &str, changes: &[RecordChange]) -> Result<(), DnsError> {
        let removals: Vec<DnsRecord> = changes.iter().map(|c| c.old.clone()).collect();
        let insertions: Vec<DnsRecord> = changes.iter().map(|c| c.new.clone()).collect();
        self.send_update(zone, &removals, &insertions).await
    }

    /// AXFR query for `zone`
    pub fn build_axfr(zone: &str, id: u16) -> Result<Message, DnsError> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);

        let mut query = Query::query(zone_name(zone)?, RecordType::AXFR);
        query.set_query_class(DNSClass::IN);
        message.add_query(query);

        Ok(message)
    }

    /// UPDATE message: zone section holds the zone's SOA question, update
    /// section holds removals (class NONE, TTL 0) followed by insertions.
    pub fn build_update(
        zone: &str,
        removals: &[DnsRecord],
        insertions: &[DnsRecord],
        id: u16,
    ) -> Result<Message, DnsError> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Update);

        let mut query = Query::query(zone_name(zone)?, RecordType::SOA);
        query.set_query_class(DNSClass::IN);
        message.add_query(query);

        for record in removals {
            let mut rr = record.to_record(zone)?;
            rr.set_dns_class(DNSClass::NONE);
            rr.set_ttl(0);
            message.add_name_server(rr);
        }

        for record in insertions {
            message.add_name_server(record.to_record(zone)?);
        }

        Ok(message)
    }

    async fn send_update(
        &self,
        zone: &str,
        removals: &[DnsRecord],
        insertions: &[DnsRecord],
    ) -> Result<(), DnsError> {
        if removals.is_empty() && insertions.is_empty() {
            return Ok(());
        }

        let message = Self::build_update(zone, removals, insertions, 0)?;

        debug!(
            zone,
            removals = removals.len(),
            insertions = insertions.len(),
            "Sending DNS update to {}",
            self.write_server
        );

        let response =
            transport::exchange(&self.write_server, message, self.timeout, self.signer.clone())
                .await?;
        check_rcode(&response)?;

        info!(
            zone,
            removals = removals.len(),
            insertions = insertions.len(),
            "DNS update applied"
        );
        Ok(())
    }
}

fn zone_name(zone: &str) -> Result<Name, DnsError> {
    Name::from_ascii(qualify("@", zone))
        .map_err(|e| DnsError::InvalidRecord(format!("zone {}: {}", zone, e)))
}

fn check_rcode(message: &Message) -> Result<(), DnsError> {
    match message.response_code() {
        ResponseCode::NoError => Ok(()),
        rcode => Err(DnsError::Rcode(rcode.to_string())),
    }
}

/// RCODE-check one verified envelope and take its answers
fn read_envelope(mut message: Message) -> Result<Vec<Record>, DnsError> {
    check_rcode(&message)?;
    Ok(message.take_answers())
}

/// Append answers until the closing SOA. Returns true once it was seen.
fn collect_answers(answers: &[Record], records: &mut Vec<DnsRecord>) -> bool {
    for answer in answers {
        if answer.record_type() == RecordType::SOA {
            return true;
        }
        if let Some(record) = DnsRecord::from_record(answer) {
            records.push(record);
        }
    }
    false
}

#[async_trait]
impl DnsService for ZoneClient {
    async fn list(&self, zone: &str) -> Result<Vec<DnsRecord>, DnsError> {
        ZoneClient::list(self, zone).await
    }

    async fn add(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError> {
        ZoneClient::add(self, zone, records).await
    }

    async fn update(&self, zone: &str, changes: &[RecordChange]) -> Result<(), DnsError> {
        ZoneClient::update(self, zone, changes).await
    }

    async fn delete(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError> {
        ZoneClient::delete(self, zone, records).await
    }
}
