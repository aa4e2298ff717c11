//! TSIG (RFC 8945) signing strategies
//!
//! HMAC-SHA256/512 keys go through hickory's [`TSigner`]. HMAC-MD5 and
//! HMAC-SHA1 keys, which hickory can parse but not compute, use
//! [`LegacyHmacSigner`]. Both plug into hickory's client streams through
//! [`TsigSigner`], which implements [`MessageFinalizer`].

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hickory_proto::error::{ProtoError, ProtoErrorKind, ProtoResult};
use hickory_proto::op::{Message, MessageFinalizer, MessageVerifier, ResponseCode};
use hickory_proto::rr::dnssec::rdata::tsig::{
    make_tsig_record, message_tbs, signed_bitmessage_to_buf, TSIG,
};
use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::xfer::DnsResponse;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use tracing::{debug, warn};

pub use hickory_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;

use crate::error::TsigError;

/// Allowed clock skew between signer and verifier, in seconds
pub const DEFAULT_FUDGE: u16 = 300;

/// Map a configured algorithm name to its TSIG algorithm.
///
/// Accepts the short names (`hmac-sha256`) as well as the full wire names,
/// in any case, with or without the trailing dot.
pub fn parse_algorithm(name: &str) -> Result<TsigAlgorithm, TsigError> {
    let normalized = name.trim().trim_end_matches('.').to_ascii_lowercase();
    match normalized.as_str() {
        "hmac-md5" | "hmac-md5.sig-alg.reg.int" => Ok(TsigAlgorithm::HmacMd5),
        "hmac-sha1" => Ok(TsigAlgorithm::HmacSha1),
        "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
        "hmac-sha512" => Ok(TsigAlgorithm::HmacSha512),
        _ => Err(TsigError::UnsupportedAlgorithm(name.to_string())),
    }
}

/// Decode the base64 secret found in BIND key files
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, TsigError> {
    STANDARD
        .decode(secret.trim())
        .map_err(|e| TsigError::InvalidSecret(e.to_string()))
}

/// Fully qualified, lowercase key name
pub fn key_name(name: &str) -> Result<Name, TsigError> {
    let mut name = Name::from_ascii(name).map_err(|e| TsigError::InvalidKeyName(e.to_string()))?;
    name.set_fqdn(true);
    Ok(name.to_lowercase())
}

/// Signing strategy picked from the key's algorithm
#[derive(Clone)]
pub enum TsigSigner {
    Native(TSigner),
    Legacy(LegacyHmacSigner),
}

impl fmt::Debug for TsigSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsigSigner")
            .field("name", &self.key_name().to_ascii())
            .field("algorithm", &self.algorithm().to_string())
            .field("legacy", &matches!(self, TsigSigner::Legacy(_)))
            .finish()
    }
}

impl TsigSigner {
    pub fn new(
        key: Vec<u8>,
        algorithm: TsigAlgorithm,
        name: Name,
        fudge: u16,
    ) -> Result<Self, TsigError> {
        if algorithm.supported() {
            TSigner::new(key, algorithm.clone(), name, fudge)
                .map(TsigSigner::Native)
                .map_err(|_| TsigError::UnsupportedAlgorithm(algorithm.to_string()))
        } else {
            LegacyHmacSigner::new(key, algorithm, name, fudge).map(TsigSigner::Legacy)
        }
    }

    /// Build from the key name, base64 secret and algorithm name of a zone
    /// configuration, with the default fudge
    pub fn from_config(name: &str, secret: &str, algorithm: &str) -> Result<Self, TsigError> {
        let algorithm = parse_algorithm(algorithm)?;
        Self::new(decode_secret(secret)?, algorithm, key_name(name)?, DEFAULT_FUDGE)
    }

    pub fn algorithm(&self) -> &TsigAlgorithm {
        match self {
            TsigSigner::Native(signer) => signer.algorithm(),
            TsigSigner::Legacy(signer) => signer.algorithm(),
        }
    }

    pub fn key_name(&self) -> &Name {
        match self {
            TsigSigner::Native(signer) => signer.signer_name(),
            TsigSigner::Legacy(signer) => signer.signer_name(),
        }
    }

    pub fn fudge(&self) -> u16 {
        match self {
            TsigSigner::Native(signer) => signer.fudge(),
            TsigSigner::Legacy(signer) => signer.fudge(),
        }
    }
}

impl MessageFinalizer for TsigSigner {
    fn finalize_message(
        &self,
        message: &Message,
        current_time: u32,
    ) -> ProtoResult<(Vec<Record>, Option<MessageVerifier>)> {
        let (records, verifier) = match self {
            TsigSigner::Native(signer) => signer.finalize_message(message, current_time)?,
            TsigSigner::Legacy(signer) => signer.finalize_message(message, current_time)?,
        };
        Ok((records, verifier.map(report_failures)))
    }
}

/// Wrap a response verifier so that unsigned error answers reach the caller
/// with their RCODE, and every other verification failure surfaces as
/// [`ProtoErrorKind::HmacInvalid`].
///
/// Servers answer requests they cannot authenticate (unknown key, bad
/// signature) without a TSIG record.
fn report_failures(mut inner: MessageVerifier) -> MessageVerifier {
    Box::new(move |bytes: &[u8]| match inner(bytes) {
        Ok(response) => Ok(response),
        Err(err) => {
            let message = Message::from_vec(bytes)?;
            if message.signature().is_empty() && message.response_code() != ResponseCode::NoError {
                debug!(
                    rcode = %message.response_code(),
                    "Accepting unsigned error response"
                );
                return Ok(DnsResponse::new(message, bytes.to_vec()));
            }
            warn!("TSIG verification failed: {}", err);
            Err(ProtoErrorKind::HmacInvalid().into())
        }
    })
}

/// HMAC-MD5 and HMAC-SHA1 keys
#[derive(Clone)]
pub struct LegacyHmacSigner(Arc<LegacyKey>);

struct LegacyKey {
    key: Vec<u8>,
    algorithm: TsigAlgorithm,
    signer_name: Name,
    fudge: u16,
}

impl LegacyHmacSigner {
    pub fn new(
        key: Vec<u8>,
        algorithm: TsigAlgorithm,
        signer_name: Name,
        fudge: u16,
    ) -> Result<Self, TsigError> {
        match algorithm {
            TsigAlgorithm::HmacMd5 | TsigAlgorithm::HmacSha1 => Ok(Self(Arc::new(LegacyKey {
                key,
                algorithm,
                signer_name,
                fudge,
            }))),
            other => Err(TsigError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn algorithm(&self) -> &TsigAlgorithm {
        &self.0.algorithm
    }

    pub fn signer_name(&self) -> &Name {
        &self.0.signer_name
    }

    pub fn fudge(&self) -> u16 {
        self.0.fudge
    }

    pub fn sign(&self, tbs: &[u8]) -> Result<Vec<u8>, TsigError> {
        match self.0.algorithm {
            TsigAlgorithm::HmacSha1 => compute_mac::<Hmac<Sha1>>(&self.0.key, tbs),
            _ => compute_mac::<Hmac<Md5>>(&self.0.key, tbs),
        }
    }

    /// Constant-time comparison of `tag` against the MAC of `tbv`
    pub fn verify(&self, tbv: &[u8], tag: &[u8]) -> Result<(), TsigError> {
        match self.0.algorithm {
            TsigAlgorithm::HmacSha1 => verify_mac::<Hmac<Sha1>>(&self.0.key, tbv, tag),
            _ => verify_mac::<Hmac<Md5>>(&self.0.key, tbv, tag),
        }
    }

    pub fn sign_message(&self, message: &Message, pre_tsig: &TSIG) -> ProtoResult<Vec<u8>> {
        let tbs = message_tbs(None, message, pre_tsig, &self.0.signer_name)?;
        self.sign(&tbs).map_err(proto_error)
    }

    /// Verify a signed message chained to `previous_hash`.
    ///
    /// Returns the message's MAC, the window its signing time allows and the
    /// signing time itself.
    pub fn verify_message_byte(
        &self,
        previous_hash: Option<&[u8]>,
        message: &[u8],
        first_message: bool,
    ) -> ProtoResult<(Vec<u8>, Range<u64>, u64)> {
        let (tbv, record) = signed_bitmessage_to_buf(previous_hash, message, first_message)?;
        let Some(RData::DNSSEC(DNSSECRData::TSIG(tsig))) = record.data() else {
            return Err(ProtoError::from("signature is not tsig"));
        };

        // Servers spell the MD5 name in lowercase, which hickory reads back as
        // an unknown algorithm. Names compare case-insensitively.
        if record.name() != &self.0.signer_name
            || tsig.algorithm().to_name() != self.0.algorithm.to_name()
        {
            return Err(ProtoErrorKind::TsigWrongKey.into());
        }

        self.verify(&tbv, tsig.mac()).map_err(proto_error)?;

        let fudge = u64::from(tsig.fudge());
        Ok((
            tsig.mac().to_vec(),
            tsig.time().saturating_sub(fudge)..tsig.time() + fudge,
            tsig.time(),
        ))
    }
}

impl MessageFinalizer for LegacyHmacSigner {
    fn finalize_message(
        &self,
        message: &Message,
        current_time: u32,
    ) -> ProtoResult<(Vec<Record>, Option<MessageVerifier>)> {
        let current_time = u64::from(current_time);
        let pre_tsig = TSIG::new(
            self.0.algorithm.clone(),
            current_time,
            self.0.fudge,
            Vec::new(),
            message.id(),
            0,
            Vec::new(),
        );
        let mut signature = self.sign_message(message, &pre_tsig)?;
        let tsig = make_tsig_record(
            self.0.signer_name.clone(),
            pre_tsig.set_mac(signature.clone()),
        );

        let signer = self.clone();
        let mut remote_time = 0;
        let verifier = move |response: &[u8]| {
            let (mac, window, time) =
                signer.verify_message_byte(Some(&signature), response, remote_time == 0)?;
            if time < remote_time || !window.contains(&current_time) {
                return Err(ProtoError::from("tsig validation error: outdated response"));
            }
            signature = mac;
            remote_time = time;
            Ok(DnsResponse::new(Message::from_vec(response)?, response.to_vec()))
        };

        Ok((vec![tsig], Some(Box::new(verifier))))
    }
}

fn compute_mac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TsigError> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| TsigError::InvalidSecret(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_mac<M: Mac + KeyInit>(key: &[u8], data: &[u8], expected: &[u8]) -> Result<(), TsigError> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| TsigError::InvalidSecret(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(expected)
        .map_err(|_| TsigError::BadSignature)
}

fn proto_error(err: TsigError) -> ProtoError {
    match err {
        TsigError::BadSignature => ProtoErrorKind::HmacInvalid().into(),
        other => ProtoError::from(other.to_string()),
    }
}
