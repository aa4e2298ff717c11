//! PEM parsing for CSRs and issued chains

use certbroker_db::normalize_serial;
use chrono::{DateTime, Utc};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};
use x509_parser::public_key::PublicKey;

use crate::error::{CertError, Result};

/// Smallest RSA modulus accepted in a CSR
pub const MIN_RSA_KEY_BITS: usize = 2048;

const CSR_LABELS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Fields of one certificate that the store keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    /// Normalized serial (lowercase hex, no separators)
    pub serial: String,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub emails: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// What a validated CSR asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub emails: Vec<String>,
    pub key_bits: usize,
}

fn invalid(message: impl Into<String>) -> CertError {
    CertError::InvalidInput(message.into())
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn collect_names(
    names: &[GeneralName<'_>],
    dns_names: &mut Vec<String>,
    emails: &mut Vec<String>,
) {
    for name in names {
        match name {
            GeneralName::DNSName(dns) => dns_names.push(dns.to_ascii_lowercase()),
            GeneralName::RFC822Name(email) => emails.push(email.to_string()),
            _ => {}
        }
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| invalid(format!("certificate time {} out of range", seconds)))
}

/// Validate a PEM CSR: well-formed, signature valid, RSA of at least
/// `min_key_bits`.
pub fn validate_csr(pem: &str, min_key_bits: usize) -> Result<CsrInfo> {
    let block = Pem::iter_from_buffer(pem.trim().as_bytes())
        .next()
        .ok_or_else(|| invalid("CSR is not PEM encoded"))?
        .map_err(|e| invalid(format!("CSR is not valid PEM: {}", e)))?;
    if !CSR_LABELS.contains(&block.label.as_str()) {
        return Err(invalid(format!("expected a CERTIFICATE REQUEST, got {}", block.label)));
    }

    let (_, csr) = X509CertificationRequest::from_der(&block.contents)
        .map_err(|e| invalid(format!("CSR could not be parsed: {}", e)))?;
    csr.verify_signature()
        .map_err(|e| invalid(format!("CSR signature is invalid: {}", e)))?;

    let info = &csr.certification_request_info;
    let key_bits = match info.subject_pki.parsed() {
        Ok(PublicKey::RSA(rsa)) => rsa.key_size(),
        Ok(_) => return Err(invalid("CSR key must be RSA")),
        Err(e) => return Err(invalid(format!("CSR public key is invalid: {}", e))),
    };
    if key_bits < min_key_bits {
        return Err(invalid(format!(
            "CSR key is {} bits, at least {} required",
            key_bits, min_key_bits
        )));
    }

    let mut dns_names = Vec::new();
    let mut emails = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                collect_names(&san.general_names, &mut dns_names, &mut emails);
            }
        }
    }

    Ok(CsrInfo {
        common_name: common_name(&info.subject),
        dns_names,
        emails,
        key_bits,
    })
}

/// Whitespace-insensitive form of a PEM document, used to spot resubmissions
pub fn canonical_pem(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_one(cert: &X509Certificate<'_>) -> Result<ParsedCertificate> {
    let mut dns_names = Vec::new();
    let mut emails = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        collect_names(&san.value.general_names, &mut dns_names, &mut emails);
    }

    let validity = cert.validity();
    Ok(ParsedCertificate {
        serial: normalize_serial(&cert.raw_serial_as_string()),
        common_name: common_name(cert.subject()),
        dns_names,
        emails,
        issuer: cert.issuer().to_string(),
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
    })
}

/// Every certificate of a PEM bundle, in file order
pub fn parse_certificates(pem: &str) -> Result<Vec<ParsedCertificate>> {
    let mut parsed = Vec::new();
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| invalid(format!("invalid PEM block: {}", e)))?;
        if block.label != "CERTIFICATE" {
            continue;
        }
        let cert = block
            .parse_x509()
            .map_err(|e| invalid(format!("invalid certificate: {}", e)))?;
        parsed.push(parse_one(&cert)?);
    }
    Ok(parsed)
}

/// The first certificate of a chain
pub fn parse_leaf(pem: &str) -> Result<ParsedCertificate> {
    parse_certificates(pem)?
        .into_iter()
        .next()
        .ok_or_else(|| invalid("no certificate in PEM"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSR_RSA2048: &str = include_str!("../tests/fixtures/csr_rsa2048.pem");
    const CSR_RSA1024: &str = include_str!("../tests/fixtures/csr_rsa1024.pem");
    const CSR_EC: &str = include_str!("../tests/fixtures/csr_ec.pem");
    const CHAIN: &str = include_str!("../tests/fixtures/chain.pem");

    #[test]
    fn test_validate_rsa2048_csr() {
        let info = validate_csr(CSR_RSA2048, MIN_RSA_KEY_BITS).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("www.example.com"));
        assert_eq!(info.dns_names, vec!["www.example.com", "example.com"]);
        assert_eq!(info.key_bits, 2048);
    }

    #[test]
    fn test_small_rsa_key_rejected() {
        let err = validate_csr(CSR_RSA1024, MIN_RSA_KEY_BITS).unwrap_err();
        assert!(matches!(err, CertError::InvalidInput(ref m) if m.contains("1024")));
        assert!(validate_csr(CSR_RSA1024, 1024).is_ok());
    }

    #[test]
    fn test_ec_key_rejected() {
        let err = validate_csr(CSR_EC, MIN_RSA_KEY_BITS).unwrap_err();
        assert!(matches!(err, CertError::InvalidInput(ref m) if m.contains("RSA")));
    }

    #[test]
    fn test_malformed_csr_rejected() {
        assert!(validate_csr("", MIN_RSA_KEY_BITS).is_err());
        assert!(validate_csr("not a csr", MIN_RSA_KEY_BITS).is_err());
        // A certificate is not a request
        assert!(validate_csr(CHAIN, MIN_RSA_KEY_BITS).is_err());

        let garbled = CSR_RSA2048.replacen("MII", "MIJ", 1);
        assert!(validate_csr(&garbled, MIN_RSA_KEY_BITS).is_err());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        // Flip one character inside the base64 body, past the header
        let lines: Vec<&str> = CSR_RSA2048.lines().collect();
        let mut tampered: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        let target = lines.len() / 2;
        let flipped: String = tampered[target]
            .chars()
            .enumerate()
            .map(|(i, c)| if i == 10 { if c == 'A' { 'B' } else { 'A' } } else { c })
            .collect();
        tampered[target] = flipped;

        assert!(validate_csr(&tampered.join("\n"), MIN_RSA_KEY_BITS).is_err());
    }

    #[test]
    fn test_parse_chain_in_order() {
        let certs = parse_certificates(CHAIN).unwrap();
        assert_eq!(certs.len(), 4);

        let names: Vec<Option<&str>> = certs.iter().map(|c| c.common_name.as_deref()).collect();
        assert_eq!(
            names,
            vec![
                Some("www.example.com"),
                Some("Test Intermediate 2"),
                Some("Test Intermediate 1"),
                Some("Test Root CA"),
            ]
        );

        let leaf = &certs[0];
        assert_eq!(leaf.serial, "7d2a9f0c11e4b3a85c6d0e1f22334455");
        assert_eq!(leaf.dns_names, vec!["www.example.com", "example.com"]);
        assert!(leaf.not_before < leaf.not_after);
        assert_eq!(parse_leaf(CHAIN).unwrap(), *leaf);
    }

    #[test]
    fn test_parse_empty_bundle() {
        assert!(parse_certificates("").unwrap().is_empty());
        assert!(parse_leaf("").is_err());
    }

    #[test]
    fn test_canonical_pem() {
        let messy = format!("\n  {}  \n\n", CSR_RSA2048.replace('\n', "\r\n"));
        assert_eq!(canonical_pem(&messy), canonical_pem(CSR_RSA2048));
    }
}
