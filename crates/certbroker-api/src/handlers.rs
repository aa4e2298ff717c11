use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use certbroker_auth::Identity;
use certbroker_cert::catalog;
use certbroker_cert::{IssueRequest, RevokeSelector, SmimeIssueRequest, SmimeRevokeSelector};
use certbroker_db::CertificateType;
use certbroker_dns::record::qualify;
use certbroker_dns::{DnsError, DnsRecord, DnsService, RecordChange};
use certbroker_domain::suffix::{is_same_or_descendant, normalize_fqdn};
use certbroker_domain::{access_context, ErrorKind};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{api_error, cert_error, dns_error, domain_error, ApiResult};
use crate::models::*;
use crate::AppState;

const DEFAULT_REVOKE_REASON: &str = "unspecified";

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

/// List the domains visible to the caller with their permissions
#[utoipa::path(
    get,
    path = "/api/domains",
    responses(
        (status = 200, description = "Visible domains", body = DomainList),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn list_domains(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
) -> ApiResult<Json<DomainList>> {
    debug!(user = %caller.user, "Listing domains");

    let domains: Vec<DomainDetail> = state
        .domains
        .list_domains(&caller.user)
        .await
        .map_err(domain_error)?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = domains.len();

    Ok(Json(DomainList { domains, total }))
}

/// Get one visible domain
#[utoipa::path(
    get,
    path = "/api/domains/{id}",
    params(
        ("id" = i32, Path, description = "Domain ID")
    ),
    responses(
        (status = 200, description = "Domain", body = DomainDetail),
        (status = 404, description = "Domain not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn get_domain(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<i32>,
) -> ApiResult<Json<DomainDetail>> {
    let entry = state
        .domains
        .get_domain(&caller.user, id)
        .await
        .map_err(domain_error)?;
    Ok(Json(entry.into()))
}

/// Register a domain. It is approved immediately when an approved domain of
/// the caller sits above it.
#[utoipa::path(
    post,
    path = "/api/domains",
    request_body = CreateDomainRequest,
    responses(
        (status = 201, description = "Domain registered", body = Domain),
        (status = 400, description = "Invalid domain name", body = ErrorResponse),
        (status = 409, description = "Domain already registered", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn create_domain(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<CreateDomainRequest>,
) -> ApiResult<(StatusCode, Json<Domain>)> {
    let domain = state
        .domains
        .create_domain(&caller.user, &req.fqdn)
        .await
        .map_err(domain_error)?;
    Ok((StatusCode::CREATED, Json(domain.into())))
}

#[utoipa::path(
    post,
    path = "/api/domains/{id}/approve",
    params(
        ("id" = i32, Path, description = "Domain ID")
    ),
    responses(
        (status = 200, description = "Domain approved", body = Domain),
        (status = 403, description = "Caller may not approve this domain", body = ErrorResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn approve_domain(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<i32>,
) -> ApiResult<Json<Domain>> {
    let domain = state
        .domains
        .approve(&caller.user, id)
        .await
        .map_err(domain_error)?;
    Ok(Json(domain.into()))
}

#[utoipa::path(
    post,
    path = "/api/domains/{id}/transfer",
    params(
        ("id" = i32, Path, description = "Domain ID")
    ),
    request_body = TransferDomainRequest,
    responses(
        (status = 200, description = "Domain transferred", body = Domain),
        (status = 403, description = "Caller may not transfer this domain", body = ErrorResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn transfer_domain(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<i32>,
    Json(req): Json<TransferDomainRequest>,
) -> ApiResult<Json<Domain>> {
    let domain = state
        .domains
        .transfer(&caller.user, id, &req.owner)
        .await
        .map_err(domain_error)?;
    Ok(Json(domain.into()))
}

#[utoipa::path(
    post,
    path = "/api/domains/{id}/delegations",
    params(
        ("id" = i32, Path, description = "Domain ID")
    ),
    request_body = CreateDelegationRequest,
    responses(
        (status = 201, description = "Delegation created", body = Delegation),
        (status = 403, description = "Caller may not delegate this domain", body = ErrorResponse),
        (status = 409, description = "Delegation already exists", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn add_delegation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<i32>,
    Json(req): Json<CreateDelegationRequest>,
) -> ApiResult<(StatusCode, Json<Delegation>)> {
    let delegation = state
        .domains
        .add_delegation(&caller.user, id, &req.user)
        .await
        .map_err(domain_error)?;
    Ok((StatusCode::CREATED, Json(delegation.into())))
}

#[utoipa::path(
    delete,
    path = "/api/domains/{id}/delegations/{delegation_id}",
    params(
        ("id" = i32, Path, description = "Domain ID"),
        ("delegation_id" = i32, Path, description = "Delegation ID")
    ),
    responses(
        (status = 204, description = "Delegation removed"),
        (status = 403, description = "Caller may not delegate this domain", body = ErrorResponse),
        (status = 404, description = "Delegation not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn remove_delegation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path((id, delegation_id)): Path<(i32, i32)>,
) -> ApiResult<StatusCode> {
    state
        .domains
        .remove_delegation(&caller.user, id, delegation_id)
        .await
        .map_err(domain_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete a domain, its delegations and its certificate links
#[utoipa::path(
    delete,
    path = "/api/domains/{id}",
    params(
        ("id" = i32, Path, description = "Domain ID")
    ),
    responses(
        (status = 204, description = "Domain deleted"),
        (status = 403, description = "Caller may not delete this domain", body = ErrorResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn delete_domain(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(id): Path<i32>,
) -> ApiResult<StatusCode> {
    info!(user = %caller.user, id, "Deleting domain");

    state
        .domains
        .delete_domain(&caller.user, id)
        .await
        .map_err(domain_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Whether the caller may request certificates for each name
#[utoipa::path(
    post,
    path = "/api/domains/check-permission",
    request_body = NamesRequest,
    responses(
        (status = 200, description = "Per-name result", body = PermissionResultList)
    ),
    tag = "domains"
)]
pub async fn check_permission(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<NamesRequest>,
) -> ApiResult<Json<PermissionResultList>> {
    let results = state
        .domains
        .check_permission(&caller.user, &req.fqdns)
        .await
        .map_err(domain_error)?;
    Ok(Json(PermissionResultList {
        results: results.into_iter().map(Into::into).collect(),
    }))
}

/// Whether each name is registered, and approved, by anyone
#[utoipa::path(
    post,
    path = "/api/domains/check-registration",
    request_body = NamesRequest,
    responses(
        (status = 200, description = "Per-name result", body = RegistrationResultList)
    ),
    tag = "domains"
)]
pub async fn check_registration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NamesRequest>,
) -> ApiResult<Json<RegistrationResultList>> {
    let results = state
        .domains
        .check_registration(&req.fqdns)
        .await
        .map_err(domain_error)?;
    Ok(Json(RegistrationResultList {
        results: results.into_iter().map(Into::into).collect(),
    }))
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

/// `name` qualified within `zone`, lowercased, without the trailing dot
fn absolute(name: &str, zone: &str) -> String {
    qualify(name, zone).trim_end_matches('.').to_ascii_lowercase()
}

/// Normalized zone the caller controls and the router serves, with every
/// record name inside it
async fn authorize_zone(
    state: &AppState,
    caller: &Identity,
    zone: &str,
    records: &[&DnsRecord],
) -> ApiResult<String> {
    let zone = normalize_fqdn(zone).map_err(domain_error)?;
    if state.dns.resolve(&zone).is_none() {
        return Err(dns_error(DnsError::NoZone(zone)));
    }

    let ctx = access_context(state.domains.db(), &caller.user)
        .await
        .map_err(domain_error)?;
    if !ctx.controls(&zone) {
        return Err(api_error(
            ErrorKind::Forbidden,
            format!("Forbidden: {} is not controlled by {}", zone, caller.user),
        ));
    }

    if let Some(outside) = records
        .iter()
        .find(|r| !is_same_or_descendant(&absolute(&r.name, &zone), &zone))
    {
        return Err(api_error(
            ErrorKind::Forbidden,
            format!("Forbidden: {} lies outside zone {}", outside.name, zone),
        ));
    }

    Ok(zone)
}

fn require_records<T>(items: &[T]) -> ApiResult<()> {
    if items.is_empty() {
        return Err(api_error(ErrorKind::InvalidInput, "Invalid input: no records given"));
    }
    Ok(())
}

/// Configured zones the caller controls
#[utoipa::path(
    get,
    path = "/api/dns/zones",
    responses(
        (status = 200, description = "Zones", body = ZoneList)
    ),
    tag = "dns"
)]
pub async fn list_zones(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
) -> ApiResult<Json<ZoneList>> {
    let ctx = access_context(state.domains.db(), &caller.user)
        .await
        .map_err(domain_error)?;
    let zones = state
        .dns
        .zones()
        .filter(|zone| ctx.controls(zone))
        .map(str::to_string)
        .collect();
    Ok(Json(ZoneList { zones }))
}

/// Records at or below `zone`, fetched by zone transfer
#[utoipa::path(
    get,
    path = "/api/dns/zones/{zone}/records",
    params(
        ("zone" = String, Path, description = "Zone, e.g. example.com")
    ),
    responses(
        (status = 200, description = "Zone records", body = RecordList),
        (status = 403, description = "Caller does not control the zone", body = ErrorResponse),
        (status = 404, description = "No configured zone contains the name", body = ErrorResponse),
        (status = 502, description = "Name server unavailable", body = ErrorResponse)
    ),
    tag = "dns"
)]
pub async fn list_records(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(zone): Path<String>,
) -> ApiResult<Json<RecordList>> {
    let zone = authorize_zone(&state, &caller, &zone, &[]).await?;

    // The configured zone may be larger than the one asked for
    let records = state
        .dns
        .list(&zone)
        .await
        .map_err(dns_error)?
        .into_iter()
        .filter(|r| is_same_or_descendant(&absolute(&r.name, &zone), &zone))
        .map(Into::into)
        .collect();

    Ok(Json(RecordList { zone, records }))
}

#[utoipa::path(
    post,
    path = "/api/dns/zones/{zone}/records",
    params(
        ("zone" = String, Path, description = "Zone, e.g. example.com")
    ),
    request_body = RecordsRequest,
    responses(
        (status = 204, description = "Records added"),
        (status = 400, description = "Malformed record", body = ErrorResponse),
        (status = 403, description = "Caller does not control the zone", body = ErrorResponse),
        (status = 502, description = "Name server refused the update", body = ErrorResponse)
    ),
    tag = "dns"
)]
pub async fn add_records(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(zone): Path<String>,
    Json(req): Json<RecordsRequest>,
) -> ApiResult<StatusCode> {
    require_records(&req.records)?;
    let records: Vec<DnsRecord> = req.records.into_iter().map(Into::into).collect();
    let refs: Vec<&DnsRecord> = records.iter().collect();
    let zone = authorize_zone(&state, &caller, &zone, &refs).await?;

    info!(user = %caller.user, zone = %zone, count = records.len(), "Adding DNS records");
    state.dns.add(&zone, &records).await.map_err(dns_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replace records. Removals are applied before insertions in one update.
#[utoipa::path(
    put,
    path = "/api/dns/zones/{zone}/records",
    params(
        ("zone" = String, Path, description = "Zone, e.g. example.com")
    ),
    request_body = UpdateRecordsRequest,
    responses(
        (status = 204, description = "Records replaced"),
        (status = 400, description = "Malformed record", body = ErrorResponse),
        (status = 403, description = "Caller does not control the zone", body = ErrorResponse),
        (status = 502, description = "Name server refused the update", body = ErrorResponse)
    ),
    tag = "dns"
)]
pub async fn update_records(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(zone): Path<String>,
    Json(req): Json<UpdateRecordsRequest>,
) -> ApiResult<StatusCode> {
    require_records(&req.changes)?;
    let changes: Vec<RecordChange> = req.changes.into_iter().map(Into::into).collect();
    let refs: Vec<&DnsRecord> = changes.iter().flat_map(|c| [&c.old, &c.new]).collect();
    let zone = authorize_zone(&state, &caller, &zone, &refs).await?;

    info!(user = %caller.user, zone = %zone, count = changes.len(), "Updating DNS records");
    state.dns.update(&zone, &changes).await.map_err(dns_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/dns/zones/{zone}/records",
    params(
        ("zone" = String, Path, description = "Zone, e.g. example.com")
    ),
    request_body = RecordsRequest,
    responses(
        (status = 204, description = "Records deleted"),
        (status = 403, description = "Caller does not control the zone", body = ErrorResponse),
        (status = 502, description = "Name server refused the update", body = ErrorResponse)
    ),
    tag = "dns"
)]
pub async fn delete_records(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(zone): Path<String>,
    Json(req): Json<RecordsRequest>,
) -> ApiResult<StatusCode> {
    require_records(&req.records)?;
    let records: Vec<DnsRecord> = req.records.into_iter().map(Into::into).collect();
    let refs: Vec<&DnsRecord> = records.iter().collect();
    let zone = authorize_zone(&state, &caller, &zone, &refs).await?;

    info!(user = %caller.user, zone = %zone, count = records.len(), "Deleting DNS records");
    state.dns.delete(&zone, &records).await.map_err(dns_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// SSL certificates
// ---------------------------------------------------------------------------

/// SSL certificates naming at least one domain visible to the caller
#[utoipa::path(
    get,
    path = "/api/certificates",
    responses(
        (status = 200, description = "Certificates, newest first", body = CertificateList)
    ),
    tag = "certificates"
)]
pub async fn list_certificates(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
) -> ApiResult<Json<CertificateList>> {
    let certificates: Vec<Certificate> = catalog::list_for_user(state.domains.db(), &caller.user)
        .await
        .map_err(cert_error)?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = certificates.len();

    Ok(Json(CertificateList {
        certificates,
        total,
    }))
}

#[utoipa::path(
    get,
    path = "/api/certificates/{serial}",
    params(
        ("serial" = String, Path, description = "Serial in hex, with or without colons")
    ),
    responses(
        (status = 200, description = "Certificate", body = Certificate),
        (status = 404, description = "Certificate not found", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn certificate_details(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(serial): Path<String>,
) -> ApiResult<Json<Certificate>> {
    let record = catalog::details(state.domains.db(), &serial)
        .await
        .map_err(cert_error)?;

    let visible = match record.certificate.certificate_type {
        CertificateType::Smime => caller
            .email
            .as_deref()
            .is_some_and(|email| email.eq_ignore_ascii_case(&record.certificate.common_name)),
        CertificateType::Ssl => {
            let ctx = access_context(state.domains.db(), &caller.user)
                .await
                .map_err(domain_error)?;
            record.domains.iter().any(|d| ctx.controls(d))
        }
    };
    if !visible {
        return Err(api_error(
            ErrorKind::NotFound,
            format!("Not found: certificate {}", serial),
        ));
    }

    Ok(Json(record.into()))
}

/// Issue a certificate and wait for the chain.
///
/// Every SAN must be covered by an approved domain of the caller.
#[utoipa::path(
    post,
    path = "/api/certificates",
    request_body = IssueCertificateRequest,
    responses(
        (status = 201, description = "Certificate issued", body = IssueCertificateResponse),
        (status = 400, description = "Invalid CSR or SAN list", body = ErrorResponse),
        (status = 403, description = "A SAN is not covered by the caller's domains", body = ErrorResponse),
        (status = 409, description = "Same CSR already in flight", body = ErrorResponse),
        (status = 502, description = "CA unavailable or declined", body = ErrorResponse),
        (status = 504, description = "CA did not issue in time", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn issue_certificate(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<IssueCertificateRequest>,
) -> ApiResult<(StatusCode, Json<IssueCertificateResponse>)> {
    let sans: Vec<String> = req
        .sans
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if sans.is_empty() {
        return Err(api_error(
            ErrorKind::InvalidInput,
            "Invalid input: at least one SAN is required",
        ));
    }
    state
        .domains
        .authorize_names(&caller.user, &sans)
        .await
        .map_err(domain_error)?;

    info!(user = %caller.user, sans = ?sans, "Issuing certificate");

    let issued = state
        .ssl
        .issue(
            IssueRequest {
                csr: req.csr,
                sans,
                issuer: caller.user.clone(),
                requester: caller.email.as_ref().map(|e| e.trim().to_ascii_lowercase()),
                source: "api".to_string(),
                comments: req.comments,
            },
            &state.shutdown.child_token(),
        )
        .await
        .map_err(cert_error)?;

    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// Revoke by serial, or every live certificate for a common name
#[utoipa::path(
    post,
    path = "/api/certificates/revoke",
    request_body = RevokeCertificateRequest,
    responses(
        (status = 200, description = "Certificates revoked", body = RevokeResponse),
        (status = 400, description = "Neither or both selectors given", body = ErrorResponse),
        (status = 403, description = "Caller does not control the names", body = ErrorResponse),
        (status = 404, description = "Certificate not found", body = ErrorResponse),
        (status = 502, description = "One or more revocations failed", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn revoke_certificate(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<RevokeCertificateRequest>,
) -> ApiResult<Json<RevokeResponse>> {
    let selector = match (req.serial, req.common_name) {
        (Some(serial), None) => {
            let record = catalog::details(state.domains.db(), &serial)
                .await
                .map_err(cert_error)?;
            if record.certificate.certificate_type != CertificateType::Ssl {
                return Err(api_error(
                    ErrorKind::NotFound,
                    format!("Not found: certificate {}", serial),
                ));
            }
            let names = if record.domains.is_empty() {
                vec![record.certificate.common_name.clone()]
            } else {
                record.domains
            };
            state
                .domains
                .authorize_names(&caller.user, &names)
                .await
                .map_err(domain_error)?;
            RevokeSelector::Serial(serial)
        }
        (None, Some(common_name)) => {
            state
                .domains
                .authorize_names(&caller.user, std::slice::from_ref(&common_name))
                .await
                .map_err(domain_error)?;
            RevokeSelector::CommonName(common_name)
        }
        _ => {
            return Err(api_error(
                ErrorKind::InvalidInput,
                "Invalid input: give exactly one of serial and common_name",
            ))
        }
    };
    let reason = req.reason.as_deref().unwrap_or(DEFAULT_REVOKE_REASON);

    info!(user = %caller.user, selector = ?selector, reason, "Revoking certificate");

    let outcome = state
        .ssl
        .revoke(&selector, reason, &state.shutdown.child_token())
        .await
        .map_err(cert_error)?;
    Ok(Json(outcome.into()))
}

// ---------------------------------------------------------------------------
// S/MIME certificates
// ---------------------------------------------------------------------------

fn caller_email(caller: &Identity) -> ApiResult<String> {
    caller
        .email
        .as_deref()
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| {
            api_error(
                ErrorKind::Forbidden,
                "Forbidden: the token carries no e-mail address",
            )
        })
}

/// First and last name from the request, else split from the token's name
fn holder_names(caller: &Identity, req: &IssueSmimeRequest) -> (String, String) {
    let (given, family) = caller
        .name
        .as_deref()
        .map(str::trim)
        .and_then(|n| n.split_once(' '))
        .map(|(f, l)| (f.to_string(), l.trim().to_string()))
        .unwrap_or_else(|| (caller.name.clone().unwrap_or_default(), String::new()));

    (
        req.first_name.clone().unwrap_or(given),
        req.last_name.clone().unwrap_or(family),
    )
}

/// The caller's S/MIME certificates
#[utoipa::path(
    get,
    path = "/api/smime",
    responses(
        (status = 200, description = "Certificates, newest first", body = CertificateList),
        (status = 403, description = "Token carries no e-mail address", body = ErrorResponse)
    ),
    tag = "smime"
)]
pub async fn list_smime(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
) -> ApiResult<Json<CertificateList>> {
    let email = caller_email(&caller)?;
    let certificates: Vec<Certificate> = state
        .smime
        .list(&email)
        .await
        .map_err(cert_error)?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = certificates.len();

    Ok(Json(CertificateList {
        certificates,
        total,
    }))
}

/// Issue an S/MIME certificate for the caller's e-mail address
#[utoipa::path(
    post,
    path = "/api/smime",
    request_body = IssueSmimeRequest,
    responses(
        (status = 201, description = "Certificate issued", body = IssueCertificateResponse),
        (status = 400, description = "Invalid CSR or names", body = ErrorResponse),
        (status = 403, description = "Token carries no e-mail address", body = ErrorResponse),
        (status = 502, description = "CA unavailable or declined", body = ErrorResponse),
        (status = 504, description = "CA did not issue in time", body = ErrorResponse)
    ),
    tag = "smime"
)]
pub async fn issue_smime(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<IssueSmimeRequest>,
) -> ApiResult<(StatusCode, Json<IssueCertificateResponse>)> {
    let email = caller_email(&caller)?;
    let (first_name, last_name) = holder_names(&caller, &req);

    info!(user = %caller.user, email = %email, "Issuing S/MIME certificate");

    let issued = state
        .smime
        .issue(
            SmimeIssueRequest {
                csr: req.csr,
                email,
                first_name,
                last_name,
                secondary_emails: req.secondary_emails,
                issuer: caller.user.clone(),
            },
            &state.shutdown.child_token(),
        )
        .await
        .map_err(cert_error)?;

    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// Revoke one of the caller's S/MIME certificates, or all of them
#[utoipa::path(
    post,
    path = "/api/smime/revoke",
    request_body = RevokeSmimeRequest,
    responses(
        (status = 200, description = "Certificates revoked", body = RevokeResponse),
        (status = 400, description = "Neither or both selectors given", body = ErrorResponse),
        (status = 404, description = "No such certificate for the caller", body = ErrorResponse),
        (status = 502, description = "One or more revocations failed", body = ErrorResponse)
    ),
    tag = "smime"
)]
pub async fn revoke_smime(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<RevokeSmimeRequest>,
) -> ApiResult<Json<RevokeResponse>> {
    let email = caller_email(&caller)?;
    let selector = match (req.serial, req.all) {
        (Some(serial), false) => {
            state
                .smime
                .owned_by(&serial, &email)
                .await
                .map_err(cert_error)?
                .ok_or_else(|| {
                    api_error(
                        ErrorKind::NotFound,
                        format!("Not found: certificate {}", serial),
                    )
                })?;
            SmimeRevokeSelector::Serial(serial)
        }
        (None, true) => SmimeRevokeSelector::Email(email),
        _ => {
            return Err(api_error(
                ErrorKind::InvalidInput,
                "Invalid input: give either serial or all",
            ))
        }
    };
    let reason = req.reason.as_deref().unwrap_or(DEFAULT_REVOKE_REASON);

    let outcome = state
        .smime
        .revoke(&selector, reason, &state.shutdown.child_token())
        .await
        .map_err(cert_error)?;
    Ok(Json(outcome.into()))
}

// ---------------------------------------------------------------------------
// EAB
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/eab",
    responses(
        (status = 200, description = "The caller's EAB keys", body = EabAccountList)
    ),
    tag = "eab"
)]
pub async fn list_eab(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
) -> ApiResult<Json<EabAccountList>> {
    let accounts: Vec<EabAccount> = state
        .eab
        .list(&caller.user)
        .await
        .map_err(domain_error)?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = accounts.len();

    Ok(Json(EabAccountList { accounts, total }))
}

/// Create an EAB key. The HMAC key is returned only once.
#[utoipa::path(
    post,
    path = "/api/eab",
    request_body = CreateEabRequest,
    responses(
        (status = 201, description = "Key created", body = EabCredentialsResponse)
    ),
    tag = "eab"
)]
pub async fn create_eab(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Json(req): Json<CreateEabRequest>,
) -> ApiResult<(StatusCode, Json<EabCredentialsResponse>)> {
    let credentials = state
        .eab
        .create(&caller.user, &req.comment)
        .await
        .map_err(domain_error)?;
    Ok((StatusCode::CREATED, Json(credentials.into())))
}

#[utoipa::path(
    delete,
    path = "/api/eab/{key_id}",
    params(
        ("key_id" = String, Path, description = "EAB key id")
    ),
    responses(
        (status = 204, description = "Key deleted"),
        (status = 404, description = "Key not found", body = ErrorResponse)
    ),
    tag = "eab"
)]
pub async fn delete_eab(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Identity>,
    Path(key_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .eab
        .delete(&caller.user, &key_id)
        .await
        .map_err(domain_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Record the ACME account a key was used to register
#[utoipa::path(
    post,
    path = "/api/eab/{key_id}/bind",
    params(
        ("key_id" = String, Path, description = "EAB key id")
    ),
    request_body = BindEabRequest,
    responses(
        (status = 200, description = "Key bound", body = EabAccount),
        (status = 404, description = "Key not found", body = ErrorResponse),
        (status = 409, description = "Key already bound to another account", body = ErrorResponse)
    ),
    tag = "eab"
)]
pub async fn bind_eab(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
    Json(req): Json<BindEabRequest>,
) -> ApiResult<Json<EabAccount>> {
    let account = state
        .eab
        .bind(&key_id, &req.account_url)
        .await
        .map_err(domain_error)?;
    Ok(Json(account.into()))
}

/// User behind an EAB key id or bound ACME account
#[utoipa::path(
    post,
    path = "/api/eab/resolve",
    request_body = ResolveAccountRequest,
    responses(
        (status = 200, description = "Owning user", body = ResolveAccountResponse),
        (status = 404, description = "Unknown account", body = ErrorResponse)
    ),
    tag = "eab"
)]
pub async fn resolve_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResolveAccountRequest>,
) -> ApiResult<Json<ResolveAccountResponse>> {
    let user = state
        .eab
        .resolve_account_id(&req.id)
        .await
        .map_err(domain_error)?;
    Ok(Json(ResolveAccountResponse { user }))
}

/// Whether the user behind an EAB account may obtain certificates for the names
#[utoipa::path(
    post,
    path = "/api/eab/check",
    request_body = CheckEabRequest,
    responses(
        (status = 200, description = "Permission result", body = EabPermissionResult),
        (status = 404, description = "Unknown account", body = ErrorResponse)
    ),
    tag = "eab"
)]
pub async fn check_eab(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckEabRequest>,
) -> ApiResult<Json<EabPermissionResult>> {
    let check = state
        .eab
        .check_eab_permissions(&req.id, &req.domains)
        .await
        .map_err(domain_error)?;
    Ok(Json(check.into()))
}
