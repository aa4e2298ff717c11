//! reqwest client for the CA REST API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::CaError;
use crate::types::*;
use crate::CertificateAuthority;

const DEFAULT_BASE_URL: &str = "https://cert-manager.com/api";
const TOTAL_COUNT_HEADER: &str = "X-Total-Count";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings and enrollment profiles for the CA
#[derive(Clone, Serialize, Deserialize)]
pub struct CaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    pub login: String,

    #[serde(default)]
    pub password: String,

    /// Tenant identifier sent as `customerUri`
    pub customer_uri: String,

    #[serde(default)]
    pub ssl: EnrollmentProfile,

    #[serde(default)]
    pub smime: EnrollmentProfile,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for CaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaConfig")
            .field("base_url", &self.base_url)
            .field("login", &self.login)
            .field("customer_uri", &self.customer_uri)
            .field("ssl", &self.ssl)
            .field("smime", &self.smime)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    description: String,
}

/// Authenticated HTTP client for the CA
#[derive(Debug, Clone)]
pub struct HttpCaClient {
    client: Client,
    config: CaConfig,
}

impl HttpCaClient {
    pub fn new(config: CaConfig) -> Result<Self, CaError> {
        if config.login.is_empty() || config.customer_uri.is_empty() {
            return Err(CaError::Configuration(
                "login and customer_uri are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CaError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        trace!(%method, %url, "CA request");

        self.client
            .request(method, url)
            .header("login", &self.config.login)
            .header("password", &self.config.password)
            .header("customerUri", &self.config.customer_uri)
    }

    /// Send and turn non-success statuses into [`CaError::Api`]
    async fn send(&self, request: RequestBuilder) -> Result<Response, CaError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, description) = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => (err.code, err.description),
            Err(_) => (
                0,
                status.canonical_reason().unwrap_or("unknown error").to_string(),
            ),
        };

        debug!(status = status.as_u16(), code, "CA returned error: {}", description);
        Err(CaError::Api {
            status: status.as_u16(),
            code,
            description,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CaError> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| CaError::Decode(e.to_string()))
    }

    async fn send_text(&self, request: RequestBuilder) -> Result<String, CaError> {
        Ok(self.send(request).await?.text().await?)
    }
}

#[async_trait]
impl CertificateAuthority for HttpCaClient {
    async fn enroll_ssl(&self, request: &SslEnrollRequest) -> Result<SslEnrollResponse, CaError> {
        self.send_json(self.request(Method::POST, "/ssl/v1/enroll").json(request))
            .await
    }

    async fn collect_ssl(&self, ssl_id: i64) -> Result<String, CaError> {
        // x509 is the full chain, leaf first
        self.send_text(self.request(Method::GET, &format!("/ssl/v1/collect/{}/x509", ssl_id)))
            .await
    }

    async fn revoke_ssl(&self, ssl_id: i64, reason: &str) -> Result<(), CaError> {
        let body = RevokeRequest {
            reason: reason.to_string(),
        };
        self.send(
            self.request(Method::POST, &format!("/ssl/v1/revoke/{}", ssl_id))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn revoke_ssl_by_serial(&self, serial: &str, reason: &str) -> Result<(), CaError> {
        let body = RevokeRequest {
            reason: reason.to_string(),
        };
        self.send(
            self.request(Method::POST, &format!("/ssl/v1/revoke/serial/{}", serial))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_ssl(&self, size: u32, position: u32) -> Result<SslPage, CaError> {
        let response = self
            .send(
                self.request(Method::GET, "/ssl/v1")
                    .query(&[("size", size), ("position", position)]),
            )
            .await?;

        let total = response
            .headers()
            .get(TOTAL_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let items: Vec<SslListItem> = response
            .json()
            .await
            .map_err(|e| CaError::Decode(e.to_string()))?;

        Ok(SslPage { items, total })
    }

    async fn ssl_details(&self, ssl_id: i64) -> Result<SslCertificateDetails, CaError> {
        self.send_json(self.request(Method::GET, &format!("/ssl/v1/{}", ssl_id)))
            .await
    }

    async fn find_ssl_by_serial(&self, serial: &str) -> Result<Option<SslListItem>, CaError> {
        let items: Vec<SslListItem> = self
            .send_json(
                self.request(Method::GET, "/ssl/v1")
                    .query(&[("serialNumber", serial)]),
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn enroll_smime(&self, request: &SmimeEnrollRequest) -> Result<SmimeEnrollResponse, CaError> {
        self.send_json(self.request(Method::POST, "/smime/v2/enroll").json(request))
            .await
    }

    async fn collect_smime(&self, backend_cert_id: &str) -> Result<String, CaError> {
        self.send_text(
            self.request(Method::GET, &format!("/smime/v2/collect/{}", backend_cert_id))
                .query(&[("format", "x509")]),
        )
        .await
    }

    async fn revoke_smime_by_serial(&self, serial: &str, reason: &str) -> Result<(), CaError> {
        let body = RevokeRequest {
            reason: reason.to_string(),
        };
        self.send(
            self.request(Method::POST, &format!("/smime/v2/revoke/serial/{}", serial))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_dcv(&self, size: u32, position: u32) -> Result<Vec<DcvValidation>, CaError> {
        self.send_json(
            self.request(Method::GET, "/dcv/v2/validation")
                .query(&[("size", size), ("position", position)]),
        )
        .await
    }

    async fn start_cname_validation(&self, domain: &str) -> Result<CnameChallenge, CaError> {
        self.send_json(
            self.request(Method::POST, "/dcv/v1/validation/start/domain/cname")
                .json(&DomainRequest { domain }),
        )
        .await
    }

    async fn submit_cname_validation(&self, domain: &str) -> Result<DcvSubmitResult, CaError> {
        self.send_json(
            self.request(Method::POST, "/dcv/v1/validation/submit/domain/cname")
                .json(&DomainRequest { domain }),
        )
        .await
    }

    async fn dcv_status(&self, domain: &str) -> Result<DcvStatus, CaError> {
        self.send_json(
            self.request(Method::POST, "/dcv/v2/validation/status")
                .json(&DomainRequest { domain }),
        )
        .await
    }
}
