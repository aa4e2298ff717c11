//! JSON/HTTP surface of the certificate broker
//!
//! Exposes the domain, DNS, SSL, S/MIME and EAB services behind bearer token
//! authentication, with OpenAPI docs served at `/api/openapi.json`.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use certbroker_auth::JwtValidator;
use certbroker_ca::CertificateAuthority;
use certbroker_cert::{CancellationToken, CertificateOrchestrator, IssuanceSettings, SmimeOrchestrator};
use certbroker_dns::ZoneRouter;
use certbroker_domain::{DomainService, EabService};
use sea_orm::DatabaseConnection;

/// Application state shared across handlers
pub struct AppState {
    pub domains: DomainService,
    pub eab: EabService,
    pub dns: ZoneRouter,
    pub ssl: CertificateOrchestrator,
    pub smime: SmimeOrchestrator,
    /// Parent of every per-request token. Cancelled on shutdown so that
    /// requests waiting on the CA return promptly.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        ca: Arc<dyn CertificateAuthority>,
        dns: ZoneRouter,
        settings: IssuanceSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            domains: DomainService::new(db.clone()),
            eab: EabService::new(db.clone()),
            dns,
            ssl: CertificateOrchestrator::new(db.clone(), Arc::clone(&ca), settings.clone()),
            smime: SmimeOrchestrator::new(db, ca, settings),
            shutdown,
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Certbroker API",
        version = "0.1.0",
        description = "Domain authorization, DNS zone management and certificate issuance"
    ),
    paths(
        handlers::health_check,
        handlers::list_domains,
        handlers::get_domain,
        handlers::create_domain,
        handlers::approve_domain,
        handlers::transfer_domain,
        handlers::add_delegation,
        handlers::remove_delegation,
        handlers::delete_domain,
        handlers::check_permission,
        handlers::check_registration,
        handlers::list_zones,
        handlers::list_records,
        handlers::add_records,
        handlers::update_records,
        handlers::delete_records,
        handlers::list_certificates,
        handlers::certificate_details,
        handlers::issue_certificate,
        handlers::revoke_certificate,
        handlers::list_smime,
        handlers::issue_smime,
        handlers::revoke_smime,
        handlers::list_eab,
        handlers::create_eab,
        handlers::delete_eab,
        handlers::bind_eab,
        handlers::resolve_account,
        handlers::check_eab,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            models::Domain,
            models::DomainPermissions,
            models::Delegation,
            models::DomainDetail,
            models::DomainList,
            models::CreateDomainRequest,
            models::TransferDomainRequest,
            models::CreateDelegationRequest,
            models::NamesRequest,
            models::PermissionResult,
            models::PermissionResultList,
            models::RegistrationResult,
            models::RegistrationResultList,
            models::Record,
            models::RecordList,
            models::RecordsRequest,
            models::RecordUpdate,
            models::UpdateRecordsRequest,
            models::ZoneList,
            models::Certificate,
            models::CertificateList,
            models::IssueCertificateRequest,
            models::IssueCertificateResponse,
            models::RevokeCertificateRequest,
            models::RevokeResponse,
            models::IssueSmimeRequest,
            models::RevokeSmimeRequest,
            models::CreateEabRequest,
            models::EabCredentialsResponse,
            models::EabAccount,
            models::EabAccountList,
            models::BindEabRequest,
            models::ResolveAccountRequest,
            models::ResolveAccountResponse,
            models::CheckEabRequest,
            models::EabPermissionResult,
        )
    ),
    tags(
        (name = "domains", description = "Domain registration, approval and delegation"),
        (name = "dns", description = "Record management in the configured zones"),
        (name = "certificates", description = "SSL certificate issuance and revocation"),
        (name = "smime", description = "S/MIME certificates for the caller's e-mail address"),
        (name = "eab", description = "ACME external account binding keys"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Allow browser origins on localhost (for development)
    pub enable_cors: bool,
    /// HS256 secret the bearer tokens are signed with
    pub jwt_secret: String,
    /// Required `iss` claim, if any
    pub jwt_issuer: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
            jwt_secret: String::new(),
            jwt_issuer: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let mut validator = JwtValidator::new(self.config.jwt_secret.as_bytes());
        if let Some(issuer) = &self.config.jwt_issuer {
            validator = validator.with_issuer(issuer.clone());
        }
        let jwt_state = Arc::new(middleware::JwtState::new(validator));

        let public_router = Router::new().route("/api/health", get(handlers::health_check));

        let protected_router = Router::new()
            .route(
                "/api/domains",
                get(handlers::list_domains).post(handlers::create_domain),
            )
            .route(
                "/api/domains/check-permission",
                post(handlers::check_permission),
            )
            .route(
                "/api/domains/check-registration",
                post(handlers::check_registration),
            )
            .route(
                "/api/domains/{id}",
                get(handlers::get_domain).delete(handlers::delete_domain),
            )
            .route("/api/domains/{id}/approve", post(handlers::approve_domain))
            .route("/api/domains/{id}/transfer", post(handlers::transfer_domain))
            .route(
                "/api/domains/{id}/delegations",
                post(handlers::add_delegation),
            )
            .route(
                "/api/domains/{id}/delegations/{delegation_id}",
                delete(handlers::remove_delegation),
            )
            .route("/api/dns/zones", get(handlers::list_zones))
            .route(
                "/api/dns/zones/{zone}/records",
                get(handlers::list_records)
                    .post(handlers::add_records)
                    .put(handlers::update_records)
                    .delete(handlers::delete_records),
            )
            .route(
                "/api/certificates",
                get(handlers::list_certificates).post(handlers::issue_certificate),
            )
            .route(
                "/api/certificates/revoke",
                post(handlers::revoke_certificate),
            )
            .route(
                "/api/certificates/{serial}",
                get(handlers::certificate_details),
            )
            .route(
                "/api/smime",
                get(handlers::list_smime).post(handlers::issue_smime),
            )
            .route("/api/smime/revoke", post(handlers::revoke_smime))
            .route(
                "/api/eab",
                get(handlers::list_eab).post(handlers::create_eab),
            )
            .route("/api/eab/resolve", post(handlers::resolve_account))
            .route("/api/eab/check", post(handlers::check_eab))
            .route("/api/eab/{key_id}", delete(handlers::delete_eab))
            .route("/api/eab/{key_id}/bind", post(handlers::bind_eab))
            .layer(axum_middleware::from_fn_with_state(
                jwt_state,
                middleware::require_auth,
            ));

        let api_router = public_router
            .merge(protected_router)
            .with_state(self.state.clone());

        // SwaggerUi automatically creates a route for /api/openapi.json
        let mut router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(api_router)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            use tower_http::cors::AllowOrigin;

            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
                    let origin = origin.to_str().unwrap_or("");
                    origin.starts_with("http://localhost:")
                        || origin.starts_with("http://127.0.0.1:")
                        || origin.starts_with("https://localhost:")
                        || origin.starts_with("https://127.0.0.1:")
                }));
            router = router.layer(cors);
        }

        router
    }

    /// Serve until the shutdown token fires
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        let shutdown = self.state.shutdown.clone();

        info!("Starting API server on {}", self.config.bind_addr);
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}
