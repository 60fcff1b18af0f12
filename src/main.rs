//! Token exchange service binary.
//!
//! Serves the RFC 8693 token exchange endpoint, a cascading revocation
//! endpoint and a health probe over HTTP. Token state, exchange policies
//! and the audit log are persisted in an embedded redb database.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use sts_exchange::clock::{Clock, SystemClock};
use sts_exchange::coordinator::{CoordinatorConfig, ExchangeCoordinator};
use sts_exchange::error::ExchangeError;
use sts_exchange::handler::{parse_exchange_request, resolve_client_credentials, ErrorResponse};
use sts_exchange::keys::{KeyConfig, SigningKeys};
use sts_exchange::parser::TokenParser;
use sts_exchange::registry::ClientRegistry;
use sts_exchange::revocation::RevocationPropagator;
use sts_exchange::store::{
    spawn_retention_task, ExchangePolicy, TokenStore, DEFAULT_RETENTION_GRACE_SECS,
    DEFAULT_RETENTION_INTERVAL_SECS,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "sts-exchange")]
#[command(about = "OAuth 2.0 token exchange service (RFC 8693)")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8080", env = "STS_LISTEN")]
    listen: SocketAddr,

    /// Path to the token database
    #[arg(
        long,
        default_value = "/var/lib/sts-exchange/tokens.redb",
        env = "STS_DB_PATH"
    )]
    db_path: PathBuf,

    /// Path to the client registry (JSON array)
    #[arg(long, env = "STS_CLIENTS_FILE")]
    clients_file: PathBuf,

    /// Path to an exchange policy file loaded into the store at startup
    #[arg(long, env = "STS_POLICIES_FILE")]
    policies_file: Option<PathBuf>,

    /// JWT secret key (for HS256)
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// JWT private key file (for RS256/ES256 signing)
    #[arg(long, env = "JWT_PRIVATE_KEY")]
    jwt_private_key: Option<PathBuf>,

    /// JWT public key file (for RS256/ES256 verification)
    #[arg(long, env = "JWT_PUBLIC_KEY")]
    jwt_public_key: Option<PathBuf>,

    /// JWT algorithm (HS256, RS256, ES256)
    #[arg(long, default_value = "HS256", env = "JWT_ALGORITHM")]
    jwt_algorithm: String,

    /// Issuer claim for issued tokens
    #[arg(long, default_value = "sts-exchange", env = "STS_ISSUER")]
    issuer: String,

    /// Maximum delegation chain depth
    #[arg(long, default_value_t = 5, env = "STS_MAX_CHAIN_DEPTH")]
    max_chain_depth: u32,

    /// Default issued-token TTL in seconds
    #[arg(long, default_value_t = 3600, env = "STS_DEFAULT_TTL_SECS")]
    default_ttl_secs: u64,

    /// Policy evaluation deadline in milliseconds
    #[arg(long, default_value_t = 500, env = "STS_POLICY_DEADLINE_MS")]
    policy_deadline_ms: u64,

    /// Policy decision cache TTL in seconds (0 disables)
    #[arg(long, default_value_t = 10, env = "STS_DECISION_CACHE_TTL_SECS")]
    decision_cache_ttl_secs: u64,

    /// Retention sweep interval in seconds
    #[arg(long, default_value_t = DEFAULT_RETENTION_INTERVAL_SECS, env = "STS_RETENTION_INTERVAL_SECS")]
    retention_interval_secs: u64,

    /// How long expired tokens are kept before eviction, in seconds
    #[arg(long, default_value_t = DEFAULT_RETENTION_GRACE_SECS, env = "STS_RETENTION_GRACE_SECS")]
    retention_grace_secs: u64,

    /// Enable verbose logging
    #[arg(short, long, env = "STS_VERBOSE")]
    verbose: bool,
}

struct AppState {
    coordinator: ExchangeCoordinator,
    propagator: RevocationPropagator,
    parser: TokenParser,
    registry: Arc<ClientRegistry>,
    store: Arc<TokenStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting token exchange service");

    let store = Arc::new(
        TokenStore::open(args.db_path.clone())
            .with_context(|| format!("Failed to open token store: {:?}", args.db_path))?,
    );
    let registry = Arc::new(ClientRegistry::from_file(&args.clients_file)?);
    if registry.is_empty() {
        warn!("Client registry is empty; every exchange will be rejected");
    }

    if let Some(path) = &args.policies_file {
        let count = load_policies(&store, path)?;
        info!(path = ?path, count, "Exchange policies loaded");
    }

    let keys = Arc::new(SigningKeys::from_config(&KeyConfig {
        algorithm: args.jwt_algorithm.clone(),
        secret: args.jwt_secret.clone(),
        private_key_path: args.jwt_private_key.clone(),
        public_key_path: args.jwt_public_key.clone(),
    })?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = CoordinatorConfig {
        issuer: args.issuer.clone(),
        max_chain_depth: args.max_chain_depth,
        default_token_ttl_secs: args.default_ttl_secs,
        policy_deadline_ms: args.policy_deadline_ms,
        decision_cache_ttl_secs: args.decision_cache_ttl_secs,
    };

    info!(
        issuer = %config.issuer,
        max_chain_depth = config.max_chain_depth,
        clients = registry.len(),
        tokens = store.token_count().unwrap_or(0),
        "Configuration loaded"
    );

    let state = Arc::new(AppState {
        coordinator: ExchangeCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&keys),
            Arc::clone(&clock),
            config,
        ),
        propagator: RevocationPropagator::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            args.max_chain_depth,
        ),
        parser: TokenParser::new(Arc::clone(&store), keys, Arc::clone(&clock)),
        registry,
        store: Arc::clone(&store),
    });

    let _retention_handle = spawn_retention_task(
        store,
        clock,
        args.retention_interval_secs,
        args.retention_grace_secs,
    );

    let app = Router::new()
        .route("/oauth/token", post(token_endpoint))
        .route("/oauth/revoke", post(revoke_endpoint))
        .route("/healthz", get(health_endpoint))
        .with_state(state);

    info!(listen = %args.listen, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn load_policies(store: &TokenStore, path: &PathBuf) -> Result<usize> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file: {:?}", path))?;
    let policies: Vec<ExchangePolicy> =
        serde_json::from_str(&data).context("Failed to parse policy file")?;
    let count = policies.len();
    for policy in policies {
        store.put_policy(policy)?;
    }
    Ok(count)
}

async fn token_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let request = match parse_exchange_request(&body) {
        Ok(r) => r,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(err)).into_response(),
    };

    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (client_id, client_secret) = match resolve_client_credentials(authorization, &request) {
        Ok(creds) => creds,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(err)).into_response(),
    };

    match state
        .coordinator
        .exchange(&client_id, &client_secret, &request)
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            let status = match err {
                ExchangeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            };
            (status, Json(ErrorResponse::from(&err))).into_response()
        }
    }
}

/// Revocation request (RFC 7009 form body).
#[derive(Debug, Deserialize)]
struct RevocationRequest {
    token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type_hint: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

async fn revoke_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let request: RevocationRequest = match serde_urlencoded::from_str(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = ErrorResponse::invalid_request(&format!("Invalid request body: {}", e));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let authenticated = match resolve_basic_or_form(authorization, &request) {
        Some((id, secret)) => state.registry.authenticate(&id, &secret).is_some(),
        None => false,
    };
    if !authenticated {
        let err = ErrorResponse {
            error: "invalid_client".to_string(),
            error_description: None,
        };
        return (StatusCode::UNAUTHORIZED, Json(err)).into_response();
    }

    // Per RFC 7009 an unknown or already revoked token is still a 200: the
    // caller only learns that the token is no longer usable.
    match state.parser.resolve_id(&request.token) {
        Some(id) => match state.propagator.revoke_cascade(id) {
            Ok(_) => StatusCode::OK.into_response(),
            Err(err) => {
                warn!(error = %err, "Revocation cascade failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::server_error()),
                )
                    .into_response()
            }
        },
        None => StatusCode::OK.into_response(),
    }
}

fn resolve_basic_or_form(
    authorization: Option<&str>,
    request: &RevocationRequest,
) -> Option<(String, String)> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    if let Some(encoded) = authorization.and_then(|h| {
        h.strip_prefix("Basic ")
            .or_else(|| h.strip_prefix("basic "))
    }) {
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let auth_str = String::from_utf8(decoded).ok()?;
        let (id, secret) = auth_str.split_once(':')?;
        return Some((id.to_string(), secret.to_string()));
    }

    match (&request.client_id, &request.client_secret) {
        (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
        _ => None,
    }
}

async fn health_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.token_count() {
        Ok(tokens) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "tokens": tokens })),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}
