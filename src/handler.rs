//! Token exchange endpoint types (RFC 8693).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// Token exchange grant type (RFC 8693).
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Token exchange request (form-urlencoded body).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenExchangeRequest {
    /// Must be "urn:ietf:params:oauth:grant-type:token-exchange".
    pub grant_type: String,
    /// The subject token to exchange.
    pub subject_token: String,
    /// Type of the subject token (URN).
    pub subject_token_type: String,
    /// Actor token (for delegation).
    #[serde(default)]
    pub actor_token: Option<String>,
    /// Actor token type.
    #[serde(default)]
    pub actor_token_type: Option<String>,
    /// Requested token type (optional, defaults to access_token).
    #[serde(default)]
    pub requested_token_type: Option<String>,
    /// Target audience for the new token.
    #[serde(default)]
    pub audience: Option<String>,
    /// Target resource.
    #[serde(default)]
    pub resource: Option<String>,
    /// Requested scopes, space-delimited.
    #[serde(default)]
    pub scope: Option<String>,
    /// Client id (when not using Basic auth).
    #[serde(default)]
    pub client_id: Option<String>,
    /// Client secret (when not using Basic auth).
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Token exchange success response (JSON).
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenExchangeResponse {
    /// The issued token.
    pub access_token: String,
    /// Type of token issued (URN).
    pub issued_token_type: String,
    /// Token type (always "Bearer").
    pub token_type: String,
    /// Expires in seconds.
    pub expires_in: u64,
    /// Granted scope; may be narrower than requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// OAuth error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    pub fn invalid_request(desc: &str) -> Self {
        Self {
            error: "invalid_request".to_string(),
            error_description: Some(desc.to_string()),
        }
    }

    pub fn server_error() -> Self {
        Self {
            error: "server_error".to_string(),
            error_description: None,
        }
    }
}

impl From<&ExchangeError> for ErrorResponse {
    /// External mapping. Deliberately coarse: internal denial detail stays
    /// in the audit log.
    fn from(err: &ExchangeError) -> Self {
        let description = match err {
            ExchangeError::Validation(msg) => Some(msg.clone()),
            ExchangeError::Storage(_) => None,
            _ => Some("The token exchange request was rejected".to_string()),
        };
        Self {
            error: err.oauth_code().to_string(),
            error_description: description,
        }
    }
}

/// Parse a form-urlencoded request body.
pub fn parse_exchange_request(body: &str) -> Result<TokenExchangeRequest, ErrorResponse> {
    serde_urlencoded::from_str(body)
        .map_err(|e| ErrorResponse::invalid_request(&format!("Invalid request body: {}", e)))
}

/// Resolve client credentials from an HTTP Basic `Authorization` header or
/// from the `client_id`/`client_secret` form fields. Basic auth wins when
/// both are present (RFC 6749 §2.3.1).
pub fn resolve_client_credentials(
    authorization: Option<&str>,
    request: &TokenExchangeRequest,
) -> Result<(String, String), ErrorResponse> {
    if let Some(header) = authorization {
        if let Some(encoded) = header
            .strip_prefix("Basic ")
            .or_else(|| header.strip_prefix("basic "))
        {
            let decoded = BASE64
                .decode(encoded.trim())
                .map_err(|_| ErrorResponse::invalid_request("Invalid Basic auth encoding"))?;
            let auth_str = String::from_utf8(decoded)
                .map_err(|_| ErrorResponse::invalid_request("Invalid Basic auth encoding"))?;
            let (id, secret) = auth_str
                .split_once(':')
                .ok_or_else(|| ErrorResponse::invalid_request("Invalid Basic auth format"))?;
            return Ok((id.to_string(), secret.to_string()));
        }
    }

    match (&request.client_id, &request.client_secret) {
        (Some(id), Some(secret)) => Ok((id.clone(), secret.clone())),
        _ => Err(ErrorResponse::invalid_request(
            "Missing client authentication",
        )),
    }
}
