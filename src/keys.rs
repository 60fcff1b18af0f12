//! Signing key material for token issuance and verification.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Key configuration: inline secret (symmetric) or PEM files (asymmetric).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// Signing algorithm (HS256, HS384, HS512, RS256, RS384, RS512, ES256, ES384).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Inline symmetric secret (HS*). May be base64 or raw.
    #[serde(default)]
    pub secret: Option<String>,

    /// Path to private key PEM (RS*/ES*).
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Path to public key PEM (RS*/ES*).
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            secret: None,
            private_key_path: None,
            public_key_path: None,
        }
    }
}

/// Loaded key pair used to sign issued tokens and verify presented ones.
pub struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
}

impl SigningKeys {
    /// Load keys according to the configuration.
    pub fn from_config(config: &KeyConfig) -> Result<Self> {
        let algorithm = parse_algorithm(&config.algorithm)?;

        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config
                    .secret
                    .as_deref()
                    .ok_or_else(|| anyhow!("{} requires an inline secret", config.algorithm))?;
                let bytes = decode_symmetric_secret(secret);
                Ok(Self {
                    encoding: EncodingKey::from_secret(&bytes),
                    decoding: DecodingKey::from_secret(&bytes),
                    algorithm,
                })
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let (private_pem, public_pem) = read_pem_pair(config)?;
                Ok(Self {
                    encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes())
                        .context("Failed to parse RSA private key")?,
                    decoding: DecodingKey::from_rsa_pem(public_pem.as_bytes())
                        .context("Failed to parse RSA public key")?,
                    algorithm,
                })
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let (private_pem, public_pem) = read_pem_pair(config)?;
                Ok(Self {
                    encoding: EncodingKey::from_ec_pem(private_pem.as_bytes())
                        .context("Failed to parse EC private key")?,
                    decoding: DecodingKey::from_ec_pem(public_pem.as_bytes())
                        .context("Failed to parse EC public key")?,
                    algorithm,
                })
            }
            _ => Err(anyhow!("Unsupported algorithm: {}", config.algorithm)),
        }
    }

    pub fn encoding(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding(&self) -> &DecodingKey {
        &self.decoding
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

fn read_pem_pair(config: &KeyConfig) -> Result<(String, String)> {
    let private_path = config
        .private_key_path
        .as_ref()
        .ok_or_else(|| anyhow!("{} requires private_key_path", config.algorithm))?;
    let public_path = config
        .public_key_path
        .as_ref()
        .ok_or_else(|| anyhow!("{} requires public_key_path", config.algorithm))?;

    let private_pem = std::fs::read_to_string(private_path)
        .with_context(|| format!("Failed to read private key: {:?}", private_path))?;
    let public_pem = std::fs::read_to_string(public_path)
        .with_context(|| format!("Failed to read public key: {:?}", public_path))?;

    Ok((private_pem, public_pem))
}

/// Parse algorithm string to jsonwebtoken Algorithm.
pub fn parse_algorithm(alg: &str) -> Result<Algorithm> {
    match alg.to_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        _ => Err(anyhow!("Unsupported algorithm: {}", alg)),
    }
}

/// Symmetric secrets may arrive base64-encoded or raw.
fn decode_symmetric_secret(secret: &str) -> Vec<u8> {
    let secret = secret.trim();
    let looks_base64 = secret
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=');
    if looks_base64 {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD
            .decode(secret)
            .unwrap_or_else(|_| secret.as_bytes().to_vec())
    } else {
        secret.as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_algorithm() {
        assert!(matches!(parse_algorithm("HS256"), Ok(Algorithm::HS256)));
        assert!(matches!(parse_algorithm("rs256"), Ok(Algorithm::RS256)));
        assert!(matches!(parse_algorithm("ES256"), Ok(Algorithm::ES256)));
        assert!(parse_algorithm("NONE").is_err());
    }

    #[test]
    fn test_symmetric_keys_from_config() {
        let config = KeyConfig {
            algorithm: "HS256".to_string(),
            secret: Some("a-test-secret-long-enough-for-hs256".to_string()),
            ..Default::default()
        };
        let keys = SigningKeys::from_config(&config).unwrap();
        assert_eq!(keys.algorithm(), Algorithm::HS256);
    }

    #[test]
    fn test_symmetric_requires_secret() {
        let config = KeyConfig {
            algorithm: "HS256".to_string(),
            secret: None,
            ..Default::default()
        };
        assert!(SigningKeys::from_config(&config).is_err());
    }

    #[test]
    fn test_asymmetric_requires_key_paths() {
        let config = KeyConfig {
            algorithm: "RS256".to_string(),
            ..Default::default()
        };
        assert!(SigningKeys::from_config(&config).is_err());
    }
}
