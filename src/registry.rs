//! Registered-client lookup and authentication.
//!
//! The registry is an external collaborator of the exchange subsystem: it
//! only answers who a client is and which scopes it may ever hold. Client
//! registration and admin tooling live elsewhere.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// A registered OAuth client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: String,
    /// Upper bound on any scope this client can be granted.
    #[serde(default)]
    pub allowed_scopes: BTreeSet<String>,
}

/// In-memory client registry, loaded once at startup.
pub struct ClientRegistry {
    clients: HashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<RegisteredClient>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|c| (c.client_id.clone(), c))
                .collect(),
        }
    }

    /// Load a registry from a JSON array of clients.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read client registry: {:?}", path))?;
        let clients: Vec<RegisteredClient> =
            serde_json::from_str(&data).context("Failed to parse client registry")?;
        Ok(Self::new(clients))
    }

    pub fn get(&self, client_id: &str) -> Option<&RegisteredClient> {
        self.clients.get(client_id)
    }

    /// Authenticate a client by id and secret. Returns None for unknown
    /// clients and bad secrets alike, so callers cannot probe the registry.
    pub fn authenticate(&self, client_id: &str, client_secret: &str) -> Option<&RegisteredClient> {
        self.clients
            .get(client_id)
            .filter(|c| constant_time_eq(c.client_secret.as_bytes(), client_secret.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Byte-wise comparison that does not short-circuit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(vec![RegisteredClient {
            client_id: "client-a".to_string(),
            client_secret: "secret-a".to_string(),
            allowed_scopes: BTreeSet::from(["read".to_string(), "write".to_string()]),
        }])
    }

    #[test]
    fn test_authenticate() {
        let registry = registry();
        assert!(registry.authenticate("client-a", "secret-a").is_some());
        assert!(registry.authenticate("client-a", "wrong").is_none());
        assert!(registry.authenticate("client-b", "secret-a").is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        std::fs::write(
            &path,
            r#"[{"client_id":"svc","client_secret":"s","allowed_scopes":["read"]}]"#,
        )
        .unwrap();

        let registry = ClientRegistry::from_file(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("svc").unwrap().allowed_scopes.contains("read"));
    }
}
