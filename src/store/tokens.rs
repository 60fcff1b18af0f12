//! Token store backed by redb embedded database.
//!
//! Holds the token records, the parent→children index of the derived-token
//! forest, the exchange policies, and the append-only audit log. All four
//! tables live in one database so issuance can commit a token row and its
//! audit entry in a single write transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableTable,
    ReadableTableMetadata, TableDefinition,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{ExchangeLogEntry, ExchangePolicy, TokenId, TokenRecord};

/// redb table for tokens (key: token id, value: MessagePack bytes).
const TOKENS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tokens");

/// redb multimap for the forest index (key: parent id, value: child id).
const CHILDREN_TABLE: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("token_children");

/// redb table for exchange policies (key: policy id, value: MessagePack bytes).
const POLICIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("exchange_policies");

/// redb table for audit entries (key: sequence number, value: MessagePack bytes).
const AUDIT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("exchange_audit");

/// Result of a compare-and-set revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeStatus {
    /// The flag was flipped by this call.
    Revoked,
    /// The token was already revoked; nothing changed.
    AlreadyRevoked,
    /// No such token.
    NotFound,
}

/// Token store with in-memory cache and persistent storage.
pub struct TokenStore {
    /// redb database handle.
    db: Database,

    /// In-memory cache for frequently accessed token records.
    cache: RwLock<HashMap<TokenId, TokenRecord>>,

    /// Maximum number of records to keep in cache.
    max_cache_size: usize,
}

impl TokenStore {
    /// Open or create a token store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open token database: {:?}", path))?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TOKENS_TABLE)?;
            let _ = write_txn.open_multimap_table(CHILDREN_TABLE)?;
            let _ = write_txn.open_table(POLICIES_TABLE)?;
            let _ = write_txn.open_table(AUDIT_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            cache: RwLock::new(HashMap::new()),
            max_cache_size: 10000,
        })
    }

    /// Insert a token record (root or derived), maintaining the child index.
    pub fn insert_token(&self, record: TokenRecord) -> Result<()> {
        let data = rmp_serde::to_vec(&record).context("Failed to serialize token")?;
        let key = record.id.to_string_key();

        let write_txn = self.db.begin_write()?;
        {
            let mut tokens = write_txn.open_table(TOKENS_TABLE)?;
            tokens.insert(key.as_str(), data.as_slice())?;

            if let Some(parent) = record.source_token_id {
                let mut children = write_txn.open_multimap_table(CHILDREN_TABLE)?;
                children.insert(parent.to_string_key().as_str(), key.as_str())?;
            }
        }
        write_txn.commit()?;

        self.cache_put(record);
        Ok(())
    }

    /// Insert a derived token together with its success audit entry in one
    /// write transaction. Either both commit or neither does.
    pub fn insert_token_with_audit(
        &self,
        record: TokenRecord,
        entry: ExchangeLogEntry,
    ) -> Result<()> {
        let token_data = rmp_serde::to_vec(&record).context("Failed to serialize token")?;
        let audit_data = rmp_serde::to_vec(&entry).context("Failed to serialize audit entry")?;
        let key = record.id.to_string_key();

        let write_txn = self.db.begin_write()?;
        {
            let mut tokens = write_txn.open_table(TOKENS_TABLE)?;
            tokens.insert(key.as_str(), token_data.as_slice())?;

            if let Some(parent) = record.source_token_id {
                let mut children = write_txn.open_multimap_table(CHILDREN_TABLE)?;
                children.insert(parent.to_string_key().as_str(), key.as_str())?;
            }

            let mut audit = write_txn.open_table(AUDIT_TABLE)?;
            let seq = next_audit_seq(&audit)?;
            audit.insert(seq, audit_data.as_slice())?;
        }
        write_txn.commit()?;

        self.cache_put(record);
        Ok(())
    }

    /// Get a token record by ID. Expiry is the caller's concern; records are
    /// returned as stored.
    pub fn get(&self, id: TokenId) -> Result<Option<TokenRecord>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(record) = cache.get(&id) {
                return Ok(Some(record.clone()));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS_TABLE)?;

        let key = id.to_string_key();
        match table.get(key.as_str())? {
            Some(value) => {
                let record: TokenRecord = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize token")?;
                self.cache_put(record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Flip the revoked flag. The read-modify-write runs inside a single
    /// write transaction, so concurrent revocations cannot lose the update.
    pub fn mark_revoked(&self, id: TokenId, now: DateTime<Utc>) -> Result<RevokeStatus> {
        let key = id.to_string_key();

        let write_txn = self.db.begin_write()?;
        let (status, updated) = {
            let mut table = write_txn.open_table(TOKENS_TABLE)?;
            let existing = match table.get(key.as_str())? {
                Some(value) => {
                    let record: TokenRecord = rmp_serde::from_slice(value.value())
                        .context("Failed to deserialize token")?;
                    Some(record)
                }
                None => None,
            };

            match existing {
                None => (RevokeStatus::NotFound, None),
                Some(record) if record.revoked => (RevokeStatus::AlreadyRevoked, None),
                Some(mut record) => {
                    record.revoked = true;
                    record.revoked_at = Some(now);
                    let data =
                        rmp_serde::to_vec(&record).context("Failed to serialize token")?;
                    table.insert(key.as_str(), data.as_slice())?;
                    (RevokeStatus::Revoked, Some(record))
                }
            }
        };
        write_txn.commit()?;

        if let Some(record) = updated {
            self.cache_put(record);
        }

        Ok(status)
    }

    /// Direct children of a token in the derived-token forest.
    pub fn children(&self, id: TokenId) -> Result<Vec<TokenId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_multimap_table(CHILDREN_TABLE)?;

        let key = id.to_string_key();
        let mut out = Vec::new();
        for value in table.get(key.as_str())? {
            let guard = value?;
            if let Some(child) = TokenId::parse(guard.value()) {
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Insert or replace an exchange policy.
    pub fn put_policy(&self, policy: ExchangePolicy) -> Result<()> {
        let data = rmp_serde::to_vec(&policy).context("Failed to serialize policy")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(POLICIES_TABLE)?;
            table.insert(policy.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Policies matching (requesting client, subject issuing client).
    /// Ordering is the policy engine's concern.
    pub fn policies_for(
        &self,
        requesting_client: &str,
        subject_client: &str,
    ) -> Result<Vec<ExchangePolicy>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(POLICIES_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let policy: ExchangePolicy =
                rmp_serde::from_slice(value.value()).context("Failed to deserialize policy")?;
            if policy.requesting_client == requesting_client
                && policy.subject_client == subject_client
            {
                out.push(policy);
            }
        }
        Ok(out)
    }

    /// Append an audit entry outside of an issuance transaction (denials and
    /// failures).
    pub fn append_audit(&self, entry: ExchangeLogEntry) -> Result<u64> {
        let data = rmp_serde::to_vec(&entry).context("Failed to serialize audit entry")?;
        let write_txn = self.db.begin_write()?;
        let seq = {
            let mut table = write_txn.open_table(AUDIT_TABLE)?;
            let seq = next_audit_seq(&table)?;
            table.insert(seq, data.as_slice())?;
            seq
        };
        write_txn.commit()?;
        Ok(seq)
    }

    /// Audit entries for one requesting client, oldest first.
    pub fn audit_for_client(&self, client_id: &str) -> Result<Vec<ExchangeLogEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let log: ExchangeLogEntry = rmp_serde::from_slice(value.value())
                .context("Failed to deserialize audit entry")?;
            if log.client_id == client_id {
                out.push(log);
            }
        }
        Ok(out)
    }

    /// The most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<ExchangeLogEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()?.rev().take(limit) {
            let (_, value) = entry?;
            let log: ExchangeLogEntry = rmp_serde::from_slice(value.value())
                .context("Failed to deserialize audit entry")?;
            out.push(log);
        }
        Ok(out)
    }

    /// Number of stored audit entries.
    pub fn audit_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// Number of stored tokens (for metrics).
    pub fn token_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// Delete tokens past expiry plus the grace window. Returns the number
    /// of records deleted. Audit entries are retained.
    pub fn evict_expired(&self, now: DateTime<Utc>, grace_secs: u64) -> Result<usize> {
        let cutoff = now - chrono::Duration::seconds(grace_secs as i64);

        // Collect expired records first; deletion needs their parent links.
        let expired: Vec<TokenRecord> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(TOKENS_TABLE)?;

            let mut records = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<TokenRecord>(value.value()) {
                    Ok(record) if record.expires_at < cutoff => records.push(record),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Undecodable token record left in place");
                    }
                }
            }
            records
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut tokens = write_txn.open_table(TOKENS_TABLE)?;
            let mut children = write_txn.open_multimap_table(CHILDREN_TABLE)?;

            for record in &expired {
                let key = record.id.to_string_key();
                tokens.remove(key.as_str())?;
                children.remove_all(key.as_str())?;
                if let Some(parent) = record.source_token_id {
                    children.remove(parent.to_string_key().as_str(), key.as_str())?;
                }
            }
        }
        write_txn.commit()?;

        if let Ok(mut cache) = self.cache.write() {
            for record in &expired {
                cache.remove(&record.id);
            }
        }

        debug!(evicted = expired.len(), "Expired tokens deleted");
        Ok(expired.len())
    }

    /// Insert into the cache, evicting the earliest-expiring entry when full.
    fn cache_put(&self, record: TokenRecord) {
        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_cache_size && !cache.contains_key(&record.id) {
                if let Some(evict_id) = cache
                    .iter()
                    .min_by_key(|(_, r)| r.expires_at)
                    .map(|(id, _)| *id)
                {
                    cache.remove(&evict_id);
                }
            }
            cache.insert(record.id, record);
        }
    }
}

/// Next audit sequence number (one past the highest stored key).
fn next_audit_seq<T: ReadableTable<u64, &'static [u8]>>(table: &T) -> Result<u64> {
    Ok(table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(0))
}
