//! Bearer credentials and the device index.
//!
//! Security properties:
//! - Token values are SHA-256 digests of 32 `OsRng` bytes plus a timestamp
//!   salt, URL-safe base64 encoded
//! - At most one credential per device id; a new pairing supersedes the old
//! - The number of live credentials is capped; the least recently used is
//!   evicted to make room
//! - Expired credentials are deleted as soon as any lookup discovers them

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::deadline;
use crate::error::PairingError;

/// Capability granted to a paired device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Execute,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => write!(f, "read"),
            Permission::Write => write!(f, "write"),
            Permission::Execute => write!(f, "execute"),
        }
    }
}

/// Permission set attached to every issued credential.
pub const DEFAULT_PERMISSIONS: [Permission; 3] =
    [Permission::Read, Permission::Write, Permission::Execute];

/// A bearer credential bound to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// The bearer secret.
    #[serde(rename = "token")]
    pub value: String,
    pub device_id: String,
    pub device_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub permissions: Vec<Permission>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Short, non-reversible identifier safe to put in logs.
    pub fn fingerprint(&self) -> String {
        hash_token(&self.value)[..12].to_string()
    }
}

/// Outcome of issuing a credential.
#[derive(Debug, Clone)]
pub(crate) struct Issued {
    pub credential: Credential,
    /// Previous credential of the same device, if any.
    pub superseded: Option<Credential>,
    /// Credential evicted to stay under the device ceiling, if any.
    pub evicted: Option<Credential>,
}

/// Credential table plus the device-id index.
///
/// Invariant: `device_tokens[d] == v` iff `tokens[v].device_id == d`.
#[derive(Debug)]
pub(crate) struct CredentialTable {
    tokens: HashMap<String, Credential>,
    device_tokens: HashMap<String, String>,
    ttl: Duration,
    max_active: usize,
}

impl CredentialTable {
    pub(crate) fn new(ttl: Duration, max_active: usize) -> Self {
        Self {
            tokens: HashMap::new(),
            device_tokens: HashMap::new(),
            ttl,
            max_active,
        }
    }

    /// Issue a fresh credential for `device_id`.
    pub(crate) fn issue(
        &mut self,
        device_id: &str,
        device_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Issued, PairingError> {
        // Generate before touching the table so a failure leaves it unchanged.
        let value = generate_token_value(now)?;

        let superseded = self.remove_device(device_id);

        let evicted = if self.active_count(now) >= self.max_active {
            self.evict_least_recently_used()
        } else {
            None
        };

        let credential = Credential {
            value: value.clone(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            created_at: now,
            expires_at: deadline(now, self.ttl),
            last_used_at: now,
            permissions: DEFAULT_PERMISSIONS.to_vec(),
        };

        self.tokens.insert(value.clone(), credential.clone());
        self.device_tokens.insert(device_id.to_string(), value);

        Ok(Issued {
            credential,
            superseded,
            evicted,
        })
    }

    /// Look up a credential and mark it used.
    pub(crate) fn validate(
        &mut self,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<Credential, PairingError> {
        let credential = self.live_mut(value, now)?;
        credential.last_used_at = now;
        Ok(credential.clone())
    }

    /// Look up a credential, mark it used and slide its expiry forward.
    pub(crate) fn refresh(
        &mut self,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<Credential, PairingError> {
        let ttl = self.ttl;
        let credential = self.live_mut(value, now)?;
        credential.expires_at = deadline(now, ttl);
        credential.last_used_at = now;
        Ok(credential.clone())
    }

    /// Remove a credential by value.
    pub(crate) fn remove(&mut self, value: &str) -> Option<Credential> {
        let credential = self.tokens.remove(value)?;
        if self
            .device_tokens
            .get(&credential.device_id)
            .is_some_and(|v| v == value)
        {
            self.device_tokens.remove(&credential.device_id);
        }
        Some(credential)
    }

    /// Remove the credential bound to a device.
    pub(crate) fn remove_device(&mut self, device_id: &str) -> Option<Credential> {
        let value = self.device_tokens.remove(device_id)?;
        self.tokens.remove(&value)
    }

    /// Credentials that have not expired yet, oldest first.
    pub(crate) fn list_active(&self, now: DateTime<Utc>) -> Vec<Credential> {
        let mut list: Vec<Credential> = self
            .tokens
            .values()
            .filter(|c| c.is_active(now))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub(crate) fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.tokens.values().filter(|c| c.is_active(now)).count()
    }

    /// Drop every expired credential and its index row.
    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .tokens
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.value.clone())
            .collect();
        for value in &expired {
            self.remove(value);
        }
        expired.len()
    }

    /// Copy of the live credentials and the index rows pointing at them.
    pub(crate) fn snapshot(
        &self,
        now: DateTime<Utc>,
    ) -> (HashMap<String, Credential>, HashMap<String, String>) {
        let tokens: HashMap<String, Credential> = self
            .tokens
            .iter()
            .filter(|(_, c)| c.is_active(now))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        let device_tokens = self
            .device_tokens
            .iter()
            .filter(|(_, v)| tokens.contains_key(*v))
            .map(|(d, v)| (d.clone(), v.clone()))
            .collect();
        (tokens, device_tokens)
    }

    /// Import persisted rows. Only unexpired credentials are taken, and only
    /// index rows whose credential was taken. Returns the number imported.
    pub(crate) fn import(
        &mut self,
        tokens: HashMap<String, Credential>,
        device_tokens: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut imported: usize = 0;
        for (value, credential) in tokens {
            if credential.is_active(now) && credential.value == value {
                self.tokens.insert(value, credential);
                imported += 1;
            }
        }
        for (device_id, value) in device_tokens {
            if self
                .tokens
                .get(&value)
                .is_some_and(|c| c.device_id == device_id)
            {
                self.device_tokens.insert(device_id, value);
            }
        }
        // A credential without an index row is re-indexed if its device is
        // free, and dropped if the device is already bound elsewhere.
        let orphans: Vec<(String, String)> = self
            .tokens
            .values()
            .filter(|c| self.device_tokens.get(&c.device_id) != Some(&c.value))
            .map(|c| (c.value.clone(), c.device_id.clone()))
            .collect();
        for (value, device_id) in orphans {
            if self.device_tokens.contains_key(&device_id) {
                self.tokens.remove(&value);
                imported = imported.saturating_sub(1);
            } else {
                self.device_tokens.insert(device_id, value);
            }
        }
        imported
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }

    #[cfg(test)]
    pub(crate) fn index_len(&self) -> usize {
        self.device_tokens.len()
    }

    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        self.device_tokens.len() == self.tokens.len()
            && self.device_tokens.iter().all(|(d, v)| {
                self.tokens.get(v).is_some_and(|c| &c.device_id == d)
            })
    }

    fn live_mut(
        &mut self,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<&mut Credential, PairingError> {
        let expired = self
            .tokens
            .get(value)
            .ok_or(PairingError::InvalidToken)?
            .is_expired(now);
        if expired {
            self.remove(value);
            return Err(PairingError::TokenExpired);
        }
        self.tokens.get_mut(value).ok_or(PairingError::InvalidToken)
    }

    /// Remove the credential with the oldest `last_used_at`, expired or not.
    /// Ties go to the first one encountered.
    fn evict_least_recently_used(&mut self) -> Option<Credential> {
        let victim = self
            .tokens
            .values()
            .min_by_key(|c| c.last_used_at)
            .map(|c| c.value.clone())?;
        self.remove(&victim)
    }
}

/// Generate a new token value.
pub fn generate_token_value(now: DateTime<Utc>) -> Result<String, PairingError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| PairingError::Generation(e.to_string()))?;

    let salt = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros());

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(salt.to_le_bytes());
    Ok(URL_SAFE.encode(hasher.finalize()))
}

/// Hex SHA-256 of a token, for storage or logging without the secret.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
