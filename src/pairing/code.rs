//! One-time pairing codes.
//!
//! Codes are short, human-enterable and single use. A consumed code stays in
//! the registry as a tombstone (so a replay reports `CodeAlreadyUsed`) until
//! the next purge removes it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::clock::deadline;
use crate::error::PairingError;

/// Upper bound on collision retries before giving up on a fresh code.
const MAX_GENERATION_ATTEMPTS: usize = 64;

/// A pairing code that can be exchanged for one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Device that redeemed the code, once consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip)]
    pub used: bool,
}

impl PairingCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Unused and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.used && now < self.expires_at
    }
}

/// Table of outstanding pairing codes keyed by code value.
#[derive(Debug)]
pub(crate) struct CodeRegistry {
    codes: HashMap<String, PairingCode>,
    length: usize,
    charset: Vec<char>,
    ttl: Duration,
}

impl CodeRegistry {
    pub(crate) fn new(length: usize, charset: &str, ttl: Duration) -> Self {
        Self {
            codes: HashMap::new(),
            length,
            charset: charset.chars().collect(),
            ttl,
        }
    }

    /// Purge stale codes, then mint a code not held by any other entry.
    pub(crate) fn issue(&mut self, now: DateTime<Utc>) -> Result<PairingCode, PairingError> {
        self.purge_stale(now);

        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let code = generate_code(self.length, &self.charset)?;
            if self.codes.contains_key(&code) {
                continue;
            }

            let pairing_code = PairingCode {
                code: code.clone(),
                created_at: now,
                expires_at: deadline(now, self.ttl),
                device_id: None,
                used: false,
            };
            self.codes.insert(code, pairing_code.clone());
            return Ok(pairing_code);
        }

        Err(PairingError::Generation(format!(
            "no unique code after {MAX_GENERATION_ATTEMPTS} attempts ({} outstanding)",
            self.codes.len()
        )))
    }

    /// Check that `code` can be redeemed right now.
    ///
    /// Expired codes are removed on discovery.
    pub(crate) fn check(&mut self, code: &str, now: DateTime<Utc>) -> Result<(), PairingError> {
        let entry = self.codes.get(code).ok_or(PairingError::InvalidCode)?;

        if entry.is_expired(now) {
            self.codes.remove(code);
            return Err(PairingError::CodeExpired);
        }
        if entry.used {
            return Err(PairingError::CodeAlreadyUsed);
        }
        Ok(())
    }

    /// Mark a checked code consumed by `device_id`. It can never be redeemed
    /// again.
    pub(crate) fn mark_used(&mut self, code: &str, device_id: &str) -> Option<PairingCode> {
        let entry = self.codes.get_mut(code)?;
        entry.used = true;
        entry.device_id = Some(device_id.to_string());
        Some(entry.clone())
    }

    /// The newest active code, if any.
    pub(crate) fn peek_active(&self, now: DateTime<Utc>) -> Option<&PairingCode> {
        self.codes
            .values()
            .filter(|pc| pc.is_active(now))
            .max_by_key(|pc| pc.created_at)
    }

    /// Drop every expired or used code. Returns the number removed.
    pub(crate) fn purge_stale(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, pc| !pc.is_expired(now) && !pc.used);
        before - self.codes.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.codes.len()
    }
}

/// Draw `length` symbols uniformly from `charset` using the OS CSPRNG.
pub fn generate_code(length: usize, charset: &[char]) -> Result<String, PairingError> {
    if charset.is_empty() {
        return Err(PairingError::Generation("empty code charset".to_string()));
    }

    let n = charset.len() as u32;
    // Largest multiple of n that fits in u32; draws at or above it are rejected.
    let zone = u32::MAX - (u32::MAX % n);

    let mut code = String::with_capacity(length);
    let mut buf = [0u8; 4];
    while code.chars().count() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| PairingError::Generation(e.to_string()))?;
        let draw = u32::from_le_bytes(buf);
        if draw >= zone {
            continue;
        }
        code.push(charset[(draw % n) as usize]);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn digits() -> Vec<char> {
        "0123456789".chars().collect()
    }

    fn registry() -> CodeRegistry {
        CodeRegistry::new(6, "0123456789", Duration::from_secs(300))
    }

    fn consume(
        reg: &mut CodeRegistry,
        code: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PairingCode, PairingError> {
        reg.check(code, now)?;
        Ok(reg.mark_used(code, device_id).unwrap())
    }

    #[test]
    fn test_generated_code_is_numeric_and_sized() {
        for _ in 0..200 {
            let code = generate_code(6, &digits()).unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_generated_code_honours_charset() {
        let charset: Vec<char> = "XYZ".chars().collect();
        let code = generate_code(12, &charset).unwrap();
        assert_eq!(code.chars().count(), 12);
        assert!(code.chars().all(|c| charset.contains(&c)));
    }

    #[test]
    fn test_empty_charset_fails() {
        let err = generate_code(6, &[]).unwrap_err();
        assert!(matches!(err, PairingError::Generation(_)));
    }

    #[test]
    fn test_issue_sets_expiry() {
        let mut reg = registry();
        let now = Utc::now();
        let pc = reg.issue(now).unwrap();
        assert_eq!(pc.created_at, now);
        assert_eq!(pc.expires_at - now, TimeDelta::minutes(5));
        assert!(pc.is_active(now));
        assert!(!pc.used);
    }

    #[test]
    fn test_issued_codes_are_unique_among_active() {
        let mut reg = registry();
        let now = Utc::now();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let pc = reg.issue(now).unwrap();
            assert!(seen.insert(pc.code), "duplicate active code issued");
        }
        assert_eq!(reg.len(), 500);
    }

    #[test]
    fn test_issue_fails_when_code_space_exhausted() {
        let mut reg = CodeRegistry::new(1, "0", Duration::from_secs(300));
        let now = Utc::now();
        reg.issue(now).unwrap();
        let err = reg.issue(now).unwrap_err();
        assert!(matches!(err, PairingError::Generation(_)));
    }

    #[test]
    fn test_consume_once() {
        let mut reg = registry();
        let now = Utc::now();
        let pc = reg.issue(now).unwrap();

        let consumed = consume(&mut reg, &pc.code, "dev-1", now).unwrap();
        assert!(consumed.used);
        assert_eq!(consumed.device_id.as_deref(), Some("dev-1"));

        let err = consume(&mut reg, &pc.code, "dev-2", now).unwrap_err();
        assert_eq!(err, PairingError::CodeAlreadyUsed);
    }

    #[test]
    fn test_consume_unknown_code() {
        let mut reg = registry();
        let err = consume(&mut reg, "999999", "dev-1", Utc::now()).unwrap_err();
        assert_eq!(err, PairingError::InvalidCode);
    }

    #[test]
    fn test_consume_expired_code_removes_it() {
        let mut reg = registry();
        let now = Utc::now();
        let pc = reg.issue(now).unwrap();
        let later = now + TimeDelta::minutes(6);

        assert_eq!(
            consume(&mut reg, &pc.code, "dev-1", later).unwrap_err(),
            PairingError::CodeExpired
        );
        assert_eq!(
            consume(&mut reg, &pc.code, "dev-1", later).unwrap_err(),
            PairingError::InvalidCode
        );
    }

    #[test]
    fn test_peek_skips_used_and_expired() {
        let mut reg = registry();
        let now = Utc::now();
        assert!(reg.peek_active(now).is_none());

        let first = reg.issue(now).unwrap();
        assert_eq!(reg.peek_active(now).unwrap().code, first.code);

        consume(&mut reg, &first.code, "dev-1", now).unwrap();
        assert!(reg.peek_active(now).is_none());

        let second = reg.issue(now).unwrap();
        assert!(reg.peek_active(now + TimeDelta::minutes(10)).is_none());
        assert_eq!(reg.peek_active(now).unwrap().code, second.code);
    }

    #[test]
    fn test_issue_purges_stale_codes() {
        let mut reg = registry();
        let now = Utc::now();
        let used = reg.issue(now).unwrap();
        consume(&mut reg, &used.code, "dev-1", now).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.check(&used.code, now).unwrap_err(),
            PairingError::CodeAlreadyUsed
        );

        // The next issue drops the used tombstone, so a replay no longer
        // reports the code as used.
        reg.issue(now).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.check(&used.code, now).unwrap_err(),
            PairingError::InvalidCode
        );

        reg.issue(now + TimeDelta::minutes(10)).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_used_flag_not_serialized() {
        let mut reg = registry();
        let pc = reg.issue(Utc::now()).unwrap();
        let json = serde_json::to_value(&pc).unwrap();
        assert!(json.get("used").is_none());
        assert!(json.get("device_id").is_none());
        assert_eq!(json["code"], pc.code);
    }
}
