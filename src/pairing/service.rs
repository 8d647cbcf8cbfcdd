//! The pairing service: codes in, bearer credentials out.
//!
//! All state sits behind one `RwLock`. Validation and refresh mutate
//! timestamps, so they take the write half like every other mutation.
//! Events are emitted and disk I/O is performed only after the lock is
//! released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;

use super::code::{CodeRegistry, PairingCode};
use super::events::{EventBus, PairingEvent};
use super::persist::{self, PersistedState};
use super::sweeper::{SweepStats, Sweeper};
use super::token::{Credential, CredentialTable, Issued};
use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::error::{PairingError, PersistError};

#[derive(Debug)]
pub(crate) struct AuthState {
    pub(crate) codes: CodeRegistry,
    pub(crate) credentials: CredentialTable,
}

impl AuthState {
    fn new(config: &AuthConfig) -> Self {
        Self {
            codes: CodeRegistry::new(config.code_length, &config.code_charset, config.code_ttl),
            credentials: CredentialTable::new(config.token_ttl, config.max_active_devices),
        }
    }
}

/// Issues pairing codes, exchanges them for credentials and validates those
/// credentials. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PairingService {
    state: Arc<RwLock<AuthState>>,
    config: Arc<AuthConfig>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    /// Serializes snapshot-and-write so the newest snapshot lands last.
    save_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for PairingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingService")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl PairingService {
    /// Create a service using the system clock.
    ///
    /// If a storage path is configured, saved credentials are loaded with a
    /// blocking read. A failed load is logged and the service starts empty.
    /// From async code prefer [`open`](Self::open).
    pub fn new(config: AuthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock. Blocks on the initial load
    /// like [`new`](Self::new).
    pub fn with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let mut state = AuthState::new(&config);

        if let Some(path) = config.storage_path.as_deref() {
            match persist::read_state(path) {
                Ok(Some(saved)) => {
                    let loaded = state.credentials.import(
                        saved.tokens,
                        saved.device_tokens,
                        clock.now(),
                    );
                    tracing::info!(
                        loaded,
                        saved_at = %saved.saved_at,
                        path = %path.display(),
                        "Auth state loaded"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load auth state, starting fresh");
                }
            }
        }

        Self::from_parts(state, config, clock)
    }

    /// Create a service using the system clock, loading saved credentials
    /// on the blocking pool.
    pub async fn open(config: AuthConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// [`open`](Self::open) with an injected clock.
    pub async fn open_with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let state = AuthState::new(&config);
        let service = Self::from_parts(state, config, clock);

        match service.load().await {
            Ok(0) => {}
            Ok(loaded) => tracing::info!(loaded, "Auth state loaded"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load auth state, starting fresh");
            }
        }
        service
    }

    /// Open a service and spawn its sweeper. The sweeper stops when
    /// `shutdown` flips to `true`.
    pub async fn start(
        config: AuthConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let service = Self::open(config).await;
        let sweeper = Sweeper::new(service.clone(), service.config.sweep_interval).spawn(shutdown);
        (service, sweeper)
    }

    fn from_parts(state: AuthState, config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            config: Arc::new(config),
            clock,
            events: EventBus::default(),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Subscribe to pairing lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Mint a new pairing code. Stale codes are purged first.
    pub async fn issue_code(&self) -> Result<PairingCode, PairingError> {
        let now = self.clock.now();
        let code = self.state.write().await.codes.issue(now)?;

        tracing::info!(
            code = %code.code,
            expires = %code.expires_at,
            "Pairing code generated"
        );
        Ok(code)
    }

    /// The currently active pairing code, if any.
    pub async fn peek_active_code(&self) -> Option<PairingCode> {
        let now = self.clock.now();
        self.state.read().await.codes.peek_active(now).cloned()
    }

    /// Exchange a pairing code for a credential bound to `device_id`.
    pub async fn redeem(
        &self,
        code: &str,
        device_id: &str,
        device_name: &str,
    ) -> Result<Credential, PairingError> {
        let now = self.clock.now();

        let Issued {
            credential,
            superseded,
            evicted,
        } = {
            let mut state = self.state.write().await;
            state.codes.check(code, now)?;
            let issued = state.credentials.issue(device_id, device_name, now)?;
            state.codes.mark_used(code, device_id);
            issued
        };

        if superseded.is_some() {
            self.events.emit(PairingEvent::DeviceSuperseded {
                device_id: device_id.to_string(),
            });
        }
        if let Some(victim) = evicted {
            tracing::info!(device_id = %victim.device_id, "Oldest device token removed");
            self.events.emit(PairingEvent::DeviceEvicted {
                device_id: victim.device_id,
                device_name: victim.device_name,
            });
        }

        tracing::info!(
            device_id = %device_id,
            device_name = %device_name,
            token = %credential.fingerprint(),
            "Device paired successfully"
        );
        self.events.emit(PairingEvent::DevicePaired {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            at: now,
        });

        Ok(credential)
    }

    /// Check a bearer credential and record its use.
    pub async fn validate(&self, token: &str) -> Result<Credential, PairingError> {
        let now = self.clock.now();
        self.state.write().await.credentials.validate(token, now)
    }

    /// Check a bearer credential and extend its expiry by the token TTL.
    pub async fn refresh(&self, token: &str) -> Result<Credential, PairingError> {
        let now = self.clock.now();
        let credential = self.state.write().await.credentials.refresh(token, now)?;
        tracing::debug!(
            device_id = %credential.device_id,
            expires = %credential.expires_at,
            "Token refreshed"
        );
        Ok(credential)
    }

    /// Revoke a credential. Returns whether anything was removed.
    pub async fn revoke(&self, token: &str) -> bool {
        let removed = self.state.write().await.credentials.remove(token);
        self.announce_revocation(removed)
    }

    /// Revoke whatever credential is bound to `device_id`.
    pub async fn revoke_device(&self, device_id: &str) -> bool {
        let removed = self.state.write().await.credentials.remove_device(device_id);
        self.announce_revocation(removed)
    }

    /// All credentials that have not expired, oldest first.
    pub async fn list_active(&self) -> Vec<Credential> {
        let now = self.clock.now();
        self.state.read().await.credentials.list_active(now)
    }

    /// Remove expired or used codes and expired credentials.
    pub async fn sweep_now(&self) -> SweepStats {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        SweepStats {
            codes: state.codes.purge_stale(now),
            credentials: state.credentials.purge_expired(now),
        }
    }

    /// Persist live credentials to the configured path. No-op without one.
    pub async fn save(&self) -> Result<(), PersistError> {
        let Some(path) = self.config.storage_path.as_deref() else {
            return Ok(());
        };

        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot().await;
        let count = snapshot.tokens.len();
        persist::write_state(path, &snapshot).await?;

        tracing::debug!(tokens = count, "Auth state saved");
        Ok(())
    }

    /// [`save`](Self::save), bounded by `timeout`.
    pub async fn save_with_timeout(&self, timeout: Duration) -> Result<(), PersistError> {
        tokio::time::timeout(timeout, self.save())
            .await
            .map_err(|_| PersistError::Timeout(timeout))?
    }

    /// Re-read the configured file and import its live credentials.
    /// Returns the number imported; a missing file imports nothing.
    pub async fn load(&self) -> Result<usize, PersistError> {
        let Some(path) = self.config.storage_path.clone() else {
            return Ok(0);
        };

        let saved = tokio::task::spawn_blocking(move || persist::read_state(&path))
            .await
            .map_err(|e| PersistError::Io {
                path: self.config.storage_path.clone().unwrap_or_default(),
                source: std::io::Error::other(e),
            })??;

        let Some(saved) = saved else {
            return Ok(0);
        };
        let now = self.clock.now();
        let mut state = self.state.write().await;
        Ok(state
            .credentials
            .import(saved.tokens, saved.device_tokens, now))
    }

    async fn snapshot(&self) -> PersistedState {
        let now = self.clock.now();
        let (tokens, device_tokens) = self.state.read().await.credentials.snapshot(now);
        PersistedState {
            tokens,
            device_tokens,
            saved_at: now,
        }
    }

    fn announce_revocation(&self, removed: Option<Credential>) -> bool {
        let Some(credential) = removed else {
            return false;
        };
        tracing::info!(device_id = %credential.device_id, "Token revoked");
        self.events.emit(PairingEvent::DeviceRevoked {
            device_id: credential.device_id,
        });
        true
    }

    #[cfg(test)]
    pub(crate) async fn code_count(&self) -> usize {
        self.state.read().await.codes.len()
    }

    #[cfg(test)]
    pub(crate) async fn credential_count(&self) -> usize {
        self.state.read().await.credentials.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;
    use crate::pairing::token::Permission;

    const MINUTE: Duration = Duration::from_secs(60);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn service_with(config: AuthConfig) -> (PairingService, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let service = PairingService::with_clock(config, Arc::new(clock.clone()));
        (service, clock)
    }

    fn service() -> (PairingService, ManualClock) {
        service_with(AuthConfig::default())
    }

    async fn pair(service: &PairingService, device_id: &str) -> Credential {
        let code = service.issue_code().await.unwrap();
        service.redeem(&code.code, device_id, device_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_issue_code_shape() {
        let (service, clock) = service();
        let code = service.issue_code().await.unwrap();
        assert_eq!(code.code.len(), 6);
        assert!(code.code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(code.expires_at - clock.now(), TimeDelta::minutes(5));
    }

    #[tokio::test]
    async fn test_concrete_pairing_scenario() {
        let (service, clock) = service();
        let code = service.issue_code().await.unwrap();

        clock.advance(MINUTE);
        let credential = service.redeem(&code.code, "dev-1", "Pixel 7").await.unwrap();
        assert_eq!(credential.device_id, "dev-1");
        assert_eq!(credential.device_name, "Pixel 7");
        assert!(credential.has_permission(Permission::Read));
        assert!(credential.has_permission(Permission::Write));
        assert!(credential.has_permission(Permission::Execute));

        clock.advance(MINUTE);
        assert!(service.validate(&credential.value).await.is_ok());

        clock.advance(31 * DAY);
        assert_eq!(
            service.validate(&credential.value).await.unwrap_err(),
            PairingError::TokenExpired
        );
        assert_eq!(service.credential_count().await, 0);
    }

    #[tokio::test]
    async fn test_redeem_twice_reports_already_used() {
        let (service, _clock) = service();
        let code = service.issue_code().await.unwrap();
        service.redeem(&code.code, "dev-1", "Phone").await.unwrap();
        assert_eq!(
            service.redeem(&code.code, "dev-2", "Other").await.unwrap_err(),
            PairingError::CodeAlreadyUsed
        );
    }

    #[tokio::test]
    async fn test_redeem_expired_code() {
        let (service, clock) = service();
        let code = service.issue_code().await.unwrap();
        clock.advance(6 * MINUTE);

        assert_eq!(
            service.redeem(&code.code, "dev-1", "Phone").await.unwrap_err(),
            PairingError::CodeExpired
        );
        assert_eq!(
            service.redeem(&code.code, "dev-1", "Phone").await.unwrap_err(),
            PairingError::InvalidCode
        );
    }

    #[tokio::test]
    async fn test_redeem_unknown_code() {
        let (service, _clock) = service();
        assert_eq!(
            service.redeem("000000", "dev-1", "Phone").await.unwrap_err(),
            PairingError::InvalidCode
        );
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let (service, clock) = service_with(AuthConfig {
            max_active_devices: 2,
            ..AuthConfig::default()
        });

        let first = pair(&service, "dev-1").await;
        clock.advance(MINUTE);
        let second = pair(&service, "dev-2").await;
        clock.advance(MINUTE);
        service.validate(&first.value).await.unwrap();
        clock.advance(MINUTE);

        let third = pair(&service, "dev-3").await;
        assert_eq!(
            service.validate(&second.value).await.unwrap_err(),
            PairingError::InvalidToken
        );
        assert!(service.validate(&first.value).await.is_ok());
        assert!(service.validate(&third.value).await.is_ok());
        assert_eq!(service.list_active().await.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_slides_expiry() {
        let (service, clock) = service();
        let credential = pair(&service, "dev-1").await;
        clock.advance(DAY);

        let refreshed = service.refresh(&credential.value).await.unwrap();
        assert!(refreshed.expires_at > credential.expires_at);
        assert!(refreshed.last_used_at > credential.last_used_at);

        clock.advance(30 * DAY + MINUTE);
        assert_eq!(
            service.refresh(&credential.value).await.unwrap_err(),
            PairingError::TokenExpired
        );
        assert_eq!(
            service.validate(&credential.value).await.unwrap_err(),
            PairingError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (service, _clock) = service();
        let credential = pair(&service, "dev-1").await;
        assert!(service.revoke(&credential.value).await);
        assert!(!service.revoke(&credential.value).await);
        assert_eq!(
            service.validate(&credential.value).await.unwrap_err(),
            PairingError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_revoke_device() {
        let (service, _clock) = service();
        let credential = pair(&service, "dev-1").await;
        assert!(service.revoke_device("dev-1").await);
        assert!(!service.revoke_device("dev-1").await);
        assert!(service.validate(&credential.value).await.is_err());
        assert!(service.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_repairing_supersedes() {
        let (service, _clock) = service();
        let old = pair(&service, "dev-1").await;
        let new = pair(&service, "dev-1").await;

        assert!(service.validate(&old.value).await.is_err());
        assert!(service.validate(&new.value).await.is_ok());
        assert_eq!(service.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_peek_active_code() {
        let (service, clock) = service();
        assert!(service.peek_active_code().await.is_none());

        let code = service.issue_code().await.unwrap();
        assert_eq!(service.peek_active_code().await.unwrap().code, code.code);

        clock.advance(6 * MINUTE);
        assert!(service.peek_active_code().await.is_none());
    }

    #[tokio::test]
    async fn test_redeem_emits_events() {
        let (service, _clock) = service_with(AuthConfig {
            max_active_devices: 1,
            ..AuthConfig::default()
        });
        let mut rx = service.subscribe();

        pair(&service, "dev-1").await;
        pair(&service, "dev-2").await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], PairingEvent::DevicePaired { .. }));
        assert_eq!(events[0].device_id(), "dev-1");
        assert!(matches!(&events[1], PairingEvent::DeviceEvicted { .. }));
        assert_eq!(events[1].device_id(), "dev-1");
        match &events[2] {
            PairingEvent::DevicePaired {
                device_id,
                device_name,
                ..
            } => {
                assert_eq!(device_id, "dev-2");
                assert_eq!(device_name, "dev-2");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_now_removes_stale_entries() {
        let (service, clock) = service_with(AuthConfig {
            token_ttl: Duration::from_secs(3600),
            ..AuthConfig::default()
        });

        // The redeemed code lingers as a used tombstone until swept.
        pair(&service, "dev-1").await;
        assert_eq!(service.code_count().await, 1);
        let stats = service.sweep_now().await;
        assert_eq!(stats, SweepStats { codes: 1, credentials: 0 });

        service.issue_code().await.unwrap();
        clock.advance(Duration::from_secs(7200));
        let stats = service.sweep_now().await;
        assert_eq!(stats, SweepStats { codes: 1, credentials: 1 });
        assert_eq!(service.code_count().await, 0);
        assert_eq!(service.credential_count().await, 0);
    }

    #[tokio::test]
    async fn test_save_without_path_is_noop() {
        let (service, _clock) = service();
        pair(&service, "dev-1").await;
        service.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig {
            token_ttl: Duration::from_secs(3600),
            ..AuthConfig::default()
        }
        .with_storage_path(dir.path().join("auth.json"));
        let (service, clock) = service_with(config.clone());

        let short_lived = pair(&service, "dev-old").await;
        clock.advance(Duration::from_secs(1800));
        let long_lived = pair(&service, "dev-new").await;
        clock.advance(Duration::from_secs(2400));
        service.save().await.unwrap();

        let restored = PairingService::with_clock(config, Arc::new(clock.clone()));
        let active = restored.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].value, long_lived.value);
        assert_eq!(
            restored.validate(&short_lived.value).await.unwrap_err(),
            PairingError::InvalidToken
        );
        assert!(restored.revoke_device("dev-new").await);
    }

    #[tokio::test]
    async fn test_load_from_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, "{ definitely not json").unwrap();

        let (service, _clock) = service_with(AuthConfig::default().with_storage_path(&path));
        assert!(service.list_active().await.is_empty());
        assert!(matches!(
            service.load().await.unwrap_err(),
            PersistError::Decode { .. }
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_imports_nothing() {
        let dir = TempDir::new().unwrap();
        let (service, _clock) =
            service_with(AuthConfig::default().with_storage_path(dir.path().join("none.json")));
        assert_eq!(service.load().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();

        let (service, _clock) =
            service_with(AuthConfig::default().with_storage_path(blocker.join("auth.json")));
        let credential = pair(&service, "dev-1").await;

        assert!(matches!(
            service.save().await.unwrap_err(),
            PersistError::Io { .. }
        ));
        assert!(service.validate(&credential.value).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_validation() {
        let (service, _clock) = service();
        let credential = pair(&service, "dev-1").await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            let token = credential.value.clone();
            handles.push(tokio::spawn(async move { service.validate(&token).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_concurrent_redeem_is_single_use() {
        let (service, _clock) = service();
        let code = service.issue_code().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let service = service.clone();
            let code = code.code.clone();
            handles.push(tokio::spawn(async move {
                service.redeem(&code, &format!("dev-{i}"), "Phone").await
            }));
        }

        let mut paired = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => paired += 1,
                Err(e) => assert_eq!(e, PairingError::CodeAlreadyUsed),
            }
        }
        assert_eq!(paired, 1);
        assert_eq!(service.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves_keep_file_intact() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig::default().with_storage_path(dir.path().join("auth.json"));
        let (service, _clock) = service_with(config.clone());
        for i in 0..5 {
            pair(&service, &format!("dev-{i}")).await;
        }

        for _ in 0..25 {
            let mut handles = Vec::new();
            for _ in 0..4 {
                let service = service.clone();
                handles.push(tokio::spawn(async move { service.save().await }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let reloaded = PairingService::open(config.clone()).await;
            assert_eq!(reloaded.list_active().await.len(), 5);
        }
    }

    #[tokio::test]
    async fn test_open_loads_saved_credentials() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig::default().with_storage_path(dir.path().join("auth.json"));
        let (service, _clock) = service_with(config.clone());
        let credential = pair(&service, "dev-1").await;
        service.save().await.unwrap();

        let opened = PairingService::open(config).await;
        assert_eq!(
            opened.validate(&credential.value).await.unwrap().device_id,
            "dev-1"
        );
    }
}
