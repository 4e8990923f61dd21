//! Multi-token store with a single active pointer
//!
//! The store owns every `TokenRecord` and the active pointer. It loads the
//! backend once, serves reads from memory and writes through to the backend
//! on each mutation. A tokio `RwLock` guards the working set; mutations hold
//! the write lock across the backend write, so readers never observe a
//! record that is not yet durable. Backend calls run on the blocking pool.
//!
//! Expired tokens are hidden from `active()` but never deleted
//! automatically; cleanup is the caller's decision.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::Clock;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::SecretBackend;
use crate::error::{Error, Result};
use crate::token::{TokenId, TokenRecord};

/// Non-secret metadata for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub host: String,
    pub prefix: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub scope: Vec<String>,
    pub expired: bool,
    pub active: bool,
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<TokenId, TokenRecord>,
    active: Option<TokenId>,
}

pub struct TokenStore {
    backend: Arc<dyn SecretBackend>,
    clock: Arc<dyn Clock>,
    state: RwLock<StoreState>,
}

impl TokenStore {
    /// Load every readable record from the backend.
    ///
    /// Unreadable entries are skipped with a warning. An active pointer that
    /// names a missing record is dropped.
    pub async fn open(backend: Arc<dyn SecretBackend>, clock: Arc<dyn Clock>) -> Result<Self> {
        let state = run_blocking(&backend, load_state).await?;
        info!(
            backend = backend.kind(),
            tokens = state.records.len(),
            active = state.active.is_some(),
            "token store opened"
        );
        Ok(Self {
            backend,
            clock,
            state: RwLock::new(state),
        })
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Re-read the backend, discarding the in-memory view.
    pub async fn reload(&self) -> Result<()> {
        let fresh = self.blocking(load_state).await?;
        *self.state.write().await = fresh;
        Ok(())
    }

    /// Store a record under `(host, prefix)`, replacing any record with the
    /// same id. Becomes active if nothing is. Saving an identical record
    /// again is a no-op.
    pub async fn save(&self, record: TokenRecord) -> Result<TokenId> {
        record.validate()?;
        let id = record.id();
        let mut state = self.state.write().await;

        if state.records.get(&id) != Some(&record) {
            let stored = record.clone();
            self.blocking(move |b| b.store(&stored)).await?;
            state.records.insert(id.clone(), record);
            debug!(token = %id, "saved token");
        }
        if state.active.is_none() {
            self.write_active(Some(&id)).await?;
            state.active = Some(id.clone());
            info!(token = %id, "token set as active");
        }
        Ok(id)
    }

    /// Active record, or `None` when there is none or it has expired.
    pub async fn active(&self) -> Option<TokenRecord> {
        let record = self.active_record().await?;
        if record.is_expired(self.clock.now()) {
            debug!(token = %record.id(), "active token expired");
            return None;
        }
        Some(record)
    }

    /// Active record even when expired, so the caller can decide to refresh.
    pub async fn active_record(&self) -> Option<TokenRecord> {
        let state = self.state.read().await;
        let id = state.active.as_ref()?;
        state.records.get(id).cloned()
    }

    pub async fn active_id(&self) -> Option<TokenId> {
        self.state.read().await.active.clone()
    }

    pub async fn get(&self, id: &TokenId) -> Option<TokenRecord> {
        self.state.read().await.records.get(id).cloned()
    }

    /// Metadata for every record, sorted by host then prefix.
    pub async fn list(&self) -> Vec<TokenSummary> {
        let now = self.clock.now();
        let state = self.state.read().await;
        state
            .records
            .iter()
            .map(|(id, record)| TokenSummary {
                host: id.host.clone(),
                prefix: id.prefix.clone(),
                created_at: record.created_at,
                expires_at: record.expires_at(),
                scope: record.scope.clone(),
                expired: record.is_expired(now),
                active: state.active.as_ref() == Some(id),
            })
            .collect()
    }

    /// Remove every record whose token starts with `handle`. Clears the
    /// active pointer when it pointed at a removed record.
    pub async fn delete(&self, handle: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let doomed: Vec<TokenId> = state
            .records
            .iter()
            .filter(|(_, record)| record.matches(handle))
            .map(|(id, _)| id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(false);
        }

        for id in &doomed {
            let key = id.clone();
            self.blocking(move |b| b.remove(&key)).await?;
            state.records.remove(id);
            info!(token = %id, "deleted token");
        }
        if let Some(active) = &state.active
            && doomed.contains(active)
        {
            self.write_active(None).await?;
            state.active = None;
            info!("active token deleted, no token is active");
        }
        Ok(true)
    }

    /// Point the active pointer at the record whose token starts with
    /// `handle`; the most recently created wins when several match.
    pub async fn set_active(&self, handle: &str) -> Result<bool> {
        let id = {
            let state = self.state.read().await;
            state
                .records
                .iter()
                .filter(|(_, record)| record.matches(handle))
                .max_by_key(|(_, record)| record.created_at)
                .map(|(id, _)| id.clone())
        };
        match id {
            Some(id) => self.set_active_id(&id).await,
            None => Ok(false),
        }
    }

    pub async fn set_active_id(&self, id: &TokenId) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.records.contains_key(id) {
            return Ok(false);
        }
        if state.active.as_ref() != Some(id) {
            self.write_active(Some(id)).await?;
            state.active = Some(id.clone());
            info!(token = %id, "switched active token");
        }
        Ok(true)
    }

    pub async fn clear_active(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.active.is_some() {
            self.write_active(None).await?;
            state.active = None;
        }
        Ok(())
    }

    /// Install `new` in place of `old` (the install step after a refresh).
    ///
    /// Writes `new`, removes `old` when its id differs, and repoints the
    /// active pointer if it pointed at `old`. Fails with `NotFound` when
    /// `old` is no longer stored (deleted while the refresh was running).
    /// If `old` cannot be removed, `new` is removed again so the backend
    /// keeps matching memory.
    pub async fn replace(&self, old: &TokenRecord, new: TokenRecord) -> Result<TokenId> {
        new.validate()?;
        let old_id = old.id();
        let new_id = new.id();
        let mut state = self.state.write().await;

        if !holds(&state, old) {
            return Err(Error::NotFound(format!("token {old_id} is no longer stored")));
        }

        let stored = new.clone();
        self.blocking(move |b| b.store(&stored)).await?;
        if old_id != new_id {
            let (old_key, new_key) = (old_id.clone(), new_id.clone());
            self.blocking(move |b| {
                b.remove(&old_key).inspect_err(|_| {
                    if let Err(e) = b.remove(&new_key) {
                        warn!(token = %new_key, error = %e, "failed to roll back replacement");
                    }
                })
            })
            .await?;
            state.records.remove(&old_id);
        }
        state.records.insert(new_id.clone(), new);

        if state.active.as_ref() == Some(&old_id) && old_id != new_id {
            self.write_active(Some(&new_id)).await?;
            state.active = Some(new_id.clone());
        }
        info!(old = %old_id, new = %new_id, "replaced token");
        Ok(new_id)
    }

    /// Whether `record`'s exact token is still stored under its id.
    pub async fn contains(&self, record: &TokenRecord) -> bool {
        holds(&*self.state.read().await, record)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn write_active(&self, id: Option<&TokenId>) -> Result<()> {
        let id = id.cloned();
        self.blocking(move |b| b.store_active(id.as_ref())).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SecretBackend) -> Result<T> + Send + 'static,
    {
        run_blocking(&self.backend, f).await
    }
}

fn holds(state: &StoreState, record: &TokenRecord) -> bool {
    state.records.get(&record.id()).map(|r| &r.access_token) == Some(&record.access_token)
}

/// Run a backend call on the blocking pool; file and keyring I/O are synchronous.
async fn run_blocking<T, F>(backend: &Arc<dyn SecretBackend>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn SecretBackend) -> Result<T> + Send + 'static,
{
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || f(backend.as_ref()))
        .await
        .map_err(|e| Error::Backend(format!("storage task failed: {e}")))?
}

fn load_state(backend: &dyn SecretBackend) -> Result<StoreState> {
    let mut state = StoreState::default();
    for entry in backend.load_all()? {
        let record = match entry.record.and_then(|r| r.validate().map(|_| r)) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "skipping unreadable token record");
                continue;
            }
        };
        let id = record.id();
        let newer = state
            .records
            .get(&id)
            .is_none_or(|existing| existing.created_at < record.created_at);
        if newer {
            state.records.insert(id, record);
        }
    }

    if let Some(active) = backend.load_active()? {
        match state.records.keys().find(|id| id.to_string() == active) {
            Some(id) => state.active = Some(id.clone()),
            None => {
                warn!(active = %active, "active token pointer names a missing record, dropping it");
                if let Err(e) = backend.store_active(None) {
                    warn!(error = %e, "failed to clear dangling active pointer");
                }
            }
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, PlaintextFileBackend};
    use common::ManualClock;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000;

    async fn store_with(backend: Arc<dyn SecretBackend>) -> (TokenStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(NOW));
        let store = TokenStore::open(backend, clock.clone()).await.unwrap();
        (store, clock)
    }

    async fn memory_store() -> (TokenStore, Arc<ManualClock>) {
        store_with(Arc::new(MemoryBackend::new())).await
    }

    fn token(access: &str, host: &str, created_at: u64) -> TokenRecord {
        TokenRecord::new(access, host, created_at)
    }

    #[tokio::test]
    async fn save_then_active_roundtrip() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_first", "github.com", NOW)).await.unwrap();

        let active = store.active().await.unwrap();
        assert_eq!(active.access_token, "ghu_first");
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, _) = store_with(backend.clone()).await;
        let record = token("ghu_same", "github.com", NOW);

        let a = store.save(record.clone()).await.unwrap();
        let b = store.save(record).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
        assert_eq!(backend.entry_count(), 1);
    }

    #[tokio::test]
    async fn first_save_becomes_active_second_does_not() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_one", "github.com", NOW)).await.unwrap();
        store.save(token("ghp_two", "github.com", NOW)).await.unwrap();

        assert_eq!(store.active().await.unwrap().access_token, "ghu_one");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn same_host_and_prefix_replaces() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_old", "github.com", NOW)).await.unwrap();
        store.save(token("ghu_new", "github.com", NOW + 1)).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.active().await.unwrap().access_token, "ghu_new");
    }

    #[tokio::test]
    async fn expiry_boundary_hides_active() {
        let (store, clock) = memory_store().await;
        let record = TokenRecord {
            expires_in: Some(3600),
            ..token("ghu_exp", "github.com", NOW - 3600)
        };
        store.save(record).await.unwrap();

        assert!(store.active().await.is_none(), "created_at + expires_in == now is expired");
        assert!(store.active_record().await.is_some(), "expired record is kept");

        clock.set(common::from_unix_seconds(NOW - 1));
        assert!(store.active().await.is_some());
    }

    #[tokio::test]
    async fn list_exposes_only_metadata() {
        let (store, clock) = memory_store().await;
        store.save(token("ghu_aaaa", "github.com", NOW)).await.unwrap();
        store
            .save(TokenRecord {
                expires_in: Some(10),
                ..token("ghp_bbbb", "ghe.example.com", NOW)
            })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(20));

        let list = store.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].host, "ghe.example.com");
        assert_eq!(list[0].prefix, "ghp_");
        assert!(list[0].expired);
        assert!(!list[0].active);
        assert_eq!(list[1].host, "github.com");
        assert!(list[1].active);

        let json = serde_json::to_string(&list).unwrap();
        assert!(!json.contains("ghu_aaaa"));
        assert!(!json.contains("ghp_bbbb"));
    }

    #[tokio::test]
    async fn delete_clears_active_pointer() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_del", "github.com", NOW)).await.unwrap();

        assert!(store.delete("ghu_").await.unwrap());
        assert!(store.active().await.is_none());
        assert!(store.active_id().await.is_none());
        assert!(!store.delete("ghu_").await.unwrap());
    }

    #[tokio::test]
    async fn delete_other_keeps_active() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_keep", "github.com", NOW)).await.unwrap();
        store.save(token("ghp_drop", "github.com", NOW)).await.unwrap();

        assert!(store.delete("ghp_").await.unwrap());
        assert_eq!(store.active().await.unwrap().access_token, "ghu_keep");
    }

    #[tokio::test]
    async fn empty_handle_matches_nothing() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_x", "github.com", NOW)).await.unwrap();
        assert!(!store.delete("").await.unwrap());
        assert!(!store.set_active("").await.unwrap());
    }

    #[tokio::test]
    async fn set_active_switches_and_reports_missing() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_one", "github.com", NOW)).await.unwrap();
        store.save(token("ghp_two", "ghe.example.com", NOW)).await.unwrap();

        assert!(store.set_active("ghp_").await.unwrap());
        let active = store.active().await.unwrap();
        assert_eq!(active.host, "ghe.example.com");

        assert!(!store.set_active("nope").await.unwrap());
        assert_eq!(store.active().await.unwrap().host, "ghe.example.com");
    }

    #[tokio::test]
    async fn set_active_prefers_newest_match() {
        let (store, _) = memory_store().await;
        store.save(token("ghu_older", "github.com", NOW - 100)).await.unwrap();
        store.save(token("ghu_newer", "ghe.example.com", NOW)).await.unwrap();

        assert!(store.set_active("ghu_").await.unwrap());
        assert_eq!(store.active().await.unwrap().access_token, "ghu_newer");
    }

    #[tokio::test]
    async fn replace_repoints_active() {
        let (store, _) = memory_store().await;
        let old = token("gho_old", "github.com", NOW);
        store.save(old.clone()).await.unwrap();

        let new = token("ghu_new", "github.com", NOW + 5);
        store.replace(&old, new).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.active().await.unwrap().access_token, "ghu_new");
    }

    #[tokio::test]
    async fn replace_after_delete_fails() {
        let (store, _) = memory_store().await;
        let old = token("ghu_gone", "github.com", NOW);
        store.save(old.clone()).await.unwrap();
        store.delete("ghu_").await.unwrap();

        let err = store
            .replace(&old, token("ghu_new", "github.com", NOW))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_replace_leaves_backend_unchanged() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, _) = store_with(backend.clone()).await;
        let old = token("gho_old", "github.com", NOW);
        store.save(old.clone()).await.unwrap();

        backend.fail_next_removals(1);
        let err = store
            .replace(&old, token("ghu_new", "github.com", NOW + 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));

        assert_eq!(backend.entry_count(), 1);
        store.reload().await.unwrap();
        assert_eq!(store.active().await.unwrap().access_token, "gho_old");
        assert!(store.contains(&old).await);
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_raw("github.com-bad_", "{definitely not json");
        backend.insert_raw(
            "github.com-empt",
            r#"{"access_token":"","host":"github.com","created_at":0}"#,
        );
        let good = token("ghu_good", "github.com", NOW);
        backend.store(&good).unwrap();

        let (store, _) = store_with(backend).await;
        let list = store.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].prefix, "ghu_");
    }

    #[tokio::test]
    async fn dangling_active_pointer_is_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        backend.store(&token("ghu_here", "github.com", NOW)).unwrap();
        backend.set_active_raw(Some("github.com-gone"));

        let (store, _) = store_with(backend.clone()).await;
        assert!(store.active().await.is_none());
        assert_eq!(backend.load_active().unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = store_with(Arc::new(PlaintextFileBackend::new(dir.path()))).await;
            store.save(token("ghu_persist", "github.com", NOW)).await.unwrap();
            store.save(token("ghp_other", "github.com", NOW)).await.unwrap();
            store.set_active("ghp_").await.unwrap();
        }

        let (store, _) = store_with(Arc::new(PlaintextFileBackend::new(dir.path()))).await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.active().await.unwrap().access_token, "ghp_other");
    }

    #[tokio::test]
    async fn reload_picks_up_external_changes() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, _) = store_with(backend.clone()).await;
        assert!(store.is_empty().await);

        backend.store(&token("ghu_ext", "github.com", NOW)).unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
