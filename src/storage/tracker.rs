//! Per-(file, backend) sync state machine with cross-process exclusion
//!
//! Every state-changing operation runs under the record lock held in the
//! shared [`StateStore`]. The tracker polls for the lock, applies the
//! transition rules, runs the caller's mutation and commits the outcome only
//! if the mutation succeeded.
//!
//! ```text
//! fill:    NoCache | ProviderNewer | Corrupted -> SyncingToCache -> InSync
//!                                                               \-> Corrupted (partial)
//! push:    InSync | CacheNewer -> SyncingToProvider -> InSync
//!                                                 \-> CacheNewer (failure)
//! destroy: any -> NoCache
//! ```
//!
//! A lock whose holder vanished mid-transfer is stolen by the next
//! acquirer: an interrupted fill reads as `ProviderNewer`, an interrupted
//! push as `CacheNewer`.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;

use crate::domain::{SyncKey, SyncRecord, SyncState};
use crate::error::{Error, Result};
use crate::storage::config::SyncSettings;
use crate::storage::state_store::{Release, StateStore};

/// How `ready_to_modify` leaves the record after a successful mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Keep the state found when the lock was taken
    Keep,
    /// Set an explicit state
    State(SyncState),
    /// Drop the record, back to `NoCache`
    Destroy,
}

pub struct SyncStateTracker {
    store: Arc<dyn StateStore>,
    settings: SyncSettings,
    holder: String,
}

impl SyncStateTracker {
    pub fn new(store: Arc<dyn StateStore>, settings: SyncSettings) -> Self {
        Self {
            store,
            settings,
            holder: holder_token(),
        }
    }

    /// Token identifying this tracker as a lock holder
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Current state as the next lock holder would see it
    pub fn state(&self, key: SyncKey) -> Result<SyncState> {
        let Some(record) = self.store.get(key)? else {
            return Ok(SyncState::NoCache);
        };

        let state = if record.has_stale_lock_at(Utc::now()) {
            record.state.after_interruption()
        } else {
            record.state
        };

        Ok(self.apply_trust(&record, state))
    }

    /// Brings the cache up to date by running `transfer` under the lock.
    ///
    /// Returns `None` without calling `transfer` if the cache is already
    /// in sync once the lock is held.
    pub fn fill<T>(&self, key: SyncKey, transfer: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
        let (lock, record) = self.acquire(key)?;
        let state = self.apply_trust(&record, record.state);

        if state == SyncState::InSync {
            tracing::debug!(key = %key, "Cache already in sync");
            lock.finish(Release::Commit { state, synced: false })?;
            return Ok(None);
        }

        if !state.can_fill() {
            return Err(Error::InvalidState {
                file_id: key.file_id,
                state,
                operation: "fill the cache of",
            });
        }

        lock.enter(SyncState::SyncingToCache)?;
        tracing::debug!(key = %key, from = %state, "Filling cache");

        match transfer() {
            Ok(value) => {
                lock.finish(Release::Commit {
                    state: SyncState::InSync,
                    synced: true,
                })?;
                Ok(Some(value))
            }
            Err(err) => {
                let fallback = if err.is_partial() {
                    SyncState::Corrupted
                } else {
                    record.state
                };
                tracing::warn!(key = %key, error = %err, state = %fallback, "Cache fill failed");
                lock.finish(Release::Commit {
                    state: fallback,
                    synced: false,
                })?;
                Err(err)
            }
        }
    }

    /// Uploads local changes by running `transfer` under the lock
    pub fn push<T>(&self, key: SyncKey, transfer: impl FnOnce() -> Result<T>) -> Result<T> {
        let (lock, record) = self.acquire(key)?;

        if !record.state.can_push() {
            return Err(Error::InvalidState {
                file_id: key.file_id,
                state: record.state,
                operation: "push",
            });
        }

        lock.enter(SyncState::SyncingToProvider)?;
        tracing::debug!(key = %key, from = %record.state, "Pushing to backend");

        match transfer() {
            Ok(value) => {
                lock.finish(Release::Commit {
                    state: SyncState::InSync,
                    synced: true,
                })?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Push failed, keeping local changes");
                lock.finish(Release::Commit {
                    state: SyncState::CacheNewer,
                    synced: false,
                })?;
                Err(err)
            }
        }
    }

    /// Runs `mutation` under the lock and commits `finish` if it succeeds.
    /// On failure the state found when the lock was taken is restored.
    pub fn ready_to_modify<T>(
        &self,
        key: SyncKey,
        finish: Finish,
        mutation: impl FnOnce(SyncState) -> Result<T>,
    ) -> Result<T> {
        self.ready_to_settle(key, |state| mutation(state).map(|value| (value, finish)))
    }

    /// Like [`ready_to_modify`](Self::ready_to_modify), with the mutation
    /// choosing how the record is left
    pub fn ready_to_settle<T>(
        &self,
        key: SyncKey,
        mutation: impl FnOnce(SyncState) -> Result<(T, Finish)>,
    ) -> Result<T> {
        let (lock, record) = self.acquire(key)?;
        let (value, finish) = mutation(record.state)?;

        let release = match finish {
            Finish::Keep => Release::Commit {
                state: record.state,
                synced: false,
            },
            Finish::State(state) => Release::Commit {
                state,
                synced: state == SyncState::InSync,
            },
            Finish::Destroy => Release::Destroy,
        };
        lock.finish(release)?;

        Ok(value)
    }

    /// Invalidates a transfer left behind by a holder whose lock expired
    pub fn recover(&self, key: SyncKey) -> Result<Option<SyncState>> {
        let recovered = self.store.reset_stale(key)?;
        if let Some(state) = recovered {
            tracing::info!(key = %key, state = %state, "Recovered interrupted sync");
        }
        Ok(recovered)
    }

    fn apply_trust(&self, record: &SyncRecord, state: SyncState) -> SyncState {
        let Some(window) = self.settings.cache_trust_expire() else {
            return state;
        };
        let Some(synced_at) = record.synced_at else {
            return state;
        };

        let expired = chrono::Duration::from_std(window)
            .map(|window| synced_at + window < Utc::now())
            .unwrap_or(false);

        if state == SyncState::InSync && expired {
            SyncState::ProviderNewer
        } else {
            state
        }
    }

    fn acquire(&self, key: SyncKey) -> Result<(HeldLock<'_>, SyncRecord)> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(record) = self.store.try_acquire(key, &self.holder, self.settings.lock_ttl())? {
                let lock = HeldLock {
                    tracker: self,
                    key,
                    restore: record.state,
                    done: false,
                };
                return Ok((lock, record));
            }

            if started.elapsed() >= self.settings.max_wait() {
                return Err(Error::Transient(format!(
                    "timed out after {}s waiting for the lock on {}",
                    self.settings.max_wait_secs, key
                )));
            }

            if !announced {
                tracing::debug!(key = %key, "Waiting for sync lock");
                announced = true;
            }
            thread::sleep(self.settings.poll_interval());
        }
    }
}

/// A lock taken through the store; restores the original state if dropped
/// without an explicit finish
struct HeldLock<'a> {
    tracker: &'a SyncStateTracker,
    key: SyncKey,
    restore: SyncState,
    done: bool,
}

impl HeldLock<'_> {
    fn enter(&self, state: SyncState) -> Result<()> {
        if self
            .tracker
            .store
            .set_locked_state(self.key, &self.tracker.holder, state)?
        {
            Ok(())
        } else {
            Err(self.lost())
        }
    }

    fn finish(mut self, release: Release) -> Result<()> {
        self.done = true;
        if self
            .tracker
            .store
            .release(self.key, &self.tracker.holder, release)?
        {
            Ok(())
        } else {
            Err(self.lost())
        }
    }

    fn lost(&self) -> Error {
        tracing::warn!(key = %self.key, "Sync lock expired while held");
        Error::Transient(format!("lock on {} expired during the operation", self.key))
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let release = Release::Commit {
            state: self.restore,
            synced: false,
        };
        if let Err(err) = self
            .tracker
            .store
            .release(self.key, &self.tracker.holder, release)
        {
            tracing::warn!(key = %self.key, error = %err, "Failed to release sync lock");
        }
    }
}

fn holder_token() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());

    format!("{}:{}:{}", host, std::process::id(), uuid::Uuid::new_v4())
}
