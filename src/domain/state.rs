//! Synchronization state of a file on a backend

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackendId, FileId};

/// Agreement between the local cache and the backend for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    NoCache,
    SyncingToCache,
    InSync,
    SyncingToProvider,
    CacheNewer,
    ProviderNewer,
    Corrupted,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NoCache => "no_cache",
            SyncState::SyncingToCache => "syncing_to_cache",
            SyncState::InSync => "in_sync",
            SyncState::SyncingToProvider => "syncing_to_provider",
            SyncState::CacheNewer => "cache_newer",
            SyncState::ProviderNewer => "provider_newer",
            SyncState::Corrupted => "corrupted",
        }
    }

    /// True while a transfer is in flight
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncState::SyncingToCache | SyncState::SyncingToProvider)
    }

    /// True if a cache fill may start from this state.
    ///
    /// `Corrupted` only ever follows a partial fill, so the backend still
    /// holds the good copy and refilling is the repair.
    pub fn can_fill(&self) -> bool {
        matches!(
            self,
            SyncState::NoCache | SyncState::ProviderNewer | SyncState::Corrupted
        )
    }

    /// True if a push to the backend may start from this state
    pub fn can_push(&self) -> bool {
        matches!(self, SyncState::InSync | SyncState::CacheNewer)
    }

    /// State to fall back to when the holder of a transfer disappeared.
    ///
    /// An interrupted push leaves the backend copy unreliable but the cache
    /// intact, so the cache stays the newer side and can be pushed again.
    pub fn after_interruption(&self) -> SyncState {
        match self {
            SyncState::SyncingToCache => SyncState::ProviderNewer,
            SyncState::SyncingToProvider => SyncState::CacheNewer,
            other => *other,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_cache" => Ok(SyncState::NoCache),
            "syncing_to_cache" => Ok(SyncState::SyncingToCache),
            "in_sync" => Ok(SyncState::InSync),
            "syncing_to_provider" => Ok(SyncState::SyncingToProvider),
            "cache_newer" => Ok(SyncState::CacheNewer),
            "provider_newer" => Ok(SyncState::ProviderNewer),
            "corrupted" => Ok(SyncState::Corrupted),
            _ => Err(format!("Unknown sync state: {}", s)),
        }
    }
}

/// Key of a sync record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub file_id: FileId,
    pub backend_id: BackendId,
}

impl SyncKey {
    pub fn new(file_id: FileId, backend_id: BackendId) -> Self {
        Self {
            file_id,
            backend_id,
        }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_id, self.backend_id)
    }
}

/// Persisted state plus lock bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRecord {
    pub file_id: FileId,
    pub backend_id: BackendId,
    pub state: SyncState,

    /// Token of the process holding the modification lock
    pub lock_holder: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncRecord {
    pub fn key(&self) -> SyncKey {
        SyncKey::new(self.file_id, self.backend_id)
    }

    /// True if a holder owns the lock and its expiry is still ahead
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_holder, self.lock_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// True if a holder once owned the lock and let it expire
    pub fn has_stale_lock_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_holder.is_some() && !self.is_locked_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_string_roundtrip() {
        for state in [
            SyncState::NoCache,
            SyncState::SyncingToCache,
            SyncState::InSync,
            SyncState::SyncingToProvider,
            SyncState::CacheNewer,
            SyncState::ProviderNewer,
            SyncState::Corrupted,
        ] {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("bogus".parse::<SyncState>().is_err());
    }

    #[test]
    fn transition_sources() {
        assert!(SyncState::NoCache.can_fill());
        assert!(SyncState::ProviderNewer.can_fill());
        assert!(!SyncState::CacheNewer.can_fill());
        assert!(SyncState::CacheNewer.can_push());
        assert!(SyncState::InSync.can_push());
        assert!(!SyncState::NoCache.can_push());
        assert!(!SyncState::Corrupted.can_push());
    }

    #[test]
    fn interruption_fallbacks() {
        assert_eq!(
            SyncState::SyncingToCache.after_interruption(),
            SyncState::ProviderNewer
        );
        assert_eq!(
            SyncState::SyncingToProvider.after_interruption(),
            SyncState::CacheNewer
        );
        assert!(!SyncState::SyncingToProvider.after_interruption().can_fill());
        assert!(SyncState::SyncingToProvider.after_interruption().can_push());
        assert_eq!(SyncState::InSync.after_interruption(), SyncState::InSync);
    }

    #[test]
    fn lock_expiry() {
        let now = Utc::now();
        let mut record = SyncRecord {
            file_id: FileId::new(1),
            backend_id: BackendId::new(1),
            state: SyncState::SyncingToCache,
            lock_holder: Some("host:1:abc".into()),
            lock_expires_at: Some(now + Duration::seconds(30)),
            updated_at: now,
            accessed_at: now,
            synced_at: None,
        };
        assert!(record.is_locked_at(now));
        assert!(!record.has_stale_lock_at(now));

        record.lock_expires_at = Some(now - Duration::seconds(1));
        assert!(!record.is_locked_at(now));
        assert!(record.has_stale_lock_at(now));
    }
}
