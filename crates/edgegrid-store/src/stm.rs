//! Optimistic software-transactional access to the store.
//!
//! A transaction function receives an [`Stm`] handle. Reads through the
//! handle are recorded with the mod revision they observed and writes are
//! buffered. On return the read set becomes a list of compares and the
//! buffered writes commit atomically; if any read key changed meanwhile
//! the store reports a conflict and [`apply_stm`] runs the function again.
//!
//! Transaction functions may run several times. They must not cause side
//! effects except through the handle, and must rebuild any values they
//! write from their inputs on every attempt.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use edgegrid_core::config::StmRetryConfig;
use edgegrid_core::{ObjKey, StoredObject};
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::keys::{db_key, type_prefix};
use crate::kv::{Compare, KvStore, LeaseId, TxnOp, TxnRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self::from(&StmRetryConfig::default())
    }
}

impl From<&StmRetryConfig> for StmConfig {
    fn from(cfg: &StmRetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_backoff: Duration::from_millis(cfg.base_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put {
        value: String,
        lease: Option<LeaseId>,
    },
    Delete,
}

/// Transaction handle passed to STM functions.
pub struct Stm<'a> {
    store: &'a dyn KvStore,
    region: u32,
    snapshot_rev: u64,
    reads: HashMap<String, u64>,
    writes: BTreeMap<String, PendingWrite>,
    stale: bool,
}

impl<'a> Stm<'a> {
    pub fn new(store: &'a dyn KvStore, region: u32) -> StoreResult<Self> {
        Ok(Self {
            store,
            region,
            snapshot_rev: store.revision()?,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            stale: false,
        })
    }

    pub fn region(&self) -> u32 {
        self.region
    }

    /// Revision of the store when the transaction started.
    pub fn snapshot_rev(&self) -> u64 {
        self.snapshot_rev
    }

    /// Set once a read observed a value newer than the snapshot. The
    /// attempt is then discarded and retried no matter what the function
    /// returned, since its view may have been inconsistent.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn get_raw(&mut self, key: &str) -> StoreResult<Option<String>> {
        if let Some(write) = self.writes.get(key) {
            return Ok(match write {
                PendingWrite::Put { value, .. } => Some(value.clone()),
                PendingWrite::Delete => None,
            });
        }
        let entry = self.store.get(key)?;
        let mod_rev = entry.as_ref().map_or(0, |e| e.mod_rev);
        if mod_rev > self.snapshot_rev {
            trace!(%key, mod_rev, snapshot = self.snapshot_rev, "read past snapshot");
            self.stale = true;
        }
        self.reads.entry(key.to_string()).or_insert(mod_rev);
        Ok(entry.map(|e| e.value))
    }

    pub fn get<T: StoredObject>(&mut self, key: &T::Key) -> StoreResult<Option<T>> {
        let db = db_key::<T>(self.region, key);
        match self.get_raw(&db)? {
            Some(value) => {
                let obj = serde_json::from_str(&value)
                    .map_err(|e| StoreError::Deserialize(format!("{db}: {e}")))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// Every object of type `T`, with pending writes applied. Each
    /// listed key joins the read set; keys created by others after the
    /// listing are not detected, so callers that need that must also
    /// read and write a shared guard key.
    pub fn list<T: StoredObject>(&mut self) -> StoreResult<Vec<T>> {
        let prefix = type_prefix(self.region, T::TYPE_TAG);
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for (key, entry) in self.store.list(&prefix)? {
            if entry.mod_rev > self.snapshot_rev {
                trace!(%key, mod_rev = entry.mod_rev, snapshot = self.snapshot_rev, "listed past snapshot");
                self.stale = true;
            }
            self.reads.entry(key.clone()).or_insert(entry.mod_rev);
            merged.insert(key, entry.value);
        }
        for (key, write) in self.writes.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            match write {
                PendingWrite::Put { value, .. } => {
                    merged.insert(key.clone(), value.clone());
                }
                PendingWrite::Delete => {
                    merged.remove(key);
                }
            }
        }
        merged
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_str(&value)
                    .map_err(|e| StoreError::Deserialize(format!("{key}: {e}")))
            })
            .collect()
    }

    pub fn exists<T: StoredObject>(&mut self, key: &T::Key) -> StoreResult<bool> {
        Ok(self.get_raw(&db_key::<T>(self.region, key))?.is_some())
    }

    pub fn put<T: StoredObject>(&mut self, obj: &T) -> StoreResult<()> {
        self.put_inner(obj, None)
    }

    /// Write an object that the store deletes when `lease` expires.
    pub fn put_with_lease<T: StoredObject>(&mut self, obj: &T, lease: LeaseId) -> StoreResult<()> {
        self.put_inner(obj, Some(lease))
    }

    pub fn delete<T: StoredObject>(&mut self, key: &T::Key) {
        self.writes
            .insert(db_key::<T>(self.region, key), PendingWrite::Delete);
    }

    fn put_inner<T: StoredObject>(&mut self, obj: &T, lease: Option<LeaseId>) -> StoreResult<()> {
        let value = serde_json::to_string(obj)
            .map_err(|e| StoreError::Serialize(format!("{}: {e}", obj.key().key_string())))?;
        self.writes.insert(
            db_key::<T>(self.region, obj.key()),
            PendingWrite::Put { value, lease },
        );
        Ok(())
    }

    fn into_request(self) -> TxnRequest {
        let mut compares: Vec<Compare> = self
            .reads
            .iter()
            .map(|(key, &rev)| Compare::ModRev {
                key: key.clone(),
                rev,
            })
            .collect();
        compares.sort_by(|a, b| a.key().cmp(b.key()));
        // Blind writes must not clobber a change made after the snapshot.
        for key in self.writes.keys() {
            if !self.reads.contains_key(key) {
                compares.push(Compare::ModRevAtMost {
                    key: key.clone(),
                    rev: self.snapshot_rev,
                });
            }
        }
        let ops = self
            .writes
            .into_iter()
            .map(|(key, write)| match write {
                PendingWrite::Put { value, lease } => TxnOp::Put { key, value, lease },
                PendingWrite::Delete => TxnOp::Delete { key },
            })
            .collect();
        TxnRequest { compares, ops }
    }
}

/// Run `apply` as an optimistic transaction, retrying on conflicts with
/// bounded exponential backoff. Returns the commit revision. Errors
/// returned by `apply` come back unchanged.
pub async fn apply_stm<F, E>(
    store: &dyn KvStore,
    region: u32,
    config: &StmConfig,
    mut apply: F,
) -> Result<u64, E>
where
    F: FnMut(&mut Stm<'_>) -> Result<(), E>,
    E: From<StoreError>,
{
    let mut backoff = config.base_backoff;
    for attempt in 1..=config.max_attempts {
        {
            let mut stm = Stm::new(store, region)?;
            let outcome = apply(&mut stm);
            if stm.is_stale() {
                debug!(attempt, "stm attempt saw a newer revision, retrying");
            } else {
                outcome?;
                match store.commit(stm.into_request()) {
                    Ok(rev) => return Ok(rev),
                    Err(StoreError::Conflict) => debug!(attempt, "stm commit conflict, retrying"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }
    Err(StoreError::TooManyRetries(config.max_attempts).into())
}
