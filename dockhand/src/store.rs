// Copyright 2024 Oxide Computer Company

//! Interfaces to the persistent store, as far as the core needs them
//!
//! The control plane keeps apps (and the lock embedded in each app record) in
//! a shared database so that every API instance sees the same state.  The
//! core only needs two things from it: look up an app by name, and atomically
//! install or clear the lock on one app.  Those are the [`AppStore`] and
//! [`LockStore`] traits.  [`MemoryStore`] implements both for embedding and
//! tests.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// The lock record embedded in an app.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AppLock {
    pub locked: bool,
    pub owner: String,
    pub reason: String,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl AppLock {
    /// Renders the lock for a conflict message, e.g.
    /// `App locked by alice@example.com, running POST /apps/myapp/env.
    /// Acquired in 2024-05-01T10:00:00Z`.
    pub fn describe(&self) -> String {
        let acquired = self
            .acquired_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        format!(
            "App locked by {}, running {}. Acquired in {}",
            self.owner, self.reason, acquired
        )
    }
}

impl fmt::Display for AppLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.locked {
            f.write_str(&self.describe())
        } else {
            f.write_str("Not locked")
        }
    }
}

/// The fields of an app record the core reads.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct App {
    pub name: String,
    pub platform: String,
    pub pool: String,
    pub teams: Vec<String>,
    #[serde(default)]
    pub lock: AppLock,
}

impl App {
    pub fn new(name: &str, platform: &str, pool: &str, teams: &[&str]) -> Self {
        App {
            name: name.to_string(),
            platform: platform.to_string(),
            pool: pool.to_string(),
            teams: teams.iter().map(|t| t.to_string()).collect(),
            lock: AppLock::default(),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for crate::HttpError {
    fn from(error: StoreError) -> Self {
        crate::HttpError::for_internal_error(error.to_string())
    }
}

/// Outcome of one attempt to install a lock.
#[derive(Clone, Debug, PartialEq)]
pub enum TryLock {
    Acquired,
    /// somebody else holds the lock; this is its live record
    Held(AppLock),
    AppNotFound,
}

#[async_trait]
pub trait AppStore: Send + Sync + 'static {
    async fn get_app(&self, name: &str) -> Result<Option<App>, StoreError>;
}

/// The atomic lock primitive.  Implementations must make `try_lock` a single
/// conditional update ("set locked if not locked"), so that two processes
/// sharing the store can never both observe `Acquired`.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    async fn try_lock(
        &self,
        app: &str,
        owner: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<TryLock, StoreError>;

    /// Clears the lock.  Unlocking an unlocked (or missing) app is not an
    /// error.
    async fn unlock(&self, app: &str) -> Result<(), StoreError>;

    async fn get_lock(&self, app: &str) -> Result<Option<AppLock>, StoreError>;
}

/// An in-process store.  The mutex plays the role of the database's
/// conditional update.
#[derive(Debug, Default)]
pub struct MemoryStore {
    apps: Mutex<BTreeMap<String, App>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Inserts or replaces an app record, lock included.
    pub fn insert_app(&self, app: App) {
        self.apps.lock().unwrap().insert(app.name.clone(), app);
    }

    pub fn remove_app(&self, name: &str) -> Option<App> {
        self.apps.lock().unwrap().remove(name)
    }
}

#[async_trait]
impl AppStore for MemoryStore {
    async fn get_app(&self, name: &str) -> Result<Option<App>, StoreError> {
        Ok(self.apps.lock().unwrap().get(name).cloned())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_lock(
        &self,
        app: &str,
        owner: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<TryLock, StoreError> {
        let mut apps = self.apps.lock().unwrap();
        let record = match apps.get_mut(app) {
            Some(record) => record,
            None => return Ok(TryLock::AppNotFound),
        };
        if record.lock.locked {
            return Ok(TryLock::Held(record.lock.clone()));
        }
        record.lock = AppLock {
            locked: true,
            owner: owner.to_string(),
            reason: reason.to_string(),
            acquired_at: Some(at),
        };
        Ok(TryLock::Acquired)
    }

    async fn unlock(&self, app: &str) -> Result<(), StoreError> {
        if let Some(record) = self.apps.lock().unwrap().get_mut(app) {
            record.lock = AppLock::default();
        }
        Ok(())
    }

    async fn get_lock(&self, app: &str) -> Result<Option<AppLock>, StoreError> {
        Ok(self.apps.lock().unwrap().get(app).map(|a| a.lock.clone()))
    }
}
