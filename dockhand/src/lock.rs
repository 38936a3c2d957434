// Copyright 2024 Oxide Computer Company

//! Per-app mutation lock
//!
//! Every mutating request against an app holds that app's lock for as long as
//! its handler runs.  The lock lives in the shared store (see
//! [`crate::store::LockStore`]) so that several API processes serialize
//! against each other, not just requests within one process.
//!
//! Waiting for a held lock is a retry loop: each attempt is one atomic
//! conditional update in the store; between attempts the waiter sleeps for
//! the poll interval.  Releases made through this process also wake local
//! waiters early, so contention between requests served by the same process
//! resolves without waiting out the interval.  There is no FIFO among
//! waiters: whichever attempt lands first after a release wins.

use crate::error::HttpError;
use crate::store::AppLock;
use crate::store::LockStore;
use crate::store::StoreError;
use crate::store::TryLock;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone, Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was still held when the wait expired.  `lock` is the
    /// holder's record as of the last attempt.  The message names the app so
    /// that callers locking several apps can tell which one was busy.
    #[error("{app}: {}", .lock.describe())]
    Held { app: String, lock: AppLock },
    #[error("App not found")]
    AppNotFound { app: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for HttpError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Held { .. } => {
                HttpError::for_conflict(error.to_string())
            }
            LockError::AppNotFound { .. } => {
                HttpError::for_not_found(error.to_string())
            }
            LockError::Store(e) => e.into(),
        }
    }
}

/// Acquires and releases app locks against a [`LockStore`].
#[derive(Clone)]
pub struct AppLockManager {
    store: Arc<dyn LockStore>,
    poll_interval: Duration,
    released: Arc<Notify>,
}

impl std::fmt::Debug for AppLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLockManager")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl AppLockManager {
    pub fn new(store: Arc<dyn LockStore>, poll_interval: Duration) -> Self {
        AppLockManager {
            store,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            released: Arc::new(Notify::new()),
        }
    }

    /// Takes the lock on `app`, retrying for at most `max_wait`.  With a zero
    /// `max_wait` this makes exactly one attempt.
    pub async fn acquire_with_wait(
        &self,
        app: &str,
        owner: &str,
        reason: &str,
        max_wait: Duration,
    ) -> Result<AppLockGuard, LockError> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Register for wakeups before the attempt so that a release
            // landing between the attempt and the sleep is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attempt =
                self.store.try_lock(app, owner, reason, Utc::now()).await?;
            let lock = match attempt {
                TryLock::Acquired => {
                    return Ok(AppLockGuard {
                        manager: self.clone(),
                        app: app.to_string(),
                        armed: true,
                    });
                }
                TryLock::AppNotFound => {
                    return Err(LockError::AppNotFound {
                        app: app.to_string(),
                    });
                }
                TryLock::Held(lock) => lock,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Held { app: app.to_string(), lock });
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes the locks on every app in `apps`, one after the other.  If any
    /// acquisition fails, the locks already taken are released before the
    /// error is returned.  Repeated names are locked once.
    pub async fn acquire_many(
        &self,
        apps: &[&str],
        owner: &str,
        reason: &str,
        max_wait: Duration,
    ) -> Result<Vec<AppLockGuard>, LockError> {
        let mut guards: Vec<AppLockGuard> = Vec::with_capacity(apps.len());
        for app in apps {
            if guards.iter().any(|g| g.app() == *app) {
                continue;
            }
            match self.acquire_with_wait(app, owner, reason, max_wait).await {
                Ok(guard) => guards.push(guard),
                Err(error) => {
                    for guard in guards {
                        // The acquisition error is the one worth reporting.
                        let _ = guard.release().await;
                    }
                    return Err(error);
                }
            }
        }
        Ok(guards)
    }

    /// Clears the lock on `app` and wakes local waiters.
    pub async fn release(&self, app: &str) -> Result<(), LockError> {
        self.store.unlock(app).await?;
        self.released.notify_waiters();
        Ok(())
    }

    /// Clears the lock on `app` regardless of who holds it.  Used to recover
    /// from holders that died without releasing.
    pub async fn force_unlock(&self, app: &str) -> Result<(), LockError> {
        match self.store.get_lock(app).await? {
            None => Err(LockError::AppNotFound { app: app.to_string() }),
            Some(_) => self.release(app).await,
        }
    }

    /// Returns the live lock record for `app`.
    pub async fn get_lock(&self, app: &str) -> Result<AppLock, LockError> {
        self.store
            .get_lock(app)
            .await?
            .ok_or_else(|| LockError::AppNotFound { app: app.to_string() })
    }
}

/// A held app lock.  Dropping the guard releases the lock in the background;
/// [`AppLockGuard::release`] does it inline and reports errors, and
/// [`AppLockGuard::keep`] hands the lock to whatever work outlives the guard.
#[must_use = "dropping the guard releases the lock"]
#[derive(Debug)]
pub struct AppLockGuard {
    manager: AppLockManager,
    app: String,
    armed: bool,
}

impl AppLockGuard {
    pub fn app(&self) -> &str {
        &self.app
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        self.manager.release(&self.app).await
    }

    /// Leaves the lock held.  Whoever takes over must eventually release it
    /// through [`AppLockManager::release`].
    pub fn keep(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.app)
    }
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let app = std::mem::take(&mut self.app);
            handle.spawn(async move {
                let _ = manager.release(&app).await;
            });
        }
    }
}
