#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! A client's claim on one slot of a named role.
//!
//! [`RoleHandle::acquire`] asks the store for a slot and starts a background task that keeps
//! renewing it shortly before it runs out. Whether the role is held is judged locally from
//! the last expiration the store returned, so callers pass a lookahead sized to the work
//! they are about to do.
//!
//! All handle state sits behind one async lock. The renewal task keeps that lock for its
//! whole attempt (flag check, store call, retries, recording the result), so a concurrent
//! [`RoleHandle::release`] runs either entirely before the attempt, which then sees the
//! maintain flag cleared and makes no call, or entirely after it, and then removes the
//! holder at the store. A released role can therefore not be renewed back into existence.
//! The cost is that `release`, `is_holding` and `remaining_lease` wait while a renewal call
//! is in flight.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use roster_core::types::unix_time_ms;
use roster_store::LeaseStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("invalid role config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleConfig {
    /// How long each acquisition or renewal asks to hold the role.
    pub playtime: Duration,
    pub max_holders: u32,
    /// Time left on the lease when the last renewal retry fires.
    pub renew_margin: Duration,
    /// Retries after a failed renewal attempt, within the same cycle.
    pub renew_retries: u32,
    pub renew_retry_interval: Duration,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            playtime: Duration::from_secs(10),
            max_holders: 1,
            renew_margin: Duration::from_secs(1),
            renew_retries: 1,
            renew_retry_interval: Duration::from_secs(1),
        }
    }
}

impl RoleConfig {
    pub fn with_max_holders(max_holders: u32) -> Self {
        Self {
            max_holders,
            ..Default::default()
        }
    }

    /// Sleep between the start of one renewal cycle and the next: the playtime minus the
    /// margin and the retry budget.
    pub fn renew_interval(&self) -> Duration {
        self.playtime
            .saturating_sub(self.renew_margin)
            .saturating_sub(self.renew_retry_interval.saturating_mul(self.renew_retries))
    }

    pub fn validate(&self) -> Result<(), RoleError> {
        if self.max_holders == 0 {
            return Err(RoleError::InvalidConfig("max_holders must be >= 1".into()));
        }
        if self.playtime.is_zero() {
            return Err(RoleError::InvalidConfig("playtime must be > 0".into()));
        }
        if self.renew_interval().is_zero() {
            return Err(RoleError::InvalidConfig(format!(
                "playtime {:?} leaves no time to renew before margin {:?} and {} retries of {:?}",
                self.playtime, self.renew_margin, self.renew_retries, self.renew_retry_interval
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RoleState {
    /// Local Unix ms; 0 means never held.
    expiration_unix_time_ms: u64,
    maintain: bool,
    renewal: Option<JoinHandle<()>>,
}

impl RoleState {
    fn record_expiration(&mut self, expires_unix_time_ms: u64) {
        if expires_unix_time_ms > self.expiration_unix_time_ms {
            self.expiration_unix_time_ms = expires_unix_time_ms;
        }
    }

    fn renewal_running(&self) -> bool {
        self.renewal.as_ref().is_some_and(|task| !task.is_finished())
    }
}

struct RoleInner {
    holder: String,
    role_path: String,
    config: RoleConfig,
    store: Arc<dyn LeaseStore>,
    state: Mutex<RoleState>,
}

/// Handle on one (role path, holder) pair. Clones share the same lease.
///
/// Dropping the last clone stops renewal without releasing the role at the store; the slot
/// then frees up when its lease runs out, exactly as if the process had died.
#[derive(Clone)]
pub struct RoleHandle {
    inner: Arc<RoleInner>,
}

impl std::fmt::Debug for RoleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleHandle")
            .field("holder", &self.inner.holder)
            .field("role_path", &self.inner.role_path)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl RoleHandle {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        role_path: impl Into<String>,
        holder: impl Into<String>,
        config: RoleConfig,
    ) -> Result<Self, RoleError> {
        config.validate()?;
        let holder = holder.into();
        if holder.trim().is_empty() {
            return Err(RoleError::InvalidConfig("holder must be non-empty".into()));
        }
        Ok(Self {
            inner: Arc::new(RoleInner {
                holder,
                role_path: role_path.into(),
                config,
                store,
                state: Mutex::new(RoleState::default()),
            }),
        })
    }

    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    pub fn role_path(&self) -> &str {
        &self.inner.role_path
    }

    /// Takes (or renews) a slot in the role. Returns false on any store failure, including
    /// a full role. On success makes sure exactly one renewal task is running.
    pub async fn acquire(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        match inner
            .store
            .take_role(
                &inner.role_path,
                &inner.holder,
                inner.config.playtime,
                inner.config.max_holders,
            )
            .await
        {
            Ok(taken) => {
                state.record_expiration(taken.expires_unix_time_ms);
                state.maintain = true;
                if !state.renewal_running() {
                    state.renewal = Some(spawn_renewal(
                        Arc::downgrade(inner),
                        inner.config.renew_interval(),
                    ));
                }
                debug!(
                    machine = %inner.holder,
                    role = %inner.role_path,
                    is_new_holder = taken.is_new_holder,
                    expires_unix_time_ms = state.expiration_unix_time_ms,
                    "role acquired"
                );
                true
            }
            Err(err) if err.is_conflict() => {
                debug!(machine = %inner.holder, role = %inner.role_path, "role is full");
                false
            }
            Err(err) => {
                warn!(
                    machine = %inner.holder,
                    role = %inner.role_path,
                    error = %err,
                    "acquire failed"
                );
                false
            }
        }
    }

    /// Stops renewal and asks the store to drop this holder.
    ///
    /// On failure the handle keeps its recorded expiration; the lease then simply runs out.
    pub async fn release(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        state.maintain = false;
        // Holding the lock means the task is sleeping or waiting for the lock, never
        // mid-attempt.
        if let Some(task) = state.renewal.take() {
            task.abort();
        }

        match inner
            .store
            .release_role(&inner.role_path, &inner.holder)
            .await
        {
            Ok(_) => {
                state.expiration_unix_time_ms = 0;
                debug!(machine = %inner.holder, role = %inner.role_path, "role released");
                true
            }
            Err(err) => {
                warn!(
                    machine = %inner.holder,
                    role = %inner.role_path,
                    error = %err,
                    "release failed"
                );
                false
            }
        }
    }

    /// True iff the recorded expiration is later than now + `lookahead`.
    ///
    /// Local and non-authoritative: the store may have dropped the holder already.
    pub async fn is_holding(&self, lookahead: Duration) -> bool {
        let target = unix_time_ms().saturating_add(duration_ms(lookahead));
        let state = self.inner.state.lock().await;
        target < state.expiration_unix_time_ms
    }

    /// Seconds until the recorded expiration; negative once it has passed.
    pub async fn remaining_lease(&self) -> f64 {
        let expiration = self.expiration_unix_time_ms().await;
        (expiration as f64 - unix_time_ms() as f64) / 1000.0
    }

    pub async fn expiration_unix_time_ms(&self) -> u64 {
        self.inner.state.lock().await.expiration_unix_time_ms
    }

    /// Fresh read of the holders with time left, or `None` if the store could not be read.
    /// Holders may disappear right after the read.
    pub async fn active_holders(&self) -> Option<BTreeSet<String>> {
        match self.inner.store.read_role(&self.inner.role_path).await {
            Ok(read) => Some(read.active_holders()),
            Err(err) => {
                debug!(role = %self.inner.role_path, error = %err, "read role failed");
                None
            }
        }
    }
}

impl RoleInner {
    /// One renewal cycle. Returns whether the renewal task should keep going.
    async fn renew(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.expiration_unix_time_ms <= unix_time_ms() {
            // Re-taking a lapsed lease would quietly claim a role the owner no longer acts
            // on; a fresh acquire is needed instead.
            state.maintain = false;
            // This task is about to exit; a later acquire must spawn a fresh one.
            state.renewal = None;
            info!(machine = %self.holder, role = %self.role_path, "lease lapsed; renewal stopped");
            return false;
        }

        let mut retries_left = self.config.renew_retries;
        loop {
            if !state.maintain {
                return false;
            }
            match self
                .store
                .take_role(
                    &self.role_path,
                    &self.holder,
                    self.config.playtime,
                    self.config.max_holders,
                )
                .await
            {
                Ok(taken) => {
                    state.record_expiration(taken.expires_unix_time_ms);
                    debug!(
                        machine = %self.holder,
                        role = %self.role_path,
                        expires_unix_time_ms = state.expiration_unix_time_ms,
                        "role renewed"
                    );
                    return true;
                }
                Err(err) if retries_left == 0 => {
                    warn!(
                        machine = %self.holder,
                        role = %self.role_path,
                        error = %err,
                        "renewal failed; giving up for this cycle"
                    );
                    return true;
                }
                Err(err) => {
                    retries_left -= 1;
                    debug!(
                        machine = %self.holder,
                        role = %self.role_path,
                        error = %err,
                        retries_left,
                        "renewal failed; retrying"
                    );
                    tokio::time::sleep(self.config.renew_retry_interval).await;
                }
            }
        }
    }
}

impl Drop for RoleInner {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().renewal.take() {
            task.abort();
        }
    }
}

fn spawn_renewal(inner: Weak<RoleInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !inner.renew().await {
                break;
            }
        }
    })
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_leaves_margin_and_retry_budget() {
        let config = RoleConfig::default();
        assert_eq!(config.renew_interval(), Duration::from_secs(8));

        let tight = RoleConfig {
            playtime: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(matches!(tight.validate(), Err(RoleError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn lapsed_renewal_lets_the_next_acquire_restart_it() {
        let store = Arc::new(roster_store::mem::MemLeaseStore::default());
        let handle = RoleHandle::new(
            store,
            "/manager_workers/unit/manager",
            "40001",
            RoleConfig::with_max_holders(1),
        )
        .unwrap();
        assert!(handle.acquire().await);

        handle.inner.state.lock().await.expiration_unix_time_ms = 1;
        assert!(!handle.inner.renew().await);
        {
            let state = handle.inner.state.lock().await;
            assert!(state.renewal.is_none());
            assert!(!state.maintain);
        }

        assert!(handle.acquire().await);
        let state = handle.inner.state.lock().await;
        assert!(state.maintain);
        assert!(state.renewal_running());
    }

    #[test]
    fn zero_holders_is_rejected() {
        assert!(RoleConfig::with_max_holders(0).validate().is_err());
        assert!(RoleConfig::with_max_holders(3).validate().is_ok());
    }
}
