//! The key pool: per-scope availability, sidelining, and reactivation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{PoolError, Result};

/// Build the scope string for a request, joining host and path with a
/// separator that can appear in neither.
pub fn scope_key(host: &str, path: &str) -> String {
    format!("{host}|{path}")
}

/// A key handed out by [`KeyPool::acquire`], together with its stable index
/// in the original key list.
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub key: String,
    pub index: usize,
}

/// Per-scope availability state. Indices refer to positions in the original
/// key list; a non-empty index is in exactly one of the two maps.
#[derive(Debug, Default)]
struct ScopeState {
    /// Key index -> key value, for keys currently in rotation.
    available: HashMap<usize, String>,
    /// Key index -> reactivation deadline, for sidelined keys.
    failing: HashMap<usize, Instant>,
}

/// Sorted view of a scope's state, for assertions and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSnapshot {
    pub available: Vec<usize>,
    pub failing: Vec<usize>,
}

/// Pool of API keys with independent availability tracking per scope.
///
/// The original key list is immutable; empty entries keep their index so
/// that indices stay stable, but are never handed out. All operations take
/// a single process-wide lock and never block while holding it.
#[derive(Debug)]
pub struct KeyPool {
    /// Original key list, used for index mapping and reactivation.
    keys: Vec<String>,
    /// Number of non-empty entries in `keys`.
    valid_key_count: usize,
    /// How long a sidelined key stays out of rotation in a scope.
    removal_duration: Duration,
    /// Scope string -> state, created lazily on first use.
    scopes: Mutex<HashMap<String, ScopeState>>,
}

impl KeyPool {
    /// Create a pool from an ordered key list and a sideline duration.
    ///
    /// Fails if the list is empty, if every entry is empty, or if the
    /// duration is zero. Empty entries are retained positionally and logged.
    pub fn new(keys: Vec<String>, removal_duration: Duration) -> Result<Self> {
        if keys.is_empty() {
            return Err(PoolError::NoKeys);
        }
        if removal_duration.is_zero() {
            return Err(PoolError::InvalidRemovalDuration);
        }

        let valid_key_count = keys.iter().filter(|k| !k.is_empty()).count();
        if valid_key_count == 0 {
            return Err(PoolError::NoValidKeys);
        }
        for (index, key) in keys.iter().enumerate() {
            if key.is_empty() {
                tracing::warn!(index, "empty key in configured list; slot will never be used");
            }
        }

        tracing::info!(
            valid = valid_key_count,
            total = keys.len(),
            "initialized key pool; scopes are created on demand"
        );

        Ok(Self {
            keys,
            valid_key_count,
            removal_duration,
            scopes: Mutex::new(HashMap::new()),
        })
    }

    /// Pick a key for the given scope.
    ///
    /// Selection starts at a uniformly random index in the original list and
    /// probes linearly, returning the first index available in this scope.
    /// Random start spreads load without a per-scope counter and avoids
    /// persistent skew after a prefix of indices has been sidelined.
    ///
    /// When every valid key is sidelined, a just-in-time reactivation pass
    /// runs before failing with [`PoolError::AllFailing`]. The background
    /// sweep is coarser than small removal durations, so this path must stay.
    pub fn acquire(&self, scope: &str) -> Result<KeyLease> {
        let mut scopes = self.lock_scopes();
        let state = Self::state_entry(&mut scopes, &self.keys, scope);

        if state.available.is_empty() {
            if !state.failing.is_empty() && state.failing.len() == self.valid_key_count {
                let reactivated = Self::reactivate_state(&self.keys, scope, state);
                tracing::info!(
                    scope,
                    reactivated,
                    "all keys failing; ran just-in-time reactivation check"
                );
                if state.available.is_empty() {
                    return Err(PoolError::AllFailing(scope.to_owned()));
                }
            } else {
                tracing::error!(
                    scope,
                    failing = state.failing.len(),
                    valid = self.valid_key_count,
                    "no keys available and not all valid keys are failing"
                );
                return Err(PoolError::NoneConfigured(scope.to_owned()));
            }
        }

        let len = self.keys.len();
        let start = rand::rng().random_range(0..len);
        let index = (0..len)
            .map(|i| (start + i) % len)
            .find(|i| state.available.contains_key(i));

        match index {
            Some(index) => {
                let key = state.available[&index].clone();
                tracing::debug!(
                    scope,
                    index,
                    remaining = state.available.len(),
                    "selected key"
                );
                Ok(KeyLease { key, index })
            }
            None => {
                tracing::error!(scope, "probe found no key despite a non-empty available set");
                Err(PoolError::NoneConfigured(scope.to_owned()))
            }
        }
    }

    /// Sideline a key for this scope until `removal_duration` has passed.
    ///
    /// A no-op when the index is already sidelined or not usable in this
    /// scope, so the call is idempotent and never extends an existing
    /// sideline.
    pub fn mark_failed(&self, scope: &str, index: usize) {
        let mut scopes = self.lock_scopes();
        let state = Self::state_entry(&mut scopes, &self.keys, scope);

        if state.available.remove(&index).is_some() {
            state
                .failing
                .insert(index, Instant::now() + self.removal_duration);
            tracing::info!(
                scope,
                index,
                sidelined_for = ?self.removal_duration,
                "sidelined key"
            );
        } else if !state.failing.contains_key(&index) {
            tracing::debug!(scope, index, "key not available in scope; nothing to sideline");
        }
    }

    /// Promote every due key back into rotation, across all scopes, in one
    /// critical section.
    pub fn sweep(&self) {
        let mut scopes = self.lock_scopes();
        for (scope, state) in scopes.iter_mut() {
            Self::reactivate_state(&self.keys, scope, state);
        }
    }

    /// Spawn the periodic reactivation task for this pool.
    pub fn spawn_reactivation(self: Arc<Self>) -> JoinHandle<()> {
        let cadence = reactivation_cadence(self.removal_duration);
        tokio::spawn(async move {
            tracing::debug!(cadence = ?cadence, "key reactivation loop started");
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// Sorted view of a scope's index sets, if the scope exists.
    pub fn scope_snapshot(&self, scope: &str) -> Option<ScopeSnapshot> {
        let scopes = self.lock_scopes();
        scopes.get(scope).map(|state| {
            let mut available: Vec<usize> = state.available.keys().copied().collect();
            let mut failing: Vec<usize> = state.failing.keys().copied().collect();
            available.sort_unstable();
            failing.sort_unstable();
            ScopeSnapshot { available, failing }
        })
    }

    /// The configured sideline duration.
    pub fn removal_duration(&self) -> Duration {
        self.removal_duration
    }

    fn lock_scopes(&self) -> MutexGuard<'_, HashMap<String, ScopeState>> {
        self.scopes.lock().expect("key pool lock poisoned")
    }

    /// Resolve or create the state for a scope. A new scope starts with every
    /// non-empty key available.
    fn state_entry<'a>(
        scopes: &'a mut HashMap<String, ScopeState>,
        keys: &[String],
        scope: &str,
    ) -> &'a mut ScopeState {
        if !scopes.contains_key(scope) {
            let mut state = ScopeState::default();
            for (index, key) in keys.iter().enumerate() {
                if !key.is_empty() {
                    state.available.insert(index, key.clone());
                }
            }
            tracing::debug!(
                scope,
                available = state.available.len(),
                "created scope state"
            );
            scopes.insert(scope.to_owned(), state);
        }
        scopes.get_mut(scope).expect("scope state just inserted")
    }

    /// Move every due key in one scope back to available. Indices that are
    /// out of bounds or refer to empty entries are dropped from the failing
    /// set instead. Returns the number of reactivated keys.
    fn reactivate_state(keys: &[String], scope: &str, state: &mut ScopeState) -> usize {
        let now = Instant::now();
        let due: Vec<usize> = state
            .failing
            .iter()
            .filter(|&(_, at)| now > *at)
            .map(|(&index, _)| index)
            .collect();

        let mut reactivated = 0;
        for index in due {
            state.failing.remove(&index);
            match keys.get(index) {
                Some(key) if !key.is_empty() => {
                    state.available.insert(index, key.clone());
                    reactivated += 1;
                    tracing::debug!(scope, index, "reactivated key");
                }
                _ => {
                    tracing::debug!(scope, index, "dropped invalid or empty index from failing set");
                }
            }
        }
        reactivated
    }
}

/// Sweep cadence: stays below the removal duration so a due key never waits
/// a full extra period, capped at one minute for long durations.
fn reactivation_cadence(removal_duration: Duration) -> Duration {
    (removal_duration / 2)
        .min(Duration::from_secs(60))
        .max(Duration::from_millis(10))
}
