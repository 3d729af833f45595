//! Per-key mutual exclusion with cooldown.
//!
//! Taps can arrive faster than a request/acknowledgment round trip. An
//! [`ActionGuard`] admits the first action for a key and silently drops the
//! rest until the key unlocks: a cooldown after the action finishes, or a
//! hold limit if it never does. Locks are always time-bounded and never
//! depend on a server answer.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SyncTuning;
use crate::task::lock;

/// State of one locked key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardLock {
    /// The guarded action is still running
    pub busy: bool,
    /// When the key unlocks on its own
    pub expires_at: Instant,
    /// Which acquisition holds the key; a permit only releases its own
    pub generation: u64,
}

/// Lock table keyed by action name.
///
/// Thread-safe via internal Mutex, so one guard can be shared by every
/// action of a component.
#[derive(Debug)]
pub struct ActionGuard {
    locks: Mutex<HashMap<String, GuardLock>>,
    /// Lock duration after the action finishes
    cooldown: Duration,
    /// Lock duration while the action is still running
    hold_limit: Duration,
    generations: AtomicU64,
}

impl Default for ActionGuard {
    fn default() -> Self {
        Self::from_tuning(&SyncTuning::default())
    }
}

impl ActionGuard {
    pub fn new(cooldown: Duration, hold_limit: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            cooldown,
            hold_limit,
            generations: AtomicU64::new(0),
        }
    }

    pub fn from_tuning(tuning: &SyncTuning) -> Self {
        Self::new(tuning.guard_cooldown(), tuning.guard_hold_limit())
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Runs `f` unless `key` is locked. Returns `None` when suppressed.
    pub fn guard<R>(&self, key: &str, f: impl FnOnce() -> R) -> Option<R> {
        self.guard_with(key, self.cooldown, f)
    }

    /// Same as [`ActionGuard::guard`] with an explicit cooldown.
    pub fn guard_with<R>(&self, key: &str, cooldown: Duration, f: impl FnOnce() -> R) -> Option<R> {
        let _permit = self.acquire(key, cooldown)?;
        Some(f())
    }

    /// Runs the future produced by `f` unless `key` is locked.
    ///
    /// The key stays busy while the future runs. If the future is dropped
    /// before completion the cooldown is armed all the same.
    pub async fn guard_async<F, Fut, R>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _permit = self.acquire(key, self.cooldown)?;
        Some(f().await)
    }

    /// Takes the lock for `key`, or `None` if it is held.
    ///
    /// The returned permit arms the cooldown when dropped, which also covers
    /// panics and cancelled futures.
    pub fn acquire(&self, key: &str, cooldown: Duration) -> Option<Permit<'_>> {
        let now = Instant::now();
        let mut locks = lock(&self.locks);
        locks.retain(|_, l| l.expires_at > now);

        if locks.contains_key(key) {
            tracing::debug!(key, "action suppressed by guard");
            return None;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        locks.insert(
            key.to_string(),
            GuardLock {
                busy: true,
                expires_at: now + self.hold_limit,
                generation,
            },
        );

        Some(Permit {
            guard: self,
            key: key.to_string(),
            cooldown,
            generation,
        })
    }

    /// Returns true if `key` would currently be suppressed.
    pub fn is_locked(&self, key: &str) -> bool {
        self.lock_state(key).is_some()
    }

    /// The live lock for `key`, if any.
    pub fn lock_state(&self, key: &str) -> Option<GuardLock> {
        let now = Instant::now();
        lock(&self.locks)
            .get(key)
            .copied()
            .filter(|l| l.expires_at > now)
    }

    /// Keys currently locked, in order.
    pub fn locked_keys(&self) -> BTreeSet<String> {
        let now = Instant::now();
        lock(&self.locks)
            .iter()
            .filter(|(_, l)| l.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drops the lock for `key`, so the next action runs at once. A permit
    /// still out for it no longer releases anything.
    pub fn unlock(&self, key: &str) {
        lock(&self.locks).remove(key);
    }

    /// Drops every lock. Used on teardown.
    pub fn clear(&self) {
        lock(&self.locks).clear();
    }

    fn release(&self, key: &str, generation: u64, cooldown: Duration) {
        let mut locks = lock(&self.locks);
        if let Some(l) = locks.get_mut(key).filter(|l| l.generation == generation) {
            l.busy = false;
            l.expires_at = Instant::now() + cooldown;
        }
    }
}

/// Proof that a guarded action is running. Arms the cooldown on drop.
#[derive(Debug)]
pub struct Permit<'a> {
    guard: &'a ActionGuard,
    key: String,
    cooldown: Duration,
    generation: u64,
}

impl Permit<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.guard.release(&self.key, self.generation, self.cooldown);
    }
}

/// Guard for per-row actions: one lock per row id, so unrelated rows stay
/// independently actionable.
#[derive(Debug, Default)]
pub struct RowGuard {
    rows: ActionGuard,
}

impl RowGuard {
    pub fn new(cooldown: Duration, hold_limit: Duration) -> Self {
        Self {
            rows: ActionGuard::new(cooldown, hold_limit),
        }
    }

    pub fn from_tuning(tuning: &SyncTuning) -> Self {
        Self::new(tuning.row_cooldown(), tuning.guard_hold_limit())
    }

    /// Runs `f` unless row `id` is busy.
    pub fn guard<R>(&self, id: &str, f: impl FnOnce() -> R) -> Option<R> {
        self.rows.guard(id, f)
    }

    /// Runs the future produced by `f` unless row `id` is busy.
    pub async fn guard_async<F, Fut, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.rows.guard_async(id, f).await
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.rows.is_locked(id)
    }

    /// Ids of rows that are busy, e.g. to dim them.
    pub fn busy_ids(&self) -> BTreeSet<String> {
        self.rows.locked_keys()
    }

    pub fn clear(&self) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> ActionGuard {
        ActionGuard::new(Duration::from_millis(280), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_within_cooldown_is_suppressed() {
        let guard = guard();
        let calls = AtomicUsize::new(0);

        assert_eq!(guard.guard("refresh", || calls.fetch_add(1, Ordering::SeqCst)), Some(0));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(guard.guard("refresh", || calls.fetch_add(1, Ordering::SeqCst)), None);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_unlocks_after_cooldown() {
        let guard = guard();
        guard.guard("refresh", || ());
        assert!(guard.is_locked("refresh"));

        tokio::time::advance(Duration::from_millis(281)).await;
        assert!(!guard.is_locked("refresh"));
        assert_eq!(guard.guard("refresh", || 7), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let guard = guard();
        guard.guard("refresh", || ());
        assert_eq!(guard.guard("clear-filters", || 1), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_while_future_runs() {
        let guard = guard();

        let outer = guard.guard_async("save", || async {
            assert_eq!(guard.lock_state("save").map(|l| l.busy), Some(true));
            // Nested attempt while the first is still running.
            assert_eq!(guard.guard("save", || ()), None);
            tokio::time::sleep(Duration::from_secs(2)).await;
            "done"
        });

        assert_eq!(outer.await, Some("done"));
        let state = guard.lock_state("save").unwrap();
        assert!(!state.busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_lock_self_expires() {
        let guard = ActionGuard::new(Duration::from_millis(280), Duration::from_secs(1));
        let permit = guard.acquire("stuck", guard.cooldown()).unwrap();

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!guard.is_locked("stuck"));
        assert!(guard.guard("stuck", || ()).is_some());
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_permit_leaves_new_holder_locked() {
        let guard = ActionGuard::new(Duration::from_millis(280), Duration::from_secs(1));
        let stale = guard.acquire("save", guard.cooldown()).unwrap();

        tokio::time::advance(Duration::from_millis(1001)).await;
        let fresh = guard.acquire("save", guard.cooldown()).unwrap();
        drop(stale);
        assert_eq!(guard.lock_state("save").map(|l| l.busy), Some(true));

        tokio::time::advance(Duration::from_millis(281)).await;
        assert_eq!(guard.guard("save", || ()), None);

        drop(fresh);
        assert_eq!(guard.lock_state("save").map(|l| l.busy), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_admits_next_action() {
        let guard = guard();
        guard.guard("refresh", || ());
        guard.unlock("refresh");
        assert!(!guard.is_locked("refresh"));
        assert_eq!(guard.guard("refresh", || 2), Some(2));
        assert!(guard.is_locked("refresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_released_on_panic() {
        let guard = guard();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guard.guard("boom", || panic!("handler failed"));
        }));
        assert!(result.is_err());

        let state = guard.lock_state("boom").unwrap();
        assert!(!state.busy);
        tokio::time::advance(Duration::from_millis(281)).await;
        assert!(!guard.is_locked("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_future_arms_cooldown() {
        let guard = guard();
        let fut = guard.guard_async("slow", || tokio::time::sleep(Duration::from_secs(60)));
        let timed_out = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(timed_out.is_err());

        assert!(!guard.lock_state("slow").unwrap().busy);
        tokio::time::advance(Duration::from_millis(281)).await;
        assert!(!guard.is_locked("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_guard_busy_ids() {
        let rows = RowGuard::new(Duration::from_millis(700), Duration::from_secs(10));
        rows.guard("5", || ());
        rows.guard("9", || ());
        assert_eq!(rows.guard("5", || ()), None);

        let busy: Vec<_> = rows.busy_ids().into_iter().collect();
        assert_eq!(busy, vec!["5".to_string(), "9".to_string()]);

        tokio::time::advance(Duration::from_millis(701)).await;
        assert!(!rows.is_busy("5"));
        assert!(rows.busy_ids().is_empty());
    }
}
