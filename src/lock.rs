//! Mutual exclusion across processes for schedule transitions.
//!
//! A lock is a (name, holder token, expiry) triple in a shared key-value
//! store. Acquisition is an atomic test-and-set with a TTL; release is an
//! atomic compare-and-delete on the token, so only the holder can unlock
//! and a stale holder's release is a no-op. The TTL keeps the system live
//! if a holder crashes; callers pick a TTL of at least twice their
//! critical-section budget. Ownership is never decided by wall-clock
//! comparison on the caller's side; the token is opaque.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::EngineError;

/// Opaque proof of lock ownership; pass it back to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(Uuid);

/// Lock-store boundary. The default [`KvLockStore`] keeps entries in
/// process-shared memory; a Redis-style backend implements the same two
/// operations with SET NX PX and a compare-and-delete script.
pub trait LockStore: Send + Sync {
    /// Acquire `name`, blocking up to `wait`. Every successful call gets a
    /// distinct token, including re-acquisition of an expired lock.
    fn acquire(&self, name: &str, ttl: Duration, wait: Duration)
        -> Result<LockToken, EngineError>;

    /// Release `name` if `token` still owns it. Returns false (and does
    /// nothing) on a mismatched or expired token.
    fn release(&self, name: &str, token: &LockToken) -> bool;
}

#[derive(Debug)]
struct Holder {
    token: Uuid,
    expires_at: Instant,
}

/// In-memory TTL lock table.
#[derive(Debug, Default)]
pub struct KvLockStore {
    entries: Mutex<HashMap<String, Holder>>,
    released: Condvar,
}

impl KvLockStore {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for KvLockStore {
    fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockToken, EngineError> {
        let deadline = Instant::now() + wait;
        let mut entries = self.entries.lock().expect("poisoned");
        loop {
            let now = Instant::now();
            let free = match entries.get(name) {
                None => true,
                Some(holder) => {
                    if holder.expires_at <= now {
                        warn!(lock = name, "lock expired under its holder, taking over");
                        true
                    } else {
                        false
                    }
                }
            };
            if free {
                let token = Uuid::new_v4();
                entries.insert(
                    name.to_string(),
                    Holder {
                        token,
                        expires_at: now + ttl,
                    },
                );
                trace!(lock = name, "acquired");
                return Ok(LockToken(token));
            }

            if now >= deadline {
                return Err(EngineError::LockTimeout {
                    name: name.to_string(),
                    waited: wait,
                });
            }

            // Wake on release or when the holder's TTL lapses.
            let holder_expiry = entries
                .get(name)
                .map(|h| h.expires_at)
                .unwrap_or(deadline);
            let sleep = deadline
                .min(holder_expiry)
                .saturating_duration_since(now)
                .max(Duration::from_millis(1));
            let (e, _) = self
                .released
                .wait_timeout(entries, sleep)
                .expect("poisoned");
            entries = e;
        }
    }

    fn release(&self, name: &str, token: &LockToken) -> bool {
        let mut entries = self.entries.lock().expect("poisoned");
        let owned = entries
            .get(name)
            .is_some_and(|h| h.token == token.0 && h.expires_at > Instant::now());
        if owned {
            entries.remove(name);
            drop(entries);
            self.released.notify_all();
            trace!(lock = name, "released");
        }
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(5);

    #[test]
    fn acquire_then_release() {
        let store = KvLockStore::new();
        let token = store.acquire("a", TTL, Duration::ZERO).unwrap();
        assert!(store.release("a", &token));
        // Second release of the same token is a no-op.
        assert!(!store.release("a", &token));
    }

    #[test]
    fn contended_acquire_times_out() {
        let store = KvLockStore::new();
        let _held = store.acquire("a", TTL, Duration::ZERO).unwrap();
        let err = store.acquire("a", TTL, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
    }

    #[test]
    fn mismatched_token_cannot_release() {
        let store = KvLockStore::new();
        let t1 = store.acquire("a", TTL, Duration::ZERO).unwrap();
        let t2 = store.acquire("b", TTL, Duration::ZERO).unwrap();
        assert!(!store.release("a", &t2));
        assert!(store.release("a", &t1));
    }

    #[test]
    fn ttl_expiry_lets_the_next_caller_in() {
        let store = KvLockStore::new();
        let stale = store
            .acquire("a", Duration::from_millis(20), Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let fresh = store.acquire("a", TTL, Duration::ZERO).unwrap();
        assert_ne!(stale, fresh);
        // The crashed holder's token no longer releases anything.
        assert!(!store.release("a", &stale));
        assert!(store.release("a", &fresh));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let store = Arc::new(KvLockStore::new());
        let token = store.acquire("a", TTL, Duration::ZERO).unwrap();
        let store2 = store.clone();
        let waiter = std::thread::spawn(move || {
            store2.acquire("a", TTL, Duration::from_secs(5)).unwrap()
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.release("a", &token));
        let token2 = waiter.join().unwrap();
        assert!(store.release("a", &token2));
    }

    #[test]
    fn tokens_are_distinct_per_acquisition() {
        let store = KvLockStore::new();
        let t1 = store.acquire("a", TTL, Duration::ZERO).unwrap();
        store.release("a", &t1);
        let t2 = store.acquire("a", TTL, Duration::ZERO).unwrap();
        assert_ne!(t1, t2);
    }
}
