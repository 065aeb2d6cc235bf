//! Gauge locks.
//!
//! Operations that read and rewrite the same part of the timeline must not
//! interleave. Each operation computes a [`LockSet`] from its content and
//! holds it from planning through commit:
//! - every event and annotation gauge it writes, exclusive
//! - every natural key of an `EVENT_KEYS`/`SIMPLE_UPDATE` event, exclusive
//! - its dim signature: shared, or exclusive in `insert_and_erase` mode
//!
//! Keys are taken one by one in their total order ([`LockKey`]'s `Ord`), so
//! two operations can never wait on each other in a cycle. Every wait is
//! bounded by one deadline for the whole set; running out of time releases
//! what was taken and returns a retryable `LockTimeout`.
//!
//! Locks are in-process. Separate processes sharing a database are still
//! kept consistent by the commit-time checks of the store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use orbitline_core::model::{GaugeKey, Operation, OperationMode, PolicyScope};
use orbitline_core::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Signature(String),
    Gauge(GaugeKey),
    Key { signature: String, key: String },
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signature(s) => write!(f, "signature {s}"),
            Self::Gauge(g) => write!(f, "gauge {g}"),
            Self::Key { signature, key } => write!(f, "key {key} of {signature}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Sorted set of keys to hold together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    keys: BTreeMap<LockKey, LockMode>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Asking for the same key twice keeps the stronger mode.
    pub fn insert(&mut self, key: LockKey, mode: LockMode) {
        let slot = self.keys.entry(key).or_insert(mode);
        *slot = (*slot).max(mode);
    }

    /// Keys an operation needs while it is planned and committed.
    pub fn for_operation(op: &Operation) -> Self {
        let mut set = Self::new();
        let signature = op.signature.name.clone();
        let signature_mode = match op.mode {
            OperationMode::InsertAndErase => LockMode::Exclusive,
            OperationMode::Insert => LockMode::Shared,
        };
        set.insert(LockKey::Signature(signature.clone()), signature_mode);

        for ev in &op.events {
            set.insert(LockKey::Gauge(ev.gauge.clone()), LockMode::Exclusive);
            if let (PolicyScope::Keyed, Some(key)) = (ev.policy.scope(), &ev.key) {
                set.insert(
                    LockKey::Key {
                        signature: signature.clone(),
                        key: key.clone(),
                    },
                    LockMode::Exclusive,
                );
            }
        }
        for ann in &op.annotations {
            set.insert(LockKey::Gauge(ann.gauge.clone()), LockMode::Exclusive);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LockKey, &LockMode)> {
        self.keys.iter()
    }
}

#[derive(Debug, Default)]
struct Holders {
    exclusive: bool,
    shared: usize,
}

impl Holders {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.exclusive,
            LockMode::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn is_free(&self) -> bool {
        !self.exclusive && self.shared == 0
    }
}

#[derive(Debug, Default)]
struct Inner {
    table: Mutex<HashMap<LockKey, Holders>>,
    released: Condvar,
}

/// Lock table shared by every operation of one engine. Cloning shares it.
#[derive(Debug, Clone, Default)]
pub struct GaugeLocks {
    inner: Arc<Inner>,
}

impl GaugeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every key of `set`, waiting at most `timeout` in total.
    pub fn acquire(&self, set: &LockSet, timeout: Duration) -> EngineResult<LockGuard> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut guard = LockGuard {
            locks: self.clone(),
            held: Vec::with_capacity(set.len()),
        };

        let mut table = self.inner.table.lock();
        for (key, mode) in set.iter() {
            loop {
                let admitted = table.get(key).map(|h| h.admits(*mode)).unwrap_or(true);
                if admitted {
                    break;
                }
                debug!(resource = %key, "waiting for lock");
                if self.inner.released.wait_until(&mut table, deadline).timed_out() {
                    let admitted = table.get(key).map(|h| h.admits(*mode)).unwrap_or(true);
                    if admitted {
                        break;
                    }
                    drop(table);
                    return Err(EngineError::LockTimeout {
                        resource: key.to_string(),
                        waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            let holders = table.entry(key.clone()).or_default();
            match mode {
                LockMode::Shared => holders.shared += 1,
                LockMode::Exclusive => holders.exclusive = true,
            }
            guard.held.push((key.clone(), *mode));
        }
        drop(table);
        Ok(guard)
    }

    /// Number of keys currently held by anyone.
    pub fn held(&self) -> usize {
        self.inner.table.lock().len()
    }

    fn release(&self, held: &[(LockKey, LockMode)]) {
        if held.is_empty() {
            return;
        }
        let mut table = self.inner.table.lock();
        for (key, mode) in held {
            if let Some(holders) = table.get_mut(key) {
                match mode {
                    LockMode::Shared => holders.shared = holders.shared.saturating_sub(1),
                    LockMode::Exclusive => holders.exclusive = false,
                }
                if holders.is_free() {
                    table.remove(key);
                }
            }
        }
        drop(table);
        self.inner.released.notify_all();
    }
}

/// Keys held by one operation. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    locks: GaugeLocks,
    held: Vec<(LockKey, LockMode)>,
}

impl LockGuard {
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.held.iter().map(|(k, _)| k)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.held);
        self.locks.release(&held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::mpsc;
    use std::thread;

    fn gauge(name: &str) -> LockKey {
        LockKey::Gauge(GaugeKey::new(name, "S2A"))
    }

    fn set(keys: &[(LockKey, LockMode)]) -> LockSet {
        let mut s = LockSet::new();
        for (k, m) in keys {
            s.insert(k.clone(), *m);
        }
        s
    }

    #[test]
    fn exclusive_lock_times_out_while_held() {
        let locks = GaugeLocks::new();
        let _held = locks
            .acquire(&set(&[(gauge("G"), LockMode::Exclusive)]), Duration::from_millis(10))
            .unwrap();
        let err = locks
            .acquire(&set(&[(gauge("G"), LockMode::Exclusive)]), Duration::from_millis(20))
            .unwrap_err();
        assert_matches!(err, EngineError::LockTimeout { ref resource, .. } if resource.contains("G@S2A"));
        assert!(err.is_retryable());
    }

    #[test]
    fn shared_locks_coexist_and_block_exclusive() {
        let locks = GaugeLocks::new();
        let sig = LockKey::Signature("SIG".into());
        let a = locks
            .acquire(&set(&[(sig.clone(), LockMode::Shared)]), Duration::from_millis(10))
            .unwrap();
        let b = locks
            .acquire(&set(&[(sig.clone(), LockMode::Shared)]), Duration::from_millis(10))
            .unwrap();
        assert!(locks
            .acquire(&set(&[(sig.clone(), LockMode::Exclusive)]), Duration::from_millis(10))
            .is_err());
        drop(a);
        drop(b);
        assert_eq!(locks.held(), 0);
        locks
            .acquire(&set(&[(sig, LockMode::Exclusive)]), Duration::from_millis(10))
            .unwrap();
    }

    #[test]
    fn timed_out_acquisition_releases_partial_set() {
        let locks = GaugeLocks::new();
        let _b = locks
            .acquire(&set(&[(gauge("B"), LockMode::Exclusive)]), Duration::from_millis(10))
            .unwrap();
        let r = locks.acquire(
            &set(&[(gauge("A"), LockMode::Exclusive), (gauge("B"), LockMode::Exclusive)]),
            Duration::from_millis(20),
        );
        assert!(r.is_err());
        // "A" was released again.
        locks
            .acquire(&set(&[(gauge("A"), LockMode::Exclusive)]), Duration::from_millis(10))
            .unwrap();
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let locks = GaugeLocks::new();
        let held = locks
            .acquire(&set(&[(gauge("G"), LockMode::Exclusive)]), Duration::from_millis(10))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                let r = locks.acquire(&set(&[(gauge("G"), LockMode::Exclusive)]), Duration::from_secs(5));
                tx.send(r.is_ok()).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
    }

    #[test]
    fn stronger_mode_wins_and_keys_are_ordered() {
        let mut s = LockSet::new();
        s.insert(gauge("Z"), LockMode::Exclusive);
        s.insert(LockKey::Signature("SIG".into()), LockMode::Shared);
        s.insert(LockKey::Signature("SIG".into()), LockMode::Exclusive);
        s.insert(gauge("A"), LockMode::Exclusive);
        let keys: Vec<_> = s.iter().map(|(k, m)| (k.clone(), *m)).collect();
        assert_eq!(
            keys,
            vec![
                (LockKey::Signature("SIG".into()), LockMode::Exclusive),
                (gauge("A"), LockMode::Exclusive),
                (gauge("Z"), LockMode::Exclusive),
            ]
        );
    }
}
