//! Priority spin-guard serializing access to a bus handle
//!
//! A thread takes ownership by swapping its token into an atomic. Contending
//! threads back off for `priority * unit` before retrying, so a lower priority
//! number retries more aggressively. The owning thread may re-enter; only the
//! outermost scope releases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const UNOWNED: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Stable non-zero token of the calling thread
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Retry priorities used by the connection
pub mod priority {
    /// Method calls and watcher registration
    pub const CALL: u32 = 1;
    /// Signal dispatch from the pump loop
    pub const PUMP: u32 = 10;
}

#[derive(Debug)]
pub struct PriorityGuard {
    owner: AtomicU64,
    unit: Duration,
}

impl PriorityGuard {
    pub fn new(unit: Duration) -> Self {
        Self {
            owner: AtomicU64::new(UNOWNED),
            unit,
        }
    }

    /// Spin until the calling thread owns the guard
    pub fn acquire(&self, priority: u32) -> GuardScope<'_> {
        let me = current_thread_token();
        loop {
            match self
                .owner
                .compare_exchange(UNOWNED, me, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return GuardScope {
                        guard: self,
                        reentrant: false,
                    };
                }
                Err(owner) if owner == me => {
                    return GuardScope {
                        guard: self,
                        reentrant: true,
                    };
                }
                Err(_) => thread::sleep(self.unit * priority.max(1)),
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNOWNED
    }

    pub fn is_held_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }
}

impl Default for PriorityGuard {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

/// Ownership of a [`PriorityGuard`], released on drop
#[must_use = "the guard is released as soon as the scope is dropped"]
pub struct GuardScope<'a> {
    guard: &'a PriorityGuard,
    reentrant: bool,
}

impl GuardScope<'_> {
    /// Whether this scope re-entered a guard already owned by this thread
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        // the outer scope owns the release
        if !self.reentrant {
            self.guard.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reentrant_scope_keeps_ownership() {
        let guard = PriorityGuard::default();
        let outer = guard.acquire(priority::CALL);
        assert!(!outer.is_reentrant());
        {
            let inner = guard.acquire(priority::CALL);
            assert!(inner.is_reentrant());
        }
        assert!(guard.is_held_by_current());
        drop(outer);
        assert!(!guard.is_held());
    }

    #[test]
    fn test_release_on_panic() {
        let guard = Arc::new(PriorityGuard::default());
        let g = Arc::clone(&guard);
        let result = thread::spawn(move || {
            let _scope = g.acquire(priority::CALL);
            panic!("call failed");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_held());
    }

    #[test]
    fn test_mutual_exclusion() {
        let guard = Arc::new(PriorityGuard::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _scope = guard.acquire(priority::CALL);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!guard.is_held());
    }

    #[test]
    fn test_thread_tokens_differ() {
        let here = current_thread_token();
        let there = thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(here, UNOWNED);
    }
}
