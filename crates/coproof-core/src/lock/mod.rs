//! Named, lease-based mutual exclusion for projects and branches.
//!
//! Locks are leases: a holder owns a key until it releases it or its TTL
//! elapses, after which anyone may take it over with a larger fencing token.
//! While a `with_*` body runs, a heartbeat thread renews the lease every
//! third of its TTL. A failed renewal marks the guard lost; bodies call
//! [`Fence::check`] before externally visible steps such as pushes.

mod file;
mod lease;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::LockSettings;
use crate::error::{EngineError, Result};

pub use file::FileLeaseBackend;
pub use lease::{is_lease_expired, lease_deadline, next_fencing_token, remaining_ttl_ms, Lease};

/// Confirms exclusive ownership right before a step others must not race.
pub trait Fence {
    fn check(&self) -> Result<()>;
}

/// A fence that always passes, for callers that serialize by other means.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unfenced;

impl Fence for Unfenced {
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Storage for lease records. Implementations must make each call atomic
/// with respect to every other caller sharing the same records.
pub trait LockBackend: Send + Sync {
    /// Takes `key` for `holder` if it is free, released or expired.
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>>;
    /// Extends a still-held lease; [`EngineError::LeaseLost`] otherwise.
    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;
    fn release(&self, lease: &Lease) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockScope {
    Project { project: String },
    Branch { project: String, branch: String },
}

impl LockScope {
    pub fn project(project: &str) -> Self {
        Self::Project {
            project: project.to_string(),
        }
    }

    pub fn branch(project: &str, branch: &str) -> Self {
        Self::Branch {
            project: project.to_string(),
            branch: branch.to_string(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            Self::Project { project } => format!("lock:project:{project}"),
            Self::Branch { project, branch } => format!("lock:branch:{project}:{branch}"),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
    pub acquire_timeout: Duration,
    pub ttl: Duration,
}

impl From<&LockSettings> for LockOptions {
    fn from(settings: &LockSettings) -> Self {
        Self {
            acquire_timeout: settings.acquire_timeout,
            ttl: settings.ttl,
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    settings: LockSettings,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, settings: LockSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Polls for `scope` until acquired or `acquire_timeout` passes.
    pub fn acquire(&self, scope: &LockScope, options: LockOptions) -> Result<LockGuard> {
        let key = scope.key();
        let holder = new_holder_id();
        let started = Instant::now();
        let mut rng = rand::thread_rng();
        loop {
            if let Some(lease) = self.backend.try_acquire(&key, &holder, options.ttl)? {
                debug!(lock = %key, token = lease.fencing_token, "lock acquired");
                return Ok(LockGuard {
                    backend: Arc::clone(&self.backend),
                    ttl: options.ttl,
                    lease: Mutex::new(Some(lease)),
                    lost: AtomicBool::new(false),
                });
            }
            let waited = started.elapsed();
            if waited >= options.acquire_timeout {
                return Err(EngineError::ResourceLocked {
                    key,
                    waited_ms: lease::duration_ms(waited),
                });
            }
            let poll = self.settings.poll_interval;
            let jitter = rng.gen_range(0..=lease::duration_ms(poll) / 2);
            let pause = (poll + Duration::from_millis(jitter))
                .min(options.acquire_timeout.saturating_sub(waited))
                .max(Duration::from_millis(1));
            thread::sleep(pause);
        }
    }

    /// Runs `body` while holding `scope` under the configured options.
    pub fn with_scope<T>(
        &self,
        scope: &LockScope,
        body: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        self.with_scope_options(scope, LockOptions::from(&self.settings), body)
    }

    /// Runs `body` while holding `scope`, renewing the lease in the
    /// background. The lease is released on every exit path. A lease lost
    /// while `body` ran turns its result into [`EngineError::LeaseLost`].
    pub fn with_scope_options<T>(
        &self,
        scope: &LockScope,
        options: LockOptions,
        body: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        let guard = self.acquire(scope, options)?;
        let interval = (options.ttl / 3).max(Duration::from_millis(1));
        let (stop, stopped) = mpsc::channel::<()>();
        let result = thread::scope(|threads| {
            let held = &guard;
            threads.spawn(move || held.heartbeat(interval, &stopped));
            let result = body(&guard);
            drop(stop);
            result
        });
        let result = result.and_then(|value| guard.ensure_held().map(|()| value));
        if let Err(err) = guard.release() {
            warn!(lock = %scope, error = %err, "failed to release lock");
        }
        result
    }

    pub fn with_project_lock<T>(
        &self,
        project: &str,
        body: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        self.with_scope(&LockScope::project(project), body)
    }

    /// [`LockManager::with_project_lock`] with a per-call acquire timeout
    /// and TTL.
    pub fn with_project_lock_options<T>(
        &self,
        project: &str,
        options: LockOptions,
        body: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        self.with_scope_options(&LockScope::project(project), options, body)
    }

    pub fn with_branch_lock<T>(
        &self,
        project: &str,
        branch: &str,
        body: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        self.with_scope(&LockScope::branch(project, branch), body)
    }

    pub fn with_branch_lock_options<T>(
        &self,
        project: &str,
        branch: &str,
        options: LockOptions,
        body: impl FnOnce(&LockGuard) -> Result<T>,
    ) -> Result<T> {
        self.with_scope_options(&LockScope::branch(project, branch), options, body)
    }
}

/// A held lease. Dropping the guard releases it.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
    lease: Mutex<Option<Lease>>,
    lost: AtomicBool,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lease", &self.current())
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    fn current(&self) -> Option<Lease> {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn key(&self) -> Option<String> {
        self.current().map(|lease| lease.key)
    }

    pub fn fencing_token(&self) -> Option<u64> {
        self.current().map(|lease| lease.fencing_token)
    }

    /// Extends the lease by another TTL. Fails with
    /// [`EngineError::LeaseLost`] if the lease expired and was taken over,
    /// after which the guard stays lost.
    pub fn renew(&self) -> Result<()> {
        let mut slot = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(lease) = slot.as_ref() else {
            return Err(EngineError::LeaseLost {
                key: "<released>".to_string(),
            });
        };
        match self.backend.renew(lease, self.ttl) {
            Ok(renewed) => {
                debug!(lock = %renewed.key, deadline_ms = renewed.deadline_ms, "lease renewed");
                *slot = Some(renewed);
                Ok(())
            }
            Err(err) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Ok while the lease is held, unexpired and never failed a renewal.
    pub fn ensure_held(&self) -> Result<()> {
        match self.current() {
            Some(lease) if !self.is_lost() && !lease.is_expired_at(lease::now_ms()) => Ok(()),
            Some(lease) => Err(EngineError::LeaseLost { key: lease.key }),
            None => Err(EngineError::LeaseLost {
                key: "<released>".to_string(),
            }),
        }
    }

    fn heartbeat(&self, interval: Duration, stop: &mpsc::Receiver<()>) {
        loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            if let Err(err) = self.renew() {
                warn!(lock = ?self.key(), error = %err, "lease renewal failed; lock is lost");
                return;
            }
        }
    }

    pub fn release(self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&self) -> Result<()> {
        let taken = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(lease) => {
                self.backend.release(&lease)?;
                debug!(lock = %lease.key, "lock released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Fence for LockGuard {
    fn check(&self) -> Result<()> {
        self.ensure_held()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, "failed to release lock on drop");
        }
    }
}

fn new_holder_id() -> String {
    let bytes: [u8; 12] = rand::random();
    format!("{}-{}", std::process::id(), hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path, acquire_timeout: Duration) -> LockManager {
        LockManager::new(
            Arc::new(FileLeaseBackend::new(dir)),
            LockSettings {
                acquire_timeout,
                ttl: Duration::from_secs(30),
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn scope_keys_are_namespaced() {
        assert_eq!(LockScope::project("p").key(), "lock:project:p");
        assert_eq!(
            LockScope::branch("p", "proposal/x").key(),
            "lock:branch:p:proposal/x"
        );
    }

    #[test]
    fn same_branch_is_exclusive_while_others_proceed() {
        let dir = tempdir().expect("tempdir");
        let locks = manager(dir.path(), Duration::from_millis(100));
        let entered_other = AtomicBool::new(false);

        locks
            .with_branch_lock("p", "b1", |_| {
                let err = locks
                    .with_branch_lock("p", "b1", |_| Ok(()))
                    .expect_err("held");
                assert!(matches!(err, EngineError::ResourceLocked { .. }));
                assert!(err.is_retryable());

                locks.with_branch_lock("p", "b2", |_| {
                    entered_other.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
            .expect("outer");
        assert!(entered_other.load(Ordering::SeqCst));
    }

    #[test]
    fn failing_body_still_releases() {
        let dir = tempdir().expect("tempdir");
        let locks = manager(dir.path(), Duration::from_millis(100));
        let result: Result<()> = locks.with_project_lock("p", |_| {
            Err(EngineError::InvalidInput("boom".into()))
        });
        assert!(result.is_err());
        locks
            .with_project_lock("p", |_| Ok(()))
            .expect("lock is free again");
    }

    #[test]
    fn waiter_acquires_after_holder_finishes() {
        let dir = tempdir().expect("tempdir");
        let locks = manager(dir.path(), Duration::from_secs(5));
        let guard = locks
            .acquire(&LockScope::project("p"), LockOptions::from(locks.settings()))
            .expect("first");
        thread::scope(|scope| {
            let waiter = scope.spawn(|| locks.with_project_lock("p", |held| Ok(held.fencing_token())));
            thread::sleep(Duration::from_millis(50));
            guard.release().expect("release");
            let token = waiter.join().expect("join").expect("acquired");
            assert_eq!(token, Some(2));
        });
    }

    #[test]
    fn crashed_holder_is_taken_over_after_ttl() {
        let dir = tempdir().expect("tempdir");
        let locks = manager(dir.path(), Duration::from_secs(2));
        let crashed = locks
            .acquire(
                &LockScope::project("p"),
                LockOptions {
                    acquire_timeout: Duration::from_millis(10),
                    ttl: Duration::from_millis(50),
                },
            )
            .expect("first");
        // Simulate a holder that died without releasing.
        std::mem::forget(crashed);

        let guard = locks
            .acquire(&LockScope::project("p"), LockOptions::from(locks.settings()))
            .expect("taken over");
        assert_eq!(guard.fencing_token(), Some(2));
        guard.renew().expect("renew");
    }

    struct NoRenewal(FileLeaseBackend);

    impl LockBackend for NoRenewal {
        fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>> {
            self.0.try_acquire(key, holder, ttl)
        }

        fn renew(&self, lease: &Lease, _: Duration) -> Result<Lease> {
            Err(EngineError::LeaseLost {
                key: lease.key.clone(),
            })
        }

        fn release(&self, lease: &Lease) -> Result<()> {
            self.0.release(lease)
        }
    }

    #[test]
    fn heartbeat_keeps_long_bodies_exclusive() {
        let dir = tempdir().expect("tempdir");
        let locks = manager(dir.path(), Duration::from_secs(5));
        let short_ttl = LockOptions {
            acquire_timeout: Duration::from_secs(1),
            ttl: Duration::from_millis(600),
        };
        thread::scope(|scope| {
            let holder = scope.spawn(|| {
                locks.with_project_lock_options("p", short_ttl, |guard| {
                    thread::sleep(Duration::from_millis(1_500));
                    guard.check()
                })
            });
            thread::sleep(Duration::from_millis(900));
            let contender = locks.with_project_lock_options(
                "p",
                LockOptions {
                    acquire_timeout: Duration::from_millis(100),
                    ttl: Duration::from_secs(30),
                },
                |_| Ok(()),
            );
            assert!(matches!(contender, Err(EngineError::ResourceLocked { .. })));
            holder.join().expect("join").expect("holder kept its lease");
        });
    }

    #[test]
    fn failed_renewal_surfaces_as_lease_lost() {
        let dir = tempdir().expect("tempdir");
        let locks = LockManager::new(
            Arc::new(NoRenewal(FileLeaseBackend::new(dir.path()))),
            LockSettings {
                acquire_timeout: Duration::from_millis(100),
                ttl: Duration::from_millis(90),
                poll_interval: Duration::from_millis(10),
            },
        );
        let result = locks.with_branch_lock("p", "main", |guard| {
            thread::sleep(Duration::from_millis(200));
            assert!(guard.is_lost());
            assert!(matches!(guard.check(), Err(EngineError::LeaseLost { .. })));
            Ok("pushed")
        });
        match result {
            Err(EngineError::LeaseLost { key }) => assert_eq!(key, "lock:branch:p:main"),
            other => panic!("expected a lost lease, got {other:?}"),
        }
    }

    #[test]
    fn per_call_options_override_settings() {
        let dir = tempdir().expect("tempdir");
        let locks = manager(dir.path(), Duration::from_secs(5));
        let started = Instant::now();
        let err = locks
            .with_branch_lock("p", "b", |_| {
                locks.with_branch_lock_options(
                    "p",
                    "b",
                    LockOptions {
                        acquire_timeout: Duration::from_millis(20),
                        ttl: Duration::from_secs(1),
                    },
                    |_| Ok(()),
                )
            })
            .expect_err("held");
        assert!(matches!(err, EngineError::ResourceLocked { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
