//! A fixed-size, fair pool of non-root execution identities.
//!
//! Sessions never allocate uids/gids on demand: the host is provisioned with
//! `MAX_CONCURRENT_JOBS` disposable identities ahead of time, and this module
//! hands them out FIFO and takes them back. `IdentityPool::acquire` is the
//! only suspension point shared across sessions: it is the sole piece of
//! cross-session shared mutable state in the whole engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::{ErrorKind, GroupId, Result, UserId};

/// How long `acquire` may wait before it logs that the pool looks starved.
/// Purely diagnostic; the wait itself is unbounded.
const SLOW_ACQUIRE_WARNING: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
struct Identity {
    uid: UserId,
    gid: GroupId,
}

struct Inner {
    free: Mutex<VecDeque<Identity>>,
    semaphore: Semaphore,
}

/// A bounded set of `(uid, gid)` pairs, checked out FIFO.
///
/// The semaphore enforces fairness and backpressure: a permit is acquired
/// before the identity queue is touched, so waiters are served in the order
/// they called `acquire`, and a pool with `n` identities never hands out more
/// than `n` concurrently.
pub struct IdentityPool {
    inner: Arc<Inner>,
}

impl IdentityPool {
    /// Build a pool from an explicit list of `(uid, gid)` pairs.
    ///
    /// Every pair must name a real, unprivileged account dedicated to this
    /// judge host; provisioning those accounts is outside this crate.
    pub fn new(identities: Vec<(UserId, GroupId)>) -> IdentityPool {
        let count = identities.len();
        let free = identities
            .into_iter()
            .map(|(uid, gid)| Identity { uid, gid })
            .collect();

        IdentityPool {
            inner: Arc::new(Inner {
                free: Mutex::new(free),
                semaphore: Semaphore::new(count),
            }),
        }
    }

    /// Check out one identity, suspending until one is free.
    ///
    /// This call never fails with `PoolExhausted`: that error is reserved
    /// for a non-blocking probe, which this method does not expose, since
    /// every caller here is an `async` session handler that is expected to
    /// suspend rather than be rejected outright.
    pub async fn acquire(&self) -> PoolGuard {
        let start = Instant::now();
        let permit = self.acquire_permit(start).await;

        let identity = {
            let mut free = self.inner.free.lock().await;
            free.pop_front()
                .expect("semaphore permit implies a free identity")
        };

        PoolGuard {
            inner: Arc::clone(&self.inner),
            identity,
            permit: Some(permit),
        }
    }

    async fn acquire_permit(&self, start: Instant) -> SemaphorePermit<'_> {
        tokio::select! {
            permit = self.inner.semaphore.acquire() => {
                permit.expect("semaphore is never closed")
            }
            _ = tokio::time::sleep(SLOW_ACQUIRE_WARNING) => {
                log::warn!(
                    "identity pool acquire has been waiting for {:?}; host may be at MAX_CONCURRENT_JOBS",
                    start.elapsed()
                );
                self.inner.semaphore.acquire().await.expect("semaphore is never closed")
            }
        }
    }

    /// Try to check out an identity without suspending.
    ///
    /// Used by callers that want `PoolExhausted` surfaced immediately instead
    /// of queueing (e.g. a non-blocking health probe).
    pub fn try_acquire(&self) -> Result<PoolGuard> {
        let permit = self
            .inner
            .semaphore
            .try_acquire()
            .map_err(|_| ErrorKind::PoolExhausted)?;

        let identity = {
            // `try_lock` is appropriate here: holding the semaphore permit
            // already proves a slot exists, so contention on this mutex is
            // momentary.
            let mut free = self
                .inner
                .free
                .try_lock()
                .map_err(|_| ErrorKind::PoolExhausted)?;
            free.pop_front().ok_or(ErrorKind::PoolExhausted)?
        };

        Ok(PoolGuard {
            inner: Arc::clone(&self.inner),
            identity,
            permit: Some(permit),
        })
    }
}

/// An identity checked out of an [`IdentityPool`].
///
/// Dropping the guard returns the identity to the pool. Callers that must
/// confirm there are no leftover processes before the identity is reused
/// should call [`PoolGuard::release`] explicitly and inspect the result
/// rather than relying on `Drop`.
pub struct PoolGuard<'a> {
    inner: Arc<Inner>,
    identity: Identity,
    permit: Option<SemaphorePermit<'a>>,
}

impl<'a> PoolGuard<'a> {
    /// The checked-out user id.
    pub fn uid(&self) -> UserId {
        self.identity.uid
    }

    /// The checked-out group id.
    pub fn gid(&self) -> GroupId {
        self.identity.gid
    }

    /// Return the identity to the pool, first killing any process still
    /// running under it.
    ///
    /// Errors are logged rather than propagated: `release` must never fail
    /// the caller, since by the time cleanup runs there is nothing left to
    /// roll back.
    pub async fn release(mut self) {
        if let Err(count) = reap_identity(self.identity.uid).await {
            log::error!(
                "sandbox identity uid={} still owned {} process(es) at release; force-killed",
                self.identity.uid,
                count
            );
        }

        self.inner.free.lock().await.push_back(self.identity);
        // Drop the permit last: only after the identity is back in the free
        // queue should a waiting `acquire` be able to observe it.
        self.permit.take();
    }
}

impl<'a> Drop for PoolGuard<'a> {
    fn drop(&mut self) {
        if self.permit.is_none() {
            // Already released explicitly.
            return;
        }

        // The guard was dropped without calling `release` (e.g. a panic
        // unwound past it). Best-effort: put the identity back so the pool
        // doesn't leak capacity, but we can't reap asynchronously from
        // `Drop`, so just log loudly.
        log::error!(
            "sandbox identity uid={} dropped without explicit release; \
             returning to pool without reaping residual processes",
            self.identity.uid
        );
        let inner = Arc::clone(&self.inner);
        let identity = self.identity;
        tokio::spawn(async move {
            if let Err(count) = reap_identity(identity.uid).await {
                log::error!(
                    "sandbox identity uid={} still owned {} process(es) at drop-release; force-killed",
                    identity.uid,
                    count
                );
            }
            inner.free.lock().await.push_back(identity);
        });
    }
}

/// Send `SIGKILL` to every process owned by `uid`.
///
/// Returns `Ok(())` if nothing was running, `Err(count)` with the number of
/// processes force-killed otherwise (still a success from the pool's point
/// of view; the caller only logs it).
async fn reap_identity(uid: UserId) -> std::result::Result<(), usize> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    // `kill(-uid_as_pid, ...)` is not how uid-based reaping works on Linux;
    // the real mechanism is signalling every pid found under
    // `/proc/*/status` whose `Uid:` line matches. We do that scan here
    // rather than relying on a process-group convention, since sandboxed
    // children are not guaranteed to share one process group once they
    // fork further.
    let mut killed = 0usize;
    if let Ok(procs) = procfs::process::all_processes() {
        for proc in procs.flatten() {
            let owner = match proc.uid() {
                Ok(owner) => owner,
                Err(_) => continue,
            };
            if owner != uid {
                continue;
            }
            if kill(NixPid::from_raw(proc.pid), Signal::SIGKILL).is_ok() {
                killed += 1;
            }
        }
    }

    if killed == 0 {
        Ok(())
    } else {
        Err(killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let pool = IdentityPool::new(vec![(10_001, 10_001), (10_002, 10_002)]);

        let a = pool.acquire().await;
        let b = pool.acquire().await;
        assert_ne!(a.uid(), b.uid());

        assert!(pool.try_acquire().is_err());

        a.release().await;
        let c = pool.try_acquire().expect("identity returned to pool");
        assert_eq!(c.uid(), 10_001);

        drop(c);
        drop(b);
    }

    #[tokio::test]
    async fn test_try_acquire_exhausted() {
        let pool = IdentityPool::new(vec![(10_001, 10_001)]);
        let _guard = pool.try_acquire().expect("first acquire succeeds");
        match pool.try_acquire() {
            Err(Error(ErrorKind::PoolExhausted, _)) => {}
            other => panic!("expected PoolExhausted, got {:?}", other.map(|_| ())),
        }
    }
}
