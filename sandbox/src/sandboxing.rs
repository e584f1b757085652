//! The sandbox provisioner (C1): turns a checked-out identity into a
//! disposable, filesystem-confined execution environment and tears it down
//! again on release.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::unistd::{chown, Gid, Uid};

use crate::pool::{IdentityPool, PoolGuard};
use crate::{ErrorKind, GroupId, Result, ResultExt, UserId};

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

fn next_sandbox_id() -> u64 {
    NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed)
}

/// A disposable per-session execution environment.
///
/// Owned exclusively by one `Job` for its lifetime: no two concurrent
/// sessions ever see the same `id`, `root_path`, `uid` or `gid`, because both
/// come out of the one-at-a-time `IdentityPool` checkout.
pub struct SandboxHandle<'a> {
    /// Opaque identifier for this sandbox instance, unique for the lifetime
    /// of the process.
    pub id: u64,

    /// Scratch root owned by `uid`/`gid`; every write a sandboxed child makes
    /// must land under here.
    pub root_path: PathBuf,

    /// The identity the sandboxed process runs as.
    pub uid: UserId,

    /// The identity's primary group.
    pub gid: GroupId,

    /// Opaque reference to a control-group the sandbox's processes are
    /// confined to, when the host has cgroup support configured. `None`
    /// means resource accounting falls back to in-process limits only
    /// (`sandbox::rlimits` plus the stage runner's own polling).
    pub cgroup_ref: Option<String>,

    guard: PoolGuard<'a>,
}

impl<'a> SandboxHandle<'a> {
    /// Path under the scratch root a stage runner should use as the child's
    /// working directory.
    pub fn working_dir(&self) -> &Path {
        &self.root_path
    }

    /// Path under the scratch root used as the writable `/tmp` replacement.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root_path.join("tmp")
    }

    /// Hand ownership of a file already written under [`Self::working_dir`]
    /// to this sandbox's identity, so a stage run as that identity (see
    /// `sandbox::process::ProcessBuilder::in_sandbox`) can read — and, for a
    /// compiled language's sources, overwrite — it. Callers outside this
    /// crate materialize job files with their own identity and need this to
    /// grant the sandbox identity ownership of all written files without
    /// reaching for `nix` themselves.
    pub fn chown_to_sandbox(&self, path: &Path) -> Result<()> {
        chown(path, Some(Uid::from_raw(self.uid)), Some(Gid::from_raw(self.gid)))?;
        Ok(())
    }

    /// Strip write permission from the working directory for everyone,
    /// including the sandbox identity itself. Called once compiling is
    /// done: from that point on, `tmp_dir()` is the only writable path a
    /// stage sees, so nothing a run stage does to its own cwd can leave
    /// residue a later test in the same job would observe.
    pub async fn lock_working_dir(&self) -> Result<()> {
        let mut perms = tokio::fs::metadata(&self.root_path).await?.permissions();
        perms.set_mode(0o555);
        tokio::fs::set_permissions(&self.root_path, perms).await?;
        Ok(())
    }

    /// Wipe and re-stage [`Self::tmp_dir`]. Must be called before every
    /// stage invocation that runs after [`Self::lock_working_dir`] (i.e.
    /// before each `run_test`/`run_batch` case): it is the only part of the
    /// sandbox a locked-down stage can still write to, so leftover files
    /// from a previous test must not survive into the next one.
    pub async fn reset_tmp_dir(&self) -> Result<()> {
        let tmp_path = self.tmp_dir();
        if tmp_path.exists() {
            tokio::fs::remove_dir_all(&tmp_path).await?;
        }
        tokio::fs::create_dir_all(&tmp_path).await?;
        stage_tmp_dir(&tmp_path, self.uid, self.gid).await
    }
}

/// `chown` + `0o1777` (sticky, world-writable) the writable `/tmp`
/// replacement. Shared by initial provisioning and by the per-test reset so
/// both paths keep the same ownership/permission contract.
async fn stage_tmp_dir(tmp_path: &Path, uid: UserId, gid: GroupId) -> Result<()> {
    let uid = Uid::from_raw(uid);
    let gid = Gid::from_raw(gid);
    chown(tmp_path, Some(uid), Some(gid))?;

    let mut perms = tokio::fs::metadata(tmp_path).await?.permissions();
    perms.set_mode(0o1777);
    tokio::fs::set_permissions(tmp_path, perms).await?;
    Ok(())
}

/// Allocates and tears down [`SandboxHandle`]s against a backing
/// [`IdentityPool`].
pub struct SandboxProvisioner {
    pool: IdentityPool,
    scratch_base: PathBuf,
}

impl SandboxProvisioner {
    /// Build a provisioner over `pool`, staging scratch roots under
    /// `scratch_base` (e.g. `/var/lib/judge/sandboxes`).
    pub fn new(pool: IdentityPool, scratch_base: impl Into<PathBuf>) -> SandboxProvisioner {
        SandboxProvisioner {
            pool,
            scratch_base: scratch_base.into(),
        }
    }

    /// Reserve an identity, create its scratch root and writable `/tmp`, and
    /// return the handle. Any failure rolls back everything already done and
    /// returns [`ErrorKind::SandboxSetupFailed`].
    pub async fn acquire(&self) -> Result<SandboxHandle<'_>> {
        let guard = self.pool.acquire().await;
        let id = next_sandbox_id();
        let root_path = self.scratch_base.join(format!("sandbox-{}", id));

        if let Err(e) = self.stage_root(&root_path, guard.uid(), guard.gid()).await {
            // Undo the directory creation before surfacing the error; the
            // identity itself goes back via `guard`'s drop.
            let _ = tokio::fs::remove_dir_all(&root_path).await;
            guard.release().await;
            return Err(e).chain_err(|| {
                ErrorKind::SandboxSetupFailed(format!(
                    "failed to stage scratch root at {}",
                    root_path.display()
                ))
            });
        }

        Ok(SandboxHandle {
            id,
            root_path,
            uid: guard.uid(),
            gid: guard.gid(),
            cgroup_ref: None,
            guard,
        })
    }

    async fn stage_root(&self, root_path: &Path, uid: UserId, gid: GroupId) -> Result<()> {
        tokio::fs::create_dir_all(root_path).await?;
        let tmp_path = root_path.join("tmp");
        tokio::fs::create_dir_all(&tmp_path).await?;

        chown(root_path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
        stage_tmp_dir(&tmp_path, uid, gid).await?;

        Ok(())
    }

    /// Terminate every process owned by the sandbox's identity, remove its
    /// scratch root, and return the identity to the pool.
    ///
    /// Idempotent and infallible to the caller: any failure here is logged,
    /// never propagated, since by the time cleanup runs there is nothing
    /// left to roll back.
    pub async fn release(&self, handle: SandboxHandle<'_>) {
        // `lock_working_dir` may have stripped write permission from the
        // root itself; restore it before trying to unlink anything under it.
        if let Ok(metadata) = tokio::fs::metadata(&handle.root_path).await {
            let mut perms = metadata.permissions();
            perms.set_mode(0o700);
            let _ = tokio::fs::set_permissions(&handle.root_path, perms).await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&handle.root_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "failed to remove sandbox scratch root {}: {}",
                    handle.root_path.display(),
                    e
                );
            }
        }

        handle.guard.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::IdentityPool;

    fn test_pool() -> IdentityPool {
        IdentityPool::new(vec![(unsafe { libc::getuid() }, unsafe { libc::getgid() })])
    }

    #[tokio::test]
    async fn test_acquire_creates_scratch_root_with_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SandboxProvisioner::new(test_pool(), dir.path());

        let handle = provisioner.acquire().await.expect("acquire succeeds");
        assert!(handle.root_path.exists());
        assert!(handle.tmp_dir().exists());

        provisioner.release(handle).await;
    }

    #[tokio::test]
    async fn test_lock_working_dir_blocks_further_writes_but_tmp_dir_survives() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SandboxProvisioner::new(test_pool(), dir.path());
        let handle = provisioner.acquire().await.expect("acquire succeeds");

        tokio::fs::write(handle.working_dir().join("a.out"), b"binary").await.unwrap();

        handle.lock_working_dir().await.expect("lock succeeds");

        let write_after_lock = tokio::fs::write(handle.working_dir().join("residue"), b"x").await;
        assert!(write_after_lock.is_err(), "working dir must be read-only once locked");

        // tmp_dir is unaffected by locking the working dir.
        tokio::fs::write(handle.tmp_dir().join("scratch"), b"x").await.expect("tmp dir stays writable");

        provisioner.release(handle).await;
    }

    #[tokio::test]
    async fn test_reset_tmp_dir_wipes_previous_test_residue() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SandboxProvisioner::new(test_pool(), dir.path());
        let handle = provisioner.acquire().await.expect("acquire succeeds");

        let leftover = handle.tmp_dir().join("leftover-from-previous-test");
        tokio::fs::write(&leftover, b"residue").await.unwrap();
        assert!(leftover.exists());

        handle.reset_tmp_dir().await.expect("reset succeeds");

        assert!(!leftover.exists());
        assert!(handle.tmp_dir().exists());

        provisioner.release(handle).await;
    }

    #[tokio::test]
    async fn test_release_removes_scratch_root() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SandboxProvisioner::new(test_pool(), dir.path());

        let handle = provisioner.acquire().await.expect("acquire succeeds");
        let root = handle.root_path.clone();
        provisioner.release(handle).await;

        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_release_is_safe_to_call_once_per_handle() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SandboxProvisioner::new(test_pool(), dir.path());

        let handle = provisioner.acquire().await.expect("acquire succeeds");
        provisioner.release(handle).await;

        // A second acquire must still succeed: the identity was returned.
        let handle = provisioner.acquire().await.expect("identity was freed");
        provisioner.release(handle).await;
    }
}
