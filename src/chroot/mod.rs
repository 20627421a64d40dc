//! Entering a populated root: bind mounts, the lock file that marks the root
//! as in use, the resolv.conf and mtab shims, and teardown in reverse order.

pub mod arch;
pub mod bind;
pub mod lock;
pub mod procs;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{async_defer, context::BuildContext};

use self::{
    bind::{build_bind_list, BindMount, BindRequest, PARENT_ROOT},
    lock::{is_busy, ChrootLock, LOCK_FILE},
};

/// Host files a chroot session reads from. Only tests point these elsewhere.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub root: PathBuf,
    pub resolv_conf: PathBuf,
    pub mtab: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            mtab: PathBuf::from("/etc/mtab"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChrootState {
    Unmounted,
    /// Binds are in place and the lock is held.
    Mounted,
    /// The lock is released and teardown is running.
    Unmounting,
}

/// A root directory that can be entered with `chroot`.
pub struct ChrootEnvironment {
    ctx: BuildContext,
    root: PathBuf,
    user_binds: Vec<BindRequest>,
    mount_parent: bool,
    host: HostPaths,
}

impl ChrootEnvironment {
    pub fn new(ctx: BuildContext, root: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            root: root.into(),
            user_binds: vec![],
            mount_parent: true,
            host: HostPaths::default(),
        }
    }

    pub fn with_binds(mut self, user_binds: Vec<BindRequest>) -> Self {
        self.user_binds = user_binds;
        self
    }

    pub fn with_mount_parent(mut self, mount_parent: bool) -> Self {
        self.mount_parent = mount_parent;
        self
    }

    pub fn with_host(mut self, host: HostPaths) -> Self {
        self.host = host;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mounts the bind set and takes the lock. Whatever was set up before a
    /// failure is torn down again before the error is returned.
    pub async fn setup(&self) -> Result<ChrootSession> {
        let binds = build_bind_list(
            &self.root,
            &self.user_binds,
            self.mount_parent,
            &self.host.root,
        )?;

        let mut session = ChrootSession {
            root: self.root.clone(),
            binds,
            lock: None,
            state: ChrootState::Unmounted,
            mtab_copied: false,
        };

        tracing::info!(root = ?self.root, "Setting up chroot");
        if let Err(error) = session.enter(&self.host).await {
            session.teardown().await;
            return Err(error.context(format!("Failed to set up chroot {:?}", self.root)));
        }
        Ok(session)
    }

    /// Runs `command` with `/bin/sh -c` inside the root, or an interactive
    /// shell when there is none, and returns its exit code. The chroot is
    /// torn down on every path.
    pub async fn run(&self, command: Option<&str>) -> Result<i32> {
        let arch = arch::detect(&self.ctx, &self.root).await?;
        arch::register_emulator(&self.ctx, &self.root, arch).await?;

        let mut session = self.setup().await?;
        let result = session.exec(command).await;
        session.teardown().await;
        result
    }
}

/// A set-up chroot. Dropping it tears it down.
pub struct ChrootSession {
    root: PathBuf,
    binds: Vec<BindMount>,
    lock: Option<ChrootLock>,
    state: ChrootState,
    mtab_copied: bool,
}

impl ChrootSession {
    pub fn state(&self) -> ChrootState {
        self.state
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binds(&self) -> &[BindMount] {
        &self.binds
    }

    async fn enter(&mut self, host: &HostPaths) -> Result<()> {
        self.state = ChrootState::Mounted;
        for bind in self.binds.iter_mut() {
            bind.mount().await?;
        }

        let etc = self.root.join("etc");
        tokio::fs::create_dir_all(&etc).await?;

        if host.resolv_conf.exists() {
            tokio::fs::copy(&host.resolv_conf, etc.join("resolv.conf"))
                .await
                .context("Failed to copy resolv.conf into the chroot")?;
        }

        let mtab = etc.join("mtab");
        let mtab_is_link = tokio::fs::symlink_metadata(&mtab)
            .await
            .is_ok_and(|metadata| metadata.file_type().is_symlink());
        if !mtab_is_link && host.mtab.exists() {
            tokio::fs::copy(&host.mtab, &mtab)
                .await
                .context("Failed to copy mtab into the chroot")?;
            self.mtab_copied = true;
        }

        self.lock = Some(ChrootLock::acquire(&self.root)?);
        Ok(())
    }

    async fn exec(&self, command: Option<&str>) -> Result<i32> {
        let mut cmd = Command::new("chroot");
        cmd.arg(&self.root);
        match command {
            Some(command) => {
                cmd.arg("/bin/sh").arg("-c").arg(command);
            }
            None => {
                let shell = if arch::resolve_in_root(&self.root, "/bin/bash").exists() {
                    "/bin/bash"
                } else {
                    "/bin/sh"
                };
                cmd.arg(shell);
            }
        }

        tracing::trace!(cmd = ?cmd.as_std(), "run in chroot");
        let status = cmd
            .status()
            .await
            .with_context(|| format!("Failed to chroot into {:?}", self.root))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Releases the lock, then undoes the setup unless another process still
    /// holds the lock. Failures are logged, never returned.
    pub async fn teardown(&mut self) {
        if self.state == ChrootState::Unmounted {
            return;
        }
        self.state = ChrootState::Unmounting;

        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }

        let busy = match is_busy(&self.root.join(LOCK_FILE)) {
            Ok(busy) => busy,
            Err(error) => {
                tracing::warn!("{error:#}");
                false
            }
        };

        if busy {
            tracing::warn!(root = ?self.root, "Chroot still in use by another process, leaving its mounts in place");
        } else {
            for bind in self.binds.iter_mut().rev() {
                if let Err(error) = bind.unmount().await {
                    tracing::warn!("{error:#}");
                }
            }
            self.remove_parent_root().await;
            self.reset_shims().await;
            if let Err(error) = procs::kill_processes_in(&self.root) {
                tracing::warn!("{error:#}");
            }
        }

        for bind in self.binds.iter_mut().rev().filter(|bind| bind.user) {
            bind.remove_created_dest().await;
        }

        self.state = ChrootState::Unmounted;
        tracing::info!(root = ?self.root, "Chroot torn down");
    }

    async fn remove_parent_root(&self) {
        let parent_root = self.root.join(PARENT_ROOT.trim_start_matches('/'));
        let is_empty = std::fs::read_dir(&parent_root)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            if let Err(error) = tokio::fs::remove_dir(&parent_root).await {
                tracing::warn!(?error, "Failed to remove {parent_root:?}");
            }
        }
    }

    async fn reset_shims(&mut self) {
        let resolv_conf = self.root.join("etc/resolv.conf");
        if resolv_conf.exists() {
            if let Err(error) = tokio::fs::write(&resolv_conf, b"").await {
                tracing::warn!(?error, "Failed to truncate {resolv_conf:?}");
            }
        }

        if self.mtab_copied {
            let mtab = self.root.join("etc/mtab");
            if let Err(error) = tokio::fs::remove_file(&mtab).await {
                tracing::warn!(?error, "Failed to remove {mtab:?}");
            }
            self.mtab_copied = false;
        }
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.state == ChrootState::Unmounted {
            return;
        }

        async_defer! {
            async {
                self.teardown().await;
            }
        }
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::fs::mount::mounts_under;

    fn fake_host(dir: &Path) -> Result<HostPaths> {
        std::fs::create_dir_all(dir.join("etc"))?;
        std::fs::write(dir.join("etc/resolv.conf"), "nameserver 192.0.2.1\n")?;
        std::fs::write(dir.join("etc/mtab"), "proc /proc proc rw 0 0\n")?;
        Ok(HostPaths {
            root: dir.to_path_buf(),
            resolv_conf: dir.join("etc/resolv.conf"),
            mtab: dir.join("etc/mtab"),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_shims_without_binds() -> Result<()> {
        let host_dir = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let host = fake_host(host_dir.path())?;

        // No default bind sources exist below the fake host, so only the
        // shims and the lock are set up
        let env = ChrootEnvironment::new(BuildContext::default(), root.path())
            .with_mount_parent(false)
            .with_host(host);
        let mut session = env.setup().await?;
        assert_eq!(session.state(), ChrootState::Mounted);
        assert!(session.binds().is_empty());
        assert_eq!(
            std::fs::read_to_string(root.path().join("etc/resolv.conf"))?,
            "nameserver 192.0.2.1\n"
        );
        assert!(root.path().join("etc/mtab").exists());
        assert!(root.path().join(LOCK_FILE).exists());

        session.teardown().await;
        assert_eq!(session.state(), ChrootState::Unmounted);
        assert_eq!(std::fs::read_to_string(root.path().join("etc/resolv.conf"))?, "");
        assert!(!root.path().join("etc/mtab").exists());

        // Idempotent
        session.teardown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_mtab_symlink_is_kept() -> Result<()> {
        let host_dir = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let host = fake_host(host_dir.path())?;
        std::fs::create_dir_all(root.path().join("etc"))?;
        std::os::unix::fs::symlink("/proc/self/mounts", root.path().join("etc/mtab"))?;

        let env = ChrootEnvironment::new(BuildContext::default(), root.path())
            .with_mount_parent(false)
            .with_host(host);
        let mut session = env.setup().await?;
        session.teardown().await;

        let link = std::fs::read_link(root.path().join("etc/mtab"))?;
        assert_eq!(link, Path::new("/proc/self/mounts"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_parent_root_removed_only_when_empty() -> Result<()> {
        let host_dir = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let host = fake_host(host_dir.path())?;
        let env = ChrootEnvironment::new(BuildContext::default(), root.path())
            .with_mount_parent(false)
            .with_host(host);

        let parent_root = root.path().join("parentroot");
        std::fs::create_dir_all(&parent_root)?;
        std::fs::write(parent_root.join("file"), "left behind")?;
        let mut session = env.setup().await?;
        session.teardown().await;
        assert_eq!(std::fs::read_to_string(parent_root.join("file"))?, "left behind");

        std::fs::remove_file(parent_root.join("file"))?;
        let mut session = env.setup().await?;
        session.teardown().await;
        assert!(!parent_root.exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_busy_chroot_keeps_shims() -> Result<()> {
        let host_dir = tempfile::tempdir()?;
        let root = tempfile::tempdir()?;
        let host = fake_host(host_dir.path())?;
        let env = ChrootEnvironment::new(BuildContext::default(), root.path())
            .with_mount_parent(false)
            .with_host(host);
        let mut session = env.setup().await?;

        let lock_file = root.path().join(LOCK_FILE);
        let mut holder = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("exec 3<{lock_file:?}; sleep 10"))
            .spawn()?;
        let mut held = false;
        for _ in 0..50 {
            if lock::lock_holders(Path::new("/proc"), &lock_file)?.contains(&holder.id()) {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        session.teardown().await;
        let resolv_conf = std::fs::read_to_string(root.path().join("etc/resolv.conf"))?;
        let mtab_kept = root.path().join("etc/mtab").exists();

        holder.kill()?;
        holder.wait()?;

        assert!(held);
        assert_eq!(session.state(), ChrootState::Unmounted);
        assert_eq!(resolv_conf, "nameserver 192.0.2.1\n");
        assert!(mtab_kept);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    #[ignore = "requires root"]
    async fn test_setup_teardown_leaves_no_mounts() -> Result<()> {
        let root = tempfile::tempdir()?;
        let cache = tempfile::tempdir()?;
        let bind = format!("{}:/mnt/cache", cache.path().display());
        let env = ChrootEnvironment::new(BuildContext::default(), root.path())
            .with_binds(vec![BindRequest::parse(&bind)?]);

        let mut session = env.setup().await?;
        assert!(!mounts_under(root.path())?.is_empty());
        assert!(root.path().join("mnt/cache").exists());

        session.teardown().await;
        assert!(mounts_under(root.path())?.is_empty());
        assert!(!root.path().join("parentroot").exists());
        assert!(!root.path().join("mnt/cache").exists());
        assert!(root.path().join(LOCK_FILE).exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    #[ignore = "requires root"]
    async fn test_busy_chroot_keeps_mounts() -> Result<()> {
        let root = tempfile::tempdir()?;
        let env = ChrootEnvironment::new(BuildContext::default(), root.path());
        let mut session = env.setup().await?;

        let mut holder = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("exec 3<{:?}; sleep 10", root.path().join(LOCK_FILE)))
            .spawn()?;
        std::thread::sleep(std::time::Duration::from_millis(500));

        session.teardown().await;
        let still_mounted = !mounts_under(root.path())?.is_empty();

        holder.kill()?;
        holder.wait()?;
        for bind in session.binds.iter_mut().rev() {
            bind.unmount().await?;
        }

        assert!(still_mounted);
        Ok(())
    }
}
