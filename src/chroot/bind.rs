use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::{
    error::{CreatorError, MountError},
    fs::mount::is_mounted,
};

/// Host paths bound into every chroot, in mount order.
pub const DEFAULT_BINDS: [&str; 9] = [
    "/proc",
    "/proc/sys/fs/binfmt_misc",
    "/sys",
    "/dev",
    "/dev/pts",
    "/dev/shm",
    "/var/lib/dbus",
    "/var/run/dbus",
    "/var/lock",
];

/// Where the host root is bound read-only inside the chroot.
pub const PARENT_ROOT: &str = "/parentroot";

/// Per-mount flags for a comma separated bind option list, applied with a
/// bind remount. Unknown options are rejected.
pub fn bind_flags(options: Option<&str>) -> Result<MsFlags> {
    let mut flags = MsFlags::empty();
    for option in options.into_iter().flat_map(|options| options.split(',')) {
        match option.trim() {
            "" | "rw" | "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => {
                return Err(CreatorError::InvalidConfig(format!(
                    "Unsupported bind mount option '{other}'"
                ))
                .into())
            }
        }
    }
    Ok(flags)
}

/// A caller supplied `src[:dest[:opts]]` bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub src: PathBuf,
    /// Path inside the chroot.
    pub dest: PathBuf,
    pub options: Option<String>,
}

impl BindRequest {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut fields = spec.splitn(3, ':');
        let src = fields.next().unwrap_or_default();
        if !src.starts_with('/') {
            return Err(CreatorError::InvalidConfig(format!(
                "Bind mount source must be an absolute path: {spec}"
            ))
            .into());
        }
        let dest = fields.next().filter(|dest| !dest.is_empty()).unwrap_or(src);
        if !dest.starts_with('/') {
            return Err(CreatorError::InvalidConfig(format!(
                "Bind mount destination must be an absolute path: {spec}"
            ))
            .into());
        }
        let options = fields
            .next()
            .filter(|options| !options.is_empty())
            .map(str::to_owned);
        bind_flags(options.as_deref())?;

        Ok(Self {
            src: src.into(),
            dest: dest.into(),
            options,
        })
    }

    /// Whether this bind would shadow a default one, or bind the host root.
    fn is_redundant(&self) -> bool {
        self.src == Path::new("/")
            || DEFAULT_BINDS
                .iter()
                .any(|default| self.src == Path::new(default) || self.dest == Path::new(default))
    }
}

/// One bind mount of a host path into the chroot.
#[derive(Debug)]
pub struct BindMount {
    pub src: PathBuf,
    /// Absolute host path below the chroot root.
    pub dest: PathBuf,
    pub options: Option<String>,
    /// Requested by the caller rather than part of the default set.
    pub user: bool,
    mounted: bool,
    created_dest: bool,
}

fn join_in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

impl BindMount {
    pub fn new(root: &Path, src: impl Into<PathBuf>, dest: &Path, options: Option<&str>) -> Self {
        Self {
            src: src.into(),
            dest: join_in_root(root, dest),
            options: options.map(str::to_owned),
            user: false,
            mounted: false,
            created_dest: false,
        }
    }

    fn user(mut self) -> Self {
        self.user = true;
        self
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn created_dest(&self) -> bool {
        self.created_dest
    }

    pub async fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        // Another session bound it already; whoever leaves last unmounts it
        if is_mounted(&self.dest)? {
            tracing::debug!(dest = ?self.dest, "Already mounted, skipping bind");
            self.mounted = true;
            return Ok(());
        }

        if self.user && !self.src.exists() {
            tokio::fs::create_dir_all(&self.src)
                .await
                .with_context(|| format!("Failed to create bind source {:?}", self.src))?;
        }

        if tokio::fs::symlink_metadata(&self.dest).await.is_err() {
            if self.src.is_dir() {
                tokio::fs::create_dir_all(&self.dest).await
            } else {
                if let Some(parent) = self.dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&self.dest, b"").await
            }
            .with_context(|| format!("Failed to create bind destination {:?}", self.dest))?;
            self.created_dest = true;
        }

        let flags = bind_flags(self.options.as_deref())?;
        let src = self.src.clone();
        let dest = self.dest.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            mount(
                Some(src.as_path()),
                dest.as_path(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            // The initial bind ignores per-mount flags
            if !flags.is_empty() {
                mount(
                    None::<&str>,
                    dest.as_path(),
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
                    None::<&str>,
                )?;
            }
            Ok(())
        })
        .await?
        .with_context(|| {
            MountError::new(format!("Failed to bind {:?} to {:?}", self.src, self.dest))
        })?;

        tracing::debug!(src = ?self.src, dest = ?self.dest, ?flags, "Bind mounted");
        self.mounted = true;
        Ok(())
    }

    /// Lazily detaches the bind.
    pub async fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }

        let dest = self.dest.clone();
        tokio::task::spawn_blocking(move || umount2(dest.as_path(), MntFlags::MNT_DETACH))
            .await?
            .with_context(|| MountError::new(format!("Failed to unmount {:?}", self.dest)))?;
        tracing::debug!(dest = ?self.dest, "Bind unmounted");
        self.mounted = false;
        Ok(())
    }

    /// Removes the destination if this session created it and it is empty.
    pub async fn remove_created_dest(&mut self) {
        if !self.created_dest || self.mounted {
            return;
        }

        let result = match tokio::fs::symlink_metadata(&self.dest).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir(&self.dest).await,
            Ok(metadata) if metadata.len() == 0 => tokio::fs::remove_file(&self.dest).await,
            Ok(_) => Err(std::io::Error::other("not empty")),
            Err(_) => Ok(()),
        };
        match result {
            Ok(()) => self.created_dest = false,
            Err(error) => {
                tracing::warn!(dest = ?self.dest, %error, "Leaving bind destination in place")
            }
        }
    }
}

/// The ordered bind set for a chroot at `root`. Default sources are looked up
/// below `host`, which is `/` outside of tests.
pub fn build_bind_list(
    root: &Path,
    user_binds: &[BindRequest],
    mount_parent: bool,
    host: &Path,
) -> Result<Vec<BindMount>> {
    let mut binds = Vec::new();

    for default in DEFAULT_BINDS {
        let src = join_in_root(host, Path::new(default));
        if src.exists() {
            binds.push(BindMount::new(root, src, Path::new(default), None));
        }
    }

    for request in user_binds {
        if request.is_redundant() {
            tracing::debug!(?request, "Ignoring bind mount that duplicates a default");
            continue;
        }
        binds.push(
            BindMount::new(root, &request.src, &request.dest, request.options.as_deref()).user(),
        );
    }

    if mount_parent {
        binds.push(BindMount::new(root, host, Path::new(PARENT_ROOT), Some("ro")));
    }

    let modules = host.join("lib/modules");
    if modules.is_dir() {
        let mut kernels = std::fs::read_dir(&modules)
            .with_context(|| format!("Failed to list {modules:?}"))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        kernels.sort();
        for kernel in kernels {
            let Some(name) = kernel.file_name() else {
                continue;
            };
            let dest = Path::new("/lib/modules").join(name);
            binds.push(BindMount::new(root, kernel.clone(), &dest, Some("ro")));
        }
    }

    Ok(binds)
}
