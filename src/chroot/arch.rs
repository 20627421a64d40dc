use std::{
    fmt::Display,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{
    context::BuildContext,
    error::CreatorError,
    fs::{cmd::CheckCommandOutput as _, kmod, mount::is_mounted},
};

/// Binaries probed to find out what a root filesystem was built for.
const PROBES: [&str; 2] = ["/bin/bash", "/sbin/init"];

const BINFMT_MISC: &str = "/proc/sys/fs/binfmt_misc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Arm,
    Aarch64,
    X86_64,
    X86,
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::Arm => write!(f, "arm"),
            Architecture::Aarch64 => write!(f, "aarch64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::X86 => write!(f, "x86"),
        }
    }
}

impl Architecture {
    /// Classifies the output of `file -b`.
    pub fn from_file_output(output: &str) -> Option<Self> {
        if output.contains("aarch64") {
            Some(Architecture::Aarch64)
        } else if output.contains("ARM") {
            Some(Architecture::Arm)
        } else if output.contains("x86-64") {
            Some(Architecture::X86_64)
        } else if output.contains("Intel 80386") {
            Some(Architecture::X86)
        } else {
            None
        }
    }

    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "arm" => Some(Architecture::Arm),
            "aarch64" => Some(Architecture::Aarch64),
            "x86_64" => Some(Architecture::X86_64),
            "x86" => Some(Architecture::X86),
            _ => None,
        }
    }

    /// Whether binaries of this architecture need a user-mode emulator on the
    /// current host.
    pub fn needs_emulation(&self) -> bool {
        match self {
            Architecture::Arm => true,
            Architecture::Aarch64 => Self::host() != Some(Architecture::Aarch64),
            Architecture::X86_64 | Architecture::X86 => false,
        }
    }

    fn emulator(&self) -> Option<Emulator> {
        match self {
            Architecture::Arm => Some(Emulator {
                name: "arm",
                binary: "qemu-arm-static",
                magic: r"\x7fELF\x01\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x28\x00",
                mask: r"\xff\xff\xff\xff\xff\xff\xff\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff",
            }),
            Architecture::Aarch64 => Some(Emulator {
                name: "aarch64",
                binary: "qemu-aarch64-static",
                magic: r"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\xb7\x00",
                mask: r"\xff\xff\xff\xff\xff\xff\xff\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff",
            }),
            Architecture::X86_64 | Architecture::X86 => None,
        }
    }
}

struct Emulator {
    name: &'static str,
    binary: &'static str,
    magic: &'static str,
    mask: &'static str,
}

impl Emulator {
    /// The line written to `binfmt_misc/register`.
    fn register_line(&self, interpreter: &Path) -> String {
        format!(
            ":{}:M::{}:{}:{}:",
            self.name,
            self.magic,
            self.mask,
            interpreter.display()
        )
    }
}

/// Resolves `path` inside `root`, following symlinks the way they would be
/// followed after chroot.
pub fn resolve_in_root(root: &Path, path: &str) -> PathBuf {
    let mut current = PathBuf::from(path);
    for _ in 0..16 {
        let host_path = root.join(current.strip_prefix("/").unwrap_or(&current));
        let Ok(target) = std::fs::read_link(&host_path) else {
            return host_path;
        };
        current = if target.is_absolute() {
            target
        } else {
            let mut resolved = current.parent().map(Path::to_path_buf).unwrap_or_default();
            for component in target.components() {
                match component {
                    Component::ParentDir => {
                        resolved.pop();
                    }
                    Component::CurDir => {}
                    other => resolved.push(other),
                }
            }
            resolved
        };
    }
    root.join(current.strip_prefix("/").unwrap_or(&current))
}

/// Probes `/bin/bash` and then `/sbin/init` in `root`.
pub async fn detect(ctx: &BuildContext, root: &Path) -> Result<Architecture> {
    for probe in PROBES {
        let binary = resolve_in_root(root, probe);
        if !binary.exists() {
            continue;
        }

        let output = match Command::new("file").arg("-b").arg(&binary).run_in(ctx).await {
            Ok(output) => output,
            Err(error) => {
                tracing::debug!("{error:#}");
                continue;
            }
        };
        if let Some(arch) = Architecture::from_file_output(&String::from_utf8_lossy(&output)) {
            tracing::debug!(?binary, %arch, "Detected chroot architecture");
            return Ok(arch);
        }
    }

    Err(CreatorError::UnknownArchitecture {
        root: root.to_path_buf(),
        probes: PROBES.iter().map(|probe| probe.to_string()).collect(),
    }
    .into())
}

async fn ensure_binfmt_misc(ctx: &BuildContext) -> Result<()> {
    let binfmt_misc = Path::new(BINFMT_MISC);
    if binfmt_misc.join("register").exists() {
        return Ok(());
    }

    kmod::load_module(ctx, "binfmt_misc").await?;
    if !is_mounted(binfmt_misc)? {
        Command::new("mount")
            .arg("-t")
            .arg("binfmt_misc")
            .arg("none")
            .arg(binfmt_misc)
            .run_in(ctx)
            .await
            .context("Failed to mount binfmt_misc")?;
    }
    Ok(())
}

/// Copies the static qemu emulator for `arch` into `root` and registers it
/// with binfmt_misc, unless it already is. Returns the emulator path inside
/// the chroot.
pub async fn register_emulator(
    ctx: &BuildContext,
    root: &Path,
    arch: Architecture,
) -> Result<Option<PathBuf>> {
    let Some(emulator) = arch.emulator().filter(|_| arch.needs_emulation()) else {
        return Ok(None);
    };

    let host_binary = which::which(emulator.binary).with_context(|| {
        format!("Please install {} to run {arch} binaries", emulator.binary)
    })?;
    let interpreter = Path::new("/usr/bin").join(emulator.binary);
    let in_root = root.join("usr/bin").join(emulator.binary);
    tokio::fs::create_dir_all(root.join("usr/bin")).await?;
    tokio::fs::copy(&host_binary, &in_root)
        .await
        .with_context(|| format!("Failed to copy {host_binary:?} into {root:?}"))?;

    ensure_binfmt_misc(ctx).await?;

    let node = Path::new(BINFMT_MISC).join(emulator.name);
    if node.exists() {
        tracing::debug!(?node, "Emulator already registered");
        return Ok(Some(interpreter));
    }

    tracing::info!(%arch, ?interpreter, "Registering emulator with binfmt_misc");
    tokio::fs::write(
        Path::new(BINFMT_MISC).join("register"),
        emulator.register_line(&interpreter),
    )
    .await
    .context("Failed to register emulator with binfmt_misc")?;
    Ok(Some(interpreter))
}

#[cfg(test)]
pub mod tests {

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ELF 64-bit LSB pie executable, x86-64, version 1 (SYSV), dynamically linked", Some(Architecture::X86_64))]
    #[case("ELF 32-bit LSB executable, ARM, EABI5 version 1 (SYSV), dynamically linked", Some(Architecture::Arm))]
    #[case("ELF 64-bit LSB executable, ARM aarch64, version 1 (SYSV), dynamically linked", Some(Architecture::Aarch64))]
    #[case("ELF 32-bit LSB executable, Intel 80386, version 1 (SYSV)", Some(Architecture::X86))]
    #[case("ELF 64-bit MSB executable, 64-bit PowerPC or cisco 7500", None)]
    #[case("cannot open `/bin/bash' (No such file or directory)", None)]
    fn test_from_file_output(#[case] output: &str, #[case] expected: Option<Architecture>) {
        assert_eq!(Architecture::from_file_output(output), expected);
    }

    #[test]
    fn test_register_line() {
        let emulator = Architecture::Arm.emulator().expect("arm has an emulator");
        let line = emulator.register_line(Path::new("/usr/bin/qemu-arm-static"));
        assert!(line.starts_with(r":arm:M::\x7fELF\x01"));
        assert!(line.ends_with(":/usr/bin/qemu-arm-static:"));
        assert!(Architecture::X86_64.emulator().is_none());
        assert!(Architecture::Arm.needs_emulation());
    }

    #[test]
    fn test_resolve_in_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("usr/bin"))?;
        std::fs::create_dir_all(root.join("usr/lib/systemd"))?;
        std::fs::write(root.join("usr/bin/bash"), "")?;
        std::fs::write(root.join("usr/lib/systemd/systemd"), "")?;
        std::os::unix::fs::symlink("usr/bin", root.join("bin"))?;
        std::fs::create_dir_all(root.join("sbin"))?;
        std::os::unix::fs::symlink("../usr/lib/systemd/systemd", root.join("sbin/init"))?;

        // Absolute targets stay inside the root
        std::os::unix::fs::symlink("/usr/bin/bash", root.join("usr/bin/sh"))?;

        assert_eq!(resolve_in_root(root, "/sbin/init"), root.join("usr/lib/systemd/systemd"));
        assert_eq!(resolve_in_root(root, "/usr/bin/sh"), root.join("usr/bin/bash"));
        assert_eq!(resolve_in_root(root, "/missing"), root.join("missing"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_detect_empty_root_fails_fast() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let error = detect(&BuildContext::default(), dir.path()).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CreatorError>(),
            Some(CreatorError::UnknownArchitecture { .. })
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_detect_host_root() -> Result<()> {
        if which::which("file").is_err() || !Path::new("/bin/bash").exists() {
            return Ok(());
        }
        let arch = detect(&BuildContext::default(), Path::new("/")).await?;
        assert_eq!(Some(arch), Architecture::host());
        Ok(())
    }
}
