use std::path::{Path, PathBuf};

use clap::Parser;

use crate::{build::CLAP_LONG_VERSION, types::FsType};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Print the partition layout computed from an image config.
    #[command(name = "plan")]
    Plan(PlanOptions),

    /// Build the partitioned image described by an image config.
    #[command(name = "create")]
    Create(CreateOptions),

    /// Enter a root directory with the usual bind mounts in place.
    #[command(name = "chroot")]
    Chroot(ChrootOptions),

    /// Shrink a filesystem image to its minimal size, optionally growing it back.
    #[command(name = "resparse")]
    Resparse(ResparseOptions),

    /// Produce a squashed copy-on-write delta that shrinks an image.
    #[command(name = "minimize")]
    Minimize(MinimizeOptions),
}

impl Command {
    /// The image config this command reads, if any.
    pub fn config_path(&self) -> Option<&Path> {
        match self {
            Command::Plan(options) => Some(&options.config),
            Command::Create(options) => Some(&options.config),
            Command::Chroot(_) | Command::Resparse(_) | Command::Minimize(_) => None,
        }
    }
}

#[derive(Parser, Debug)]
pub struct PlanOptions {
    /// Path to the image config (TOML).
    #[clap(long, short = 'c')]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct CreateOptions {
    /// Path to the image config (TOML).
    #[clap(long, short = 'c')]
    pub config: PathBuf,

    /// Directory the disk images are written to.
    #[clap(long, short = 'o')]
    pub output: PathBuf,

    /// Image name, used as the prefix of every disk image file.
    #[clap(long, short = 'n')]
    pub name: String,

    /// Where the partitions are mounted while building. Defaults to `<output>/<name>.root`.
    #[clap(long)]
    pub root: Option<PathBuf>,

    /// Command run inside the chroot once every partition is mounted, e.g.
    /// a package installer.
    #[clap(long)]
    pub exec: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ChrootOptions {
    /// Root directory to enter.
    pub root: PathBuf,

    /// Extra bind mount as SRC[:DEST[:OPTS]]. May be given more than once.
    #[clap(long = "bind", short = 'b')]
    pub binds: Vec<String>,

    /// Do not bind the host root at /parentroot.
    #[clap(long, default_value = "false")]
    pub no_parent_root: bool,

    /// Command to run instead of an interactive shell.
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ResparseOptions {
    /// Filesystem image file.
    pub image: PathBuf,

    /// Filesystem type of the image.
    #[clap(long)]
    #[arg(value_enum)]
    pub fstype: FsType,

    /// Size in bytes to grow the image back to after shrinking.
    #[clap(long)]
    pub size: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct MinimizeOptions {
    /// Ext filesystem image to shrink. It is left untouched.
    pub image: PathBuf,

    /// Size in bytes the filesystem is shrunk to.
    #[clap(long)]
    pub minimal_size: u64,

    /// Path of the squashed delta.
    #[clap(long, short = 'o')]
    pub output: PathBuf,

    /// Size in bytes of the copy-on-write store.
    #[clap(long)]
    pub cow_size: Option<u64>,

    /// mksquashfs compressor, e.g. xz or zstd.
    #[clap(long)]
    pub compressor: Option<String>,
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use anyhow::Result;

    #[test]
    fn test_parse_chroot_command() -> Result<()> {
        let cli = Cli::try_parse_from([
            "imgpilot",
            "chroot",
            "/var/tmp/root",
            "--bind",
            "/srv/cache:/var/cache/pkgs:ro",
            "--no-parent-root",
            "--",
            "rpm",
            "-qa",
        ])?;
        let Command::Chroot(options) = cli.command else {
            panic!("expected chroot command");
        };
        assert_eq!(options.root, Path::new("/var/tmp/root"));
        assert_eq!(options.binds, vec!["/srv/cache:/var/cache/pkgs:ro"]);
        assert!(options.no_parent_root);
        assert_eq!(options.command, vec!["rpm", "-qa"]);
        Ok(())
    }

    #[test]
    fn test_config_path() -> Result<()> {
        let cli = Cli::try_parse_from(["imgpilot", "plan", "-c", "image.toml"])?;
        assert_eq!(cli.command.config_path(), Some(Path::new("image.toml")));

        let cli = Cli::try_parse_from([
            "imgpilot",
            "resparse",
            "root.img",
            "--fstype",
            "ext4",
            "--size",
            "1048576",
        ])?;
        assert_eq!(cli.command.config_path(), None);
        Ok(())
    }
}
