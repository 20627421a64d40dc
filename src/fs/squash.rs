use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{context::BuildContext, fs::cmd::CheckCommandOutput as _};

/// Packs `input` (a file or directory) into a fresh squashfs image at `output`.
pub async fn mksquashfs(
    ctx: &BuildContext,
    input: &Path,
    output: &Path,
    compressor: Option<&str>,
) -> Result<()> {
    let mut cmd = Command::new("mksquashfs");
    cmd.arg(input)
        .arg(output)
        .arg("-noappend")
        .arg("-no-progress");
    if let Some(compressor) = compressor {
        cmd.arg("-comp").arg(compressor);
    }

    cmd.run_in(ctx)
        .await
        .with_context(|| format!("Failed to squash {input:?} into {output:?}"))?;
    Ok(())
}
