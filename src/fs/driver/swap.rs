use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{context::BuildContext, error::MountError, fs::cmd::CheckCommandOutput as _};

/// Formats a swap partition with a fresh random UUID, which is returned.
pub async fn mkswap(ctx: &BuildContext, device: &Path, label: &str) -> Result<String> {
    let uuid = uuid::Uuid::new_v4().to_string();

    tracing::info!("Formatting swap on {device:?}");
    Command::new("mkswap")
        .arg("-L")
        .arg(label)
        .arg("-U")
        .arg(&uuid)
        .arg(device)
        .run_in(ctx)
        .await
        .with_context(|| MountError::new(format!("Error creating swap on {device:?}")))?;

    Ok(uuid)
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_mkswap_on_missing_device_is_mount_error() {
        let error = mkswap(
            &BuildContext::default(),
            Path::new("/nonexistent/swap.img"),
            "swap",
        )
        .await
        .unwrap_err();
        assert!(error.downcast_ref::<MountError>().is_some());
    }
}
