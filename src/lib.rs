#![deny(clippy::disallowed_methods)]

pub mod btrfs;
pub mod chroot;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod image;
pub mod partition;
pub mod types;

use anyhow::{Context, Result};
use clap::Parser as _;
use cmd::IntoCommand as _;
use shadow_rs::shadow;
use tracing_subscriber::{
    layer::SubscriberExt as _, reload, util::SubscriberInitExt as _, EnvFilter, Registry,
};

shadow!(build);

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

/// Installs the stderr subscriber. `RUST_LOG` wins over the built-in level.
fn init_logging() -> FilterHandle {
    let (filter, handle) = reload::Layer::new(env_filter_or("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

async fn apply_config_verbosity(command: &cli::Command, handle: &FilterHandle) -> Result<()> {
    let Some(config_path) = command.config_path() else {
        return Ok(());
    };
    let verbose = config::ImageConfig::load(config_path)
        .await?
        .global
        .is_some_and(|global| global.verbose);
    if verbose {
        handle
            .modify(|filter| *filter = env_filter_or("debug"))
            .context("Failed to raise log level to DEBUG")?;
        tracing::debug!(config = ?config_path, "Verbose logging requested by image config");
    }
    Ok(())
}

pub async fn run() -> Result<()> {
    let handle = init_logging();
    let args = cli::Cli::parse();

    tracing::debug!(
        version = build::PKG_VERSION,
        commit = build::COMMIT_HASH,
        build_time = build::BUILD_TIME,
        "Starting imgpilot"
    );

    apply_config_verbosity(&args.command, &handle).await?;
    args.command.into_command().run().await
}

/// Runs an async cleanup future when the enclosing scope ends, including from
/// `Drop` impls. The current task blocks until the future completes.
///
/// Requires the tokio multi-thread runtime; `block_in_place` panics on a
/// current-thread runtime.
#[macro_export]
macro_rules! async_defer {
    ($future:expr) => {
        scopeguard::defer! {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = $future.await;
                });
            });
        }
    };
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::registry()
            .with(super::env_filter_or("debug"))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    }
}
