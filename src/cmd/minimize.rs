use anyhow::Result;
use async_trait::async_trait;

use crate::{context::BuildContext, fs::minimize::ImageMinimizer};

pub struct MinimizeCommand {
    pub minimize_options: crate::cli::MinimizeOptions,
}

#[async_trait]
impl super::Command for MinimizeCommand {
    async fn run(&self) -> Result<()> {
        let options = &self.minimize_options;
        let mut minimizer = ImageMinimizer::new(BuildContext::default())
            .with_compressor(options.compressor.clone());
        if let Some(cow_size) = options.cow_size {
            minimizer = minimizer.with_cow_size(cow_size);
        }

        let delta = minimizer
            .minimize(&options.image, options.minimal_size, &options.output)
            .await?;
        tracing::info!(path = ?delta.path, cow_used = delta.cow_used, "Minimized delta written");
        println!("{}", delta.path.display());
        Ok(())
    }
}
