use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{
    chroot::ChrootEnvironment,
    config::ImageConfig,
    image::PartitionedImage,
};

pub struct CreateCommand {
    pub create_options: crate::cli::CreateOptions,
}

impl CreateCommand {
    async fn populate(&self, image: &mut PartitionedImage, config: &ImageConfig) -> Result<()> {
        image.mount().await?;

        for partition in &image.layout().partitions {
            if let Some(uuid) = image.uuid_of(&partition.mountpoint) {
                tracing::info!(mountpoint = %partition.mountpoint, %uuid, "Filesystem ready");
            }
        }

        let Some(exec) = &self.create_options.exec else {
            return Ok(());
        };
        let chroot = config.chroot();
        let code = ChrootEnvironment::new(config.context(), image.root())
            .with_binds(chroot.bind_requests()?)
            .with_mount_parent(chroot.mount_parent)
            .run(Some(exec))
            .await?;
        if code != 0 {
            bail!("Command `{exec}` exited with code {code} inside the image");
        }
        Ok(())
    }
}

#[async_trait]
impl super::Command for CreateCommand {
    async fn run(&self) -> Result<()> {
        let options = &self.create_options;
        let config = ImageConfig::load(&options.config).await?;
        let layout = config.layout()?;
        let root = options
            .root
            .clone()
            .unwrap_or_else(|| options.output.join(format!("{}.root", options.name)));

        let mut image = PartitionedImage::new(
            config.context(),
            &options.name,
            &options.output,
            root,
            layout,
            config.disk_targets(),
        );

        let result = self.populate(&mut image, &config).await;
        let cleanup = image.cleanup().await;
        result?;
        cleanup?;

        for artifact in image.artifacts() {
            println!("{}", artifact.display());
        }
        Ok(())
    }
}
