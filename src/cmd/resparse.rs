use anyhow::Result;
use async_trait::async_trait;

use crate::{context::BuildContext, fs::block::disk::Disk, fs::fsmount::FsMount};

pub struct ResparseCommand {
    pub resparse_options: crate::cli::ResparseOptions,
}

#[async_trait]
impl super::Command for ResparseCommand {
    async fn run(&self) -> Result<()> {
        let options = &self.resparse_options;
        let mountdir = tempfile::Builder::new().prefix("imgpilot-").tempdir()?;
        let disk = Disk::loopback(&options.image)?;

        let mut fs = FsMount::new(
            BuildContext::default(),
            disk,
            options.fstype,
            mountdir.path(),
            "",
            None,
        )?;
        let minimal = fs.resparse(options.size).await?;
        println!("{minimal}");
        Ok(())
    }
}
