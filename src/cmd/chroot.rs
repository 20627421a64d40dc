use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{
    chroot::{bind::BindRequest, ChrootEnvironment},
    context::BuildContext,
};

pub struct ChrootCommand {
    pub chroot_options: crate::cli::ChrootOptions,
}

#[async_trait]
impl super::Command for ChrootCommand {
    async fn run(&self) -> Result<()> {
        let options = &self.chroot_options;
        let binds = options
            .binds
            .iter()
            .map(|spec| BindRequest::parse(spec))
            .collect::<Result<Vec<_>>>()?;
        let command = (!options.command.is_empty()).then(|| options.command.join(" "));

        let code = ChrootEnvironment::new(BuildContext::default(), &options.root)
            .with_binds(binds)
            .with_mount_parent(!options.no_parent_root)
            .run(command.as_deref())
            .await?;
        if code != 0 {
            bail!("Chroot command exited with code {code}");
        }
        Ok(())
    }
}
