use anyhow::Result;
use async_trait::async_trait;

pub mod chroot;
pub mod create;
pub mod minimize;
pub mod plan;
pub mod resparse;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Command {
    fn into_command(self) -> Box<dyn Command> {
        match self {
            crate::cli::Command::Plan(plan_options) => Box::new(plan::PlanCommand { plan_options }),
            crate::cli::Command::Create(create_options) => {
                Box::new(create::CreateCommand { create_options })
            }
            crate::cli::Command::Chroot(chroot_options) => {
                Box::new(chroot::ChrootCommand { chroot_options })
            }
            crate::cli::Command::Resparse(resparse_options) => {
                Box::new(resparse::ResparseCommand { resparse_options })
            }
            crate::cli::Command::Minimize(minimize_options) => {
                Box::new(minimize::MinimizeCommand { minimize_options })
            }
        }
    }
}
