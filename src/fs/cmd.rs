use std::{
    marker::{Send, Sync},
    process::{Output, Stdio},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::context::BuildContext;

#[async_trait]
pub trait CheckCommandOutput {
    async fn run(&mut self) -> Result<Vec<u8>>;

    /// Like [`CheckCommandOutput::run`] but bounded by the tool timeout of the build.
    async fn run_in(&mut self, ctx: &BuildContext) -> Result<Vec<u8>>;

    /// Runs the command and returns its exit code, whatever it is.
    async fn run_for_exit_code(&mut self, ctx: &BuildContext) -> Result<i32>;

    async fn run_with_status_checker<R>(
        &mut self,
        ctx: &BuildContext,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R>;

    async fn run_with_timeout<R>(
        &mut self,
        timeout: Option<Duration>,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R>;
}

fn require_success(code: i32, stdout: Vec<u8>, _stderr: Vec<u8>) -> Result<Vec<u8>> {
    if code != 0 {
        bail!("Command exited unsuccessfully")
    }
    Ok(stdout)
}

/// Renders captured output for error messages, indenting multi-line output.
fn describe_stream(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.contains('\n') {
        format!("(multi-line)\n\t{}", text.replace('\n', "\n\t"))
    } else {
        text.into_owned()
    }
}

async fn wait_bounded(command: &mut Command, timeout: Option<Duration>) -> Result<Output> {
    // A timed out child is killed when the wait future is dropped.
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let Some(timeout) = timeout else {
        return Ok(child.wait_with_output().await?);
    };
    tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("timed out after {timeout:?}"))?
        .map_err(anyhow::Error::from)
}

#[async_trait]
impl CheckCommandOutput for Command {
    async fn run(&mut self) -> Result<Vec<u8>> {
        self.run_with_timeout(None, require_success).await
    }

    async fn run_in(&mut self, ctx: &BuildContext) -> Result<Vec<u8>> {
        self.run_with_timeout(ctx.tool_timeout, require_success).await
    }

    async fn run_for_exit_code(&mut self, ctx: &BuildContext) -> Result<i32> {
        self.run_with_timeout(ctx.tool_timeout, |code, _, _| Ok(code))
            .await
    }

    async fn run_with_status_checker<R>(
        &mut self,
        ctx: &BuildContext,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        self.run_with_timeout(ctx.tool_timeout, f).await
    }

    async fn run_with_timeout<R>(
        &mut self,
        timeout: Option<Duration>,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        // Tools are parsed with C locale output
        self.env("LC_ALL", "C");
        tracing::trace!(cmd = ?self.as_std(), ?timeout, "Running external tool");

        let Output {
            status,
            stdout,
            stderr,
        } = wait_bounded(self, timeout)
            .await
            .with_context(|| format!("Failed to execute external command: {:?}", self.as_std()))?;

        let code = status.code();
        let checked = match code {
            Some(code) => f(code, stdout.clone(), stderr.clone()),
            None => Err(anyhow!("killed by signal")),
        };
        checked.with_context(|| {
            format!(
                "\ncmd: {:?}\nexit code: {}\nstdout: {}\nstderr: {}",
                self.as_std(),
                code.map_or_else(|| "unknown".to_string(), |code| code.to_string()),
                describe_stream(&stdout),
                describe_stream(&stderr),
            )
        })
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_run_captures_stdout() -> Result<()> {
        let stdout = Command::new("echo").arg("hello").run().await?;
        assert_eq!(String::from_utf8(stdout)?, "hello\n");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_bad_exit_code_is_error() -> Result<()> {
        let error = Command::new("false").run().await.unwrap_err();
        assert!(format!("{error:#}").contains("exit code: 1"));

        let code = Command::new("false")
            .run_for_exit_code(&BuildContext::default())
            .await?;
        assert_eq!(code, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_timeout_kills_command() -> Result<()> {
        let ctx = BuildContext {
            tool_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let error = Command::new("sleep").arg("10").run_in(&ctx).await.unwrap_err();
        assert!(format!("{error:#}").contains("timed out"));
        Ok(())
    }
}
