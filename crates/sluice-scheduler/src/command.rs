use async_trait::async_trait;
use tokio::process::Command;

/// Captured result of one scheduler command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  /// Exit code; `None` if killed by a signal.
  pub status: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.status == Some(0)
  }
}

/// Runs the scheduler's command-line tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
  async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
  async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
    let output = Command::new(program).args(args).output().await?;
    Ok(CommandOutput {
      status: output.status.code(),
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
  }
}
