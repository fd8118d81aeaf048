use crate::domain::ports::{CommandRunner, Invocation, OperatorPrompt};
use crate::utils::error::{Result, StallbookError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Runs invocations as real child processes with inherited stdio.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Option<i32>> {
        tracing::debug!("▶️ {}", invocation.display());

        let status = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StallbookError::ToolNotFound {
                    program: invocation.program.clone(),
                },
                _ => StallbookError::IoError(e),
            })?;

        Ok(status.code())
    }
}

/// Waits for the operator to press Enter on stdin.
#[derive(Debug, Clone, Default)]
pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, message: &str) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{}\nPress Enter to continue...", message).as_bytes())
            .await?;
        stdout.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Err(StallbookError::PreconditionFailed {
                check: "operator-confirmation".to_string(),
                reason: "stdin closed before confirmation".to_string(),
            });
        }
        Ok(())
    }
}

/// Never blocks; used when a plan asks for confirmation but no terminal is attached.
#[derive(Debug, Clone, Default)]
pub struct AutoConfirm;

#[async_trait]
impl OperatorPrompt for AutoConfirm {
    async fn confirm(&self, message: &str) -> Result<()> {
        tracing::info!("⏩ Skipping operator confirmation: {}", message);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn invocation(program: &str, args: &[&str]) -> Invocation {
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_exit_codes_are_reported() {
        let runner = SystemRunner;
        assert_eq!(runner.run(&invocation("true", &[])).await.unwrap(), Some(0));
        assert_eq!(
            runner.run(&invocation("sh", &["-c", "exit 7"])).await.unwrap(),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_not_found() {
        let runner = SystemRunner;
        let err = runner
            .run(&invocation("stallbook-definitely-not-installed", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StallbookError::ToolNotFound { .. }));
    }
}
