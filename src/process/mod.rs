//! External command execution.
//!
//! All subprocess invocations in the pipeline go through [`ProcessRunner`]:
//! unprivileged runs spawn the tool directly, privileged runs shell one
//! escaped command line through the macOS administrator prompt
//! (`osascript`). Either way the in-flight child is registered with the
//! operation context so cancellation can terminate it.

pub mod escape;

use crate::{FlashError, FlashResult, OperationContext};
use log::debug;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of one subprocess invocation.
///
/// Used for control-flow decisions and log emission only, never persisted.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// First non-empty line of stderr, for one-line error messages.
    pub fn stderr_brief(&self) -> String {
        self.stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("(no error output)")
            .trim()
            .to_string()
    }
}

pub struct ProcessRunner {
    ctx: OperationContext,
}

impl ProcessRunner {
    pub fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }

    /// Run a command directly, optionally feeding `input` on stdin.
    ///
    /// Stdout and stderr are drained concurrently with the wait so output
    /// larger than the pipe buffer cannot deadlock the child. A non-zero
    /// exit is not an error at this layer; callers inspect the result.
    pub async fn run(
        &self,
        command: &str,
        args: &[&str],
        input: Option<&str>,
    ) -> FlashResult<CommandResult> {
        debug!("exec: {} {}", command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(pid) = child.id() {
            self.ctx.register_child(pid as i32);
        }

        // Stream the input, then close stdin to signal end-of-input.
        if let Some(data) = input {
            if let Some(mut stdin) = child.stdin.take() {
                let write_result = stdin.write_all(data.as_bytes()).await;
                drop(stdin);
                if let Err(e) = write_result {
                    self.ctx.clear_child();
                    return Err(e.into());
                }
            }
        }

        // wait_with_output reads both pipes while waiting, and closes every
        // descriptor when the child is reaped.
        let output = child.wait_with_output().await;
        self.ctx.clear_child();
        let output = output?;

        if self.ctx.is_cancelled() {
            return Err(FlashError::Cancelled);
        }

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    /// Run a command with administrator privileges.
    ///
    /// The command, its arguments and any piped input are assembled into a
    /// single escaped `sh` line and executed through
    /// `osascript -e 'do shell script ... with administrator privileges'`.
    /// The call blocks until the user resolves the consent dialog; there is
    /// no timeout on that wait. A refusal maps to
    /// [`FlashError::PermissionDenied`].
    pub async fn run_privileged(
        &self,
        command: &str,
        args: &[&str],
        input: Option<&str>,
    ) -> FlashResult<CommandResult> {
        let line = escape::shell_line(command, args, input);
        let script = format!(
            "do shell script \"{}\" with administrator privileges",
            escape::applescript_string(&line)
        );
        debug!("exec (privileged): {}", line);

        let result = self.run("osascript", &["-e", &script], None).await?;

        // osascript reports a dismissed consent dialog as error -128.
        if !result.success()
            && (result.stderr.contains("User canceled")
                || result.stderr.contains("(-128)"))
        {
            return Err(FlashError::PermissionDenied(
                "administrator authorization was refused".to_string(),
            ));
        }

        Ok(result)
    }
}
