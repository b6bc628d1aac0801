//! Wrapper over `Command` for the external tools the driver shells out to,
//! with error mapping and a hard per-call timeout.

use snafu::{ResultExt, Snafu};
use std::{ffi::OsStr, process::Stdio, time::Duration};
use tokio::process::Command;

/// Default deadline applied to every external command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Errors which can be encountered whilst running an external command.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShellError {
    #[snafu(display("Failed to spawn/wait for {command}: {source}"))]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to run command: '{command}'; exit={code}; out={output}"))]
    Failed {
        command: String,
        code: i32,
        output: String,
    },
    #[snafu(display("Reached timeout of {}s on command: '{command}'", timeout.as_secs()))]
    Timeout { command: String, timeout: Duration },
}

impl ShellError {
    /// The kernel reports a busy block device as exit status 16 from both
    /// `rbd unmap` and `rbd-nbd unmap`.
    pub fn is_busy(&self) -> bool {
        matches!(self, ShellError::Failed { code: 16, .. })
    }

    /// True when the command was killed for exceeding its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShellError::Timeout { .. })
    }
}

/// Shell command builder in the style of `Command`, which runs the child
/// with a deadline and returns its combined output.
pub(crate) struct Sh {
    display: String,
    cmder: Command,
    timeout: Duration,
}

impl Sh {
    /// Prepare a command; arguments are added with `arg`/`args`.
    pub(crate) fn new(program: &str) -> Self {
        let mut cmder = Command::new(program);
        cmder
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Self {
            display: program.to_string(),
            cmder,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// See help for `Command::arg`.
    pub(crate) fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.display.push(' ');
        self.display.push_str(&arg.as_ref().to_string_lossy());
        self.cmder.arg(arg);
        self
    }

    /// See help for `Command::args`.
    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Override the default deadline.
    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the command and return its combined stdout+stderr, trimmed.
    ///
    /// # Errors
    ///
    /// `ShellError::Spawn` => Failed to execute or await for completion.
    /// `ShellError::Failed` => Completed with a nonzero exit code.
    /// `ShellError::Timeout` => Killed after exceeding the deadline.
    pub(crate) async fn output(mut self) -> Result<String, ShellError> {
        tracing::trace!("shell command: {}", self.display);

        let child = self.cmder.spawn().context(SpawnSnafu {
            command: self.display.clone(),
        })?;

        // kill_on_drop reaps the child when the timeout drops the wait future
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(waited) => waited.context(SpawnSnafu {
                command: self.display.clone(),
            })?,
            Err(_) => {
                tracing::warn!(
                    "stopping command '{}' because it exceeded its {}s deadline",
                    self.display,
                    self.timeout.as_secs()
                );
                return TimeoutSnafu {
                    command: self.display,
                    timeout: self.timeout,
                }
                .fail();
            }
        };

        let combined = combine_output(&output.stdout, &output.stderr);
        let code = output.status.code().unwrap_or(-1);
        tracing::trace!("shell output ({code}): {combined}");

        if !output.status.success() {
            return FailedSnafu {
                command: self.display,
                code,
                output: combined,
            }
            .fail();
        }
        Ok(combined)
    }
}

/// Stdout first, then stderr, separated by a newline when both are present.
fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = Sh::new("echo").arg("hello").output().await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn combines_stdout_and_stderr() {
        let out = Sh::new("sh")
            .args(["-c", "echo out; echo err 1>&2"])
            .output()
            .await
            .unwrap();
        assert_eq!(out, "out\nerr");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_output() {
        let error = Sh::new("sh")
            .args(["-c", "echo broken; exit 3"])
            .output()
            .await
            .unwrap_err();
        match &error {
            ShellError::Failed { code, output, .. } => {
                assert_eq!(*code, 3);
                assert_eq!(output, "broken");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(!error.is_busy());
        assert!(ShellError::Failed {
            command: "x".into(),
            code: 16,
            output: String::new(),
        }
        .is_busy());
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let error = Sh::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(100))
            .output()
            .await
            .unwrap_err();
        assert!(error.is_timeout(), "expected Timeout, got {error:?}");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let error = Sh::new("cepher-no-such-binary").output().await.unwrap_err();
        assert!(matches!(error, ShellError::Spawn { .. }));
    }
}
