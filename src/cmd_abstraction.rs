//! Process execution seam.
//!
//! Every external tool geoallow drives (`iptables`, `ipset`, `ip`, `crontab`)
//! goes through [`CommandExecutor`], so the firewall adapter and the probes
//! can be unit-tested against scripted output.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

use crate::error::FirewallError;

/// Captured result of one process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero.
    pub success: bool,
    /// Exit code, absent when killed by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }
}

/// Runs external programs.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetime.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run with `stdin` piped into the child. Used for bulk `restore` loads.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Executor that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes())
                .with_context(|| format!("Failed to write stdin of {}", cmd))?;
            // pipe dropped here so the child sees EOF
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
pub(crate) fn args_eq(args: &[String], expected: &[&str]) -> bool {
    args.len() == expected.len() && args.iter().zip(expected.iter()).all(|(a, e)| a == *e)
}

#[cfg(test)]
pub(crate) fn args_has(args: &[String], val: &str) -> bool {
    args.iter().any(|a| a == val)
}

/// Run a command and turn spawn failures and non-zero exits into
/// [`FirewallError`]s.
pub fn run_checked<E: CommandExecutor + ?Sized>(
    executor: &E,
    cmd: &str,
    args: &[String],
    stdin: Option<&str>,
) -> std::result::Result<CommandOutput, FirewallError> {
    let result = match stdin {
        Some(data) => executor.execute_with_stdin(cmd, args, data),
        None => executor.execute(cmd, args),
    };
    let output = result.map_err(|e| FirewallError::Spawn {
        program: cmd.to_string(),
        reason: format!("{:#}", e),
    })?;

    if !output.success {
        return Err(FirewallError::Command {
            command: describe(cmd, args),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Short human-readable form of a command line for error messages.
fn describe(cmd: &str, args: &[String]) -> String {
    let mut parts = vec![cmd.to_string()];
    parts.extend(args.iter().take(4).cloned());
    if args.len() > 4 {
        parts.push("...".to_string());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_strings() {
        assert_eq!(
            args_to_strings(&["-w", "-S", "INPUT"]),
            vec!["-w", "-S", "INPUT"]
        );
        assert!(args_to_strings(&[]).is_empty());
    }

    #[test]
    fn test_run_checked_success() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd.ends_with("ipset") && args_eq(args, &["list", "-n"]))
            .returning(|_, _| Ok(CommandOutput::ok("geoallow_US\n")));

        let out = run_checked(&mock, "ipset", &args_to_strings(&["list", "-n"]), None).unwrap();
        assert_eq!(out.stdout, "geoallow_US\n");
    }

    #[test]
    fn test_run_checked_nonzero_exit() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .returning(|_, _| Ok(CommandOutput::failed(1, "set does not exist\n")));

        let err = run_checked(&mock, "ipset", &args_to_strings(&["destroy", "x"]), None)
            .unwrap_err();
        assert_eq!(
            err,
            FirewallError::Command {
                command: "ipset destroy x".into(),
                code: Some(1),
                stderr: "set does not exist".into(),
            }
        );
    }

    #[test]
    fn test_run_checked_spawn_failure() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute_with_stdin()
            .returning(|_, _, _| Err(anyhow::anyhow!("No such file or directory")));

        let err = run_checked(&mock, "ipset", &args_to_strings(&["restore"]), Some("add x"))
            .unwrap_err();
        assert!(matches!(err, FirewallError::Spawn { ref program, .. } if program == "ipset"));
    }

    #[test]
    fn test_describe_truncates() {
        let args = args_to_strings(&["-w", "-A", "INPUT", "-m", "set", "--match-set"]);
        assert_eq!(describe("iptables", &args), "iptables -w -A INPUT -m ...");
    }

    #[test]
    fn test_system_executor_runs_true() {
        let out = SystemExecutor.execute("true", &[]);
        if let Ok(out) = out {
            assert!(out.success);
        }
    }
}
