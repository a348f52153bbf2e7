use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CommandOutput, RemoteExecutor};
use crate::host::CommandRunner;
use crate::{Error, Result};

/// Runs commands on VMs through the system `ssh` client
///
/// The command is fed to `bash -s` on stdin so quoting never has to survive
/// two shells.
pub struct SshTransport {
    runner: Arc<dyn CommandRunner>,
    user: String,
    key_path: PathBuf,
}

impl SshTransport {
    /// Create a transport logging in as `user` with the private key at `key_path`
    pub fn new(runner: Arc<dyn CommandRunner>, user: impl Into<String>, key_path: PathBuf) -> Self {
        Self {
            runner,
            user: user.into(),
            key_path,
        }
    }

    fn options(&self, address: &str, batch: bool) -> Vec<String> {
        let mut args = vec!["-i".to_string(), self.key_path.display().to_string()];
        let mut opts = vec![
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
            "ConnectTimeout=5",
        ];
        if batch {
            opts.push("BatchMode=yes");
        }
        for opt in opts {
            args.push("-o".to_string());
            args.push(opt.to_string());
        }
        args.push(format!("{}@{}", self.user, address));
        args
    }

    /// `ssh` arguments for an interactive login on `address`
    pub fn login_args(&self, address: &str) -> Vec<String> {
        self.options(address, false)
    }

    fn ssh_args(&self, address: &str) -> Vec<String> {
        let mut args = self.options(address, true);
        args.extend(["bash".to_string(), "-s".to_string()]);
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshTransport {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!(address = %address, timeout = ?timeout, "ssh exec");
        let run = self
            .runner
            .run("ssh", self.ssh_args(address), Some(command.to_string()));

        let output = tokio::time::timeout(timeout, run).await.map_err(|_| {
            Error::command_failed(
                format!("ssh {}@{}", self.user, address),
                format!("timed out after {:?}", timeout),
            )
        })??;

        // ssh reserves 255 for its own failures
        if output.exit_code == 255 {
            return Err(Error::command_failed(
                format!("ssh {}@{}", self.user, address),
                output.diagnostic(),
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockCommandRunner;

    fn transport(runner: MockCommandRunner) -> SshTransport {
        SshTransport::new(Arc::new(runner), "root", PathBuf::from("/keys/id_rsa"))
    }

    #[tokio::test]
    async fn command_goes_to_stdin_of_bash() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args, stdin| {
                program == "ssh"
                    && args.first().map(String::as_str) == Some("-i")
                    && args.contains(&"root@192.168.120.11".to_string())
                    && args.ends_with(&["bash".to_string(), "-s".to_string()])
                    && stdin.as_deref() == Some("hostnamectl set-hostname master-1")
            })
            .returning(|_, _, _| Ok(CommandOutput::ok("")));

        let out = transport(runner)
            .execute(
                "192.168.120.11",
                "hostnamectl set-hostname master-1",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn remote_non_zero_is_output_not_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(CommandOutput::failed(3, "unit not found")));
        let out = transport(runner)
            .execute("10.0.0.1", "systemctl is-active crio", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn connection_failure_is_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(CommandOutput::failed(
                255,
                "ssh: connect to host 10.0.0.1 port 22: Connection refused",
            ))
        });
        let err = transport(runner)
            .execute("10.0.0.1", "true", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
    }

    #[test]
    fn login_is_interactive() {
        let args = transport(MockCommandRunner::new()).login_args("10.0.0.1");
        assert_eq!(args.last().map(String::as_str), Some("root@10.0.0.1"));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert!(!args.contains(&"bash".to_string()));
    }
}
