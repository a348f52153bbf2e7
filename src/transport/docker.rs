use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CommandOutput, RemoteExecutor};
use crate::host::CommandRunner;
use crate::{Error, Result};

/// Runs commands inside kind node containers with `docker exec`
///
/// The node address is the container name.
pub struct DockerExecTransport {
    runner: Arc<dyn CommandRunner>,
}

impl DockerExecTransport {
    /// Create a transport over the given host runner
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RemoteExecutor for DockerExecTransport {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!(container = %address, "docker exec");
        let args = vec![
            "exec".to_string(),
            "-i".to_string(),
            address.to_string(),
            "bash".to_string(),
            "-s".to_string(),
        ];
        let run = self.runner.run("docker", args, Some(command.to_string()));

        let output = tokio::time::timeout(timeout, run).await.map_err(|_| {
            Error::command_failed(
                format!("docker exec {}", address),
                format!("timed out after {:?}", timeout),
            )
        })??;

        if output.stderr.contains("No such container") || output.stderr.contains("is not running") {
            return Err(Error::command_failed(
                format!("docker exec {}", address),
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

    #[tokio::test]
    async fn execs_bash_in_named_container() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args, stdin| {
                program == "docker"
                    && args[..3] == ["exec".to_string(), "-i".to_string(), "ovn-worker".to_string()]
                    && stdin.as_deref() == Some("kubectl get nodes")
            })
            .returning(|_, _, _| Ok(CommandOutput::ok("ok")));

        let out = DockerExecTransport::new(Arc::new(runner))
            .execute("ovn-worker", "kubectl get nodes", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "ok");
    }

    #[tokio::test]
    async fn missing_container_is_transport_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(CommandOutput::failed(1, "Error response from daemon: No such container: gone"))
        });
        assert!(DockerExecTransport::new(Arc::new(runner))
            .execute("gone", "true", Duration::from_secs(5))
            .await
            .is_err());
    }
}
