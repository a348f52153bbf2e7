//! Remote command execution on provisioned nodes
//!
//! Every remote action goes through [`RemoteExecutor::execute`]. The contract
//! is deliberately small: a command string in, exit status and captured
//! streams out. A non-zero exit is a normal [`CommandOutput`]; `Err` is
//! reserved for transport failures (connection refused, timeout).

mod docker;
mod ssh;

pub use docker::DockerExecTransport;
pub use ssh::SshTransport;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub use crate::host::CommandOutput;
use crate::Result;

/// Run a shell command on a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute `command` with `bash` on the node at `address`
    async fn execute(&self, address: &str, command: &str, timeout: Duration)
        -> Result<CommandOutput>;
}

/// Timeout for one reachability check
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Whether the node at `address` answers a no-op command
pub async fn is_reachable(executor: &dyn RemoteExecutor, address: &str) -> Result<bool> {
    executor
        .execute(address, "true", REACHABILITY_TIMEOUT)
        .await
        .map(|out| out.success())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for orchestrator and CNI tests

    use std::sync::Mutex;

    use super::*;
    use crate::Error;

    /// How a rule answers a matching command
    #[derive(Debug, Clone)]
    pub enum Reply {
        /// Exit zero with this stdout
        Ok(String),
        /// Exit non-zero with this stderr
        Fail(String),
        /// Transport-level failure
        Unreachable,
        /// Answer from the list in order, repeating the last entry
        Sequence(Vec<Reply>),
    }

    struct Rule {
        address: Option<String>,
        needle: String,
        reply: Reply,
        served: usize,
    }

    /// A command observed by [`FakeTransport`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Call {
        /// Node address
        pub address: String,
        /// Full command text
        pub command: String,
    }

    /// Substring-matched scripted transport that records every call
    ///
    /// Rules are checked newest first; unmatched commands succeed with empty
    /// output.
    #[derive(Default)]
    pub struct FakeTransport {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer commands containing `needle` on any node
        pub fn on(&self, needle: &str, reply: Reply) -> &Self {
            self.push(None, needle, reply)
        }

        /// Answer commands containing `needle` on one node
        pub fn on_node(&self, address: &str, needle: &str, reply: Reply) -> &Self {
            self.push(Some(address.to_string()), needle, reply)
        }

        fn push(&self, address: Option<String>, needle: &str, reply: Reply) -> &Self {
            self.rules.lock().unwrap().push(Rule {
                address,
                needle: needle.to_string(),
                reply,
                served: 0,
            });
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        /// Commands run on `address` that contain `needle`
        pub fn count(&self, address: &str, needle: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.address == address && c.command.contains(needle))
                .count()
        }

        /// Commands on any node that contain `needle`
        pub fn count_any(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.command.contains(needle))
                .count()
        }
    }

    fn answer(reply: &Reply, served: usize) -> Result<CommandOutput> {
        match reply {
            Reply::Ok(out) => Ok(CommandOutput::ok(out.clone())),
            Reply::Fail(err) => Ok(CommandOutput::failed(1, err.clone())),
            Reply::Unreachable => Err(Error::command_failed("ssh", "connection refused")),
            Reply::Sequence(items) => match items.get(served).or(items.last()) {
                Some(r) => answer(r, 0),
                None => Ok(CommandOutput::ok("")),
            },
        }
    }

    #[async_trait]
    impl RemoteExecutor for FakeTransport {
        async fn execute(
            &self,
            address: &str,
            command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(Call {
                address: address.to_string(),
                command: command.to_string(),
            });
            let mut rules = self.rules.lock().unwrap();
            let rule = rules.iter_mut().rev().find(|r| {
                command.contains(&r.needle) && r.address.as_deref().map_or(true, |a| a == address)
            });
            match rule {
                Some(rule) => {
                    let served = rule.served;
                    rule.served += 1;
                    answer(&rule.reply, served)
                }
                None => Ok(CommandOutput::ok("")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeTransport, Reply};
    use super::*;

    #[tokio::test]
    async fn reachability_follows_transport() {
        let fake = FakeTransport::new();
        fake.on_node("10.0.0.2", "true", Reply::Unreachable);
        fake.on_node("10.0.0.3", "true", Reply::Fail("nope".into()));

        assert!(is_reachable(&fake, "10.0.0.1").await.unwrap());
        assert!(is_reachable(&fake, "10.0.0.2").await.is_err());
        assert!(!is_reachable(&fake, "10.0.0.3").await.unwrap());
    }

    #[tokio::test]
    async fn sequence_replies_repeat_last() {
        let fake = FakeTransport::new();
        fake.on(
            "get pods",
            Reply::Sequence(vec![Reply::Ok("a".into()), Reply::Ok("b".into())]),
        );
        let t = Duration::from_secs(1);
        assert_eq!(fake.execute("n", "get pods", t).await.unwrap().stdout, "a");
        assert_eq!(fake.execute("n", "get pods", t).await.unwrap().stdout, "b");
        assert_eq!(fake.execute("n", "get pods", t).await.unwrap().stdout, "b");
        assert_eq!(fake.count("n", "get pods"), 3);
    }
}
