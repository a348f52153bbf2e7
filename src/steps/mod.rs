//! Named, idempotent configuration steps run on one node
//!
//! A [`Step`] is a bash script plus a timeout. [`StepExecutor`] runs steps
//! through the injected transport, strictly in order, and stops a node's
//! sequence at the first failure. Every script must be safe to re-run
//! against a node that is already partly or fully configured.

pub mod brex;
pub mod host_prep;
pub mod kubeadm;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::transport::RemoteExecutor;
use crate::{Error, Result};

/// One named unit of remote configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Short name used in logs and reports
    pub name: &'static str,
    /// Bash script fed to the node
    pub script: String,
    /// Upper bound on the script's run time
    pub timeout: Duration,
}

impl Step {
    /// Create a step
    pub fn new(name: &'static str, script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name,
            script: script.into(),
            timeout,
        }
    }
}

/// Where a step ran and what it printed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// Step name
    pub step: &'static str,
    /// Trimmed stdout
    pub output: String,
}

/// A node a step sequence targets
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// Node name, for logs and errors
    pub node: &'a str,
    /// Transport address
    pub address: &'a str,
}

/// Runs steps on nodes through a [`RemoteExecutor`]
#[derive(Clone)]
pub struct StepExecutor {
    transport: Arc<dyn RemoteExecutor>,
}

impl StepExecutor {
    /// Create an executor over the given transport
    pub fn new(transport: Arc<dyn RemoteExecutor>) -> Self {
        Self { transport }
    }

    /// Run one step, mapping non-zero exits and transport errors to [`Error::StepFailure`]
    pub async fn run(&self, target: Target<'_>, step: &Step) -> Result<StepRecord> {
        debug!(node = %target.node, step = step.name, "running step");
        let output = self
            .transport
            .execute(target.address, &step.script, step.timeout)
            .await
            .map_err(|e| Error::step_failure(target.node, step.name, e.to_string()))?;

        if !output.success() {
            return Err(Error::step_failure(
                target.node,
                step.name,
                output.diagnostic(),
            ));
        }

        Ok(StepRecord {
            step: step.name,
            output: output.stdout.trim().to_string(),
        })
    }

    /// Run `steps` in order, stopping at the first failure
    pub async fn run_all(&self, target: Target<'_>, steps: &[Step]) -> Result<Vec<StepRecord>> {
        let mut records = Vec::with_capacity(steps.len());
        for step in steps {
            records.push(self.run(target, step).await?);
            info!(node = %target.node, step = step.name, "step complete");
        }
        Ok(records)
    }
}
