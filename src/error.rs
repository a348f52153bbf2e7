//! Error types for cluster bring-up
//!
//! Errors are structured with fields naming the cluster, node and stage
//! involved so the summary report can say exactly where a run went wrong.

use std::time::Duration;

use thiserror::Error;

/// Main error type for dpusim operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend could not create or resolve networks or node instances
    #[error("substrate error for {cluster}: {message}")]
    Substrate {
        /// Cluster whose substrate failed (or "shared" for run-wide resources)
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A node never became reachable through its transport
    #[error("node {node} not reachable after {attempts} attempts: {message}")]
    ReachabilityTimeout {
        /// Node that never answered
        node: String,
        /// How many attempts were made
        attempts: u32,
        /// Last observed condition
        message: String,
    },

    /// A remote step returned non-zero or could not be executed
    #[error("step {step} failed on {node}: {message}")]
    StepFailure {
        /// Node the step ran on
        node: String,
        /// Step name
        step: String,
        /// Captured stderr or transport error
        message: String,
    },

    /// Network plugin pods did not all report ready in time
    #[error("{plugin} rollout not complete after {waited:?}: {message}")]
    PluginRolloutTimeout {
        /// Plugin name
        plugin: String,
        /// Time spent waiting
        waited: Duration,
        /// Last observed condition
        message: String,
    },

    /// A worker could not join the cluster
    #[error("node {node} failed to join: {message}")]
    JoinFailure {
        /// Joining node
        node: String,
        /// Description of what failed
        message: String,
    },

    /// A VM power or access operation was refused
    #[error("vm {vm}: {message}")]
    Vm {
        /// Domain name
        vm: String,
        /// Why the operation was refused
        message: String,
    },

    /// Topology or settings could not be parsed
    #[error("config error: {0}")]
    Config(String),

    /// Topology parsed but violates one or more rules
    #[error("validation error: {0}")]
    Validation(String),

    /// A required host tool is missing
    #[error("prerequisite not found: {tool} - {hint}")]
    PrerequisiteNotFound {
        /// The missing tool
        tool: String,
        /// How to install it
        hint: String,
    },

    /// A host-side command failed
    #[error("command failed: {command} - {message}")]
    CommandFailed {
        /// The command line that failed
        command: String,
        /// Captured stderr or spawn error
        message: String,
    },

    /// A Kubernetes object was missing, malformed or rejected
    #[error("resource error: {0}")]
    Resource(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Manifest download failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a substrate error for a cluster
    pub fn substrate(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Substrate {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Create a step failure for a node
    pub fn step_failure(
        node: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StepFailure {
            node: node.into(),
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create a join failure for a node
    pub fn join_failure(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JoinFailure {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a VM lifecycle error
    pub fn vm(vm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vm {
            vm: vm.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a command failure for a host-side tool invocation
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }
}
