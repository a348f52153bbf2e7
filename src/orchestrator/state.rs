//! Bring-up stages, cluster state and recorded stage results

use std::fmt;

use crate::backend::NodeKind;

/// Stages a cluster passes through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Networks and node instances exist
    SubstrateReady,
    /// Nodes have addresses and answer on their transport
    NodesReachable,
    /// Host preparation finished on every reachable node
    HostsPrepared,
    /// The bootstrap control-plane is initialized
    ControlPlaneInitialized,
    /// The network plugin is installed
    CniInstalled,
    /// Workers have joined
    WorkersJoined,
    /// Node list read back from the cluster
    ClusterVerified,
}

impl Stage {
    /// Every stage in order
    pub const ALL: [Stage; 7] = [
        Stage::SubstrateReady,
        Stage::NodesReachable,
        Stage::HostsPrepared,
        Stage::ControlPlaneInitialized,
        Stage::CniInstalled,
        Stage::WorkersJoined,
        Stage::ClusterVerified,
    ];

    /// Stage following this one
    pub fn next(self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::SubstrateReady => "SUBSTRATE_READY",
            Stage::NodesReachable => "NODES_REACHABLE",
            Stage::HostsPrepared => "HOSTS_PREPARED",
            Stage::ControlPlaneInitialized => "CONTROL_PLANE_INITIALIZED",
            Stage::CniInstalled => "CNI_INSTALLED",
            Stage::WorkersJoined => "WORKERS_JOINED",
            Stage::ClusterVerified => "CLUSTER_VERIFIED",
        })
    }
}

/// Where a cluster is in its bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    /// Nothing done yet
    Pending,
    /// The given stage completed
    Reached(Stage),
    /// The given stage could not complete; no later stage ran
    Failed {
        /// Stage that was being attempted
        stage: Stage,
        /// Why it failed
        reason: String,
    },
}

impl ClusterState {
    /// Stage a cluster in this state may attempt next
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            ClusterState::Pending => Some(Stage::SubstrateReady),
            ClusterState::Reached(stage) => stage.next(),
            ClusterState::Failed { .. } => None,
        }
    }

    /// Whether the cluster reached the final stage
    pub fn is_verified(&self) -> bool {
        *self == ClusterState::Reached(Stage::ClusterVerified)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Pending => f.write_str("PENDING"),
            ClusterState::Reached(stage) => write!(f, "{}", stage),
            ClusterState::Failed { stage, reason } => write!(f, "FAILED({}, {})", stage, reason),
        }
    }
}

/// Outcome of one recorded stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed
    Success,
    /// Did not complete
    Failure,
    /// Not applicable on this backend or node
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
        })
    }
}

/// What a stage result is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// The whole cluster
    Cluster(String),
    /// One node
    Node(String),
}

/// One immutable entry in a cluster's stage log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    /// Stage the entry belongs to
    pub stage: Stage,
    /// Cluster or node
    pub scope: Scope,
    /// Outcome
    pub outcome: Outcome,
    /// Diagnostic text, empty on plain success
    pub diagnostic: String,
}

/// Final status of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Took part in every stage
    Healthy,
    /// Dropped out at `stage`
    Excluded {
        /// Stage the node failed
        stage: Stage,
        /// Why
        reason: String,
    },
}

/// A node and how its bring-up went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    /// Node name
    pub name: String,
    /// Role
    pub kind: NodeKind,
    /// Final status
    pub status: NodeStatus,
}

impl NodeReport {
    /// Whether the node dropped out of the bring-up
    pub fn is_excluded(&self) -> bool {
        matches!(self.status, NodeStatus::Excluded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_strictly_in_order() {
        let mut state = ClusterState::Pending;
        let mut seen = Vec::new();
        while let Some(stage) = state.next_stage() {
            seen.push(stage);
            state = ClusterState::Reached(stage);
        }
        assert_eq!(seen, Stage::ALL);
        assert!(state.is_verified());
    }

    #[test]
    fn failed_is_terminal() {
        let state = ClusterState::Failed {
            stage: Stage::HostsPrepared,
            reason: "step container-runtime failed on master-1".into(),
        };
        assert_eq!(state.next_stage(), None);
        assert!(state.to_string().starts_with("FAILED(HOSTS_PREPARED"));
    }
}
