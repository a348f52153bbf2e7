//! End-of-run summary
//!
//! Each cluster produces one [`ClusterReport`]. The summary table is the
//! only thing a run prints to stdout; everything else goes through tracing.

use crate::orchestrator::{ClusterState, NodeReport, NodeStatus, StageResult};

/// Overall verdict for one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Verified with every node healthy and no warnings
    Succeeded,
    /// Verified, but at least one node dropped out or a soft wait expired
    Degraded,
    /// Never reached the verified state
    Failed,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClusterStatus::Succeeded => "succeeded",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Failed => "failed",
        })
    }
}

/// Everything recorded while bringing up one cluster
#[derive(Debug, Clone)]
pub struct ClusterReport {
    /// Cluster name
    pub cluster: String,
    /// Final state
    pub state: ClusterState,
    /// Every node the backend reported, in bring-up order
    pub nodes: Vec<NodeReport>,
    /// Stage log, in the order entries were recorded
    pub stages: Vec<StageResult>,
    /// Soft-wait warnings
    pub warnings: Vec<String>,
}

impl ClusterReport {
    /// Verdict derived from state, node exclusions and warnings
    pub fn status(&self) -> ClusterStatus {
        if !self.state.is_verified() {
            ClusterStatus::Failed
        } else if self.nodes.iter().any(NodeReport::is_excluded) || !self.warnings.is_empty() {
            ClusterStatus::Degraded
        } else {
            ClusterStatus::Succeeded
        }
    }

    /// Whether any node of this cluster dropped out
    pub fn has_failed_nodes(&self) -> bool {
        self.nodes.iter().any(NodeReport::is_excluded)
    }

    /// Node by name
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Process exit status for a set of reports
///
/// Non-zero when any cluster failed or any node was excluded.
pub fn exit_code(reports: &[ClusterReport]) -> i32 {
    let failed = reports
        .iter()
        .any(|r| r.status() == ClusterStatus::Failed || r.has_failed_nodes());
    i32::from(failed)
}

/// Render the per-cluster, per-node summary table
pub fn render_summary(reports: &[ClusterReport]) -> String {
    let mut out = format!("{:<20} {:<10} {}\n", "CLUSTER", "STATUS", "STATE");
    for report in reports {
        out.push_str(&format!(
            "{:<20} {:<10} {}\n",
            report.cluster,
            report.status(),
            report.state
        ));
        for node in &report.nodes {
            let detail = match &node.status {
                NodeStatus::Healthy => "ok".to_string(),
                NodeStatus::Excluded { stage, reason } => format!("failed at {}: {}", stage, reason),
            };
            out.push_str(&format!("  {:<18} {:<14} {}\n", node.name, node.kind, detail));
        }
        for warning in &report.warnings {
            out.push_str(&format!("  warning: {}\n", warning));
        }
    }
    out
}
