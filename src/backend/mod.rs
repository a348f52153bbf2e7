//! Provisioning backends
//!
//! A backend owns the substrate a cluster runs on: networks, bridges and
//! node instances. The orchestrator only ever sees [`ProvisioningBackend`],
//! so stage logic is identical for VMs and kind containers; the two
//! implementations are selected once, from the topology's deployment mode.

mod kind;
mod libvirt;

pub use kind::KindBackend;
pub use libvirt::LibvirtBackend;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::host::CommandRunner;
use crate::topology::{ClusterSpec, DeploymentMode, Topology};
use crate::transport::{DockerExecTransport, RemoteExecutor, SshTransport};
use crate::Result;

/// Kubernetes role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs the control plane
    ControlPlane,
    /// Runs workloads only
    Worker,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::ControlPlane => f.write_str("control-plane"),
            NodeKind::Worker => f.write_str("worker"),
        }
    }
}

/// A node instance created by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    /// Node name, also its Kubernetes node name
    pub name: String,
    /// Cluster the node belongs to
    pub cluster: String,
    /// Role in that cluster
    pub kind: NodeKind,
}

/// Resolved addresses of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddresses {
    /// Where the transport reaches the node
    pub management: String,
    /// Address used inside the cluster, e.g. the API advertise address
    pub cluster: String,
}

/// Creates, resolves and destroys the substrate for clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Host tools this backend shells out to, with install hints
    fn required_tools(&self) -> Vec<(&'static str, &'static str)>;

    /// Transport that reaches this backend's nodes
    fn transport(&self) -> Arc<dyn RemoteExecutor>;

    /// Whether node creation already installs and joins Kubernetes
    fn bootstraps_kubernetes(&self) -> bool;

    /// Whether privileged commands on nodes need `sudo`
    fn uses_sudo(&self) -> bool;

    /// Create networks and node instances for `cluster`
    ///
    /// Resources that already exist are left in place.
    async fn create_substrate(&self, cluster: &ClusterSpec) -> Result<()>;

    /// Nodes of `cluster`, control-plane nodes first in declaration order
    async fn nodes(&self, cluster: &ClusterSpec) -> Result<Vec<NodeHandle>>;

    /// Addresses of `node`, or `None` while it is still booting
    async fn node_addresses(&self, node: &NodeHandle) -> Result<Option<NodeAddresses>>;

    /// Admin kubeconfig usable from this host, when the backend can produce one
    async fn export_kubeconfig(&self, cluster: &ClusterSpec) -> Result<Option<String>>;

    /// Remove everything the backend created for the topology
    ///
    /// Safe on partially-created or already-destroyed state.
    async fn destroy_substrate(&self) -> Result<()>;
}

/// Select the backend for the topology's deployment mode
pub fn for_topology(
    topology: Arc<Topology>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn ProvisioningBackend>> {
    Ok(match topology.mode()? {
        DeploymentMode::Vm => {
            let transport = Arc::new(SshTransport::new(
                runner.clone(),
                topology.ssh.user.clone(),
                topology.ssh.resolved_key_path(),
            ));
            Arc::new(LibvirtBackend::new(topology, runner, transport))
        }
        DeploymentMode::Kind => {
            let transport = Arc::new(DockerExecTransport::new(runner.clone()));
            Arc::new(KindBackend::new(topology, runner, transport))
        }
    })
}

/// Collapse per-resource teardown failures into one error
pub(crate) fn collect_errors(scope: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::substrate(scope, errors.join("; ")))
    }
}
