//! Run-wide tunables: worker-pool size, poll budgets and step timeouts

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::CniKind;
use crate::container::EnginePreference;
use crate::poll::{secs, PollConfig};

/// Orchestrator tunables, read from the `orchestrator` topology section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Nodes processed concurrently within one cluster
    pub parallelism: usize,
    /// Waiting for a node to obtain its management address
    pub address_poll: PollConfig,
    /// Waiting for the transport to answer
    pub reachability_poll: PollConfig,
    /// Waiting for a joined node to report Ready
    pub node_ready_poll: PollConfig,
    /// Waiting for simple-overlay plugin pods
    pub overlay_rollout_poll: PollConfig,
    /// Waiting for advanced-SDN plugin pods
    pub sdn_rollout_poll: PollConfig,
    /// Waiting for a worker's SDN node daemon pod to appear or become ready
    pub sdn_node_pod_poll: PollConfig,
    /// Wait/approve/wait cycles before a worker is declared degraded
    pub sdn_join_cycles: u32,
    /// Default timeout for one host-preparation step
    #[serde(deserialize_with = "secs::deserialize")]
    pub step_timeout: Duration,
    /// Timeout for control-plane initialization
    #[serde(deserialize_with = "secs::deserialize")]
    pub init_timeout: Duration,
    /// Timeout for one join
    #[serde(deserialize_with = "secs::deserialize")]
    pub join_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            parallelism: 1,
            address_poll: PollConfig::new(Duration::from_secs(2), 150),
            reachability_poll: PollConfig::new(Duration::from_secs(2), 150),
            node_ready_poll: PollConfig::new(Duration::from_secs(5), 60),
            overlay_rollout_poll: PollConfig::new(Duration::from_secs(5), 36),
            sdn_rollout_poll: PollConfig::new(Duration::from_secs(5), 60),
            sdn_node_pod_poll: PollConfig::new(Duration::from_secs(5), 24),
            sdn_join_cycles: 3,
            step_timeout: Duration::from_secs(300),
            init_timeout: Duration::from_secs(600),
            join_timeout: Duration::from_secs(300),
        }
    }
}

/// Where OVN-Kubernetes manifests come from
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OvnSettings {
    /// Image every OVN component runs
    pub image: String,
    /// Directory of rendered manifests
    pub manifest_dir: PathBuf,
    /// Checkout whose `dist/images/daemonset.sh` renders the manifests before install
    pub repo_path: Option<PathBuf>,
    /// OVN commit or branch to compile into a registry image instead of prebuilt packages
    pub ovn_git_ref: Option<String>,
}

impl Default for OvnSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/ovn-kubernetes/ovn-kubernetes/ovn-kube-ubuntu:master".to_string(),
            manifest_dir: PathBuf::from("ovn-kubernetes/dist/yaml"),
            repo_path: None,
            ovn_git_ref: None,
        }
    }
}

/// Host port of the local registry
pub const REGISTRY_PORT: u16 = 5000;

/// Local image registry, read from the `registry` topology section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySettings {
    /// Engine that runs the registry and builds images
    #[serde(default)]
    pub engine: EnginePreference,
    /// Images built from source and pushed on every run
    #[serde(default)]
    pub containers: Vec<RegistryImage>,
}

/// One image built and pushed to the local registry
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryImage {
    /// Label used in logs
    #[serde(default)]
    pub name: String,
    /// Plugin whose source tree is built
    pub cni: Option<CniKind>,
    /// `name:tag` under the registry
    #[serde(default)]
    pub tag: String,
}

impl RegistrySettings {
    /// Entry building the image for `cni`
    pub fn image_for(&self, cni: CniKind) -> Option<&RegistryImage> {
        self.containers.iter().find(|c| c.cni == Some(cni))
    }

    /// `localhost:<port>` as seen from the orchestrating host
    pub fn endpoint() -> String {
        format!("localhost:{}", REGISTRY_PORT)
    }

    /// Full reference of `tag` inside the registry
    pub fn image_ref(tag: &str) -> String {
        format!("{}/{}", Self::endpoint(), tag)
    }
}

#[cfg(test)]
impl OrchestratorSettings {
    /// Millisecond polls and small budgets for scenario tests
    pub(crate) fn fast() -> Self {
        let quick = |attempts| PollConfig::new(Duration::from_millis(1), attempts);
        Self {
            parallelism: 1,
            address_poll: quick(3),
            reachability_poll: quick(3),
            node_ready_poll: quick(3),
            overlay_rollout_poll: quick(3),
            sdn_rollout_poll: quick(3),
            sdn_node_pod_poll: quick(3),
            sdn_join_cycles: 3,
            step_timeout: Duration::from_secs(5),
            init_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }
}
