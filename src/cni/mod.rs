//! Pod network plugins
//!
//! A cluster's CNI selector picks one [`NetworkPlugin`]. Every plugin has
//! the same two entry points: [`NetworkPlugin::install`] right after the
//! control plane is up, and [`NetworkPlugin::after_worker_join`] once per
//! joined worker. Rollout waits are soft: pods that are still starting
//! when the budget runs out produce [`PluginOutcome::Degraded`], not a
//! failure.

mod flannel;
mod multus;
mod ovn;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::host::CommandRunner;
use crate::k8s::{ClusterApi, PodQuery, PodReadiness};
use crate::poll::{poll, Check, PollConfig};
use crate::topology::{ClusterSpec, CniKind, DeploymentMode, OrchestratorSettings, OvnSettings};
use crate::{Error, Result};

/// Result of installing a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOutcome {
    /// Installed and every plugin pod reports ready
    Ready,
    /// Installed, but rollout had not finished within its budget
    Degraded(String),
    /// Installation itself failed
    Failed(String),
}

/// Everything a plugin needs from the running bring-up
pub struct PluginContext<'a> {
    /// Cluster being configured
    pub cluster: &'a ClusterSpec,
    /// API access to the cluster
    pub api: &'a dyn ClusterApi,
    /// Host command runner, for manifest generation
    pub runner: &'a Arc<dyn CommandRunner>,
    /// Poll budgets
    pub settings: &'a OrchestratorSettings,
    /// OVN-Kubernetes manifest sources
    pub ovn: &'a OvnSettings,
    /// Backend the cluster runs on
    pub mode: DeploymentMode,
    /// `https://<addr>:6443` of the bootstrap control-plane
    pub api_endpoint: &'a str,
    /// Names of all control-plane nodes
    pub control_planes: &'a [String],
}

/// Closed set of supported plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPlugin {
    /// Simple overlay
    Flannel,
    /// Overlay with the multus meta-plugin layered on top
    Multus,
    /// OVN-Kubernetes SDN
    OvnKubernetes,
    /// kind's built-in plugin, nothing to install
    Kindnet,
}

impl From<CniKind> for NetworkPlugin {
    fn from(kind: CniKind) -> Self {
        match kind {
            CniKind::Flannel => NetworkPlugin::Flannel,
            CniKind::Multus => NetworkPlugin::Multus,
            CniKind::OvnKubernetes => NetworkPlugin::OvnKubernetes,
            CniKind::Kindnet => NetworkPlugin::Kindnet,
        }
    }
}

impl NetworkPlugin {
    /// Name used in logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            NetworkPlugin::Flannel => "flannel",
            NetworkPlugin::Multus => "multus",
            NetworkPlugin::OvnKubernetes => "ovn-kubernetes",
            NetworkPlugin::Kindnet => "kindnet",
        }
    }

    /// Install the plugin on a cluster whose control plane is up
    pub async fn install(&self, ctx: &PluginContext<'_>) -> PluginOutcome {
        info!(cluster = %ctx.cluster.name, plugin = self.name(), "installing network plugin");
        let result = match self {
            NetworkPlugin::Flannel => flannel::install(ctx).await,
            NetworkPlugin::Multus => multus::install(ctx).await,
            NetworkPlugin::OvnKubernetes => ovn::install(ctx).await,
            NetworkPlugin::Kindnet => Ok(PluginOutcome::Ready),
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => PluginOutcome::Failed(e.to_string()),
        }
    }

    /// Plugin-specific readiness work after `worker` joined
    ///
    /// An error means the worker is degraded; the cluster carries on.
    pub async fn after_worker_join(&self, ctx: &PluginContext<'_>, worker: &str) -> Result<()> {
        match self {
            NetworkPlugin::OvnKubernetes => ovn::after_worker_join(ctx, worker).await,
            _ => Ok(()),
        }
    }
}

/// Wait for pods to become ready, turning a timeout into a warning
///
/// Returns `None` when every matched pod is ready.
pub(crate) async fn soft_wait(
    ctx: &PluginContext<'_>,
    plugin: &str,
    query: &PodQuery,
    cfg: &PollConfig,
) -> Option<String> {
    let what = format!("{} pods in {}", plugin, query.namespace);
    let api = ctx.api;
    let last = &std::sync::Mutex::new(PodReadiness::default());
    let result = poll(cfg, &what, || async move {
        match api.pod_readiness(query).await {
            Ok(r) if r.all_ready() => Check::Ready(r),
            Ok(r) => {
                if let Ok(mut l) = last.lock() {
                    *l = r;
                }
                Check::NotYet
            }
            Err(e) => {
                debug!(error = %e, "pod query failed, retrying");
                Check::NotYet
            }
        }
    })
    .await;

    match result {
        Ok(r) => {
            info!(cluster = %ctx.cluster.name, plugin = %plugin, readiness = %r, "plugin pods ready");
            None
        }
        Err(e) => {
            let observed = last.lock().map(|l| l.to_string()).unwrap_or_default();
            let err = Error::PluginRolloutTimeout {
                plugin: plugin.to_string(),
                waited: cfg.budget(),
                message: format!("{} ({})", e, observed),
            };
            warn!(cluster = %ctx.cluster.name, error = %err, "continuing with plugin not fully ready");
            Some(err.to_string())
        }
    }
}

/// Merge the warnings of several soft waits into one outcome
pub(crate) fn outcome_from(warnings: impl IntoIterator<Item = Option<String>>) -> PluginOutcome {
    let warnings: Vec<String> = warnings.into_iter().flatten().collect();
    if warnings.is_empty() {
        PluginOutcome::Ready
    } else {
        PluginOutcome::Degraded(warnings.join("; "))
    }
}
