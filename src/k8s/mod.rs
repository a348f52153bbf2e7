//! Kubernetes API access for a cluster under bring-up
//!
//! [`ClusterApi`] is everything the network plugins and the orchestrator
//! ask of a running cluster. [`KubeApi`] talks to the API server with
//! kube-rs through the kubeconfig saved for the cluster. When that server
//! cannot be reached from this host, [`Kubectl`] runs the same operations
//! with kubectl on the bootstrap control-plane through the node transport.

mod client;
mod kubectl;

pub use client::{build_api_resource, parse_manifest, pluralize_kind, KubeApi, ManifestMetadata};
pub use kubectl::Kubectl;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestCondition};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Field manager recorded for server-side apply
pub const FIELD_MANAGER: &str = "dpusim";

/// Pod template annotation whose change rolls a workload's pods
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Readiness of a set of pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PodReadiness {
    /// Pods whose containers all report ready
    pub ready: usize,
    /// Pods matched
    pub total: usize,
}

impl PodReadiness {
    /// At least one pod matched and every matched pod is ready
    pub fn all_ready(&self) -> bool {
        self.total > 0 && self.ready == self.total
    }
}

impl std::fmt::Display for PodReadiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} pods ready", self.ready, self.total)
    }
}

/// Pods of one namespace, optionally narrowed by label and field selectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodQuery {
    /// Namespace to list
    pub namespace: String,
    /// Label selector, e.g. `app=flannel`
    pub label_selector: Option<String>,
    /// Field selector, e.g. `spec.nodeName=worker-1`
    pub field_selector: Option<String>,
}

impl PodQuery {
    /// Every pod in `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: None,
            field_selector: None,
        }
    }

    /// Only pods carrying `selector`
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Only pods scheduled on `node`
    pub fn on_node(mut self, node: &str) -> Self {
        self.field_selector = Some(format!("spec.nodeName={}", node));
        self
    }
}

/// Operations the bring-up needs from a cluster's API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Short name of the access path, for logs
    fn name(&self) -> &'static str;

    /// Apply every document of the manifest at `url`
    async fn apply_url(&self, url: &str) -> Result<()>;

    /// Apply every document of a multi-document manifest
    async fn apply_manifest(&self, manifests: &str) -> Result<()>;

    /// Read one key of a ConfigMap
    async fn configmap_value(&self, namespace: &str, name: &str, key: &str) -> Result<String>;

    /// Set one key of a ConfigMap, leaving the other keys alone
    async fn set_configmap_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Roll every pod of a DaemonSet
    async fn restart_daemonset(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a DaemonSet; an absent one is fine
    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()>;

    /// Readiness of the pods matching `query`
    async fn pod_readiness(&self, query: &PodQuery) -> Result<PodReadiness>;

    /// Whether `node` reports the Ready condition
    async fn node_ready(&self, node: &str) -> Result<bool>;

    /// Names of all registered nodes
    async fn node_names(&self) -> Result<Vec<String>>;

    /// Set a label on a node, overwriting an existing value
    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()>;

    /// Remove the `key:effect` taint from a node; an absent taint is fine
    async fn remove_taint(&self, node: &str, key: &str, effect: &str) -> Result<()>;

    /// Approve every pending CSR requested for `node`, returning how many
    async fn approve_pending_csrs(&self, node: &str) -> Result<usize>;
}

/// A running pod whose containers all report ready
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let containers = status.container_statuses.as_deref().unwrap_or_default();
    status.phase.as_deref() == Some("Running")
        && !containers.is_empty()
        && containers.iter().all(|c| c.ready)
}

/// Count ready pods
pub fn readiness(pods: &[Pod]) -> PodReadiness {
    PodReadiness {
        ready: pods.iter().filter(|p| pod_is_ready(p)).count(),
        total: pods.len(),
    }
}

/// Whether the node's Ready condition is True
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Names of requests made on behalf of `node` that are neither approved nor denied
///
/// Both the kubelet (`system:node:<node>`) and the OVN node identity
/// (`system:ovn-node:<node>`) request certificates, so only the trailing
/// node name is matched.
pub fn pending_csr_names(csrs: &[CertificateSigningRequest], node: &str) -> Vec<String> {
    let suffix = format!(":{}", node);
    csrs.iter()
        .filter(|c| {
            let decided = c
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conds| !conds.is_empty());
            let requester = c.spec.username.as_deref().unwrap_or_default();
            !decided && requester.ends_with(&suffix)
        })
        .filter_map(|c| c.metadata.name.clone())
        .collect()
}

/// Condition written to the approval subresource
pub fn approval_condition() -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some("DpusimApprove".to_string()),
        message: Some("approved during cluster bring-up".to_string()),
        ..Default::default()
    }
}

/// Taints left after dropping `key:effect`, or `None` when it was not set
pub fn without_taint(taints: &[Taint], key: &str, effect: &str) -> Option<Vec<Taint>> {
    let kept: Vec<Taint> = taints
        .iter()
        .filter(|t| !(t.key == key && t.effect == effect))
        .cloned()
        .collect();
    (kept.len() != taints.len()).then_some(kept)
}

/// Documents of a multi-document manifest that declare a resource
pub fn manifest_documents(manifests: &str) -> impl Iterator<Item = &str> {
    manifests
        .split("\n---")
        .map(str::trim)
        .filter(|doc| doc.contains("apiVersion"))
}
