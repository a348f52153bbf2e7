//! Container-backed nodes through kind
//!
//! kind installs and joins Kubernetes itself, so this backend only creates
//! and lists clusters. Node containers are reached with `docker exec`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{collect_errors, NodeAddresses, NodeHandle, NodeKind, ProvisioningBackend};
use crate::host::{args, CommandRunner};
use crate::render::{render, KIND_CONFIG};
use crate::topology::{ClusterSpec, KindRole, Topology};
use crate::transport::RemoteExecutor;
use crate::{Error, Result};

/// API server port published on the host for the first cluster
const API_HOST_PORT: u16 = 6443;

#[derive(Serialize)]
struct KindNode {
    role: &'static str,
    api_port: Option<u16>,
}

/// [`ProvisioningBackend`] creating kind clusters
pub struct KindBackend {
    topology: Arc<Topology>,
    runner: Arc<dyn CommandRunner>,
    transport: Arc<dyn RemoteExecutor>,
}

impl KindBackend {
    /// Create a backend for `topology`
    pub fn new(
        topology: Arc<Topology>,
        runner: Arc<dyn CommandRunner>,
        transport: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            topology,
            runner,
            transport,
        }
    }

    async fn kind(&self, scope: &str, kind_args: Vec<String>, stdin: Option<String>) -> Result<String> {
        let command = format!("kind {}", kind_args.join(" "));
        self.runner
            .run("kind", kind_args, stdin)
            .await?
            .into_stdout(&command)
            .map_err(|e| Error::substrate(scope, e.to_string()))
    }

    async fn existing_clusters(&self) -> Result<Vec<String>> {
        let out = self.kind("kind", args(["get", "clusters"]), None).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("No kind clusters"))
            .map(String::from)
            .collect())
    }

    /// kind cluster config for `cluster`
    fn config(&self, cluster: &ClusterSpec) -> Result<String> {
        let publishes_api = self
            .topology
            .kubernetes
            .clusters
            .first()
            .is_some_and(|c| c.name == cluster.name);

        let mut api_port = publishes_api.then_some(API_HOST_PORT);
        let nodes: Vec<KindNode> = self
            .topology
            .cluster_kind_nodes(&cluster.name)
            .into_iter()
            .map(|n| match n.role {
                KindRole::ControlPlane => KindNode {
                    role: "control-plane",
                    api_port: api_port.take(),
                },
                KindRole::Worker => KindNode {
                    role: "worker",
                    api_port: None,
                },
            })
            .collect();

        render(
            KIND_CONFIG,
            &minijinja::context! {
                name => cluster.name,
                pod_cidr => cluster.pod_cidr,
                service_cidr => cluster.service_cidr,
                disable_default_cni => cluster.cni.disables_default_cni(),
                disable_kube_proxy => cluster.cni.disables_kube_proxy(),
                nodes => nodes,
            },
        )
    }
}

#[async_trait]
impl ProvisioningBackend for KindBackend {
    fn name(&self) -> &'static str {
        "kind"
    }

    fn required_tools(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("kind", "Install kind: https://kind.sigs.k8s.io/docs/user/quick-start/#installation"),
            ("docker", "Install Docker: https://docs.docker.com/get-docker/"),
        ]
    }

    fn transport(&self) -> Arc<dyn RemoteExecutor> {
        self.transport.clone()
    }

    fn bootstraps_kubernetes(&self) -> bool {
        true
    }

    fn uses_sudo(&self) -> bool {
        false
    }

    async fn create_substrate(&self, cluster: &ClusterSpec) -> Result<()> {
        if self.existing_clusters().await?.contains(&cluster.name) {
            info!(cluster = %cluster.name, "kind cluster exists, reusing");
            return Ok(());
        }
        let config = self.config(cluster)?;
        debug!(cluster = %cluster.name, config = %config, "creating kind cluster");
        self.kind(
            &cluster.name,
            args(["create", "cluster", "--name", &cluster.name, "--config", "-"]),
            Some(config),
        )
        .await?;
        info!(cluster = %cluster.name, "kind cluster created");
        Ok(())
    }

    async fn nodes(&self, cluster: &ClusterSpec) -> Result<Vec<NodeHandle>> {
        let out = self
            .kind(&cluster.name, args(["get", "nodes", "--name", &cluster.name]), None)
            .await?;
        let prefix = format!("{}-", cluster.name);
        let mut nodes: Vec<NodeHandle> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|name| {
                let role = name.strip_prefix(&prefix).unwrap_or(name);
                // HA clusters get a haproxy container that is not a Kubernetes node
                if role == "external-load-balancer" {
                    return None;
                }
                Some(NodeHandle {
                    name: name.to_string(),
                    cluster: cluster.name.clone(),
                    kind: if role.starts_with("control-plane") {
                        NodeKind::ControlPlane
                    } else {
                        NodeKind::Worker
                    },
                })
            })
            .collect();
        nodes.sort_by_key(|n| (n.kind != NodeKind::ControlPlane, n.name.clone()));
        Ok(nodes)
    }

    async fn node_addresses(&self, node: &NodeHandle) -> Result<Option<NodeAddresses>> {
        let out = self
            .runner
            .run(
                "docker",
                args([
                    "inspect",
                    "-f",
                    "{{.NetworkSettings.Networks.kind.IPAddress}}",
                    &node.name,
                ]),
                None,
            )
            .await?;
        if !out.success() {
            return Err(Error::substrate(
                &node.cluster,
                format!("container {}: {}", node.name, out.diagnostic()),
            ));
        }
        let ip = out.stdout.trim();
        if ip.is_empty() || ip == "<no value>" {
            return Ok(None);
        }
        Ok(Some(NodeAddresses {
            management: node.name.clone(),
            cluster: ip.to_string(),
        }))
    }

    async fn export_kubeconfig(&self, cluster: &ClusterSpec) -> Result<Option<String>> {
        self.kind(
            &cluster.name,
            args(["get", "kubeconfig", "--name", &cluster.name]),
            None,
        )
        .await
        .map(Some)
    }

    async fn destroy_substrate(&self) -> Result<()> {
        let existing = self.existing_clusters().await?;
        let mut errors = Vec::new();
        for cluster in &self.topology.kubernetes.clusters {
            if !existing.contains(&cluster.name) {
                debug!(cluster = %cluster.name, "kind cluster absent");
                continue;
            }
            match self
                .kind(&cluster.name, args(["delete", "cluster", "--name", &cluster.name]), None)
                .await
            {
                Ok(_) => info!(cluster = %cluster.name, "kind cluster deleted"),
                Err(e) => errors.push(e.to_string()),
            }
        }
        collect_errors("kind", errors)
    }
}
