//! Cluster access with kube-rs from the orchestrating host

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{
    approval_condition, manifest_documents, node_is_ready, pending_csr_names, readiness,
    without_taint, ClusterApi, PodQuery, PodReadiness, FIELD_MANAGER, RESTARTED_AT_ANNOTATION,
};
use crate::{Error, Result};

/// Connection timeout; the API server is local or on a libvirt network
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API calls
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Kinds whose plural is not derived by the suffix rules
const KIND_PLURALS: &[(&str, &str)] = &[("endpoints", "endpoints")];

/// A parsed manifest document ready for server-side apply
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// Document as JSON
    pub value: Value,
    /// metadata.name
    pub name: String,
    /// metadata.namespace; `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Resource type derived from apiVersion and kind
    pub api_resource: ApiResource,
}

/// Parse one JSON or YAML document
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata> {
    let value: Value = if manifest.trim_start().starts_with('{') {
        serde_json::from_str(manifest)?
    } else {
        serde_yaml::from_str(manifest)?
    };

    let field = |pointer: &str| value.pointer(pointer).and_then(Value::as_str);
    let api_version = field("/apiVersion")
        .ok_or_else(|| Error::resource("manifest missing apiVersion"))?
        .to_string();
    let kind = field("/kind")
        .ok_or_else(|| Error::resource("manifest missing kind"))?
        .to_string();
    let name = field("/metadata/name")
        .ok_or_else(|| Error::resource(format!("{} manifest missing metadata.name", kind)))?
        .to_string();
    let namespace = field("/metadata/namespace").map(str::to_string);

    Ok(ManifestMetadata {
        api_resource: build_api_resource(&api_version, &kind),
        value,
        name,
        namespace,
    })
}

/// Resource type for an apiVersion/kind pair
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Lowercase plural resource name of a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

fn keyed(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// kube-rs client for one cluster
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
    http: reqwest::Client,
}

impl KubeApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self { client, http })
    }

    /// Connect with a saved kubeconfig, failing when the API server does not answer
    pub async fn connect(kubeconfig: &Path) -> Result<Self> {
        let parsed = Kubeconfig::read_from(kubeconfig).map_err(|e| {
            Error::config(format!(
                "failed to read kubeconfig {}: {}",
                kubeconfig.display(),
                e
            ))
        })?;
        let mut config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        let server = config.cluster_url.to_string();

        let client = Client::try_from(config)?;
        let version = client.apiserver_version().await?;
        info!(server = %server, version = %version.git_version, "API server reachable");
        Self::new(client)
    }

    async fn apply_document(&self, document: &str) -> Result<()> {
        let metadata = parse_manifest(document)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let api: Api<DynamicObject> = match &metadata.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &metadata.api_resource),
            None => Api::all_with(self.client.clone(), &metadata.api_resource),
        };
        api.patch(&metadata.name, &params, &Patch::Apply(&metadata.value))
            .await
            .map_err(|e| {
                Error::resource(format!(
                    "failed to apply {}/{}: {}",
                    metadata.api_resource.kind, metadata.name, e
                ))
            })?;
        debug!(kind = %metadata.api_resource.kind, name = %metadata.name, "applied");
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    fn name(&self) -> &'static str {
        "kube-api"
    }

    async fn apply_url(&self, url: &str) -> Result<()> {
        debug!(url = %url, "downloading manifest");
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        self.apply_manifest(&body).await
    }

    async fn apply_manifest(&self, manifests: &str) -> Result<()> {
        for document in manifest_documents(manifests) {
            self.apply_document(document).await?;
        }
        Ok(())
    }

    async fn configmap_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api.get(name).await?;
        cm.data
            .and_then(|mut data| data.remove(key))
            .ok_or_else(|| {
                Error::resource(format!("configmap {}/{} has no key {}", namespace, name, key))
            })
    }

    async fn set_configmap_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "data": keyed(key, Value::from(value)) });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn restart_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let stamp = Value::from(chrono::Utc::now().to_rfc3339());
        let patch = json!({
            "spec": { "template": { "metadata": {
                "annotations": keyed(RESTARTED_AT_ANNOTATION, stamp)
            } } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        if api.get_opt(name).await?.is_some() {
            api.delete(name, &DeleteParams::default()).await?;
            info!(namespace = %namespace, daemonset = %name, "deleted");
        }
        Ok(())
    }

    async fn pod_readiness(&self, query: &PodQuery) -> Result<PodReadiness> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &query.namespace);
        let mut params = ListParams::default();
        if let Some(sel) = &query.label_selector {
            params = params.labels(sel);
        }
        if let Some(sel) = &query.field_selector {
            params = params.fields(sel);
        }
        let pods = api.list(&params).await?;
        Ok(readiness(&pods.items))
    }

    async fn node_ready(&self, node: &str) -> Result<bool> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(node).await?.is_some_and(|n| node_is_ready(&n)))
    }

    async fn node_names(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.into_iter().filter_map(|n| n.metadata.name).collect())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": keyed(key, Value::from(value)) } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_taint(&self, node: &str, key: &str, effect: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let current = api.get(node).await?;
        let taints = current
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default();
        if let Some(kept) = without_taint(&taints, key, effect) {
            let patch = json!({ "spec": { "taints": kept } });
            api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            debug!(node = %node, taint = %key, "taint removed");
        }
        Ok(())
    }

    async fn approve_pending_csrs(&self, node: &str) -> Result<usize> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let csrs = api.list(&ListParams::default()).await?;
        let pending = pending_csr_names(&csrs.items, node);
        let patch = json!({ "status": { "conditions": [approval_condition()] } });
        for name in &pending {
            api.patch_approval(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            debug!(csr = %name, node = %node, "approved");
        }
        Ok(pending.len())
    }
}
