//! Cluster access through kubectl on the bootstrap control-plane
//!
//! Used when the API server is not reachable from this host. Every call is
//! a kubectl invocation on a control-plane node through the same transport
//! the step library uses, so it works unchanged for VMs reached over ssh
//! and for kind nodes reached with `docker exec`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::Pod;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{pending_csr_names, readiness, ClusterApi, PodQuery, PodReadiness};
use crate::host::CommandOutput;
use crate::transport::RemoteExecutor;
use crate::{Error, Result};

const KUBECTL_TIMEOUT: Duration = Duration::from_secs(120);
const HEREDOC_TAG: &str = "DPUSIM_MANIFEST";

/// `kubectl get -o json` output; kind is `List`, not the typed list kind
#[derive(Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// kubectl bound to one control-plane node
#[derive(Clone)]
pub struct Kubectl {
    transport: Arc<dyn RemoteExecutor>,
    address: String,
    prefix: &'static str,
}

impl Kubectl {
    /// Admin kubeconfig path on control-plane nodes
    pub const ADMIN_KUBECONFIG: &'static str = "/etc/kubernetes/admin.conf";

    /// kubectl on the control-plane reachable at `address`
    ///
    /// `use_sudo` is needed on VMs where the admin kubeconfig is root-only.
    pub fn new(transport: Arc<dyn RemoteExecutor>, address: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            transport,
            address: address.into(),
            prefix: if use_sudo { "sudo " } else { "" },
        }
    }

    fn command(&self, args: &str) -> String {
        format!(
            "{}kubectl --kubeconfig={} {}",
            self.prefix,
            Self::ADMIN_KUBECONFIG,
            args
        )
    }

    /// `kubectl <args>` fed `stdin` through a quoted heredoc
    fn with_stdin(&self, args: &str, stdin: &str) -> String {
        format!(
            "{} <<'{tag}'\n{}\n{tag}\n",
            self.command(args),
            stdin.trim_end(),
            tag = HEREDOC_TAG
        )
    }

    async fn raw(&self, script: String) -> Result<CommandOutput> {
        debug!(address = %self.address, "kubectl");
        self.transport
            .execute(&self.address, &script, KUBECTL_TIMEOUT)
            .await
    }

    /// Run `kubectl <args>` and return stdout, failing on non-zero exit
    pub async fn run(&self, args: &str) -> Result<String> {
        self.raw(self.command(args))
            .await?
            .into_stdout(&format!("kubectl {}", args))
    }

    async fn list<T: DeserializeOwned>(&self, args: &str) -> Result<Vec<T>> {
        let list: Items<T> = serde_json::from_str(&self.run(args).await?)?;
        Ok(list.items)
    }

    async fn merge_patch(&self, namespace: &str, resource: &str, patch: &Value) -> Result<()> {
        let args = format!(
            "-n {} patch {} --type merge --patch-file /dev/stdin",
            namespace, resource
        );
        self.raw(self.with_stdin(&args, &patch.to_string()))
            .await?
            .into_stdout(&format!("kubectl patch {}", resource))
            .map(|_| ())
    }
}

#[async_trait]
impl ClusterApi for Kubectl {
    fn name(&self) -> &'static str {
        "kubectl"
    }

    async fn apply_url(&self, url: &str) -> Result<()> {
        self.run(&format!("apply -f {}", url)).await.map(|_| ())
    }

    async fn apply_manifest(&self, manifests: &str) -> Result<()> {
        self.raw(self.with_stdin("apply -f -", manifests))
            .await?
            .into_stdout("kubectl apply -f -")
            .map(|_| ())
    }

    async fn configmap_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let escaped = key.replace('.', "\\.");
        self.run(&format!(
            "-n {} get configmap {} -o jsonpath='{{.data.{}}}'",
            namespace, name, escaped
        ))
        .await
    }

    async fn set_configmap_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), Value::from(value));
        self.merge_patch(namespace, &format!("configmap/{}", name), &json!({ "data": data }))
            .await
    }

    async fn restart_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        self.run(&format!("-n {} rollout restart daemonset/{}", namespace, name))
            .await
            .map(|_| ())
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        self.run(&format!(
            "-n {} delete daemonset/{} --ignore-not-found",
            namespace, name
        ))
        .await
        .map(|_| ())
    }

    async fn pod_readiness(&self, query: &PodQuery) -> Result<PodReadiness> {
        let mut args = format!("-n {} get pods -o json", query.namespace);
        if let Some(sel) = &query.label_selector {
            args.push_str(&format!(" -l {}", sel));
        }
        if let Some(sel) = &query.field_selector {
            args.push_str(&format!(" --field-selector {}", sel));
        }
        let pods: Vec<Pod> = self.list(&args).await?;
        let r = readiness(&pods);
        debug!(
            namespace = %query.namespace,
            pods = ?pods.iter().filter_map(|p| p.metadata.name.as_deref()).collect::<Vec<_>>(),
            ready = r.ready,
            "pod readiness"
        );
        Ok(r)
    }

    async fn node_ready(&self, node: &str) -> Result<bool> {
        let out = self
            .raw(self.command(&format!(
                "get node {} -o jsonpath='{{.status.conditions[?(@.type==\"Ready\")].status}}'",
                node
            )))
            .await?;
        Ok(out.success() && out.stdout.trim() == "True")
    }

    async fn node_names(&self) -> Result<Vec<String>> {
        let out = self
            .run("get nodes -o jsonpath='{.items[*].metadata.name}'")
            .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()> {
        self.run(&format!("label node {} {}={} --overwrite", node, key, value))
            .await
            .map(|_| ())
    }

    async fn remove_taint(&self, node: &str, key: &str, effect: &str) -> Result<()> {
        let out = self
            .raw(self.command(&format!("taint nodes {} {}:{}-", node, key, effect)))
            .await?;
        if out.success() || out.stderr.contains("not found") {
            Ok(())
        } else {
            Err(Error::command_failed(
                format!("kubectl taint nodes {}", node),
                out.diagnostic(),
            ))
        }
    }

    async fn approve_pending_csrs(&self, node: &str) -> Result<usize> {
        let csrs: Vec<CertificateSigningRequest> = self.list("get csr -o json").await?;
        let pending = pending_csr_names(&csrs, node);
        if !pending.is_empty() {
            self.run(&format!("certificate approve {}", pending.join(" ")))
                .await?;
        }
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{csr_list, pod_list};
    use super::*;
    use crate::transport::testing::{FakeTransport, Reply};

    fn kubectl(fake: &Arc<FakeTransport>, sudo: bool) -> Kubectl {
        Kubectl::new(fake.clone(), "cp", sudo)
    }

    #[tokio::test]
    async fn commands_use_admin_kubeconfig() {
        let fake = Arc::new(FakeTransport::new());
        kubectl(&fake, true).run("get nodes").await.unwrap();
        kubectl(&fake, false).run("get nodes").await.unwrap();
        let calls = fake.calls();
        assert_eq!(
            calls[0].command,
            "sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf get nodes"
        );
        assert_eq!(
            calls[1].command,
            "kubectl --kubeconfig=/etc/kubernetes/admin.conf get nodes"
        );
    }

    #[tokio::test]
    async fn readiness_parses_typed_pods() {
        let fake = Arc::new(FakeTransport::new());
        fake.on(
            "app=flannel",
            Reply::Ok(pod_list(&[("kube-flannel-ds-a", "Running", &[true]), ("kube-flannel-ds-b", "Running", &[true, true])])),
        );
        fake.on(
            "ovnkube-node",
            Reply::Ok(pod_list(&[("ovnkube-node-x", "Running", &[true, false]), ("ovnkube-node-y", "Pending", &[])])),
        );
        let k = kubectl(&fake, false);

        let r = k
            .pod_readiness(&PodQuery::new("kube-flannel").labels("app=flannel"))
            .await
            .unwrap();
        assert!(r.all_ready());
        assert_eq!(r.to_string(), "2/2 pods ready");

        let r = k
            .pod_readiness(&PodQuery::new("ovn-kubernetes").labels("name=ovnkube-node").on_node("ovn-worker"))
            .await
            .unwrap();
        assert_eq!(r, PodReadiness { ready: 0, total: 2 });
        assert_eq!(
            fake.count_any("-n ovn-kubernetes get pods -o json -l name=ovnkube-node --field-selector spec.nodeName=ovn-worker"),
            1
        );
    }

    #[tokio::test]
    async fn malformed_pod_list_is_an_error() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("get pods", Reply::Ok("not json".into()));
        assert!(kubectl(&fake, false)
            .pod_readiness(&PodQuery::new("kube-system"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn approves_only_pending_csrs_for_the_node() {
        let fake = Arc::new(FakeTransport::new());
        fake.on(
            "get csr",
            Reply::Ok(csr_list(&[
                ("csr-aaa", "system:ovn-node:worker-1", false),
                ("csr-bbb", "system:node:worker-1", true),
                ("csr-ccc", "system:node:worker-10", false),
            ])),
        );
        let approved = kubectl(&fake, false)
            .approve_pending_csrs("worker-1")
            .await
            .unwrap();
        assert_eq!(approved, 1);
        assert_eq!(fake.count_any("certificate approve csr-aaa"), 1);
        assert_eq!(fake.count_any("csr-ccc"), 0);
    }

    #[tokio::test]
    async fn manifest_goes_through_quoted_heredoc() {
        let fake = Arc::new(FakeTransport::new());
        kubectl(&fake, true)
            .apply_manifest("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: $x\n")
            .await
            .unwrap();
        let cmd = &fake.calls()[0].command;
        assert!(cmd.contains("apply -f - <<'DPUSIM_MANIFEST'\napiVersion: v1"));
        assert!(cmd.ends_with("name: $x\nDPUSIM_MANIFEST\n"));
    }

    #[tokio::test]
    async fn absent_taint_is_not_an_error() {
        let fake = Arc::new(FakeTransport::new());
        fake.on(
            "taint nodes",
            Reply::Fail("error: taint \"node-role.kubernetes.io/master:NoSchedule\" not found".into()),
        );
        kubectl(&fake, false)
            .remove_taint("master-1", "node-role.kubernetes.io/master", "NoSchedule")
            .await
            .unwrap();
        assert_eq!(fake.count_any("taint nodes master-1 node-role.kubernetes.io/master:NoSchedule-"), 1);
    }

    #[tokio::test]
    async fn node_ready_reads_condition() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("get node worker-1", Reply::Ok("True".into()));
        fake.on("get node worker-2", Reply::Ok("False".into()));
        let k = kubectl(&fake, false);
        assert!(k.node_ready("worker-1").await.unwrap());
        assert!(!k.node_ready("worker-2").await.unwrap());
    }

    #[tokio::test]
    async fn configmap_patch_sends_json_body() {
        let fake = Arc::new(FakeTransport::new());
        kubectl(&fake, false)
            .set_configmap_value("kube-flannel", "kube-flannel-cfg", "net-conf.json", "{\"Network\":\"10.200.0.0/16\"}")
            .await
            .unwrap();
        let cmd = &fake.calls()[0].command;
        assert!(cmd.contains("-n kube-flannel patch configmap/kube-flannel-cfg --type merge"));
        assert!(cmd.contains(r#"{"data":{"net-conf.json":"{\"Network\":\"10.200.0.0/16\"}"}}"#));
    }

    #[tokio::test]
    async fn node_names_split_jsonpath_output() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("get nodes", Reply::Ok("master-1 host-1 dpu-1".into()));
        assert_eq!(
            kubectl(&fake, false).node_names().await.unwrap(),
            ["master-1", "host-1", "dpu-1"]
        );
    }
}
