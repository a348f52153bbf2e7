//! Flannel simple overlay

use serde_json::json;
use tracing::{info, warn};

use super::{outcome_from, soft_wait, PluginContext, PluginOutcome};
use crate::k8s::PodQuery;
use crate::topology::DEFAULT_POD_CIDR;
use crate::Result;

const MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";
pub(super) const NAMESPACE: &str = "kube-flannel";
const CONFIG_MAP: &str = "kube-flannel-cfg";
const NET_CONF_KEY: &str = "net-conf.json";
const DAEMONSET: &str = "kube-flannel-ds";

/// Apply flannel and point it at the cluster's pod range
///
/// Returns a warning when the range could not be patched in; flannel then
/// keeps its default network.
pub(super) async fn apply(ctx: &PluginContext<'_>) -> Result<Option<String>> {
    ctx.api.apply_url(MANIFEST_URL).await?;

    let pod_cidr = ctx.cluster.pod_cidr.as_str();
    if pod_cidr == DEFAULT_POD_CIDR {
        return Ok(None);
    }
    let net_conf = json!({ "Network": pod_cidr, "Backend": { "Type": "vxlan" } });
    let patched = async {
        ctx.api
            .set_configmap_value(NAMESPACE, CONFIG_MAP, NET_CONF_KEY, &net_conf.to_string())
            .await?;
        info!(cluster = %ctx.cluster.name, pod_cidr = %pod_cidr, "flannel network patched");
        ctx.api.restart_daemonset(NAMESPACE, DAEMONSET).await
    }
    .await;
    Ok(patched.err().map(|e| {
        warn!(cluster = %ctx.cluster.name, error = %e, "flannel pod range not applied");
        format!("flannel pod range {} not applied: {}", pod_cidr, e)
    }))
}

pub(super) async fn install(ctx: &PluginContext<'_>) -> Result<PluginOutcome> {
    let patch_warning = apply(ctx).await?;
    let rollout = soft_wait(
        ctx,
        "flannel",
        &PodQuery::new(NAMESPACE),
        &ctx.settings.overlay_rollout_poll,
    )
    .await;
    Ok(outcome_from([patch_warning, rollout]))
}
