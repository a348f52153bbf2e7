//! Multus meta-plugin layered over flannel

use super::{flannel, outcome_from, soft_wait, PluginContext, PluginOutcome};
use crate::k8s::PodQuery;
use crate::Result;

const MANIFEST_URL: &str = "https://raw.githubusercontent.com/k8snetworkplumbingwg/multus-cni/master/deployments/multus-daemonset-thick.yml";

pub(super) async fn install(ctx: &PluginContext<'_>) -> Result<PluginOutcome> {
    let patch_warning = flannel::apply(ctx).await?;
    ctx.api.apply_url(MANIFEST_URL).await?;

    let poll = &ctx.settings.overlay_rollout_poll;
    let multus_pods = PodQuery::new("kube-system").labels("app=multus");
    let multus = soft_wait(ctx, "multus", &multus_pods, poll).await;
    let flannel = soft_wait(ctx, "flannel", &PodQuery::new(flannel::NAMESPACE), poll).await;
    Ok(outcome_from([patch_warning, multus, flannel]))
}
