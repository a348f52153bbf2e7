//! OVN-Kubernetes SDN
//!
//! Install order matters: CRDs, then RBAC, then the identity webhook, the
//! node switch (kind only), the databases, the controllers and finally the
//! node daemons, which need the databases reachable. Control-plane nodes
//! host the databases, so they are labeled and untainted first.
//!
//! A joining worker's `ovnkube-node` pod cannot finish starting until its
//! certificate requests are approved, and the requests only show up once
//! the pod runs. [`after_worker_join`] breaks the cycle with a bounded
//! number of wait/approve/wait rounds.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{outcome_from, soft_wait, PluginContext, PluginOutcome};
use crate::host::args;
use crate::k8s::PodQuery;
use crate::poll::{poll, Check};
use crate::topology::DeploymentMode;
use crate::{Error, Result};

const NAMESPACE: &str = "ovn-kubernetes";
const NODE_SELECTOR: &str = "name=ovnkube-node";
const DB_LABEL: (&str, &str) = ("k8s.ovn.org/ovnkube-db", "true");
const CONTROL_PLANE_TAINTS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];
const DNS_SERVER: &str = "8.8.8.8";

const CRDS: &[&str] = &[
    "k8s.ovn.org_egressfirewalls.yaml",
    "k8s.ovn.org_egressips.yaml",
    "k8s.ovn.org_egressqoses.yaml",
    "k8s.ovn.org_egressservices.yaml",
    "k8s.ovn.org_adminpolicybasedexternalroutes.yaml",
    "k8s.ovn.org_networkqoses.yaml",
    "k8s.ovn.org_userdefinednetworks.yaml",
    "k8s.ovn.org_clusteruserdefinednetworks.yaml",
    "k8s.ovn.org_routeadvertisements.yaml",
    "k8s.ovn.org_clusternetworkconnects.yaml",
];

// Pinned to the network-policy-api version OVN-Kubernetes vendors
const POLICY_CRDS: &[&str] = &[
    "https://raw.githubusercontent.com/kubernetes-sigs/network-policy-api/v0.1.5/config/crd/experimental/policy.networking.k8s.io_adminnetworkpolicies.yaml",
    "https://raw.githubusercontent.com/kubernetes-sigs/network-policy-api/v0.1.5/config/crd/experimental/policy.networking.k8s.io_baselineadminnetworkpolicies.yaml",
];

const SETUP: &[&str] = &[
    "ovn-setup.yaml",
    "rbac-ovnkube-identity.yaml",
    "rbac-ovnkube-cluster-manager.yaml",
    "rbac-ovnkube-master.yaml",
    "rbac-ovnkube-node.yaml",
    "rbac-ovnkube-db.yaml",
];

const DAEMONSET_FLAGS: &[&str] = &[
    "--gateway-mode=shared",
    "--dummy-gateway-bridge=false",
    "--gateway-options=",
    "--enable-ipsec=false",
    "--hybrid-enabled=false",
    "--disable-snat-multiple-gws=false",
    "--disable-forwarding=false",
    "--ovn-encap-port=",
    "--disable-pkt-mtu-check=false",
    "--ovn-empty-lb-events=false",
    "--multicast-enabled=false",
    "--ovn-master-count=1",
    "--ovn-unprivileged-mode=no",
    "--master-loglevel=5",
    "--node-loglevel=5",
    "--dbchecker-loglevel=5",
    "--ovn-loglevel-northd=-vconsole:info -vfile:info",
    "--ovn-loglevel-nb=-vconsole:info -vfile:info",
    "--ovn-loglevel-sb=-vconsole:info -vfile:info",
    "--ovn-loglevel-controller=-vconsole:info",
    "--ovnkube-libovsdb-client-logfile=",
    "--ovnkube-config-duration-enable=true",
    "--admin-network-policy-enable=true",
    "--egress-ip-enable=true",
    "--egress-ip-healthcheck-port=9107",
    "--egress-firewall-enable=true",
    "--egress-qos-enable=true",
    "--egress-service-enable=true",
    "--v4-join-subnet=100.64.0.0/16",
    "--v6-join-subnet=fd98::/64",
    "--v4-masquerade-subnet=169.254.0.0/17",
    "--v6-masquerade-subnet=fd69::/112",
    "--v4-transit-subnet=100.88.0.0/16",
    "--v6-transit-subnet=fd97::/64",
    "--ex-gw-network-interface=",
    "--multi-network-enable=false",
    "--network-segmentation-enable=false",
    "--preconfigured-udn-addresses-enable=false",
    "--route-advertisements-enable=false",
    "--advertise-default-network=false",
    "--advertised-udn-isolation-mode=strict",
    "--ovnkube-metrics-scale-enable=false",
    "--compact-mode=false",
    "--enable-multi-external-gateway=true",
    "--enable-ovnkube-identity=true",
    "--enable-persistent-ips=true",
    "--network-qos-enable=false",
    "--mtu=1400",
    "--enable-dnsnameresolver=false",
    "--enable-observ=false",
];

/// Workload manifests in dependency order
fn component_manifests(mode: DeploymentMode) -> Vec<&'static str> {
    let mut manifests = vec!["ovnkube-identity.yaml"];
    if mode == DeploymentMode::Kind {
        manifests.push("ovs-node.yaml");
    }
    manifests.extend(["ovnkube-db.yaml", "ovnkube-master.yaml", "ovnkube-node.yaml"]);
    manifests
}

/// Rewrite a Corefile so lookups outside the cluster never loop back
///
/// Drops `upstream`, `fallthrough` and `loop`, serves the `net` zone from
/// the kubernetes plugin and forwards everything else to `dns`.
fn patch_corefile(corefile: &str, dns: &str) -> String {
    let mut out = Vec::new();
    for line in corefile.lines() {
        let trimmed = line.trim();
        if trimmed == "upstream" || trimmed == "loop" || trimmed.starts_with("fallthrough") {
            continue;
        }
        let indent = &line[..line.len() - line.trim_start().len()];
        if let Some(rest) = trimmed.strip_prefix("kubernetes cluster.local") {
            if rest.starts_with(" net") {
                out.push(line.to_string());
            } else {
                out.push(format!("{}kubernetes cluster.local net{}", indent, rest));
            }
        } else if trimmed.starts_with("forward .") {
            let block = if trimmed.ends_with('{') { " {" } else { "" };
            out.push(format!("{}forward . {}{}", indent, dns, block));
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

async fn patch_coredns(ctx: &PluginContext<'_>) -> Result<()> {
    let corefile = ctx
        .api
        .configmap_value("kube-system", "coredns", "Corefile")
        .await?;
    let patched = patch_corefile(&corefile, DNS_SERVER);
    ctx.api
        .set_configmap_value("kube-system", "coredns", "Corefile", &patched)
        .await?;
    info!(cluster = %ctx.cluster.name, dns = DNS_SERVER, "CoreDNS forwards to external resolver");
    Ok(())
}

/// Render manifests from an OVN-Kubernetes checkout and return where they landed
async fn render_manifests(ctx: &PluginContext<'_>, repo: &Path) -> Result<PathBuf> {
    let images = repo.join("dist").join("images");
    let mut script_args = args([
        "-c",
        "cd \"$1\" && shift && exec ./daemonset.sh \"$@\"",
        "daemonset.sh",
    ]);
    script_args.push(images.display().to_string());
    script_args.extend([
        format!("--image={}", ctx.ovn.image),
        format!("--net-cidr={}", ctx.cluster.pod_cidr),
        format!("--svc-cidr={}", ctx.cluster.service_cidr),
        format!("--k8s-apiserver={}", ctx.api_endpoint),
    ]);
    script_args.extend(DAEMONSET_FLAGS.iter().map(|f| f.to_string()));

    info!(cluster = %ctx.cluster.name, repo = %repo.display(), "rendering OVN-Kubernetes manifests");
    let out = ctx
        .runner
        .run("bash", script_args, None)
        .await?
        .into_stdout("daemonset.sh")?;
    debug!(output = %out.trim(), "daemonset.sh finished");
    Ok(repo.join("dist").join("yaml"))
}

async fn apply_file(ctx: &PluginContext<'_>, dir: &Path, name: &str) -> Result<()> {
    let path = dir.join(name);
    let manifest = tokio::fs::read_to_string(&path).await.map_err(|e| {
        Error::config(format!(
            "OVN-Kubernetes manifest {} not readable: {}",
            path.display(),
            e
        ))
    })?;
    ctx.api.apply_manifest(&manifest).await?;
    debug!(manifest = %name, "applied");
    Ok(())
}

async fn prepare_control_planes(ctx: &PluginContext<'_>) -> Result<()> {
    for node in ctx.control_planes {
        ctx.api.label_node(node, DB_LABEL.0, DB_LABEL.1).await?;
        for taint in CONTROL_PLANE_TAINTS {
            ctx.api.remove_taint(node, taint, "NoSchedule").await?;
        }
        info!(node = %node, "labeled for OVN databases");
    }
    Ok(())
}

pub(super) async fn install(ctx: &PluginContext<'_>) -> Result<PluginOutcome> {
    patch_coredns(ctx)
        .await
        .map_err(|e| Error::resource(format!("CoreDNS patch failed: {}", e)))?;

    let dir = match &ctx.ovn.repo_path {
        Some(repo) => render_manifests(ctx, repo).await?,
        None => ctx.ovn.manifest_dir.clone(),
    };

    for crd in CRDS {
        apply_file(ctx, &dir, crd).await?;
    }
    for url in POLICY_CRDS {
        ctx.api.apply_url(url).await?;
    }
    for manifest in SETUP {
        apply_file(ctx, &dir, manifest).await?;
    }

    prepare_control_planes(ctx).await?;

    for manifest in component_manifests(ctx.mode) {
        apply_file(ctx, &dir, manifest).await?;
    }
    info!(cluster = %ctx.cluster.name, "OVN-Kubernetes manifests applied");

    let warning = soft_wait(
        ctx,
        "ovn-kubernetes",
        &PodQuery::new(NAMESPACE),
        &ctx.settings.sdn_rollout_poll,
    )
    .await;

    // ovnkube-node takes over service load-balancing from kube-proxy
    ctx.api
        .delete_daemonset("kube-system", "kube-proxy")
        .await
        .map_err(|e| Error::resource(format!("kube-proxy removal failed: {}", e)))?;
    info!(cluster = %ctx.cluster.name, "kube-proxy removed");

    Ok(outcome_from([warning]))
}

pub(super) async fn after_worker_join(ctx: &PluginContext<'_>, worker: &str) -> Result<()> {
    let api = ctx.api;
    let query = &PodQuery::new(NAMESPACE).labels(NODE_SELECTOR).on_node(worker);
    let cfg = &ctx.settings.sdn_node_pod_poll;
    let cycles = ctx.settings.sdn_join_cycles.max(1);

    for cycle in 1..=cycles {
        let appeared = poll(cfg, &format!("ovnkube-node pod on {}", worker), || async move {
            match api.pod_readiness(query).await {
                Ok(r) if r.total > 0 => Check::Ready(()),
                Ok(_) => Check::NotYet,
                Err(e) => {
                    debug!(error = %e, "pod query failed, retrying");
                    Check::NotYet
                }
            }
        })
        .await;
        if let Err(e) = appeared {
            debug!(node = %worker, cycle, error = %e, "ovnkube-node pod not scheduled yet");
        }

        match api.approve_pending_csrs(worker).await {
            Ok(0) => {}
            Ok(approved) => info!(node = %worker, approved, "approved certificate requests"),
            Err(e) => warn!(node = %worker, error = %e, "certificate approval failed"),
        }

        let ready = poll(cfg, &format!("ovnkube-node ready on {}", worker), || async move {
            match api.pod_readiness(query).await {
                Ok(r) if r.all_ready() => Check::Ready(()),
                _ => Check::NotYet,
            }
        })
        .await;
        if ready.is_ok() {
            info!(node = %worker, cycle, "ovnkube-node ready");
            return Ok(());
        }
        warn!(node = %worker, cycle, cycles, "ovnkube-node not ready, retrying approval");
    }

    Err(Error::join_failure(
        worker,
        format!("ovnkube-node pod not ready after {} approval cycles", cycles),
    ))
}
