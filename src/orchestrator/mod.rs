//! Cluster bring-up state machine
//!
//! A cluster moves through [`Stage`]s strictly in order:
//!
//! 1. `SUBSTRATE_READY` - the backend creates networks and node instances
//! 2. `NODES_REACHABLE` - every node gets an address and answers on its transport
//! 3. `HOSTS_PREPARED` - host preparation steps on every reachable node
//! 4. `CONTROL_PLANE_INITIALIZED` - kubeadm init on the bootstrap control-plane
//! 5. `CNI_INSTALLED` - the cluster's network plugin
//! 6. `WORKERS_JOINED` - joins, certificate approval and plugin post-join work
//! 7. `CLUSTER_VERIFIED` - node list read back, diagnostic only
//!
//! Node-scoped failures exclude that node from later stages; the cluster
//! only fails when the bootstrap control-plane is lost or a cluster-wide
//! step (substrate, init, plugin install) fails. Independent clusters run
//! concurrently and never share state beyond the backend's substrate.

mod state;

pub use state::{ClusterState, NodeReport, NodeStatus, Outcome, Scope, Stage, StageResult};

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::backend::{NodeAddresses, NodeHandle, NodeKind, ProvisioningBackend};
use crate::cni::{NetworkPlugin, PluginContext, PluginOutcome};
use crate::host::CommandRunner;
use crate::k8s::{ClusterApi, KubeApi, Kubectl};
use crate::kubeconfig;
use crate::poll::{poll, Check, PollError};
use crate::report::ClusterReport;
use crate::steps::brex::ensure_external_bridge;
use crate::steps::host_prep::{detect_package_manager, HostPrep};
use crate::steps::kubeadm::{
    fetch_admin_kubeconfig, init_control_plane, join_node, InitParams, JoinToken,
};
use crate::steps::{StepExecutor, Target};
use crate::topology::{ClusterSpec, DeploymentMode, OrchestratorSettings, OvnSettings, Topology};
use crate::transport::is_reachable;
use crate::{Error, Result};

/// `Err` carries the reason a cluster-wide stage failed
type StageOutcome = std::result::Result<(), String>;

struct NodeEntry {
    handle: NodeHandle,
    addresses: Option<NodeAddresses>,
    status: NodeStatus,
}

impl NodeEntry {
    fn new(handle: NodeHandle) -> Self {
        Self {
            handle,
            addresses: None,
            status: NodeStatus::Healthy,
        }
    }

    fn resolved(&self) -> Result<(Target<'_>, &NodeAddresses)> {
        let addrs = self.addresses.as_ref().ok_or_else(|| {
            Error::substrate(
                &self.handle.cluster,
                format!("node {} has no resolved address", self.handle.name),
            )
        })?;
        Ok((
            Target {
                node: &self.handle.name,
                address: &addrs.management,
            },
            addrs,
        ))
    }
}

/// Mutable bookkeeping for one cluster's bring-up
struct ClusterRun<'c> {
    cluster: &'c ClusterSpec,
    state: ClusterState,
    nodes: Vec<NodeEntry>,
    log: Vec<StageResult>,
    warnings: Vec<String>,
    join: Option<JoinToken>,
    api_endpoint: String,
    kubeconfig: Option<PathBuf>,
}

impl<'c> ClusterRun<'c> {
    fn new(cluster: &'c ClusterSpec) -> Self {
        Self {
            cluster,
            state: ClusterState::Pending,
            nodes: Vec::new(),
            log: Vec::new(),
            warnings: Vec::new(),
            join: None,
            api_endpoint: String::new(),
            kubeconfig: None,
        }
    }

    fn record(&mut self, stage: Stage, scope: Scope, outcome: Outcome, diagnostic: impl Into<String>) {
        self.log.push(StageResult {
            stage,
            scope,
            outcome,
            diagnostic: diagnostic.into(),
        });
    }

    fn record_cluster(&mut self, stage: Stage, outcome: Outcome, diagnostic: impl Into<String>) {
        let scope = Scope::Cluster(self.cluster.name.clone());
        self.record(stage, scope, outcome, diagnostic);
    }

    fn record_node(&mut self, stage: Stage, idx: usize, outcome: Outcome, diagnostic: impl Into<String>) {
        let scope = Scope::Node(self.nodes[idx].handle.name.clone());
        self.record(stage, scope, outcome, diagnostic);
    }

    fn exclude(&mut self, idx: usize, stage: Stage, reason: String) {
        warn!(
            cluster = %self.cluster.name,
            node = %self.nodes[idx].handle.name,
            stage = %stage,
            reason = %reason,
            "node excluded from remaining stages"
        );
        self.record_node(stage, idx, Outcome::Failure, reason.clone());
        self.nodes[idx].status = NodeStatus::Excluded { stage, reason };
    }

    fn warn(&mut self, message: String) {
        warn!(cluster = %self.cluster.name, "{}", message);
        self.warnings.push(message);
    }

    fn bootstrap_index(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.handle.kind == NodeKind::ControlPlane)
    }

    /// The bootstrap control-plane, as long as it is still healthy
    fn bootstrap(&self) -> std::result::Result<(usize, &NodeEntry), String> {
        let idx = self
            .bootstrap_index()
            .ok_or_else(|| format!("no control-plane node in cluster {}", self.cluster.name))?;
        let entry = &self.nodes[idx];
        match &entry.status {
            NodeStatus::Healthy => Ok((idx, entry)),
            NodeStatus::Excluded { reason, .. } => Err(format!(
                "bootstrap control-plane {} lost: {}",
                entry.handle.name, reason
            )),
        }
    }

    fn healthy(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].status == NodeStatus::Healthy)
            .collect()
    }

    fn healthy_of(&self, kind: NodeKind) -> Vec<usize> {
        self.healthy()
            .into_iter()
            .filter(|i| self.nodes[*i].handle.kind == kind)
            .collect()
    }

    fn control_plane_names(&self) -> Vec<String> {
        self.healthy_of(NodeKind::ControlPlane)
            .into_iter()
            .map(|i| self.nodes[i].handle.name.clone())
            .collect()
    }

    fn into_report(self) -> ClusterReport {
        ClusterReport {
            cluster: self.cluster.name.clone(),
            state: self.state,
            nodes: self
                .nodes
                .into_iter()
                .map(|n| NodeReport {
                    name: n.handle.name,
                    kind: n.handle.kind,
                    status: n.status,
                })
                .collect(),
            stages: self.log,
            warnings: self.warnings,
        }
    }
}

fn wait_error(node: &NodeHandle, attempts: u32, e: PollError) -> Error {
    if e.is_timeout() {
        Error::ReachabilityTimeout {
            node: node.name.clone(),
            attempts,
            message: e.to_string(),
        }
    } else {
        Error::substrate(&node.cluster, e.to_string())
    }
}

/// Which parts of a bring-up actually run
///
/// Skipped stages are still recorded so the report shows where work stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    /// Create networks and nodes; off reuses what the backend already has
    pub deploy: bool,
    /// Prepare hosts, bootstrap Kubernetes and join workers
    pub kubernetes: bool,
    /// Install the cluster's network plugin
    pub cni: bool,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            deploy: true,
            kubernetes: true,
            cni: true,
        }
    }
}

impl RunPlan {
    /// Why `stage` is skipped under this plan, if it is
    pub fn skip_reason(&self, stage: Stage) -> Option<&'static str> {
        match stage {
            Stage::SubstrateReady | Stage::NodesReachable => None,
            _ if !self.kubernetes => Some("Kubernetes installation skipped"),
            Stage::CniInstalled if !self.cni => Some("CNI installation skipped"),
            _ => None,
        }
    }
}

/// Drives every cluster of a topology through its bring-up stages
pub struct Orchestrator {
    topology: Arc<Topology>,
    backend: Arc<dyn ProvisioningBackend>,
    runner: Arc<dyn CommandRunner>,
    settings: OrchestratorSettings,
    ovn: OvnSettings,
    mode: DeploymentMode,
    plan: RunPlan,
}

impl Orchestrator {
    /// Create an orchestrator using the topology's own settings
    pub fn new(
        topology: Arc<Topology>,
        backend: Arc<dyn ProvisioningBackend>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let mode = topology.mode()?;
        let ovn = OvnSettings {
            image: topology.ovn_image(),
            ..topology.ovn.clone()
        };
        Ok(Self {
            settings: topology.orchestrator.clone(),
            ovn,
            topology,
            backend,
            runner,
            mode,
            plan: RunPlan::default(),
        })
    }

    /// Override how many nodes of a cluster are worked on at once
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.settings.parallelism = parallelism.max(1);
        self
    }

    /// Replace poll budgets, timeouts and parallelism
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Restrict which stages do work
    pub fn with_plan(mut self, plan: RunPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Bring up every declared cluster, or only `only`
    ///
    /// Clusters run concurrently. The only error is an unknown cluster
    /// name; everything else ends up in the reports.
    pub async fn run(&self, only: Option<&str>) -> Result<Vec<ClusterReport>> {
        let clusters: Vec<&ClusterSpec> = match only {
            Some(name) => vec![self.topology.cluster(name).ok_or_else(|| {
                Error::config(format!("cluster {} is not declared in the topology", name))
            })?],
            None => self.topology.kubernetes.clusters.iter().collect(),
        };
        info!(
            backend = self.backend.name(),
            clusters = clusters.len(),
            parallelism = self.settings.parallelism,
            "starting bring-up"
        );
        Ok(join_all(clusters.into_iter().map(|c| self.bring_up(c))).await)
    }

    /// Bring up one cluster until it is verified or a stage fails
    pub async fn bring_up(&self, cluster: &ClusterSpec) -> ClusterReport {
        let mut run = ClusterRun::new(cluster);

        while let Some(stage) = run.state.next_stage() {
            if let Some(reason) = self.plan.skip_reason(stage) {
                info!(cluster = %cluster.name, stage = %stage, reason, "stage skipped");
                run.record_cluster(stage, Outcome::Skipped, reason);
                run.state = ClusterState::Reached(stage);
                continue;
            }
            info!(cluster = %cluster.name, stage = %stage, "entering stage");
            let result = match stage {
                Stage::SubstrateReady => self.substrate_ready(&mut run).await,
                Stage::NodesReachable => self.nodes_reachable(&mut run).await,
                Stage::HostsPrepared => self.hosts_prepared(&mut run).await,
                Stage::ControlPlaneInitialized => self.control_plane_initialized(&mut run).await,
                Stage::CniInstalled => self.cni_installed(&mut run).await,
                Stage::WorkersJoined => self.workers_joined(&mut run).await,
                Stage::ClusterVerified => self.cluster_verified(&mut run).await,
            };
            match result {
                Ok(()) => run.state = ClusterState::Reached(stage),
                Err(reason) => {
                    error!(cluster = %cluster.name, stage = %stage, reason = %reason, "cluster failed");
                    run.record_cluster(stage, Outcome::Failure, reason.clone());
                    run.state = ClusterState::Failed { stage, reason };
                }
            }
        }

        info!(cluster = %cluster.name, state = %run.state, "bring-up finished");
        run.into_report()
    }

    fn parallelism(&self) -> usize {
        self.settings.parallelism.max(1)
    }

    async fn substrate_ready(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        let cluster = run.cluster;
        if self.plan.deploy {
            self.backend
                .create_substrate(cluster)
                .await
                .map_err(|e| e.to_string())?;
        } else {
            info!(cluster = %cluster.name, "deployment skipped, using existing nodes");
        }
        let nodes = self.backend.nodes(cluster).await.map_err(|e| e.to_string())?;
        if !nodes.iter().any(|n| n.kind == NodeKind::ControlPlane) {
            return Err(format!("no control-plane node in cluster {}", cluster.name));
        }

        run.nodes = nodes.into_iter().map(NodeEntry::new).collect();
        let summary = format!("{} nodes", run.nodes.len());
        run.record_cluster(Stage::SubstrateReady, Outcome::Success, summary);
        Ok(())
    }

    async fn nodes_reachable(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        let mut results: Vec<(usize, Result<NodeAddresses>)> =
            stream::iter(run.nodes.iter().enumerate())
                .map(move |(idx, entry)| async move {
                    (idx, self.await_reachable(&entry.handle).await)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await;
        results.sort_by_key(|(idx, _)| *idx);

        for (idx, result) in results {
            match result {
                Ok(addrs) => {
                    let diagnostic = format!("{} (cluster {})", addrs.management, addrs.cluster);
                    run.record_node(Stage::NodesReachable, idx, Outcome::Success, diagnostic);
                    run.nodes[idx].addresses = Some(addrs);
                }
                Err(e) => run.exclude(idx, Stage::NodesReachable, e.to_string()),
            }
        }
        run.bootstrap().map(|_| ())
    }

    /// Poll for an address, then for the transport to answer on it
    async fn await_reachable(&self, node: &NodeHandle) -> Result<NodeAddresses> {
        let backend = self.backend.as_ref();
        let cfg = &self.settings.address_poll;
        let addresses = poll(cfg, &format!("address of {}", node.name), || async move {
            Check::from_result(backend.node_addresses(node).await)
        })
        .await
        .map_err(|e| wait_error(node, cfg.max_attempts, e))?;

        let transport = self.backend.transport();
        let executor = transport.as_ref();
        let address = addresses.management.as_str();
        let cfg = &self.settings.reachability_poll;
        poll(cfg, &format!("transport to {}", node.name), || async move {
            match is_reachable(executor, address).await {
                Ok(true) => Check::Ready(()),
                Ok(false) => Check::NotYet,
                Err(e) => {
                    debug!(address = %address, error = %e, "not reachable yet");
                    Check::NotYet
                }
            }
        })
        .await
        .map_err(|e| wait_error(node, cfg.max_attempts, e))?;

        info!(node = %node.name, address = %address, "node reachable");
        Ok(addresses)
    }

    async fn hosts_prepared(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        if self.backend.bootstraps_kubernetes() {
            let note = format!("{} nodes ship prepared", self.backend.name());
            run.record_cluster(Stage::HostsPrepared, Outcome::Skipped, note);
            return Ok(());
        }

        let exec = StepExecutor::new(self.backend.transport());
        let cluster = run.cluster;
        let mut results: Vec<(usize, Result<()>)> = {
            let (exec, nodes) = (&exec, &run.nodes);
            stream::iter(run.healthy())
                .map(move |idx| async move { (idx, self.prepare_host(exec, cluster, &nodes[idx]).await) })
                .buffer_unordered(self.parallelism())
                .collect()
                .await
        };
        results.sort_by_key(|(idx, _)| *idx);

        for (idx, result) in results {
            match result {
                Ok(()) => run.record_node(Stage::HostsPrepared, idx, Outcome::Success, ""),
                Err(e) => run.exclude(idx, Stage::HostsPrepared, e.to_string()),
            }
        }
        run.bootstrap().map(|_| ())
    }

    /// Host preparation sequence for one node; steps never overlap within a node
    async fn prepare_host(
        &self,
        exec: &StepExecutor,
        cluster: &ClusterSpec,
        entry: &NodeEntry,
    ) -> Result<()> {
        let (target, addrs) = entry.resolved()?;
        let package_manager = detect_package_manager(exec, target).await?;
        let prep = HostPrep {
            hostname: target.node,
            version: &self.topology.kubernetes.version,
            package_manager,
            timeout: self.settings.step_timeout,
        };
        exec.run_all(target, &prep.steps()).await?;

        if cluster.cni.requires_external_bridge() {
            ensure_external_bridge(
                exec,
                target,
                &addrs.management,
                &addrs.cluster,
                self.settings.step_timeout,
            )
            .await?;
        }
        info!(cluster = %cluster.name, node = %target.node, "host prepared");
        Ok(())
    }

    async fn control_plane_initialized(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        let cluster = run.cluster;
        let (boot_idx, boot) = run.bootstrap()?;
        let name = boot.handle.name.clone();
        let addrs = boot.addresses.clone().ok_or_else(|| format!("{} has no address", name))?;
        let target = Target {
            node: &name,
            address: &addrs.management,
        };
        let exec = StepExecutor::new(self.backend.transport());

        if self.backend.bootstraps_kubernetes() {
            run.api_endpoint = format!("https://{}:6443", addrs.cluster);
            let note = format!("control plane created by {}", self.backend.name());
            run.record_cluster(Stage::ControlPlaneInitialized, Outcome::Skipped, note);
        } else {
            let params = InitParams {
                advertise_address: &addrs.cluster,
                pod_cidr: &cluster.pod_cidr,
                service_cidr: &cluster.service_cidr,
                timeout: self.settings.init_timeout,
            };
            let control_plane = init_control_plane(&exec, target, params)
                .await
                .map_err(|e| e.to_string())?;
            run.record_node(
                Stage::ControlPlaneInitialized,
                boot_idx,
                Outcome::Success,
                control_plane.api_endpoint.clone(),
            );
            run.api_endpoint = control_plane.api_endpoint;

            // control-plane members join one at a time
            let secondary: Vec<usize> = run
                .healthy_of(NodeKind::ControlPlane)
                .into_iter()
                .filter(|i| *i != boot_idx)
                .collect();
            for idx in secondary {
                let result = match run.nodes[idx].resolved() {
                    Ok((t, _)) => {
                        join_node(&exec, t, &control_plane.join, true, self.settings.join_timeout)
                            .await
                    }
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => run.record_node(
                        Stage::ControlPlaneInitialized,
                        idx,
                        Outcome::Success,
                        "joined as control-plane",
                    ),
                    Err(e) => run.exclude(idx, Stage::ControlPlaneInitialized, e.to_string()),
                }
            }
            run.join = Some(control_plane.join);
        }

        self.save_kubeconfig(run, &exec, target).await;
        Ok(())
    }

    async fn save_kubeconfig(&self, run: &mut ClusterRun<'_>, exec: &StepExecutor, target: Target<'_>) {
        let cluster = run.cluster;
        let content = match self.backend.export_kubeconfig(cluster).await {
            Ok(Some(content)) => Ok(content),
            Ok(None) => fetch_admin_kubeconfig(exec, target).await,
            Err(e) => Err(e),
        };
        let saved = match content {
            Ok(c) if c.trim().is_empty() => Err(Error::command_failed(
                "fetch-kubeconfig",
                "admin kubeconfig is empty",
            )),
            Ok(c) => kubeconfig::save(&self.topology.kubernetes.kubeconfig_dir, &cluster.name, &c).await,
            Err(e) => Err(e),
        };
        match saved {
            Ok(path) => {
                info!(cluster = %cluster.name, path = %path.display(), "kubeconfig saved");
                run.kubeconfig = Some(path);
            }
            Err(e) => run.warn(format!("kubeconfig not saved: {}", e)),
        }
    }

    /// API access for the cluster
    ///
    /// kube-rs through the saved kubeconfig when its API server answers from
    /// this host, otherwise kubectl on the bootstrap control-plane.
    async fn cluster_api(&self, run: &ClusterRun<'_>) -> std::result::Result<Box<dyn ClusterApi>, String> {
        let (_, boot) = run.bootstrap()?;
        let addrs = boot
            .addresses
            .as_ref()
            .ok_or_else(|| format!("{} has no address", boot.handle.name))?;

        if let Some(path) = &run.kubeconfig {
            match KubeApi::connect(path).await {
                Ok(api) => return Ok(Box::new(api)),
                Err(e) => debug!(
                    cluster = %run.cluster.name,
                    error = %e,
                    "API server not usable from this host, using kubectl on the control-plane"
                ),
            }
        }
        Ok(Box::new(Kubectl::new(
            self.backend.transport(),
            addrs.management.clone(),
            self.backend.uses_sudo(),
        )))
    }

    fn plugin_context<'a>(
        &'a self,
        run: &'a ClusterRun<'_>,
        api: &'a dyn ClusterApi,
        control_planes: &'a [String],
    ) -> PluginContext<'a> {
        PluginContext {
            cluster: run.cluster,
            api,
            runner: &self.runner,
            settings: &self.settings,
            ovn: &self.ovn,
            mode: self.mode,
            api_endpoint: &run.api_endpoint,
            control_planes,
        }
    }

    async fn cni_installed(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        let plugin = NetworkPlugin::from(run.cluster.cni);
        let api = self.cluster_api(run).await?;
        let control_planes = run.control_plane_names();

        let outcome = plugin
            .install(&self.plugin_context(run, api.as_ref(), &control_planes))
            .await;
        match outcome {
            PluginOutcome::Ready => {
                run.record_cluster(Stage::CniInstalled, Outcome::Success, plugin.name());
                Ok(())
            }
            PluginOutcome::Degraded(warning) => {
                run.record_cluster(Stage::CniInstalled, Outcome::Success, warning.clone());
                run.warn(warning);
                Ok(())
            }
            PluginOutcome::Failed(e) => Err(format!("{} install failed: {}", plugin.name(), e)),
        }
    }

    async fn workers_joined(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        let plugin = NetworkPlugin::from(run.cluster.cni);
        let api = self.cluster_api(run).await?;
        let control_planes = run.control_plane_names();
        let exec = StepExecutor::new(self.backend.transport());
        let workers = run.healthy_of(NodeKind::Worker);

        if self.backend.bootstraps_kubernetes() {
            for idx in &workers {
                run.record_node(
                    Stage::WorkersJoined,
                    *idx,
                    Outcome::Skipped,
                    format!("kubeadm join handled by {}", self.backend.name()),
                );
            }
        }

        let mut results: Vec<(usize, Result<Option<String>>)> = {
            let ctx = self.plugin_context(run, api.as_ref(), &control_planes);
            let (ctx, exec, nodes, join) = (&ctx, &exec, &run.nodes, run.join.as_ref());
            stream::iter(workers)
                .map(move |idx| async move {
                    (idx, self.join_worker(ctx, exec, join, plugin, &nodes[idx]).await)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await
        };
        results.sort_by_key(|(idx, _)| *idx);

        for (idx, result) in results {
            match result {
                Ok(None) => run.record_node(Stage::WorkersJoined, idx, Outcome::Success, "joined"),
                Ok(Some(warning)) => {
                    run.record_node(Stage::WorkersJoined, idx, Outcome::Success, warning.clone());
                    run.warn(warning);
                }
                Err(e) => run.exclude(idx, Stage::WorkersJoined, e.to_string()),
            }
        }
        Ok(())
    }

    /// Join one worker and wait for it; `Ok(Some)` is a soft readiness warning
    async fn join_worker(
        &self,
        ctx: &PluginContext<'_>,
        exec: &StepExecutor,
        join: Option<&JoinToken>,
        plugin: NetworkPlugin,
        entry: &NodeEntry,
    ) -> Result<Option<String>> {
        let (target, _) = entry.resolved()?;
        let name = target.node;

        if !self.backend.bootstraps_kubernetes() {
            let token = join.ok_or_else(|| {
                Error::join_failure(name, "control-plane init produced no join token")
            })?;
            join_node(exec, target, token, false, self.settings.join_timeout).await?;
            info!(cluster = %ctx.cluster.name, node = %name, "node joined");
        }

        match ctx.api.approve_pending_csrs(name).await {
            Ok(0) => {}
            Ok(approved) => info!(node = %name, approved, "approved pending certificate requests"),
            Err(e) => debug!(node = %name, error = %e, "certificate approval skipped"),
        }

        if self.plan.cni {
            plugin.after_worker_join(ctx, name).await?;
        }

        let api = ctx.api;
        let ready = poll(
            &self.settings.node_ready_poll,
            &format!("node {} Ready", name),
            || async move {
                match api.node_ready(name).await {
                    Ok(true) => Check::Ready(()),
                    _ => Check::NotYet,
                }
            },
        )
        .await;
        Ok(ready.err().map(|e| format!("{} joined, but {}", name, e)))
    }

    async fn cluster_verified(&self, run: &mut ClusterRun<'_>) -> StageOutcome {
        let diagnostic = match self.cluster_api(run).await {
            Ok(api) => match api.node_names().await {
                Ok(names) => format!("nodes: {}", names.join(", ")),
                Err(e) => format!("node list unavailable: {}", e),
            },
            Err(reason) => reason,
        };
        info!(cluster = %run.cluster.name, %diagnostic, "cluster verified");
        run.record_cluster(Stage::ClusterVerified, Outcome::Success, diagnostic);
        Ok(())
    }

    /// Run host preparation on one existing node outside a bring-up
    ///
    /// Only meaningful where this tool installs the node software itself;
    /// backends that bootstrap Kubernetes ship prepared nodes.
    pub async fn install_software(&self, node: &str) -> Result<()> {
        if self.backend.bootstraps_kubernetes() {
            return Err(Error::config(format!(
                "{} nodes ship with their software installed",
                self.backend.name()
            )));
        }
        for cluster in &self.topology.kubernetes.clusters {
            let nodes = self.backend.nodes(cluster).await?;
            let Some(handle) = nodes.into_iter().find(|n| n.name == node) else {
                continue;
            };
            let mut entry = NodeEntry::new(handle);
            entry.addresses = Some(self.await_reachable(&entry.handle).await?);
            let exec = StepExecutor::new(self.backend.transport());
            self.prepare_host(&exec, cluster, &entry).await?;
            info!(node = %node, cluster = %cluster.name, "software installed");
            return Ok(());
        }
        Err(Error::config(format!("node {} is not part of any cluster", node)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::backend::MockProvisioningBackend;
    use crate::cni::testing::{pods_ready, pods_starting};
    use crate::host::SystemRunner;
    use crate::report::{exit_code, ClusterStatus};
    use crate::topology::fixtures::{KIND_TOPOLOGY, VM_TOPOLOGY};
    use crate::transport::testing::{FakeTransport, Reply};
    use crate::transport::RemoteExecutor;

    const JOIN: &str = "kubeadm join 192.168.123.11:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:1234";
    const MASTER: &str = "192.168.120.11";
    const HOST: &str = "192.168.120.12";
    const DPU: &str = "192.168.120.13";

    fn node(name: &str, cluster: &str, kind: NodeKind, mgmt: &str, addr: &str) -> (NodeHandle, NodeAddresses) {
        (
            NodeHandle {
                name: name.into(),
                cluster: cluster.into(),
                kind,
            },
            NodeAddresses {
                management: mgmt.into(),
                cluster: addr.into(),
            },
        )
    }

    fn vm_nodes() -> Vec<(NodeHandle, NodeAddresses)> {
        vec![
            node("master-1", "cluster-1", NodeKind::ControlPlane, MASTER, "192.168.123.11"),
            node("host-1", "cluster-1", NodeKind::Worker, HOST, "192.168.123.12"),
            node("dpu-1", "cluster-1", NodeKind::Worker, DPU, "192.168.123.13"),
        ]
    }

    fn kind_nodes() -> Vec<(NodeHandle, NodeAddresses)> {
        vec![
            node("ovn-control-plane", "ovn", NodeKind::ControlPlane, "ovn-control-plane", "172.18.0.2"),
            node("ovn-worker", "ovn", NodeKind::Worker, "ovn-worker", "172.18.0.3"),
            node("ovn-worker2", "ovn", NodeKind::Worker, "ovn-worker2", "172.18.0.4"),
        ]
    }

    fn backend(
        fake: Arc<FakeTransport>,
        nodes: Vec<(NodeHandle, NodeAddresses)>,
        bootstraps: bool,
    ) -> MockProvisioningBackend {
        let mut b = existing_backend(fake, nodes, bootstraps);
        b.expect_create_substrate().returning(|_| Ok(()));
        b
    }

    /// Backend whose substrate is already deployed
    fn existing_backend(
        fake: Arc<FakeTransport>,
        nodes: Vec<(NodeHandle, NodeAddresses)>,
        bootstraps: bool,
    ) -> MockProvisioningBackend {
        let transport: Arc<dyn RemoteExecutor> = fake;
        let addresses: HashMap<String, NodeAddresses> = nodes
            .iter()
            .map(|(h, a)| (h.name.clone(), a.clone()))
            .collect();
        let handles: Vec<NodeHandle> = nodes.into_iter().map(|(h, _)| h).collect();

        let mut b = MockProvisioningBackend::new();
        b.expect_name().return_const(if bootstraps { "kind" } else { "libvirt" });
        b.expect_transport().returning(move || transport.clone());
        b.expect_bootstraps_kubernetes().return_const(bootstraps);
        b.expect_uses_sudo().return_const(!bootstraps);
        b.expect_nodes().returning(move |_| Ok(handles.clone()));
        b.expect_node_addresses()
            .returning(move |n| Ok(addresses.get(&n.name).cloned()));
        b.expect_export_kubeconfig().returning(move |_| {
            Ok(bootstraps.then(|| "apiVersion: v1\nkind: Config\n".to_string()))
        });
        b
    }

    fn orchestrator(topology: &str, backend: MockProvisioningBackend, kubeconfigs: &Path) -> Orchestrator {
        let mut topology = Topology::from_yaml(topology).unwrap();
        topology.kubernetes.kubeconfig_dir = kubeconfigs.to_path_buf();
        Orchestrator::new(Arc::new(topology), Arc::new(backend), Arc::new(SystemRunner))
            .unwrap()
            .with_settings(OrchestratorSettings::fast())
    }

    /// Transport on which every VM prepares, initializes and joins cleanly
    fn healthy_transport() -> Arc<FakeTransport> {
        let fake = Arc::new(FakeTransport::new());
        fake.on("cat /etc/os-release", Reply::Ok("NAME=Fedora\nID=fedora\n".into()));
        fake.on("token create --print-join-command", Reply::Ok(JOIN.into()));
        fake.on("cat /etc/kubernetes/admin.conf", Reply::Ok("apiVersion: v1\nkind: Config\n".into()));
        fake.on("get pods", Reply::Ok(pods_ready()));
        fake.on("type==\"Ready\"", Reply::Ok("True".into()));
        fake.on("get nodes -o jsonpath", Reply::Ok("master-1 host-1".into()));
        fake
    }

    mod cluster_bring_up_flow {
        use super::*;

        /// Story: every node healthy, the cluster walks all seven stages
        #[tokio::test]
        async fn clean_vm_run_reaches_verified() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path());

            let reports = orch.run(None).await.unwrap();
            let report = &reports[0];

            assert_eq!(report.state, ClusterState::Reached(Stage::ClusterVerified));
            assert_eq!(report.status(), ClusterStatus::Succeeded, "{:?}", report.warnings);
            assert_eq!(exit_code(&reports), 0);
            assert_eq!(fake.count(MASTER, "--apiserver-advertise-address=192.168.123.11"), 1);
            assert_eq!(fake.count(HOST, "kubeadm join 192.168.123.11:6443"), 1);
            assert_eq!(fake.count(DPU, "kubeadm join 192.168.123.11:6443"), 1);
            assert_eq!(fake.count(MASTER, "kubeadm join"), 0);

            let verified = report.stages.last().unwrap();
            assert_eq!(verified.stage, Stage::ClusterVerified);
            assert_eq!(verified.diagnostic, "nodes: master-1, host-1");

            let saved = dir.path().join("cluster-1.kubeconfig");
            let mode = std::fs::metadata(&saved).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        /// Story: one worker never answers; the cluster still comes up without it
        #[tokio::test]
        async fn unreachable_worker_is_degraded_not_fatal() {
            let fake = healthy_transport();
            fake.on_node(DPU, "", Reply::Unreachable);
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path());

            let reports = orch.run(None).await.unwrap();
            let report = &reports[0];

            assert_eq!(report.state, ClusterState::Reached(Stage::ClusterVerified));
            assert_eq!(report.status(), ClusterStatus::Degraded);
            assert!(matches!(
                report.node("dpu-1").unwrap().status,
                NodeStatus::Excluded { stage: Stage::NodesReachable, .. }
            ));
            assert_eq!(report.node("host-1").unwrap().status, NodeStatus::Healthy);
            assert_eq!(fake.count(HOST, "kubeadm join"), 1);
            assert_eq!(fake.count(DPU, "cat /etc/os-release"), 0);
            assert_eq!(fake.count(DPU, "kubeadm join"), 0);
            assert_eq!(exit_code(&reports), 1);
        }

        /// Story: the bootstrap control-plane cannot be prepared, nobody joins
        #[tokio::test]
        async fn control_plane_prep_failure_fails_cluster() {
            let fake = healthy_transport();
            fake.on_node(
                MASTER,
                "modprobe",
                Reply::Fail("modprobe: FATAL: Module br_netfilter not found".into()),
            );
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path());

            let report = orch.run(None).await.unwrap().remove(0);

            match &report.state {
                ClusterState::Failed { stage, reason } => {
                    assert_eq!(*stage, Stage::HostsPrepared);
                    assert!(reason.contains("master-1"));
                    assert!(reason.contains("br_netfilter"));
                }
                other => panic!("expected failure, got {}", other),
            }
            assert_eq!(report.status(), ClusterStatus::Failed);
            assert_eq!(fake.count_any("kubeadm init"), 0);
            assert_eq!(fake.count_any("kubeadm join"), 0);
            assert!(report.stages.iter().all(|s| s.stage <= Stage::HostsPrepared));
        }

        /// Story: a worker's join fails; it is excluded and the cluster carries on
        #[tokio::test]
        async fn join_failure_excludes_worker() {
            let fake = healthy_transport();
            fake.on_node(HOST, "kubeadm join", Reply::Fail("error execution phase preflight".into()));
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path());

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified());
            match &report.node("host-1").unwrap().status {
                NodeStatus::Excluded { stage, reason } => {
                    assert_eq!(*stage, Stage::WorkersJoined);
                    assert!(reason.contains("failed to join"));
                }
                other => panic!("expected exclusion, got {:?}", other),
            }
            assert_eq!(report.node("dpu-1").unwrap().status, NodeStatus::Healthy);
        }

        /// Story: the backend cannot build the substrate, nothing else runs
        #[tokio::test]
        async fn substrate_failure_is_fatal() {
            let mut b = MockProvisioningBackend::new();
            b.expect_name().return_const("libvirt");
            b.expect_create_substrate()
                .returning(|c| Err(Error::substrate(&c.name, "network k8s-net failed to start")));
            b.expect_nodes().never();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, b, dir.path());

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(matches!(
                report.state,
                ClusterState::Failed { stage: Stage::SubstrateReady, ref reason } if reason.contains("k8s-net")
            ));
            assert_eq!(report.stages.len(), 1);
        }

        /// Story: kind brings its own Kubernetes; only readiness work remains
        #[tokio::test]
        async fn kind_skips_kubeadm_stages() {
            let fake = Arc::new(FakeTransport::new());
            fake.on("type==\"Ready\"", Reply::Ok("True".into()));
            fake.on("get nodes -o jsonpath", Reply::Ok(String::new()));
            let dir = tempfile::tempdir().unwrap();
            let topology = KIND_TOPOLOGY.replace("ovn-kubernetes", "kindnet");
            let orch = orchestrator(&topology, backend(fake.clone(), kind_nodes(), true), dir.path());

            let report = orch.run(Some("ovn")).await.unwrap().remove(0);

            assert_eq!(report.status(), ClusterStatus::Succeeded);
            for stage in [Stage::HostsPrepared, Stage::ControlPlaneInitialized] {
                assert!(report
                    .stages
                    .iter()
                    .any(|s| s.stage == stage && s.outcome == Outcome::Skipped));
            }
            assert_eq!(
                report
                    .stages
                    .iter()
                    .filter(|s| s.stage == Stage::WorkersJoined && s.outcome == Outcome::Skipped)
                    .count(),
                2
            );
            assert_eq!(fake.count_any("kubeadm"), 0);
            assert!(fake
                .calls()
                .iter()
                .filter(|c| c.command.contains("kubectl"))
                .all(|c| !c.command.starts_with("sudo")));
            assert!(dir.path().join("ovn.kubeconfig").exists());
        }
    }

    mod ovn_on_vms {
        use super::*;

        const MANIFESTS: &[&str] = &[
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
            "ovn-setup.yaml",
            "rbac-ovnkube-identity.yaml",
            "rbac-ovnkube-cluster-manager.yaml",
            "rbac-ovnkube-master.yaml",
            "rbac-ovnkube-node.yaml",
            "rbac-ovnkube-db.yaml",
            "ovnkube-identity.yaml",
            "ovnkube-db.yaml",
            "ovnkube-master.yaml",
            "ovnkube-node.yaml",
        ];

        fn links(management: &str, cluster: &str) -> String {
            format!(
                r#"[{{"ifname":"enp1s0","addr_info":[{{"local":"{}"}}]}},{{"ifname":"enp2s0","addr_info":[{{"local":"{}"}}]}}]"#,
                management, cluster
            )
        }

        /// VM topology running OVN-Kubernetes from manifests in `dir`
        fn topology(dir: &Path) -> String {
            let manifests = dir.join("yaml");
            std::fs::create_dir_all(&manifests).unwrap();
            for name in MANIFESTS {
                std::fs::write(
                    manifests.join(name),
                    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n", name),
                )
                .unwrap();
            }
            format!(
                "{}ovn:\n  manifest_dir: {}\n",
                VM_TOPOLOGY.replace("cni: flannel", "cni: ovn-kubernetes"),
                manifests.display()
            )
        }

        fn transport() -> Arc<FakeTransport> {
            let fake = healthy_transport();
            for (node, cluster) in [
                (MASTER, "192.168.123.11"),
                (HOST, "192.168.123.12"),
                (DPU, "192.168.123.13"),
            ] {
                fake.on_node(node, "ip -j addr show", Reply::Ok(links(node, cluster)));
            }
            fake
        }

        /// Story: br-ex exists on every node before kubeadm init runs
        #[tokio::test]
        async fn external_bridge_precedes_control_plane_init() {
            let fake = transport();
            let dir = tempfile::tempdir().unwrap();
            let topology = topology(dir.path());
            let orch = orchestrator(&topology, backend(fake.clone(), vm_nodes(), false), dir.path());

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified(), "{}", report.state);
            let calls = fake.calls();
            let init = calls
                .iter()
                .position(|c| c.command.contains("kubeadm init"))
                .unwrap();
            for addr in [MASTER, HOST, DPU] {
                let bridge = calls
                    .iter()
                    .position(|c| c.address == addr && c.command.contains("IF=enp2s0"))
                    .unwrap_or_else(|| panic!("no br-ex on {}", addr));
                assert!(bridge < init, "br-ex on {} ran after kubeadm init", addr);
            }
            assert_eq!(fake.count_any("delete daemonset/kube-proxy"), 1);
        }

        /// Story: ovnkube-node never becomes ready on one worker; it is dropped
        /// and the rest of the cluster still verifies
        #[tokio::test]
        async fn worker_without_ready_ovnkube_node_is_excluded() {
            let fake = transport();
            fake.on("spec.nodeName=dpu-1", Reply::Ok(pods_starting()));
            let dir = tempfile::tempdir().unwrap();
            let topology = topology(dir.path());
            let orch = orchestrator(&topology, backend(fake.clone(), vm_nodes(), false), dir.path());

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified(), "{}", report.state);
            assert_eq!(report.status(), ClusterStatus::Degraded);
            match &report.node("dpu-1").unwrap().status {
                NodeStatus::Excluded { stage, reason } => {
                    assert_eq!(*stage, Stage::WorkersJoined);
                    assert!(reason.contains("failed to join"), "{}", reason);
                    assert!(reason.contains("ovnkube-node"), "{}", reason);
                }
                other => panic!("expected exclusion, got {:?}", other),
            }
            assert_eq!(report.node("host-1").unwrap().status, NodeStatus::Healthy);
            assert_eq!(fake.count(DPU, "kubeadm join"), 1);
        }
    }

    mod run_plan {
        use super::*;

        #[test]
        fn skips_follow_flags() {
            let plan = RunPlan {
                kubernetes: false,
                ..RunPlan::default()
            };
            assert_eq!(plan.skip_reason(Stage::SubstrateReady), None);
            assert_eq!(plan.skip_reason(Stage::NodesReachable), None);
            for stage in &Stage::ALL[2..] {
                assert!(plan.skip_reason(*stage).is_some(), "{}", stage);
            }

            let plan = RunPlan {
                cni: false,
                ..RunPlan::default()
            };
            assert!(plan.skip_reason(Stage::CniInstalled).is_some());
            assert_eq!(plan.skip_reason(Stage::WorkersJoined), None);
            assert!(Stage::ALL
                .iter()
                .all(|s| RunPlan::default().skip_reason(*s).is_none()));
        }

        /// Story: deploy-only run brings nodes up and touches no Kubernetes
        #[tokio::test]
        async fn kubernetes_skipped_stops_after_reachability() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path())
                .with_plan(RunPlan {
                    kubernetes: false,
                    ..RunPlan::default()
                });

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified());
            assert_eq!(fake.count_any("cat /etc/os-release"), 0);
            assert_eq!(fake.count_any("kubeadm"), 0);
            assert!(report
                .stages
                .iter()
                .any(|s| s.stage == Stage::CniInstalled && s.outcome == Outcome::Skipped));
        }

        /// Story: existing VMs are reused when deployment is skipped
        #[tokio::test]
        async fn deploy_skipped_reuses_nodes() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let mut b = existing_backend(fake.clone(), vm_nodes(), false);
            b.expect_create_substrate().never();
            let orch = orchestrator(VM_TOPOLOGY, b, dir.path()).with_plan(RunPlan {
                deploy: false,
                ..RunPlan::default()
            });

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified());
            assert_eq!(fake.count_any("kubeadm join"), 2);
        }

        /// Story: with CNI skipped, workers still join but no plugin runs
        #[tokio::test]
        async fn cni_skipped_still_joins_workers() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path())
                .with_plan(RunPlan {
                    cni: false,
                    ..RunPlan::default()
                });

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified());
            assert_eq!(fake.count_any("kube-flannel"), 0);
            assert_eq!(fake.count_any("kubeadm join"), 2);
        }
    }

    mod install_software {
        use super::*;

        #[tokio::test]
        async fn prepares_only_the_named_node() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path());

            orch.install_software("host-1").await.unwrap();

            assert_eq!(fake.count(HOST, "cat /etc/os-release"), 1);
            assert_eq!(fake.count(MASTER, "cat /etc/os-release"), 0);
            assert_eq!(fake.count_any("kubeadm"), 0);
        }

        #[tokio::test]
        async fn unknown_node_is_rejected() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake, vm_nodes(), false), dir.path());
            let err = orch.install_software("ghost").await.unwrap_err();
            assert!(err.to_string().contains("not part of any cluster"));
        }

        #[tokio::test]
        async fn kind_nodes_need_no_install() {
            let fake = Arc::new(FakeTransport::new());
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(KIND_TOPOLOGY, backend(fake.clone(), kind_nodes(), true), dir.path());
            assert!(orch.install_software("ovn-worker").await.is_err());
            assert!(fake.calls().is_empty());
        }
    }

    mod scheduling {
        use super::*;

        #[tokio::test]
        async fn parallel_mode_processes_every_node() {
            let fake = healthy_transport();
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, backend(fake.clone(), vm_nodes(), false), dir.path())
                .with_parallelism(3);

            let report = orch.run(None).await.unwrap().remove(0);

            assert!(report.state.is_verified());
            for addr in [MASTER, HOST, DPU] {
                assert_eq!(fake.count(addr, "cat /etc/os-release"), 1, "{}", addr);
            }
            assert_eq!(fake.count_any("kubeadm join"), 2);
            // stage log stays in node order regardless of completion order
            let reachable: Vec<_> = report
                .stages
                .iter()
                .filter(|s| s.stage == Stage::NodesReachable)
                .map(|s| s.scope.clone())
                .collect();
            assert_eq!(
                reachable,
                ["master-1", "host-1", "dpu-1"].map(|n| Scope::Node(n.to_string()))
            );
        }

        #[tokio::test]
        async fn unknown_cluster_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(VM_TOPOLOGY, MockProvisioningBackend::new(), dir.path());
            let err = orch.run(Some("nope")).await.unwrap_err();
            assert!(err.to_string().contains("nope"));
        }
    }
}
