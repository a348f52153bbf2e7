//! dpusim - bring up simulated host/DPU Kubernetes clusters

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dpusim::backend::{self, ProvisioningBackend};
use dpusim::container::ContainerEngine;
use dpusim::host::{check_prerequisites, CommandRunner, SystemRunner};
use dpusim::image::OvnImageBuild;
use dpusim::naming::derive_link_name;
use dpusim::orchestrator::{Orchestrator, RunPlan};
use dpusim::registry::Registry;
use dpusim::report::{exit_code, render_summary};
use dpusim::teardown::teardown;
use dpusim::topology::{CniKind, DeploymentMode, Topology};

/// dpusim - simulated host/DPU Kubernetes clusters on libvirt VMs or kind nodes
#[derive(Parser, Debug)]
#[command(name = "dpusim", version, about, long_about = None)]
struct Cli {
    /// Topology file
    #[arg(short, long, env = "DPUSIM_CONFIG", default_value = "topology.yaml", global = true)]
    config: PathBuf,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the substrate and bring up every cluster
    Up(UpArgs),

    /// Tear everything down and remove saved kubeconfigs
    Down,

    /// Install node software or the network plugin on existing nodes
    InstallSoftware(InstallArgs),

    /// Load and validate the topology, then print the derived links
    Validate,

    /// Print the bridge name derived for a host/DPU pair
    LinkName {
        /// Host VM name
        host: String,
        /// DPU VM name
        dpu: String,
    },
}

/// Arguments for `up`
#[derive(Parser, Debug)]
struct UpArgs {
    /// Keep whatever already exists instead of tearing it down first
    #[arg(long)]
    skip_cleanup: bool,

    /// Nodes of one cluster worked on concurrently
    #[arg(long)]
    parallel: Option<usize>,

    /// Only bring up this cluster
    #[arg(long)]
    cluster: Option<String>,

    /// Leave resources in place after an interrupt or a run error
    #[arg(long)]
    keep_on_failure: bool,

    /// Do not check for required host tools
    #[arg(long)]
    skip_deps: bool,

    /// Reuse existing networks and nodes instead of creating them
    #[arg(long)]
    skip_deploy: bool,

    /// Stop once nodes are reachable; no Kubernetes or network plugin
    #[arg(long)]
    skip_k8s: bool,
}

impl UpArgs {
    fn plan(&self) -> RunPlan {
        RunPlan {
            deploy: !self.skip_deploy,
            kubernetes: !self.skip_k8s,
            cni: !self.skip_k8s,
        }
    }
}

/// Arguments for `install-software`
#[derive(Parser, Debug)]
struct InstallArgs {
    /// Only this VM
    #[arg(long)]
    vm: Option<String>,

    /// Leave the network plugin alone
    #[arg(long)]
    skip_cni: bool,

    /// Only nodes of this cluster
    #[arg(long)]
    cluster: Option<String>,

    /// Install on all selected VMs at once
    #[arg(short, long)]
    parallel: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Up(args) => {
            let code = run_up(&cli.config, args).await?;
            std::process::exit(code);
        }
        Commands::Down => run_down(&cli.config).await,
        Commands::InstallSoftware(args) => {
            let code = run_install_software(&cli.config, args).await?;
            std::process::exit(code);
        }
        Commands::Validate => run_validate(&cli.config),
        Commands::LinkName { host, dpu } => {
            println!("{}", derive_link_name(&host, &dpu));
            Ok(())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Arc<Topology>> {
    let topology = Topology::load(path)
        .with_context(|| format!("loading topology {}", path.display()))?;
    Ok(Arc::new(topology))
}

type Handles = (Arc<Topology>, Arc<dyn CommandRunner>, Arc<dyn ProvisioningBackend>);

fn setup(path: &Path) -> anyhow::Result<Handles> {
    let topology = load(path)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let backend = backend::for_topology(topology.clone(), runner.clone())?;
    Ok((topology, runner, backend))
}

/// Full bring-up; returns the process exit status
async fn run_up(path: &Path, args: UpArgs) -> anyhow::Result<i32> {
    let (topology, runner, backend) = setup(path)?;
    if args.skip_deps {
        info!("skipping dependency check");
    } else {
        check_prerequisites(runner.as_ref(), &backend.required_tools()).await?;
    }

    let plan = args.plan();
    if !args.skip_cleanup && plan.deploy {
        info!("removing leftovers from earlier runs");
        if let Err(e) = teardown(backend.as_ref(), &topology).await {
            warn!(error = %e, "pre-run cleanup incomplete");
        }
    }

    if plan.cni && topology.has_registry() {
        setup_registry(&topology, runner.clone()).await?;
    }

    let mut orchestrator =
        Orchestrator::new(topology.clone(), backend.clone(), runner)?.with_plan(plan);
    if let Some(parallel) = args.parallel {
        orchestrator = orchestrator.with_parallelism(parallel);
    }

    let result = tokio::select! {
        result = orchestrator.run(args.cluster.as_deref()) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let reports = match result {
        Some(Ok(reports)) => reports,
        Some(Err(e)) => {
            error!(error = %e, "bring-up aborted");
            best_effort_teardown(backend.as_ref(), &topology, args.keep_on_failure).await;
            return Err(e.into());
        }
        None => {
            warn!("interrupted");
            best_effort_teardown(backend.as_ref(), &topology, args.keep_on_failure).await;
            return Ok(130);
        }
    };

    print!("{}", render_summary(&reports));
    Ok(exit_code(&reports))
}

/// Start the local registry and push every image it lists
async fn setup_registry(topology: &Topology, runner: Arc<dyn CommandRunner>) -> anyhow::Result<()> {
    let Some(settings) = topology.registry.clone() else {
        return Ok(());
    };
    let engine = ContainerEngine::detect(runner.clone(), settings.engine).await?;
    let registry = Registry::new(engine.clone(), settings)?;
    let ovn = &topology.ovn;

    registry
        .setup_all(|image| {
            let engine = engine.clone();
            let runner = runner.clone();
            async move {
                match (image.cni, &ovn.repo_path) {
                    (Some(CniKind::OvnKubernetes), Some(repo)) => {
                        OvnImageBuild::new(engine, runner, repo.clone())
                            .build(&image.tag, ovn.ovn_git_ref.as_deref())
                            .await?;
                        Ok(image.tag)
                    }
                    _ => Err(dpusim::Error::config(
                        "building the OVN-Kubernetes image needs ovn.repo_path",
                    )),
                }
            }
        })
        .await?;

    if topology.mode()? == DeploymentMode::Kind {
        // the network exists only once a kind cluster has been created
        if let Err(e) = registry.connect_to_kind_network().await {
            warn!(error = %e, "registry not attached to the kind network");
        }
    }
    Ok(())
}

/// Prepare existing nodes or install the network plugin on existing clusters
async fn run_install_software(path: &Path, args: InstallArgs) -> anyhow::Result<i32> {
    let (topology, runner, backend) = setup(path)?;
    check_prerequisites(runner.as_ref(), &backend.required_tools()).await?;

    if topology.mode()? == DeploymentMode::Kind {
        if args.skip_cni {
            info!("skipping network plugin installation");
            return Ok(0);
        }
        if topology.has_registry() {
            setup_registry(&topology, runner.clone()).await?;
        }
        let plan = RunPlan {
            deploy: false,
            ..RunPlan::default()
        };
        let orchestrator = Orchestrator::new(topology, backend, runner)?.with_plan(plan);
        let reports = orchestrator.run(args.cluster.as_deref()).await?;
        print!("{}", render_summary(&reports));
        return Ok(exit_code(&reports));
    }

    let names: Vec<String> = match &args.vm {
        Some(vm) => vec![vm.clone()],
        None => topology
            .vms
            .iter()
            .filter(|vm| match (&args.cluster, &vm.k8s_cluster) {
                (Some(only), Some(cluster)) => only == cluster,
                (Some(_), None) => false,
                (None, _) => vm.k8s_cluster.is_some(),
            })
            .map(|vm| vm.name.clone())
            .collect(),
    };
    let orchestrator = Orchestrator::new(topology, backend, runner)?;
    if args.parallel {
        futures::future::try_join_all(names.iter().map(|n| orchestrator.install_software(n))).await?;
    } else {
        for name in &names {
            orchestrator.install_software(name).await?;
        }
    }
    println!("software installed on {} node(s)", names.len());
    Ok(0)
}

async fn best_effort_teardown(backend: &dyn ProvisioningBackend, topology: &Topology, keep: bool) {
    if keep {
        info!("keeping resources for inspection");
        return;
    }
    if let Err(e) = teardown(backend, topology).await {
        warn!(error = %e, "cleanup after abnormal exit incomplete");
    }
}

async fn run_down(path: &Path) -> anyhow::Result<()> {
    let (topology, runner, backend) = setup(path)?;
    check_prerequisites(runner.as_ref(), &backend.required_tools()).await?;
    teardown(backend.as_ref(), &topology).await?;
    if let Some(settings) = topology.registry.clone().filter(|_| topology.has_registry()) {
        let engine = ContainerEngine::detect(runner, settings.engine).await?;
        Registry::new(engine, settings)?.stop().await?;
    }
    Ok(())
}

fn run_validate(path: &Path) -> anyhow::Result<()> {
    let topology = load(path)?;
    println!("topology {} is valid ({} mode)", path.display(), topology.mode()?);
    for cluster in &topology.kubernetes.clusters {
        println!(
            "cluster {}: cni {}, pods {}, services {}",
            cluster.name, cluster.cni, cluster.pod_cidr, cluster.service_cidr
        );
    }
    for link in topology.pairing_links() {
        println!(
            "link {} <-> {}: network {}, bridge {}",
            link.host, link.dpu, link.network_name, link.bridge_name
        );
    }
    Ok(())
}
