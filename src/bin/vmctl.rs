//! vmctl - list, power-cycle and reach the VMs of a dpusim topology

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dpusim::backend;
use dpusim::host::{CommandRunner, SystemRunner};
use dpusim::topology::Topology;
use dpusim::vmctl::{render_list, VmControl};

/// vmctl - day-two control of dpusim VMs
#[derive(Parser, Debug)]
#[command(name = "vmctl", version, about, long_about = None)]
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
    /// Show state, address and size of every declared VM
    List,
    /// Open an interactive shell on a VM
    Ssh {
        /// VM name
        vm: String,
    },
    /// Start a stopped VM
    Start {
        /// VM name
        vm: String,
    },
    /// Shut a VM down gracefully
    Stop {
        /// VM name
        vm: String,
    },
    /// Power a VM off immediately
    Destroy {
        /// VM name
        vm: String,
    },
    /// Reboot a running VM
    Reboot {
        /// VM name
        vm: String,
    },
    /// Run a command on a VM
    Exec {
        /// VM name
        vm: String,
        /// Command and its arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let topology = Arc::new(
        Topology::load(&cli.config)
            .with_context(|| format!("loading topology {}", cli.config.display()))?,
    );
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let backend = backend::for_topology(topology.clone(), runner.clone())?;
    let vms = VmControl::new(topology, runner, backend)?;

    match cli.command {
        Commands::List => print!("{}", render_list(&vms.list().await?)),
        Commands::Start { vm } => {
            vms.start(&vm).await?;
            println!("VM {} started", vm);
        }
        Commands::Stop { vm } => {
            vms.stop(&vm).await?;
            println!("VM {} is shutting down", vm);
        }
        Commands::Destroy { vm } => {
            vms.destroy(&vm).await?;
            println!("VM {} powered off", vm);
        }
        Commands::Reboot { vm } => {
            vms.reboot(&vm).await?;
            println!("VM {} is rebooting", vm);
        }
        Commands::Ssh { vm } => {
            let ssh_args = vms.ssh_args(&vm).await?;
            let status = tokio::process::Command::new("ssh")
                .args(&ssh_args)
                .status()
                .await
                .context("starting ssh")?;
            std::process::exit(status.code().unwrap_or(1));
        }
        Commands::Exec { vm, command } => {
            let out = vms.exec(&vm, &command.join(" ")).await?;
            print!("{}", out.stdout);
            eprint!("{}", out.stderr);
            std::process::exit(out.exit_code);
        }
    }
    Ok(())
}
