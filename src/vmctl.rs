//! Day-two control of topology VMs
//!
//! Backs the `vmctl` binary: listing, power operations through `virsh`, and
//! running commands or logging in over the same SSH identity a bring-up uses.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::{NodeAddresses, NodeHandle, NodeKind, ProvisioningBackend};
use crate::host::{args, CommandOutput, CommandRunner};
use crate::poll::{poll, Check, PollConfig};
use crate::topology::{DeploymentMode, Topology, VmRole, VmSpec};
use crate::transport::SshTransport;
use crate::{Error, Result};

/// How long `ssh` and `exec` wait for a VM to report its address
const ADDRESS_WAIT: PollConfig = PollConfig::new(Duration::from_secs(2), 5);

/// Timeout for a command run through `exec`
const EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// Domain facts shown by `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Domain name
    pub name: String,
    /// `virsh domstate` wording, e.g. `running` or `shut off`
    pub state: String,
    /// Management address when a lease exists
    pub address: Option<String>,
    /// Virtual CPUs
    pub vcpus: u32,
    /// Maximum memory in MiB
    pub memory_mib: u64,
}

/// One `list` row; `None` when the domain is not defined
pub type VmRow = (String, Option<VmInfo>);

/// Parse `virsh dominfo` into (state, vcpus, memory MiB)
fn parse_dominfo(out: &str) -> (String, u32, u64) {
    let mut state = String::new();
    let mut vcpus = 0;
    let mut memory = 0;
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "State" => state = value.to_string(),
            "CPU(s)" => vcpus = value.parse().unwrap_or(0),
            "Max memory" => {
                let kib: u64 = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                memory = kib / 1024;
            }
            _ => {}
        }
    }
    (state, vcpus, memory)
}

/// libvirt counts every state except these as active
fn is_active(state: &str) -> bool {
    !matches!(state, "shut off" | "crashed" | "")
}

/// Render the `list` table
pub fn render_list(rows: &[VmRow]) -> String {
    let mut out = format!(
        "{:<20} {:<15} {:<15} {:<8} {:<10}\n{}\n",
        "VM Name",
        "State",
        "IP Address",
        "vCPUs",
        "Memory",
        "-".repeat(80)
    );
    for (name, info) in rows {
        let line = match info {
            Some(info) => format!(
                "{:<20} {:<15} {:<15} {:<8} {}MB\n",
                info.name,
                info.state,
                info.address.as_deref().unwrap_or("N/A"),
                info.vcpus,
                info.memory_mib
            ),
            None => format!(
                "{:<20} {:<15} {:<15} {:<8} {:<10}\n",
                name, "Not Found", "N/A", "N/A", "N/A"
            ),
        };
        out.push_str(&line);
    }
    out
}

/// Lifecycle and access for the VMs a topology declares
pub struct VmControl {
    topology: Arc<Topology>,
    runner: Arc<dyn CommandRunner>,
    backend: Arc<dyn ProvisioningBackend>,
    ssh: SshTransport,
}

impl VmControl {
    /// Control the VMs of a VM-mode topology
    pub fn new(
        topology: Arc<Topology>,
        runner: Arc<dyn CommandRunner>,
        backend: Arc<dyn ProvisioningBackend>,
    ) -> Result<Self> {
        if topology.mode()? != DeploymentMode::Vm {
            return Err(Error::config("vmctl needs a topology that declares vms"));
        }
        let ssh = SshTransport::new(
            runner.clone(),
            topology.ssh.user.clone(),
            topology.ssh.resolved_key_path(),
        );
        Ok(Self {
            topology,
            runner,
            backend,
            ssh,
        })
    }

    async fn virsh(&self, virsh_args: Vec<String>) -> Result<CommandOutput> {
        let mut full = args(["-c", &self.topology.libvirt.uri]);
        full.extend(virsh_args);
        self.runner.run("virsh", full, None).await
    }

    async fn virsh_ok(&self, vm: &str, virsh_args: Vec<String>) -> Result<()> {
        let command = format!("virsh {}", virsh_args.join(" "));
        let out = self.virsh(virsh_args).await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::vm(vm, format!("{}: {}", command, out.diagnostic())))
        }
    }

    fn spec(&self, name: &str) -> Result<&VmSpec> {
        self.topology
            .vm(name)
            .ok_or_else(|| Error::config(format!("vm {} is not declared in the topology", name)))
    }

    fn handle(vm: &VmSpec) -> NodeHandle {
        NodeHandle {
            name: vm.name.clone(),
            cluster: vm.k8s_cluster.clone().unwrap_or_else(|| "shared".to_string()),
            kind: match vm.k8s_role {
                Some(VmRole::Master) => NodeKind::ControlPlane,
                _ => NodeKind::Worker,
            },
        }
    }

    /// Current domain state
    pub async fn state(&self, name: &str) -> Result<String> {
        let out = self.virsh(args(["domstate", name])).await?;
        if !out.success() {
            return Err(Error::vm(name, format!("not defined: {}", out.diagnostic())));
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Facts about one domain, `None` when it is not defined
    pub async fn info(&self, name: &str) -> Result<Option<VmInfo>> {
        let out = self.virsh(args(["dominfo", name])).await?;
        if !out.success() {
            return Ok(None);
        }
        let (state, vcpus, memory_mib) = parse_dominfo(&out.stdout);
        let address = match self.spec(name) {
            Ok(vm) if is_active(&state) => self
                .backend
                .node_addresses(&Self::handle(vm))
                .await
                .unwrap_or_else(|e| {
                    debug!(vm = %name, error = %e, "address lookup failed");
                    None
                })
                .map(|a| a.management),
            _ => None,
        };
        Ok(Some(VmInfo {
            name: name.to_string(),
            state,
            address,
            vcpus,
            memory_mib,
        }))
    }

    /// Every declared VM in topology order
    pub async fn list(&self) -> Result<Vec<VmRow>> {
        let mut rows = Vec::with_capacity(self.topology.vms.len());
        for vm in &self.topology.vms {
            rows.push((vm.name.clone(), self.info(&vm.name).await?));
        }
        Ok(rows)
    }

    /// Boot a stopped VM
    pub async fn start(&self, name: &str) -> Result<()> {
        if is_active(&self.state(name).await?) {
            return Err(Error::vm(name, "already running"));
        }
        self.virsh_ok(name, args(["start", name])).await?;
        info!(vm = %name, "started");
        Ok(())
    }

    /// Ask the guest to shut down
    pub async fn stop(&self, name: &str) -> Result<()> {
        if !is_active(&self.state(name).await?) {
            return Err(Error::vm(name, "already stopped"));
        }
        self.virsh_ok(name, args(["shutdown", name])).await?;
        info!(vm = %name, "shutting down");
        Ok(())
    }

    /// Power a VM off immediately; a stopped VM is left as is
    pub async fn destroy(&self, name: &str) -> Result<()> {
        if is_active(&self.state(name).await?) {
            self.virsh_ok(name, args(["destroy", name])).await?;
            info!(vm = %name, "force stopped");
        }
        Ok(())
    }

    /// Reboot a running VM
    pub async fn reboot(&self, name: &str) -> Result<()> {
        if !is_active(&self.state(name).await?) {
            return Err(Error::vm(name, "not running"));
        }
        self.virsh_ok(name, args(["reboot", name])).await?;
        info!(vm = %name, "rebooting");
        Ok(())
    }

    /// Management address, waiting briefly for a lease
    pub async fn management_address(&self, name: &str) -> Result<String> {
        let handle = Self::handle(self.spec(name)?);
        let backend = self.backend.as_ref();
        let handle = &handle;
        let addrs: NodeAddresses = poll(&ADDRESS_WAIT, &format!("address of {}", name), || async move {
            Check::from_result(backend.node_addresses(handle).await)
        })
        .await
        .map_err(|e| Error::vm(name, e.to_string()))?;
        Ok(addrs.management)
    }

    /// Run `command` on the VM and return its output
    pub async fn exec(&self, name: &str, command: &str) -> Result<CommandOutput> {
        let address = self.management_address(name).await?;
        self.backend
            .transport()
            .execute(&address, command, EXEC_TIMEOUT)
            .await
    }

    /// `ssh` arguments for an interactive session on the VM
    pub async fn ssh_args(&self, name: &str) -> Result<Vec<String>> {
        let address = self.management_address(name).await?;
        info!(vm = %name, address = %address, user = %self.topology.ssh.user, "connecting");
        Ok(self.ssh.login_args(&address))
    }
}
