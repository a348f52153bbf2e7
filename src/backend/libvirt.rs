//! Hypervisor-backed nodes on libvirt
//!
//! Driven entirely through `virsh`, `qemu-img`, `genisoimage`, `ovs-vsctl`
//! and `wget` so nothing links against libvirt. Networks and cluster-less
//! VMs are shared by every cluster and created once per run; each cluster
//! then creates its own VMs.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{collect_errors, NodeAddresses, NodeHandle, NodeKind, ProvisioningBackend};
use crate::host::{args, CommandOutput, CommandRunner};
use crate::render::{render, DOMAIN_XML, NETWORK_XML, USER_DATA};
use crate::topology::{
    ClusterSpec, NetworkMode, NetworkSpec, NetworkType, Topology, VmRole, VmSpec,
};
use crate::transport::RemoteExecutor;
use crate::{Error, Result};

const SHARED: &str = "shared";

#[derive(Serialize)]
struct Reservation<'a> {
    mac: &'a str,
    name: &'a str,
    ip: String,
}

#[derive(Serialize)]
struct Nic {
    network: String,
    mac: Option<String>,
    model: String,
    ovs: bool,
}

/// [`ProvisioningBackend`] creating KVM guests through virsh
pub struct LibvirtBackend {
    topology: Arc<Topology>,
    runner: Arc<dyn CommandRunner>,
    transport: Arc<dyn RemoteExecutor>,
    shared: OnceCell<()>,
}

impl LibvirtBackend {
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
            shared: OnceCell::new(),
        }
    }

    async fn virsh(&self, mut virsh_args: Vec<String>, stdin: Option<String>) -> Result<CommandOutput> {
        let mut full = args(["-c", &self.topology.libvirt.uri]);
        full.append(&mut virsh_args);
        self.runner.run("virsh", full, stdin).await
    }

    async fn virsh_ok(&self, cluster: &str, virsh_args: Vec<String>, stdin: Option<String>) -> Result<String> {
        let command = format!("virsh {}", virsh_args.join(" "));
        let out = self.virsh(virsh_args, stdin).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(Error::substrate(cluster, format!("{}: {}", command, out.diagnostic())))
        }
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.virsh(args(["net-info", name]), None).await?.success())
    }

    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.virsh(args(["dominfo", name]), None).await?.success())
    }

    fn image_dir(&self) -> &Path {
        &self.topology.libvirt.image_dir
    }

    fn disk_path(&self, vm: &str) -> PathBuf {
        self.image_dir().join(format!("{}.qcow2", vm))
    }

    fn iso_path(&self, vm: &str) -> PathBuf {
        self.image_dir().join(format!("{}-cloud-init.iso", vm))
    }

    // ---- networks ----

    async fn ensure_ovs_bridge(&self, bridge: &str) -> Result<()> {
        let exists = self
            .runner
            .run("ovs-vsctl", args(["br-exists", bridge]), None)
            .await?
            .success();
        if !exists {
            self.runner
                .run("ovs-vsctl", args(["--may-exist", "add-br", bridge]), None)
                .await?
                .into_stdout(&format!("ovs-vsctl add-br {}", bridge))
                .map_err(|e| Error::substrate(SHARED, e.to_string()))?;
            info!(bridge = %bridge, "created OVS bridge");
        }
        self.runner
            .run("ip", args(["link", "set", bridge, "up"]), None)
            .await?
            .into_stdout(&format!("ip link set {} up", bridge))
            .map_err(|e| Error::substrate(SHARED, e.to_string()))?;
        Ok(())
    }

    fn reservations(&self, net: &NetworkSpec) -> Vec<Reservation<'_>> {
        if net.network_type != NetworkType::K8s {
            return Vec::new();
        }
        self.topology
            .vms
            .iter()
            .filter_map(|vm| {
                Some(Reservation {
                    mac: vm.k8s_node_mac.as_deref()?,
                    name: &vm.name,
                    ip: vm.k8s_node_ip?.to_string(),
                })
            })
            .collect()
    }

    fn network_xml(&self, net: &NetworkSpec) -> Result<String> {
        let nat = net.mode == NetworkMode::Nat && net.gateway.is_some();
        render(
            NETWORK_XML,
            &minijinja::context! {
                name => net.name,
                bridge => net.bridge_name,
                nat => nat,
                ovs => net.use_ovs && !nat,
                gateway => net.gateway.map(|g| g.to_string()),
                netmask => net.subnet_mask.map(|m| m.to_string()),
                dhcp_start => net.dhcp_start.map(|a| a.to_string()),
                dhcp_end => net.dhcp_end.map(|a| a.to_string()),
                reservations => self.reservations(net),
            },
        )
    }

    async fn define_network(&self, name: &str, xml: String) -> Result<()> {
        if self.network_exists(name).await? {
            debug!(network = %name, "network exists, skipping");
            return Ok(());
        }
        self.virsh_ok(SHARED, args(["net-define", "/dev/stdin"]), Some(xml))
            .await?;
        self.virsh_ok(SHARED, args(["net-autostart", name]), None)
            .await?;
        let start = self.virsh(args(["net-start", name]), None).await?;
        if !start.success() && !start.stderr.contains("already active") {
            return Err(Error::substrate(
                SHARED,
                format!("virsh net-start {}: {}", name, start.diagnostic()),
            ));
        }
        info!(network = %name, "network started");
        Ok(())
    }

    async fn create_networks(&self) -> Result<()> {
        for net in &self.topology.networks {
            if net.use_ovs && net.mode == NetworkMode::L2Bridge {
                self.ensure_ovs_bridge(&net.bridge_name).await?;
            }
            self.define_network(&net.name, self.network_xml(net)?)
                .await?;
        }
        for link in self.topology.pairing_links() {
            self.ensure_ovs_bridge(&link.bridge_name).await?;
            let xml = render(
                NETWORK_XML,
                &minijinja::context! {
                    name => link.network_name,
                    bridge => link.bridge_name,
                    nat => false,
                    ovs => true,
                },
            )?;
            self.define_network(&link.network_name, xml).await?;
        }
        Ok(())
    }

    // ---- images and VMs ----

    fn base_image(&self) -> PathBuf {
        self.image_dir().join(&self.topology.operating_system.image_name)
    }

    async fn ensure_base_image(&self) -> Result<()> {
        let path = self.base_image();
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let url = self
            .topology
            .operating_system
            .image_url
            .as_deref()
            .ok_or_else(|| {
                Error::substrate(
                    SHARED,
                    format!("{} is missing and no image_url is set", path.display()),
                )
            })?;
        info!(url = %url, "downloading cloud image");
        let dest = path.display().to_string();
        self.runner
            .run("wget", args(["-q", "-O", &dest, url]), None)
            .await?
            .into_stdout(&format!("wget {}", url))
            .map_err(|e| Error::substrate(SHARED, e.to_string()))?;
        Ok(())
    }

    async fn create_disk(&self, vm: &VmSpec, scope: &str) -> Result<PathBuf> {
        let disk = self.disk_path(&vm.name);
        if tokio::fs::try_exists(&disk).await? {
            return Ok(disk);
        }
        let base = self.base_image().display().to_string();
        let target = disk.display().to_string();
        let size = format!("{}G", vm.disk_size);
        self.runner
            .run(
                "qemu-img",
                args(["create", "-f", "qcow2", "-F", "qcow2", "-b", &base, &target, &size]),
                None,
            )
            .await?
            .into_stdout("qemu-img create")
            .map_err(|e| Error::substrate(scope, e.to_string()))?;
        Ok(disk)
    }

    async fn create_cloud_init(&self, vm: &VmSpec, scope: &str) -> Result<PathBuf> {
        let ssh = &self.topology.ssh;
        let pub_key_path = PathBuf::from(format!("{}.pub", ssh.resolved_key_path().display()));
        let ssh_key = tokio::fs::read_to_string(&pub_key_path).await.map_err(|e| {
            Error::substrate(
                scope,
                format!("reading {}: {}", pub_key_path.display(), e),
            )
        })?;

        let user_data = render(
            USER_DATA,
            &minijinja::context! {
                hostname => vm.name,
                user => ssh.user,
                ssh_key => ssh_key.trim(),
                password => ssh.password,
            },
        )?;
        let meta_data = format!("instance-id: {0}\nlocal-hostname: {0}\n", vm.name);

        let dir = tempfile::Builder::new()
            .prefix(&format!("cloud-init-{}-", vm.name))
            .tempdir()?;
        let user_path = dir.path().join("user-data");
        let meta_path = dir.path().join("meta-data");
        tokio::fs::write(&user_path, user_data).await?;
        tokio::fs::write(&meta_path, meta_data).await?;

        let iso = self.iso_path(&vm.name);
        let (iso_s, user_s, meta_s) = (
            iso.display().to_string(),
            user_path.display().to_string(),
            meta_path.display().to_string(),
        );
        self.runner
            .run(
                "genisoimage",
                args([
                    "-output", &iso_s, "-volid", "cidata", "-joliet", "-rock", &user_s, &meta_s,
                ]),
                None,
            )
            .await?
            .into_stdout("genisoimage")
            .map_err(|e| Error::substrate(scope, e.to_string()))?;
        Ok(iso)
    }

    fn interfaces(&self, vm: &VmSpec) -> Vec<Nic> {
        let mut nics: Vec<Nic> = self
            .topology
            .networks
            .iter()
            .filter(|n| n.attaches(vm.vm_type))
            .map(|n| Nic {
                network: n.name.clone(),
                mac: (n.network_type == NetworkType::K8s)
                    .then(|| vm.k8s_node_mac.clone())
                    .flatten(),
                model: n.nic_model.clone(),
                ovs: n.use_ovs && n.mode == NetworkMode::L2Bridge,
            })
            .collect();
        nics.extend(self.topology.links_for(vm).into_iter().map(|l| Nic {
            network: l.network_name,
            mac: None,
            model: "igb".to_string(),
            ovs: true,
        }));
        nics
    }

    fn domain_xml(&self, vm: &VmSpec, disk: &Path, iso: &Path) -> Result<String> {
        render(
            DOMAIN_XML,
            &minijinja::context! {
                name => vm.name,
                memory => vm.memory,
                vcpus => vm.vcpus,
                disk => disk.display().to_string(),
                cloud_init => iso.display().to_string(),
                interfaces => self.interfaces(vm),
            },
        )
    }

    async fn create_vm(&self, vm: &VmSpec, scope: &str) -> Result<()> {
        if self.domain_exists(&vm.name).await? {
            let state = self
                .virsh_ok(scope, args(["domstate", &vm.name]), None)
                .await?;
            if state.trim() == "running" {
                debug!(vm = %vm.name, "domain exists and is running, skipping");
            } else {
                self.virsh_ok(scope, args(["start", &vm.name]), None)
                    .await?;
                info!(vm = %vm.name, state = %state.trim(), "existing domain started");
            }
            return Ok(());
        }
        let disk = self.create_disk(vm, scope).await?;
        let iso = self.create_cloud_init(vm, scope).await?;
        let xml = self.domain_xml(vm, &disk, &iso)?;

        self.virsh_ok(scope, args(["define", "/dev/stdin"]), Some(xml))
            .await?;
        self.virsh_ok(scope, args(["autostart", &vm.name]), None)
            .await?;
        self.virsh_ok(scope, args(["start", &vm.name]), None)
            .await?;
        info!(vm = %vm.name, "domain started");
        Ok(())
    }

    async fn create_shared(&self) -> Result<()> {
        self.create_networks().await?;
        self.ensure_base_image().await?;
        for vm in self.topology.vms.iter().filter(|v| v.k8s_cluster.is_none()) {
            self.create_vm(vm, SHARED).await?;
        }
        Ok(())
    }

    // ---- addresses ----

    fn subnet_of(&self, network_type: NetworkType) -> Option<Ipv4Net> {
        self.topology
            .network_by_type(network_type)
            .and_then(|n| n.subnet())
    }

    // ---- teardown ----

    async fn remove_file(path: &Path, errors: &mut Vec<String>) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push(format!("remove {}: {}", path.display(), e)),
        }
    }

    async fn destroy_vm(&self, name: &str, errors: &mut Vec<String>) -> Result<()> {
        if self.domain_exists(name).await? {
            // a shut-off domain rejects destroy, which is fine
            let _ = self.virsh(args(["destroy", name]), None).await?;
            let out = self
                .virsh(args(["undefine", name, "--nvram"]), None)
                .await?;
            if !out.success() {
                errors.push(format!("virsh undefine {}: {}", name, out.diagnostic()));
            } else {
                info!(vm = %name, "domain removed");
            }
        }
        Self::remove_file(&self.disk_path(name), errors).await;
        Self::remove_file(&self.iso_path(name), errors).await;
        Ok(())
    }

    async fn destroy_network(&self, name: &str, bridge: Option<&str>, errors: &mut Vec<String>) -> Result<()> {
        if self.network_exists(name).await? {
            let _ = self.virsh(args(["net-destroy", name]), None).await?;
            let out = self.virsh(args(["net-undefine", name]), None).await?;
            if !out.success() {
                errors.push(format!("virsh net-undefine {}: {}", name, out.diagnostic()));
            } else {
                info!(network = %name, "network removed");
            }
        }
        if let Some(bridge) = bridge {
            let out = self
                .runner
                .run("ovs-vsctl", args(["--if-exists", "del-br", bridge]), None)
                .await?;
            if !out.success() {
                errors.push(format!("ovs-vsctl del-br {}: {}", bridge, out.diagnostic()));
            }
        }
        Ok(())
    }
}

/// Parse `virsh domifaddr` output into IPv4 addresses
fn parse_domifaddr(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 || cols[2] != "ipv4" {
                return None;
            }
            cols[3].split('/').next()?.parse().ok()
        })
        .collect()
}

fn pick(addrs: &[Ipv4Addr], subnet: Option<Ipv4Net>) -> Option<Ipv4Addr> {
    match subnet {
        Some(net) => addrs.iter().copied().find(|a| net.contains(a)),
        None => addrs.first().copied(),
    }
}

#[async_trait]
impl ProvisioningBackend for LibvirtBackend {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    fn required_tools(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("virsh", "Install libvirt-client (dnf install libvirt-client)"),
            ("qemu-img", "Install qemu-img (dnf install qemu-img)"),
            ("genisoimage", "Install genisoimage (dnf install genisoimage)"),
            ("ovs-vsctl", "Install Open vSwitch (dnf install openvswitch)"),
            ("wget", "Install wget (dnf install wget)"),
        ]
    }

    fn transport(&self) -> Arc<dyn RemoteExecutor> {
        self.transport.clone()
    }

    fn bootstraps_kubernetes(&self) -> bool {
        false
    }

    fn uses_sudo(&self) -> bool {
        true
    }

    async fn create_substrate(&self, cluster: &ClusterSpec) -> Result<()> {
        self.shared
            .get_or_try_init(|| self.create_shared())
            .await?;
        for vm in self.topology.cluster_vms(&cluster.name) {
            self.create_vm(vm, &cluster.name).await?;
        }
        Ok(())
    }

    async fn nodes(&self, cluster: &ClusterSpec) -> Result<Vec<NodeHandle>> {
        let handle = |vm: &VmSpec, kind| NodeHandle {
            name: vm.name.clone(),
            cluster: cluster.name.clone(),
            kind,
        };
        let vms: Vec<&VmSpec> = self.topology.cluster_vms(&cluster.name).collect();
        let mut nodes: Vec<NodeHandle> = vms
            .iter()
            .filter(|v| v.k8s_role == Some(VmRole::Master))
            .map(|v| handle(v, NodeKind::ControlPlane))
            .collect();
        nodes.extend(
            vms.iter()
                .filter(|v| v.k8s_role != Some(VmRole::Master))
                .map(|v| handle(v, NodeKind::Worker)),
        );
        Ok(nodes)
    }

    async fn node_addresses(&self, node: &NodeHandle) -> Result<Option<NodeAddresses>> {
        let out = self
            .virsh(args(["domifaddr", &node.name, "--source", "lease"]), None)
            .await?;
        if !out.success() {
            if out.stderr.contains("failed to get domain") {
                return Err(Error::substrate(
                    &node.cluster,
                    format!("domain {} does not exist", node.name),
                ));
            }
            return Ok(None);
        }

        let addrs = parse_domifaddr(&out.stdout);
        let Some(management) = pick(&addrs, self.subnet_of(NetworkType::Mgmt)) else {
            return Ok(None);
        };

        let k8s = self.topology.network_by_type(NetworkType::K8s);
        let cluster = match k8s.and_then(|n| n.subnet()) {
            Some(subnet) => match pick(&addrs, Some(subnet)) {
                Some(addr) => addr,
                None if k8s.is_some_and(|n| n.mode == NetworkMode::Nat) => return Ok(None),
                None => management,
            },
            None => management,
        };

        Ok(Some(NodeAddresses {
            management: management.to_string(),
            cluster: cluster.to_string(),
        }))
    }

    async fn export_kubeconfig(&self, _cluster: &ClusterSpec) -> Result<Option<String>> {
        Ok(None)
    }

    async fn destroy_substrate(&self) -> Result<()> {
        let mut errors = Vec::new();
        for vm in &self.topology.vms {
            self.destroy_vm(&vm.name, &mut errors).await?;
        }
        for net in &self.topology.networks {
            let bridge = (net.use_ovs && net.mode == NetworkMode::L2Bridge)
                .then_some(net.bridge_name.as_str());
            self.destroy_network(&net.name, bridge, &mut errors).await?;
        }
        for link in self.topology.pairing_links() {
            self.destroy_network(&link.network_name, Some(link.bridge_name.as_str()), &mut errors)
                .await?;
        }
        if !errors.is_empty() {
            warn!(count = errors.len(), "libvirt teardown left resources behind");
        }
        collect_errors(SHARED, errors)
    }
}
