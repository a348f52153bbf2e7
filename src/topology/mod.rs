//! Declarative topology: networks, nodes and clusters
//!
//! The topology is read once from YAML at startup and is immutable for the
//! rest of the run. Loading applies defaults; [`Topology::validate`] then
//! checks every cross-reference and reports all violations at once.

mod settings;
mod validate;

pub use settings::{
    OrchestratorSettings, OvnSettings, RegistryImage, RegistrySettings, REGISTRY_PORT,
};

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::naming::{derive_link_name, link_network_name};
use crate::{Error, Result};

/// Default pod address range
pub const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
/// Default service address range
pub const DEFAULT_SERVICE_CIDR: &str = "10.245.0.0/16";
/// Default Kubernetes minor version
pub const DEFAULT_K8S_VERSION: &str = "1.33";

/// Complete topology document
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    /// Explicitly declared networks
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    /// Hypervisor-backed nodes
    #[serde(default)]
    pub vms: Vec<VmSpec>,
    /// Container-backed nodes
    #[serde(default)]
    pub kind: Option<KindSpec>,
    /// Guest image used for every VM
    #[serde(default)]
    pub operating_system: OsSpec,
    /// Credentials for reaching VMs
    #[serde(default)]
    pub ssh: SshSpec,
    /// Hypervisor connection settings
    #[serde(default)]
    pub libvirt: LibvirtSpec,
    /// Cluster definitions
    pub kubernetes: KubernetesSpec,
    /// OVN-Kubernetes manifest sources
    #[serde(default)]
    pub ovn: OvnSettings,
    /// Parallelism, poll budgets and step timeouts
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Local image registry
    #[serde(default)]
    pub registry: Option<RegistrySettings>,
}

/// Role of a declared network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Management network, reached by the orchestrator
    Mgmt,
    /// Cluster-plane network, used as the API advertise address
    K8s,
    /// Any other network
    #[serde(other)]
    Data,
}

/// Isolation mode of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum NetworkMode {
    /// Routed with DHCP address assignment
    #[default]
    #[serde(rename = "nat")]
    Nat,
    /// Pure link layer, no addresses
    #[serde(rename = "l2-bridge")]
    L2Bridge,
}

/// Which node types a network is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachTo {
    /// Every VM
    #[default]
    Any,
    /// Only hosts
    Host,
    /// Only DPUs
    Dpu,
}

/// A declared network
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSpec {
    /// Libvirt network name
    pub name: String,
    /// Network role
    #[serde(rename = "type")]
    pub network_type: NetworkType,
    /// Backing bridge interface
    pub bridge_name: String,
    /// Gateway address (routed networks)
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Subnet mask (routed networks)
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    /// First DHCP address
    #[serde(default)]
    pub dhcp_start: Option<Ipv4Addr>,
    /// Last DHCP address
    #[serde(default)]
    pub dhcp_end: Option<Ipv4Addr>,
    /// Isolation mode
    #[serde(default)]
    pub mode: NetworkMode,
    /// Guest NIC model
    #[serde(default = "default_nic_model")]
    pub nic_model: String,
    /// Back the bridge with Open vSwitch
    #[serde(default)]
    pub use_ovs: bool,
    /// Node types attached to this network
    #[serde(default)]
    pub attach_to: AttachTo,
}

impl NetworkSpec {
    /// Subnet derived from gateway and mask, if both are set
    pub fn subnet(&self) -> Option<Ipv4Net> {
        let gateway = self.gateway?;
        let mask = self.subnet_mask?;
        Ipv4Net::with_netmask(gateway, mask).ok().map(|n| n.trunc())
    }

    /// Whether a VM of the given type gets an interface on this network
    pub fn attaches(&self, vm_type: VmType) -> bool {
        match self.attach_to {
            AttachTo::Any => true,
            AttachTo::Host => vm_type == VmType::Host,
            AttachTo::Dpu => vm_type == VmType::Dpu,
        }
    }
}

fn default_nic_model() -> String {
    "virtio".to_string()
}

/// VM type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Server node, may own DPUs
    Host,
    /// DPU attached to a host
    Dpu,
}

/// Kubernetes role of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRole {
    /// Control-plane node
    Master,
    /// Worker node
    Worker,
}

/// Topological role of a node, derived from pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Not part of any pair
    Standalone,
    /// Host with at least one DPU
    PairedHost,
    /// DPU paired with a host
    PairedPeripheral,
}

/// A hypervisor-backed node
#[derive(Debug, Clone, Deserialize)]
pub struct VmSpec {
    /// Domain name, also the Kubernetes node name
    pub name: String,
    /// Host or DPU
    #[serde(rename = "type")]
    pub vm_type: VmType,
    /// Cluster this node belongs to
    #[serde(default)]
    pub k8s_cluster: Option<String>,
    /// Role in that cluster
    #[serde(default)]
    pub k8s_role: Option<VmRole>,
    /// MAC on the cluster-plane network
    #[serde(default)]
    pub k8s_node_mac: Option<String>,
    /// Reserved address on the cluster-plane network
    #[serde(default)]
    pub k8s_node_ip: Option<Ipv4Addr>,
    /// Owning host (DPUs only)
    #[serde(default)]
    pub host: Option<String>,
    /// Memory in MiB
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// Virtual CPUs
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    /// Disk size in GiB
    #[serde(default = "default_disk_size")]
    pub disk_size: u32,
}

fn default_memory() -> u32 {
    4096
}

fn default_vcpus() -> u32 {
    2
}

fn default_disk_size() -> u32 {
    20
}

/// Container-backed node set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KindSpec {
    /// Nodes across all kind clusters
    #[serde(default)]
    pub nodes: Vec<KindNodeSpec>,
}

/// Role of a kind node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KindRole {
    /// Control-plane node
    ControlPlane,
    /// Worker node
    Worker,
}

/// One kind node
#[derive(Debug, Clone, Deserialize)]
pub struct KindNodeSpec {
    /// Node role
    pub role: KindRole,
    /// Owning cluster, defaults to the first declared cluster
    #[serde(default)]
    pub k8s_cluster: Option<String>,
}

/// Guest operating system image
#[derive(Debug, Clone, Deserialize)]
pub struct OsSpec {
    /// Where to download the image from when absent
    #[serde(default)]
    pub image_url: Option<String>,
    /// File name inside the image directory
    #[serde(default = "default_image_name")]
    pub image_name: String,
}

impl Default for OsSpec {
    fn default() -> Self {
        Self {
            image_url: None,
            image_name: default_image_name(),
        }
    }
}

fn default_image_name() -> String {
    "Fedora-Cloud-Base-Generic.qcow2".to_string()
}

/// SSH credentials for VMs
#[derive(Debug, Clone, Deserialize)]
pub struct SshSpec {
    /// Login user
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Private key; the public key is expected next to it with `.pub`
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Console password set through cloud-init
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for SshSpec {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_path: default_key_path(),
            password: None,
        }
    }
}

impl SshSpec {
    /// Private key path with a leading `~` expanded from `$HOME`
    pub fn resolved_key_path(&self) -> PathBuf {
        expand_tilde(&self.key_path)
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_key_path() -> PathBuf {
    PathBuf::from("~/.ssh/id_rsa")
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Hypervisor connection and storage
#[derive(Debug, Clone, Deserialize)]
pub struct LibvirtSpec {
    /// Connection URI passed to virsh
    #[serde(default = "default_libvirt_uri")]
    pub uri: String,
    /// Directory holding base images, disks and cloud-init media
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
}

impl Default for LibvirtSpec {
    fn default() -> Self {
        Self {
            uri: default_libvirt_uri(),
            image_dir: default_image_dir(),
        }
    }
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("/var/lib/libvirt/images")
}

/// Kubernetes-wide settings and cluster list
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesSpec {
    /// Minor version, e.g. "1.33"
    #[serde(default = "default_k8s_version")]
    pub version: String,
    /// Where admin kubeconfigs are written
    #[serde(default = "default_kubeconfig_dir")]
    pub kubeconfig_dir: PathBuf,
    /// Clusters in declaration order
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
}

fn default_k8s_version() -> String {
    DEFAULT_K8S_VERSION.to_string()
}

fn default_kubeconfig_dir() -> PathBuf {
    PathBuf::from("kubeconfig")
}

/// Network plugin selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CniKind {
    /// Simple overlay
    Flannel,
    /// Simple overlay with the multus meta-plugin on top
    Multus,
    /// Advanced SDN with hardware-offload hooks
    OvnKubernetes,
    /// kind's built-in plugin
    Kindnet,
}

impl CniKind {
    /// Selector string as written in the topology
    pub fn as_str(&self) -> &'static str {
        match self {
            CniKind::Flannel => "flannel",
            CniKind::Multus => "multus",
            CniKind::OvnKubernetes => "ovn-kubernetes",
            CniKind::Kindnet => "kindnet",
        }
    }

    /// Whether the backend's default plugin must be disabled
    pub fn disables_default_cni(&self) -> bool {
        !matches!(self, CniKind::Kindnet)
    }

    /// Whether kube-proxy must be disabled
    pub fn disables_kube_proxy(&self) -> bool {
        matches!(self, CniKind::OvnKubernetes)
    }

    /// Whether every node needs the external `br-ex` bridge before init
    pub fn requires_external_bridge(&self) -> bool {
        matches!(self, CniKind::OvnKubernetes)
    }
}

impl std::fmt::Display for CniKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Kubernetes cluster
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name
    pub name: String,
    /// Pod address range
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    /// Service address range
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    /// Network plugin
    pub cni: CniKind,
}

fn default_pod_cidr() -> String {
    DEFAULT_POD_CIDR.to_string()
}

fn default_service_cidr() -> String {
    DEFAULT_SERVICE_CIDR.to_string()
}

/// Which backend a topology targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// libvirt VMs
    Vm,
    /// kind containers
    Kind,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentMode::Vm => f.write_str("vm"),
            DeploymentMode::Kind => f.write_str("kind"),
        }
    }
}

/// An implied point-to-point link between a host and one of its DPUs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingLink {
    /// Host VM name
    pub host: String,
    /// DPU VM name
    pub dpu: String,
    /// Libvirt network name
    pub network_name: String,
    /// OVS bridge name
    pub bridge_name: String,
}

impl Topology {
    /// Parse a topology document
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse topology: {}", e)))
    }

    /// Read, parse and validate a topology file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read topology {}: {}", path.display(), e))
        })?;
        let topology = Self::from_yaml(&content)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Backend selected by which node section is populated
    pub fn mode(&self) -> Result<DeploymentMode> {
        let has_vms = !self.vms.is_empty();
        let has_kind = self.kind.as_ref().is_some_and(|k| !k.nodes.is_empty());
        match (has_vms, has_kind) {
            (true, true) => Err(Error::validation(
                "both 'vms' and 'kind' sections are populated; use only one deployment mode",
            )),
            (true, false) => Ok(DeploymentMode::Vm),
            (false, true) => Ok(DeploymentMode::Kind),
            (false, false) => Err(Error::validation(
                "neither 'vms' nor 'kind' section is populated",
            )),
        }
    }

    /// Whether a local registry is configured with at least one image
    pub fn has_registry(&self) -> bool {
        self.registry.as_ref().is_some_and(|r| !r.containers.is_empty())
    }

    /// Image the OVN-Kubernetes components run
    ///
    /// A registry entry for the plugin takes precedence over `ovn.image`.
    pub fn ovn_image(&self) -> String {
        self.registry
            .as_ref()
            .and_then(|r| r.image_for(CniKind::OvnKubernetes))
            .map(|c| RegistrySettings::image_ref(&c.tag))
            .unwrap_or_else(|| self.ovn.image.clone())
    }

    /// Cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterSpec> {
        self.kubernetes.clusters.iter().find(|c| c.name == name)
    }

    /// VM by name
    pub fn vm(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|v| v.name == name)
    }

    /// First declared network of the given type
    pub fn network_by_type(&self, network_type: NetworkType) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.network_type == network_type)
    }

    /// VMs of a cluster in declaration order
    pub fn cluster_vms<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a VmSpec> + 'a {
        self.vms
            .iter()
            .filter(move |v| v.k8s_cluster.as_deref() == Some(cluster))
    }

    /// Kind nodes of a cluster in declaration order
    pub fn cluster_kind_nodes(&self, cluster: &str) -> Vec<&KindNodeSpec> {
        let first = self.kubernetes.clusters.first().map(|c| c.name.as_str());
        self.kind
            .iter()
            .flat_map(|k| k.nodes.iter())
            .filter(|n| n.k8s_cluster.as_deref().or(first) == Some(cluster))
            .collect()
    }

    /// Every host/DPU pair, in VM declaration order
    pub fn pairing_links(&self) -> Vec<PairingLink> {
        self.vms
            .iter()
            .filter(|v| v.vm_type == VmType::Dpu)
            .filter_map(|dpu| {
                let host = dpu.host.as_deref()?;
                Some(PairingLink {
                    host: host.to_string(),
                    dpu: dpu.name.clone(),
                    network_name: link_network_name(host, &dpu.name),
                    bridge_name: derive_link_name(host, &dpu.name),
                })
            })
            .collect()
    }

    /// Topological role of a VM
    pub fn node_role(&self, vm: &VmSpec) -> NodeRole {
        match vm.vm_type {
            VmType::Dpu => NodeRole::PairedPeripheral,
            VmType::Host
                if self
                    .vms
                    .iter()
                    .any(|v| v.host.as_deref() == Some(vm.name.as_str())) =>
            {
                NodeRole::PairedHost
            }
            VmType::Host => NodeRole::Standalone,
        }
    }

    /// Pairing links a VM is an endpoint of
    pub fn links_for(&self, vm: &VmSpec) -> Vec<PairingLink> {
        self.pairing_links()
            .into_iter()
            .filter(|l| l.host == vm.name || l.dpu == vm.name)
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let t = Topology::from_yaml(VM_TOPOLOGY).unwrap();
        let mgmt = t.network_by_type(NetworkType::Mgmt).unwrap();
        assert_eq!(mgmt.mode, NetworkMode::Nat);
        assert_eq!(mgmt.nic_model, "virtio");
        assert_eq!(mgmt.attach_to, AttachTo::Any);
        assert_eq!(t.kubernetes.version, "1.33");
        assert_eq!(t.kubernetes.kubeconfig_dir, PathBuf::from("kubeconfig"));
        assert_eq!(t.ssh.user, "root");
        let c = t.cluster("cluster-1").unwrap();
        assert_eq!(c.pod_cidr, DEFAULT_POD_CIDR);
        assert_eq!(c.service_cidr, DEFAULT_SERVICE_CIDR);
        assert_eq!(t.vm("master-1").unwrap().memory, 4096);
    }

    #[test]
    fn mode_is_derived_from_populated_section() {
        assert_eq!(
            Topology::from_yaml(VM_TOPOLOGY).unwrap().mode().unwrap(),
            DeploymentMode::Vm
        );
        assert_eq!(
            Topology::from_yaml(KIND_TOPOLOGY).unwrap().mode().unwrap(),
            DeploymentMode::Kind
        );
    }

    #[test]
    fn subnet_is_truncated_from_gateway() {
        let t = Topology::from_yaml(VM_TOPOLOGY).unwrap();
        let subnet = t.network_by_type(NetworkType::Mgmt).unwrap().subnet().unwrap();
        assert_eq!(subnet.to_string(), "192.168.120.0/24");
    }

    #[test]
    fn pairing_links_and_roles() {
        let t = Topology::from_yaml(VM_TOPOLOGY).unwrap();
        let links = t.pairing_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].network_name, "h2d-host-1-dpu-1");
        assert_eq!(links[0].bridge_name, derive_link_name("host-1", "dpu-1"));

        assert_eq!(t.node_role(t.vm("master-1").unwrap()), NodeRole::Standalone);
        assert_eq!(t.node_role(t.vm("host-1").unwrap()), NodeRole::PairedHost);
        assert_eq!(t.node_role(t.vm("dpu-1").unwrap()), NodeRole::PairedPeripheral);
        assert_eq!(t.links_for(t.vm("dpu-1").unwrap()).len(), 1);
        assert!(t.links_for(t.vm("master-1").unwrap()).is_empty());
    }

    #[test]
    fn kind_nodes_default_to_first_cluster() {
        let t = Topology::from_yaml(KIND_TOPOLOGY).unwrap();
        assert_eq!(t.cluster_kind_nodes("ovn").len(), 3);
        assert!(t.cluster_kind_nodes("other").is_empty());
    }

    #[test]
    fn cni_requirements() {
        assert!(CniKind::OvnKubernetes.disables_kube_proxy());
        assert!(CniKind::OvnKubernetes.requires_external_bridge());
        assert!(CniKind::Flannel.disables_default_cni());
        assert!(!CniKind::Kindnet.disables_default_cni());
        assert!(!CniKind::Multus.disables_kube_proxy());
    }

    #[test]
    fn unknown_cni_fails_to_parse() {
        let doc = KIND_TOPOLOGY.replace("ovn-kubernetes", "calico");
        let err = Topology::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("config error"));
    }

    #[test]
    fn registry_overrides_ovn_image() {
        let t = Topology::from_yaml(KIND_TOPOLOGY).unwrap();
        assert!(!t.has_registry());
        assert_eq!(t.ovn_image(), t.ovn.image);

        let doc = format!(
            "{}registry:\n  containers:\n    - name: ovnk\n      cni: ovn-kubernetes\n      tag: ovn-kube:dpu-sim\n",
            KIND_TOPOLOGY
        );
        let t = Topology::from_yaml(&doc).unwrap();
        assert!(t.has_registry());
        assert_eq!(t.ovn_image(), "localhost:5000/ovn-kube:dpu-sim");
    }
}
