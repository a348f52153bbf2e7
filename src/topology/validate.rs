//! Cross-reference checks over a parsed topology

use std::collections::HashSet;

use ipnet::IpNet;

use super::{CniKind, DeploymentMode, KindRole, NetworkType, Topology, VmRole, VmType};
use crate::naming::validate_interface_name;
use crate::{Error, Result};

impl Topology {
    /// Check every rule and report all violations in one error
    pub fn validate(&self) -> Result<()> {
        let mode = self.mode()?;
        let mut errors = Vec::new();

        self.check_networks(mode, &mut errors);
        match mode {
            DeploymentMode::Vm => self.check_vms(&mut errors),
            DeploymentMode::Kind => self.check_kind(&mut errors),
        }
        self.check_clusters(mode, &mut errors);
        self.check_registry(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "topology has {} problem(s):\n  - {}",
                errors.len(),
                errors.join("\n  - ")
            )))
        }
    }

    fn check_networks(&self, mode: DeploymentMode, errors: &mut Vec<String>) {
        let mut names = HashSet::new();
        for (i, net) in self.networks.iter().enumerate() {
            if net.name.is_empty() {
                errors.push(format!("networks[{}]: 'name' is required", i));
            } else if !names.insert(net.name.as_str()) {
                errors.push(format!("networks[{}]: duplicate network name '{}'", i, net.name));
            }
            if let Err(e) = validate_interface_name(&net.bridge_name) {
                errors.push(format!("networks[{}] ({}): 'bridge_name': {}", i, net.name, e));
            }
            if net.gateway.is_some() != net.subnet_mask.is_some() {
                errors.push(format!(
                    "networks[{}] ({}): 'gateway' and 'subnet_mask' must be set together",
                    i, net.name
                ));
            } else if net.gateway.is_some() && net.subnet().is_none() {
                errors.push(format!(
                    "networks[{}] ({}): 'subnet_mask' is not a valid netmask",
                    i, net.name
                ));
            }
        }

        for link in self.pairing_links() {
            if names.contains(link.network_name.as_str()) {
                errors.push(format!(
                    "pairing link network '{}' collides with a declared network",
                    link.network_name
                ));
            }
        }

        if mode == DeploymentMode::Vm && self.network_by_type(NetworkType::Mgmt).is_none() {
            errors.push("a network with type 'mgmt' is required".to_string());
        }
    }

    fn check_vms(&self, errors: &mut Vec<String>) {
        if self.operating_system.image_name.is_empty() {
            errors.push("operating_system: 'image_name' is required".to_string());
        }

        let mut names = HashSet::new();
        for (i, vm) in self.vms.iter().enumerate() {
            if vm.name.is_empty() {
                errors.push(format!("vms[{}]: 'name' is required", i));
            } else if !names.insert(vm.name.as_str()) {
                errors.push(format!("vms[{}]: duplicate VM name '{}'", i, vm.name));
            }

            if let Some(cluster) = &vm.k8s_cluster {
                if self.cluster(cluster).is_none() {
                    errors.push(format!(
                        "vms[{}] ({}): 'k8s_cluster' references unknown cluster '{}'",
                        i, vm.name, cluster
                    ));
                }
                if vm.k8s_role.is_none() {
                    errors.push(format!(
                        "vms[{}] ({}): 'k8s_role' is required when 'k8s_cluster' is set",
                        i, vm.name
                    ));
                }
            }

            match (vm.vm_type, vm.host.as_deref()) {
                (VmType::Dpu, None) => {
                    errors.push(format!("vms[{}] ({}): 'host' is required for dpu", i, vm.name))
                }
                (VmType::Dpu, Some(host)) => match self.vm(host) {
                    None => errors.push(format!(
                        "vms[{}] ({}): 'host' references non-existent VM '{}'",
                        i, vm.name, host
                    )),
                    Some(h) if h.vm_type != VmType::Host => errors.push(format!(
                        "vms[{}] ({}): 'host' '{}' is not of type host",
                        i, vm.name, host
                    )),
                    Some(_) => {}
                },
                (VmType::Host, Some(_)) => errors.push(format!(
                    "vms[{}] ({}): 'host' is only valid for dpu",
                    i, vm.name
                )),
                (VmType::Host, None) => {}
            }
        }
    }

    fn check_kind(&self, errors: &mut Vec<String>) {
        let nodes = self.kind.iter().flat_map(|k| k.nodes.iter());
        for (i, node) in nodes.enumerate() {
            if let Some(cluster) = &node.k8s_cluster {
                if self.cluster(cluster).is_none() {
                    errors.push(format!(
                        "kind.nodes[{}]: 'k8s_cluster' references unknown cluster '{}'",
                        i, cluster
                    ));
                }
            }
        }
    }

    fn check_clusters(&self, mode: DeploymentMode, errors: &mut Vec<String>) {
        if self.kubernetes.clusters.is_empty() {
            errors.push("kubernetes.clusters: at least one cluster is required".to_string());
        }

        let mut names = HashSet::new();
        for (i, cluster) in self.kubernetes.clusters.iter().enumerate() {
            if cluster.name.is_empty() {
                errors.push(format!("kubernetes.clusters[{}]: 'name' is required", i));
            } else if !names.insert(cluster.name.as_str()) {
                errors.push(format!(
                    "kubernetes.clusters[{}]: duplicate cluster name '{}'",
                    i, cluster.name
                ));
            }

            for (field, cidr) in [
                ("pod_cidr", &cluster.pod_cidr),
                ("service_cidr", &cluster.service_cidr),
            ] {
                if cidr.parse::<IpNet>().is_err() {
                    errors.push(format!(
                        "kubernetes.clusters[{}] ({}): '{}' is not a valid CIDR: '{}'",
                        i, cluster.name, field, cidr
                    ));
                }
            }

            if cluster.cni == CniKind::Kindnet && mode != DeploymentMode::Kind {
                errors.push(format!(
                    "kubernetes.clusters[{}] ({}): 'kindnet' is only available in kind mode",
                    i, cluster.name
                ));
            }

            let has_control_plane = match mode {
                DeploymentMode::Vm => self
                    .cluster_vms(&cluster.name)
                    .any(|v| v.k8s_role == Some(VmRole::Master)),
                DeploymentMode::Kind => self
                    .cluster_kind_nodes(&cluster.name)
                    .iter()
                    .any(|n| n.role == KindRole::ControlPlane),
            };
            if !has_control_plane {
                errors.push(format!(
                    "kubernetes.clusters[{}] ({}): no control-plane node",
                    i, cluster.name
                ));
            }
        }
    }
}

impl Topology {
    fn check_registry(&self, errors: &mut Vec<String>) {
        let Some(registry) = &self.registry else {
            return;
        };
        for (i, image) in registry.containers.iter().enumerate() {
            if image.name.is_empty() {
                errors.push(format!("registry.containers[{}]: 'name' is required", i));
            }
            match image.cni {
                None => errors.push(format!(
                    "registry.containers[{}] ({}): 'cni' is required",
                    i, image.name
                )),
                Some(CniKind::OvnKubernetes) => {}
                Some(other) => errors.push(format!(
                    "registry.containers[{}] ({}): 'cni' must be 'ovn-kubernetes', got '{}'",
                    i,
                    image.name,
                    other.as_str()
                )),
            }
            if image.tag.is_empty() {
                errors.push(format!("registry.containers[{}] ({}): 'tag' is required", i, image.name));
            }
        }
    }
}
