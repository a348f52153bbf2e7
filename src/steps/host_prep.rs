//! Host preparation: everything a node needs before kubeadm runs

use std::time::Duration;

use super::{Step, StepExecutor, Target};
use crate::{Error, Result};

/// Package manager family of the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// Fedora, RHEL, CentOS
    Dnf,
    /// Debian, Ubuntu
    Apt,
}

impl PackageManager {
    /// Classify an `/etc/os-release` document
    pub fn from_os_release(content: &str) -> Option<Self> {
        let ids: Vec<String> = content
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                matches!(key.trim(), "ID" | "ID_LIKE").then(|| value.trim_matches('"').to_string())
            })
            .flat_map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect();

        if ids
            .iter()
            .any(|id| matches!(id.as_str(), "fedora" | "rhel" | "centos" | "rocky" | "almalinux"))
        {
            Some(Self::Dnf)
        } else if ids.iter().any(|id| matches!(id.as_str(), "debian" | "ubuntu")) {
            Some(Self::Apt)
        } else {
            None
        }
    }
}

/// Read `/etc/os-release` on the node and pick its package manager
pub async fn detect_package_manager(exec: &StepExecutor, target: Target<'_>) -> Result<PackageManager> {
    let record = exec
        .run(
            target,
            &Step::new("detect-distro", "cat /etc/os-release", Duration::from_secs(30)),
        )
        .await?;
    PackageManager::from_os_release(&record.output).ok_or_else(|| {
        Error::step_failure(target.node, "detect-distro", "unsupported Linux distribution")
    })
}

/// Inputs to the host preparation sequence
#[derive(Debug, Clone)]
pub struct HostPrep<'a> {
    /// Hostname to set, also the Kubernetes node name
    pub hostname: &'a str,
    /// Kubernetes minor version, e.g. "1.33"
    pub version: &'a str,
    /// Guest package manager
    pub package_manager: PackageManager,
    /// Per-step timeout
    pub timeout: Duration,
}

impl HostPrep<'_> {
    /// The ordered step sequence
    pub fn steps(&self) -> Vec<Step> {
        let t = self.timeout;
        vec![
            Step::new("disable-swap", disable_swap(), t),
            Step::new("set-hostname", set_hostname(self.hostname), t),
            Step::new("kernel-modules", kernel_modules(), t),
            Step::new(
                "container-runtime",
                container_runtime(self.package_manager, self.version),
                t,
            ),
            Step::new("software-switch", software_switch(self.package_manager), t),
            Step::new(
                "package-repo",
                package_repo(self.package_manager, self.version),
                t,
            ),
            Step::new(
                "control-plane-binaries",
                control_plane_binaries(self.package_manager),
                t,
            ),
            Step::new("firewall", firewall(self.package_manager), t),
            Step::new("verify", verify(), t),
        ]
    }
}

fn disable_swap() -> String {
    // comment out swap entries only once
    "set -e\n\
     sudo swapoff -a\n\
     sudo sed -i '/^[^#].* swap / s/^/#/' /etc/fstab\n"
        .to_string()
}

fn set_hostname(hostname: &str) -> String {
    format!("set -e\nsudo hostnamectl set-hostname {}\n", hostname)
}

fn kernel_modules() -> String {
    "set -e\n\
     sudo tee /etc/modules-load.d/k8s.conf > /dev/null <<EOF\n\
     overlay\n\
     br_netfilter\n\
     EOF\n\
     sudo modprobe overlay\n\
     sudo modprobe br_netfilter\n\
     sudo tee /etc/sysctl.d/k8s.conf > /dev/null <<EOF\n\
     net.bridge.bridge-nf-call-iptables = 1\n\
     net.bridge.bridge-nf-call-ip6tables = 1\n\
     net.ipv4.ip_forward = 1\n\
     EOF\n\
     sudo sysctl --system > /dev/null 2>&1\n"
        .to_string()
}

fn container_runtime(pm: PackageManager, version: &str) -> String {
    let repo = format!("https://pkgs.k8s.io/addons:/cri-o:/stable:/v{}", version);
    let install = match pm {
        PackageManager::Dnf => format!(
            "sudo tee /etc/yum.repos.d/cri-o.repo > /dev/null <<EOF\n\
             [cri-o]\n\
             name=CRI-O\n\
             baseurl={repo}/rpm/\n\
             enabled=1\n\
             gpgcheck=1\n\
             gpgkey={repo}/rpm/repodata/repomd.xml.key\n\
             EOF\n\
             sudo dnf install -y cri-o iproute-tc containernetworking-plugins > /dev/null\n\
             sudo mkdir -p /opt/cni/bin\n\
             sudo ln -sf /usr/libexec/cni/* /opt/cni/bin/\n",
            repo = repo
        ),
        PackageManager::Apt => format!(
            "sudo mkdir -p /etc/apt/keyrings\n\
             curl -fsSL {repo}/deb/Release.key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/cri-o-apt-keyring.gpg\n\
             echo 'deb [signed-by=/etc/apt/keyrings/cri-o-apt-keyring.gpg] {repo}/deb/ /' | sudo tee /etc/apt/sources.list.d/cri-o.list > /dev/null\n\
             sudo apt-get update -q > /dev/null\n\
             sudo DEBIAN_FRONTEND=noninteractive apt-get install -y cri-o > /dev/null\n",
            repo = repo
        ),
    };
    format!(
        "set -e\n{}sudo systemctl enable --now crio > /dev/null 2>&1\n",
        install
    )
}

fn software_switch(pm: PackageManager) -> String {
    let install = match pm {
        PackageManager::Dnf => "sudo dnf install -y NetworkManager-ovs openvswitch > /dev/null\n",
        PackageManager::Apt => {
            "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y openvswitch-switch network-manager-openvswitch > /dev/null\n"
        }
    };
    let service = match pm {
        PackageManager::Dnf => "openvswitch",
        PackageManager::Apt => "openvswitch-switch",
    };
    format!(
        "set -e\n{}sudo systemctl enable --now {} > /dev/null 2>&1\nsudo systemctl restart NetworkManager\n",
        install, service
    )
}

fn package_repo(pm: PackageManager, version: &str) -> String {
    let repo = format!("https://pkgs.k8s.io/core:/stable:/v{}", version);
    match pm {
        PackageManager::Dnf => format!(
            "set -e\n\
             sudo tee /etc/yum.repos.d/kubernetes.repo > /dev/null <<EOF\n\
             [kubernetes]\n\
             name=Kubernetes\n\
             baseurl={repo}/rpm/\n\
             enabled=1\n\
             gpgcheck=1\n\
             gpgkey={repo}/rpm/repodata/repomd.xml.key\n\
             exclude=kubelet kubeadm kubectl cri-tools kubernetes-cni\n\
             EOF\n",
            repo = repo
        ),
        PackageManager::Apt => format!(
            "set -e\n\
             sudo mkdir -p /etc/apt/keyrings\n\
             curl -fsSL {repo}/deb/Release.key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg\n\
             echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] {repo}/deb/ /' | sudo tee /etc/apt/sources.list.d/kubernetes.list > /dev/null\n\
             sudo apt-get update -q > /dev/null\n",
            repo = repo
        ),
    }
}

fn control_plane_binaries(pm: PackageManager) -> String {
    let install = match pm {
        PackageManager::Dnf => {
            "sudo dnf install -y kubelet kubeadm kubectl --setopt=disable_excludes=kubernetes > /dev/null\n"
        }
        PackageManager::Apt => {
            "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y kubelet kubeadm kubectl > /dev/null\n\
             sudo apt-mark hold kubelet kubeadm kubectl > /dev/null\n"
        }
    };
    format!("set -e\n{}sudo systemctl enable kubelet > /dev/null 2>&1\n", install)
}

fn firewall(pm: PackageManager) -> String {
    match pm {
        PackageManager::Dnf => "set -e\n\
             if rpm -q firewalld > /dev/null 2>&1; then\n\
             \x20 sudo systemctl disable --now firewalld\n\
             \x20 sudo dnf remove -y firewalld > /dev/null\n\
             fi\n"
            .to_string(),
        PackageManager::Apt => "set -e\n\
             if command -v ufw > /dev/null 2>&1; then\n\
             \x20 sudo ufw disable\n\
             fi\n"
            .to_string(),
    }
}

fn verify() -> String {
    "set -e\n\
     sudo kubeadm version -o short\n\
     sudo systemctl is-active crio\n\
     sudo ovs-vsctl --version | head -n 1\n"
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::testing::{FakeTransport, Reply};

    fn prep(pm: PackageManager) -> HostPrep<'static> {
        HostPrep {
            hostname: "master-1",
            version: "1.33",
            package_manager: pm,
            timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn sequence_order_is_fixed() {
        let names: Vec<_> = prep(PackageManager::Dnf)
            .steps()
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(
            names,
            [
                "disable-swap",
                "set-hostname",
                "kernel-modules",
                "container-runtime",
                "software-switch",
                "package-repo",
                "control-plane-binaries",
                "firewall",
                "verify"
            ]
        );
    }

    #[test]
    fn repositories_track_requested_version() {
        let steps = prep(PackageManager::Dnf).steps();
        let runtime = &steps[3].script;
        assert!(runtime.contains("https://pkgs.k8s.io/addons:/cri-o:/stable:/v1.33/rpm/"));
        let repo = &steps[5].script;
        assert!(repo.contains("https://pkgs.k8s.io/core:/stable:/v1.33/rpm/"));
        assert!(repo.contains("exclude=kubelet kubeadm kubectl"));
    }

    #[test]
    fn apt_variant_uses_deb_repositories() {
        let steps = prep(PackageManager::Apt).steps();
        assert!(steps[3].script.contains("/deb/Release.key"));
        assert!(steps[6].script.contains("apt-mark hold"));
        assert!(steps[7].script.contains("ufw disable"));
    }

    #[test]
    fn scripts_are_rerunnable() {
        let steps = prep(PackageManager::Dnf).steps();
        assert!(steps[0].script.contains("/^[^#].* swap /"));
        assert!(steps[7].script.contains("if rpm -q firewalld"));
        assert!(steps.iter().all(|s| s.script.starts_with("set -e\n")));
    }

    #[test]
    fn os_release_detection() {
        let fedora = "NAME=\"Fedora Linux\"\nID=fedora\nVERSION_ID=42\n";
        assert_eq!(PackageManager::from_os_release(fedora), Some(PackageManager::Dnf));
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(PackageManager::from_os_release(ubuntu), Some(PackageManager::Apt));
        let rocky = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(PackageManager::from_os_release(rocky), Some(PackageManager::Dnf));
        assert_eq!(PackageManager::from_os_release("ID=alpine\n"), None);
    }

    #[tokio::test]
    async fn unsupported_distro_fails_detection() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("os-release", Reply::Ok("ID=alpine\n".into()));
        let err = detect_package_manager(
            &StepExecutor::new(fake),
            Target {
                node: "n",
                address: "a",
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unsupported Linux distribution"));
    }
}
