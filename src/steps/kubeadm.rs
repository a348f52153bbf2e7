//! Control-plane initialization and node joins with kubeadm

use std::time::Duration;

use tracing::info;

use super::{Step, StepExecutor, Target};
use crate::{Error, Result};

const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
const SHORT: Duration = Duration::from_secs(60);

/// Credential a node presents to join an initialized control plane
///
/// Produced once by [`init_control_plane`]. `Debug` never shows the secret
/// half of the bootstrap token or the certificate key.
#[derive(Clone)]
pub struct JoinToken {
    command: String,
    certificate_key: Option<String>,
}

impl JoinToken {
    /// Wrap a `kubeadm join ...` command line
    pub fn new(command: impl Into<String>, certificate_key: Option<String>) -> Self {
        Self {
            command: command.into().trim().to_string(),
            certificate_key: certificate_key.filter(|k| !k.is_empty()),
        }
    }

    /// API server endpoint the command joins
    pub fn endpoint(&self) -> Option<&str> {
        self.command
            .split_whitespace()
            .nth(2)
            .filter(|s| !s.starts_with('-'))
    }

    /// Bootstrap token with its secret half masked
    pub fn redacted(&self) -> String {
        let mut words = self.command.split_whitespace();
        let token = loop {
            match words.next() {
                Some("--token") => break words.next(),
                Some(_) => continue,
                None => break None,
            }
        };
        match token.and_then(|t| t.split_once('.')) {
            Some((id, _)) => format!("{}.****", id),
            None => "****".to_string(),
        }
    }

    /// Command for a worker join
    pub fn worker_command(&self) -> &str {
        &self.command
    }

    /// Command for an additional control-plane join
    pub fn control_plane_command(&self) -> Option<String> {
        self.certificate_key.as_ref().map(|key| {
            format!(
                "{} --control-plane --certificate-key {}",
                self.command, key
            )
        })
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken")
            .field("endpoint", &self.endpoint())
            .field("token", &self.redacted())
            .field("certificate_key", &self.certificate_key.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Result of control-plane initialization
#[derive(Debug, Clone)]
pub struct ControlPlane {
    /// `https://<advertise address>:6443`
    pub api_endpoint: String,
    /// Join credential for the remaining nodes
    pub join: JoinToken,
}

/// Parameters for `kubeadm init`
#[derive(Debug, Clone, Copy)]
pub struct InitParams<'a> {
    /// Cluster-plane address the API server advertises
    pub advertise_address: &'a str,
    /// Pod network range
    pub pod_cidr: &'a str,
    /// Service range
    pub service_cidr: &'a str,
    /// Timeout for the init itself
    pub timeout: Duration,
}

/// Initialize the control plane on the bootstrap node and mint a join credential
///
/// Re-running against an initialized node skips `kubeadm init` and only
/// mints a fresh token.
pub async fn init_control_plane(
    exec: &StepExecutor,
    target: Target<'_>,
    params: InitParams<'_>,
) -> Result<ControlPlane> {
    let init = format!(
        "set -e\n\
         if [ -f {conf} ]; then echo 'control plane already initialized'; exit 0; fi\n\
         sudo kubeadm init --pod-network-cidr={pod} --service-cidr={svc} --apiserver-advertise-address={addr} --upload-certs\n",
        conf = ADMIN_CONF,
        pod = params.pod_cidr,
        svc = params.service_cidr,
        addr = params.advertise_address,
    );
    exec.run(target, &Step::new("kubeadm-init", init, params.timeout))
        .await?;

    let kubectl_setup = format!(
        "set -e\nsudo mkdir -p /root/.kube\nsudo cp {} /root/.kube/config\nsudo chown root:root /root/.kube/config\n",
        ADMIN_CONF
    );
    exec.run(target, &Step::new("kubectl-setup", kubectl_setup, SHORT))
        .await?;

    let join = exec
        .run(
            target,
            &Step::new(
                "join-token",
                "set -e\nsudo kubeadm token create --print-join-command\n",
                SHORT,
            ),
        )
        .await?;
    if !join.output.starts_with("kubeadm join") {
        return Err(Error::step_failure(
            target.node,
            "join-token",
            "token create did not print a join command",
        ));
    }

    let key = exec
        .run(
            target,
            &Step::new(
                "certificate-key",
                "set -e\nsudo kubeadm init phase upload-certs --upload-certs 2>/dev/null | tail -1\n",
                SHORT,
            ),
        )
        .await?;

    let join = JoinToken::new(join.output, Some(key.output));
    info!(node = %target.node, token = %join.redacted(), "control plane initialized");

    Ok(ControlPlane {
        api_endpoint: format!("https://{}:6443", params.advertise_address),
        join,
    })
}

/// Join a node, as a worker or as an additional control-plane member
///
/// Nodes that already have a kubelet configuration are left alone.
pub async fn join_node(
    exec: &StepExecutor,
    target: Target<'_>,
    token: &JoinToken,
    control_plane: bool,
    timeout: Duration,
) -> Result<()> {
    let command = if control_plane {
        token.control_plane_command().ok_or_else(|| {
            Error::join_failure(target.node, "no certificate key for control-plane join")
        })?
    } else {
        token.worker_command().to_string()
    };

    let mut script = format!(
        "set -e\nif [ -f {} ]; then echo 'already joined'; exit 0; fi\nsudo {}\n",
        KUBELET_CONF, command
    );
    if control_plane {
        script.push_str(&format!(
            "sudo mkdir -p /root/.kube\nsudo cp {} /root/.kube/config\n",
            ADMIN_CONF
        ));
    }

    exec.run(target, &Step::new("kubeadm-join", script, timeout))
        .await
        .map_err(|e| match e {
            Error::StepFailure { message, .. } => Error::join_failure(target.node, message),
            other => other,
        })?;
    Ok(())
}

/// Read the admin kubeconfig from a control-plane node
pub async fn fetch_admin_kubeconfig(exec: &StepExecutor, target: Target<'_>) -> Result<String> {
    let record = exec
        .run(
            target,
            &Step::new(
                "fetch-kubeconfig",
                format!("sudo cat {}", ADMIN_CONF),
                Duration::from_secs(30),
            ),
        )
        .await?;
    Ok(record.output)
}
