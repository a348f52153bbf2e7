//! Docker or Podman on the orchestrating host
//!
//! The local registry and image builds need a container engine. Both CLIs
//! accept the same commands for everything used here; the differences are
//! the binary name and how an insecure push is spelled.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::host::{args, CommandRunner};
use crate::{Error, Result};

/// Engine requested in the topology
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    /// Podman when installed, otherwise Docker
    #[default]
    Auto,
    /// Always Docker
    Docker,
    /// Always Podman
    Podman,
}

/// Concrete engine in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// `docker`
    Docker,
    /// `podman`
    Podman,
}

impl EngineKind {
    /// CLI binary
    pub fn binary(self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

/// Inputs to an image build
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build context
    pub context_dir: PathBuf,
    /// Dockerfile, when not `<context>/Dockerfile`
    pub dockerfile: Option<PathBuf>,
    /// Tag for the result
    pub image: String,
    /// Target platform, e.g. `linux/amd64`
    pub platform: Option<String>,
    /// `--build-arg` values; passed in key order
    pub build_args: BTreeMap<String, String>,
    /// Extra flags placed before the context
    pub extra_args: Vec<String>,
}

impl BuildOptions {
    fn to_args(&self) -> Vec<String> {
        let mut out = vec!["build".to_string()];
        for (k, v) in &self.build_args {
            out.push("--build-arg".to_string());
            out.push(format!("{}={}", k, v));
        }
        if let Some(platform) = &self.platform {
            out.extend(["--platform".to_string(), platform.clone()]);
        }
        out.extend(["-t".to_string(), self.image.clone()]);
        if let Some(dockerfile) = &self.dockerfile {
            out.extend(["-f".to_string(), dockerfile.display().to_string()]);
        }
        out.extend(self.extra_args.iter().cloned());
        out.push(self.context_dir.display().to_string());
        out
    }
}

/// Inputs to a `run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Container name
    pub name: String,
    /// Image to run
    pub image: String,
    /// Restart policy
    pub restart: Option<String>,
    /// Network to attach at start
    pub network: Option<String>,
    /// `host:container` port mappings
    pub publish: Vec<String>,
}

impl RunOptions {
    fn to_args(&self) -> Vec<String> {
        let mut out = args(["run", "-d"]);
        if let Some(restart) = &self.restart {
            out.push(format!("--restart={}", restart));
        }
        if let Some(network) = &self.network {
            out.extend(["--network".to_string(), network.clone()]);
        }
        for p in &self.publish {
            out.extend(["-p".to_string(), p.clone()]);
        }
        out.extend(["--name".to_string(), self.name.clone(), self.image.clone()]);
        out
    }
}

/// Whether a container exists and runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// Container is known to the engine
    pub exists: bool,
    /// Container is running
    pub running: bool,
}

/// Per-network addressing of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkEndpoint {
    /// Address on that network
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// A container engine CLI driven through [`CommandRunner`]
#[derive(Clone)]
pub struct ContainerEngine {
    kind: EngineKind,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerEngine {
    /// Use a specific engine
    pub fn new(kind: EngineKind, runner: Arc<dyn CommandRunner>) -> Self {
        Self { kind, runner }
    }

    /// Resolve `preference`, checking installed CLIs when it is `Auto`
    pub async fn detect(runner: Arc<dyn CommandRunner>, preference: EnginePreference) -> Result<Self> {
        let kind = match preference {
            EnginePreference::Docker => EngineKind::Docker,
            EnginePreference::Podman => EngineKind::Podman,
            EnginePreference::Auto => {
                let mut found = None;
                for kind in [EngineKind::Podman, EngineKind::Docker] {
                    let installed = runner
                        .run(kind.binary(), args(["--version"]), None)
                        .await
                        .map(|o| o.success())
                        .unwrap_or(false);
                    if installed {
                        found = Some(kind);
                        break;
                    }
                }
                found.ok_or_else(|| Error::PrerequisiteNotFound {
                    tool: "podman or docker".to_string(),
                    hint: "install podman or docker and make sure it is in $PATH".to_string(),
                })?
            }
        };
        debug!(engine = %kind, "container engine selected");
        Ok(Self::new(kind, runner))
    }

    /// Engine in use
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn run_ok(&self, cmd_args: Vec<String>) -> Result<String> {
        let line = format!("{} {}", self.kind, cmd_args.join(" "));
        self.runner
            .run(self.kind.binary(), cmd_args, None)
            .await?
            .into_stdout(&line)
    }

    /// Build and tag an image
    pub async fn build(&self, opts: &BuildOptions) -> Result<()> {
        info!(engine = %self.kind, image = %opts.image, "building image");
        self.run_ok(opts.to_args()).await.map(|_| ())
    }

    /// Add `target` as another name for `source`
    pub async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run_ok(args(["tag", source, target])).await.map(|_| ())
    }

    /// Whether `image` is present locally
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self
            .runner
            .run(self.kind.binary(), args(["image", "inspect", image]), None)
            .await?
            .success())
    }

    /// Push `image`; `insecure` allows a plain-HTTP registry
    ///
    /// Docker has no per-push switch and only trusts plain HTTP for
    /// loopback registries unless the daemon is configured otherwise.
    pub async fn push(&self, image: &str, insecure: bool) -> Result<()> {
        let mut cmd = args(["push"]);
        match self.kind {
            EngineKind::Podman if insecure => cmd.push("--tls-verify=false".to_string()),
            EngineKind::Docker if insecure && !is_loopback_ref(image) => {
                return Err(Error::config(format!(
                    "docker push of {} to an insecure registry needs the daemon's insecure-registries setting",
                    image
                )));
            }
            _ => {}
        }
        cmd.push(image.to_string());
        self.run_ok(cmd).await.map(|_| ())
    }

    /// Start a detached container
    pub async fn run_container(&self, opts: &RunOptions) -> Result<()> {
        self.run_ok(opts.to_args()).await.map(|_| ())
    }

    /// Force-remove a container
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        self.run_ok(args(["rm", "-f", name])).await.map(|_| ())
    }

    /// Existence and run state of a container
    pub async fn container_state(&self, name: &str) -> Result<ContainerState> {
        let out = self
            .runner
            .run(
                self.kind.binary(),
                args(["inspect", "-f", "{{.State.Running}}", name]),
                None,
            )
            .await?;
        if !out.success() {
            return Ok(ContainerState::default());
        }
        Ok(ContainerState {
            exists: true,
            running: out.stdout.trim().eq_ignore_ascii_case("true"),
        })
    }

    /// Networks a container is attached to, keyed by network name
    pub async fn container_networks(&self, name: &str) -> Result<HashMap<String, NetworkEndpoint>> {
        let out = self
            .run_ok(args([
                "inspect",
                "--format",
                "{{json .NetworkSettings.Networks}}",
                name,
            ]))
            .await?;
        Ok(serde_json::from_str(out.trim())?)
    }

    /// Attach a running container to `network`
    pub async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        self.run_ok(args(["network", "connect", network, container]))
            .await
            .map(|_| ())
    }
}

fn is_loopback_ref(image: &str) -> bool {
    let host = image.split('/').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host == "localhost" || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::host::{CommandOutput, MockCommandRunner};

    fn recording(
        reply: impl Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static,
    ) -> (Arc<dyn CommandRunner>, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = calls.clone();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |program, args, _| {
            seen.lock().unwrap().push(format!("{} {}", program, args.join(" ")));
            Ok(reply(program, &args))
        });
        (Arc::new(runner), calls)
    }

    #[test]
    fn build_arguments_in_stable_order() {
        let opts = BuildOptions {
            context_dir: PathBuf::from("."),
            dockerfile: Some(PathBuf::from("Dockerfile")),
            image: "example:v1".into(),
            platform: Some("linux/amd64".into()),
            build_args: [("ZED", "1"), ("FOO", "bar")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            extra_args: vec!["--pull".into()],
        };
        assert_eq!(
            opts.to_args().join(" "),
            "build --build-arg FOO=bar --build-arg ZED=1 --platform linux/amd64 -t example:v1 -f Dockerfile --pull ."
        );
    }

    #[test]
    fn run_arguments() {
        let opts = RunOptions {
            name: "dpu-sim-registry".into(),
            image: "registry:2".into(),
            restart: Some("always".into()),
            network: Some("bridge".into()),
            publish: vec!["5000:5000".into()],
        };
        assert_eq!(
            opts.to_args().join(" "),
            "run -d --restart=always --network bridge -p 5000:5000 --name dpu-sim-registry registry:2"
        );
    }

    #[tokio::test]
    async fn auto_prefers_podman() {
        let (runner, _) = recording(|_, _| CommandOutput::ok("podman version 5.2.0"));
        let engine = ContainerEngine::detect(runner, EnginePreference::Auto).await.unwrap();
        assert_eq!(engine.kind(), EngineKind::Podman);
    }

    #[tokio::test]
    async fn auto_falls_back_to_docker() {
        let (runner, _) = recording(|program, _| {
            if program == "docker" {
                CommandOutput::ok("Docker version 27.0.3")
            } else {
                CommandOutput::failed(127, "podman: command not found")
            }
        });
        let engine = ContainerEngine::detect(runner, EnginePreference::Auto).await.unwrap();
        assert_eq!(engine.kind(), EngineKind::Docker);
    }

    #[tokio::test]
    async fn no_engine_is_a_missing_prerequisite() {
        let (runner, _) = recording(|_, _| CommandOutput::failed(127, "not found"));
        let err = ContainerEngine::detect(runner, EnginePreference::Auto)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PrerequisiteNotFound { .. }));
    }

    #[tokio::test]
    async fn explicit_preference_skips_detection() {
        let (runner, calls) = recording(|_, _| CommandOutput::ok(""));
        let engine = ContainerEngine::detect(runner, EnginePreference::Docker).await.unwrap();
        assert_eq!(engine.kind(), EngineKind::Docker);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn insecure_push_per_engine() {
        let (runner, calls) = recording(|_, _| CommandOutput::ok(""));
        ContainerEngine::new(EngineKind::Podman, runner.clone())
            .push("localhost:5000/ovn-kube:dpu-sim", true)
            .await
            .unwrap();
        assert_eq!(
            calls.lock().unwrap()[0],
            "podman push --tls-verify=false localhost:5000/ovn-kube:dpu-sim"
        );

        let docker = ContainerEngine::new(EngineKind::Docker, runner);
        docker.push("localhost:5000/ovn-kube:dpu-sim", true).await.unwrap();
        assert!(docker.push("10.0.0.5:5000/ovn-kube:dpu-sim", true).await.is_err());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn state_of_missing_container() {
        let (runner, _) = recording(|_, args| {
            if args.contains(&"ghost".to_string()) {
                CommandOutput::failed(1, "Error: no such object: ghost")
            } else {
                CommandOutput::ok("false\n")
            }
        });
        let engine = ContainerEngine::new(EngineKind::Docker, runner);
        assert_eq!(engine.container_state("ghost").await.unwrap(), ContainerState::default());
        assert_eq!(
            engine.container_state("dpu-sim-registry").await.unwrap(),
            ContainerState {
                exists: true,
                running: false
            }
        );
    }

    #[tokio::test]
    async fn networks_parse_inspect_json() {
        let (runner, _) = recording(|_, _| {
            CommandOutput::ok(r#"{"bridge":{"IPAddress":"172.17.0.2"},"kind":{"IPAddress":"172.18.0.9","Gateway":"172.18.0.1"}}"#)
        });
        let networks = ContainerEngine::new(EngineKind::Docker, runner)
            .container_networks("dpu-sim-registry")
            .await
            .unwrap();
        assert_eq!(networks["kind"].ip_address, "172.18.0.9");
        assert_eq!(networks.len(), 2);
    }
}
