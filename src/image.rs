//! OVN-Kubernetes image builds from a local checkout
//!
//! Builds are cached by content: the image is first tagged with a key
//! derived from the source revision, target architecture, OVN source and
//! Dockerfile, and a rebuild happens only when no image carries that key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aws_lc_rs::digest;
use tracing::{info, warn};

use crate::container::{BuildOptions, ContainerEngine, EngineKind};
use crate::host::{args, CommandRunner};
use crate::{Error, Result};

/// Go toolchain image the Dockerfile compiles with
pub const BUILDER_IMAGE: &str = "quay.io/projectquay/golang:1.24";
/// Upstream OVN repository used when building OVN from source
pub const OVN_REPO: &str = "https://github.com/ovn-org/ovn.git";

/// Where OVN itself comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OvnSource {
    /// Prebuilt packages
    Koji,
    /// Built from `OVN_REPO` at a resolved commit
    Git(String),
}

impl OvnSource {
    fn build_arg(&self) -> &'static str {
        match self {
            OvnSource::Koji => "koji",
            OvnSource::Git(_) => "source",
        }
    }

    fn commit(&self) -> &str {
        match self {
            OvnSource::Koji => "",
            OvnSource::Git(sha) => sha,
        }
    }
}

/// Map `uname -m` output to the container platform architecture
pub fn container_arch(machine: &str) -> String {
    match machine.trim() {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

fn short_sha256(data: &[u8], len: usize) -> String {
    let sum = digest::digest(&digest::SHA256, data);
    let hex: String = sum.as_ref().iter().map(|b| format!("{:02x}", b)).collect();
    hex[..len.min(hex.len())].to_string()
}

/// Stable key over every input that changes the built image
pub fn cache_key(source_rev: &str, arch: &str, ovn: &OvnSource, dockerfile: &[u8]) -> String {
    let material = [
        source_rev.to_string(),
        format!("arch={}", arch),
        format!("ovn_from={}", ovn.build_arg()),
        format!("ovn_gitref={}", ovn.commit()),
        format!("dockerfile_sha={}", short_sha256(dockerfile, 16)),
    ]
    .join("\n");
    short_sha256(material.as_bytes(), 16)
}

/// `image` with `key` appended to its tag, or used as the tag when it has none
pub fn cached_name(image: &str, key: &str) -> String {
    let colon = image.rfind(':');
    let slash = image.rfind('/');
    match colon {
        Some(c) if slash.map_or(true, |s| c > s) => format!("{}-{}", image, key),
        _ => format!("{}:{}", image, key),
    }
}

/// Builds the OVN-Kubernetes image from `repo` with a container engine
pub struct OvnImageBuild {
    engine: ContainerEngine,
    runner: Arc<dyn CommandRunner>,
    repo: PathBuf,
    cache_dir: Option<PathBuf>,
}

impl OvnImageBuild {
    /// Build from the checkout at `repo`
    pub fn new(engine: ContainerEngine, runner: Arc<dyn CommandRunner>, repo: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            runner,
            repo: repo.into(),
            cache_dir: default_cache_dir(),
        }
    }

    /// Persistent Go cache mounted into podman builds
    pub fn with_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_dir = dir;
        self
    }

    fn dockerfile(&self) -> PathBuf {
        self.repo.join("dist").join("images").join("Dockerfile.fedora")
    }

    async fn git(&self, git_args: &[&str]) -> Result<String> {
        let mut cmd = vec!["-C".to_string(), self.repo.display().to_string()];
        cmd.extend(git_args.iter().map(|a| a.to_string()));
        let line = format!("git {}", cmd.join(" "));
        self.runner.run("git", cmd, None).await?.into_stdout(&line)
    }

    /// HEAD of the checkout, suffixed with a digest of tracked changes when dirty
    pub async fn source_revision(&self) -> Result<String> {
        let head = self.git(&["rev-parse", "HEAD"]).await?.trim().to_string();
        if head.is_empty() {
            return Err(Error::command_failed("git rev-parse HEAD", "empty HEAD"));
        }
        let status = match self.git(&["status", "--porcelain", "--untracked-files=no"]).await {
            Ok(status) => status,
            Err(_) => return Ok(head),
        };
        if status.trim().is_empty() {
            return Ok(head);
        }
        match self.git(&["diff", "--no-ext-diff", "--binary", "--", "."]).await {
            Ok(diff) => Ok(format!("{}-dirty-{}", head, short_sha256(diff.as_bytes(), 12))),
            Err(_) => Ok(format!("{}-dirty", head)),
        }
    }

    async fn arch(&self) -> Result<String> {
        let machine = self
            .runner
            .run("uname", args(["-m"]), None)
            .await?
            .into_stdout("uname -m")?;
        Ok(container_arch(&machine))
    }

    async fn resolve_ovn_ref(&self, git_ref: &str) -> Result<String> {
        let line = format!("git ls-remote {} {}", OVN_REPO, git_ref);
        let out = self
            .runner
            .run("git", args(["ls-remote", OVN_REPO, git_ref]), None)
            .await?
            .into_stdout(&line)?;
        match out.split_whitespace().next() {
            Some(sha) => Ok(sha.to_string()),
            // a bare commit id does not show up in ls-remote
            None if git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit()) => {
                Ok(git_ref.to_string())
            }
            None => Err(Error::config(format!("OVN git ref '{}' not found in {}", git_ref, OVN_REPO))),
        }
    }

    /// Produce `image`, reusing a cached build when the inputs are unchanged
    ///
    /// `ovn_git_ref` builds OVN from source at that ref instead of using
    /// prebuilt packages.
    pub async fn build(&self, image: &str, ovn_git_ref: Option<&str>) -> Result<()> {
        let dockerfile_path = self.dockerfile();
        let dockerfile = tokio::fs::read(&dockerfile_path).await.map_err(|e| {
            Error::config(format!("{} not readable: {}", dockerfile_path.display(), e))
        })?;

        let arch = self.arch().await?;
        let ovn = match ovn_git_ref {
            Some(r) => OvnSource::Git(self.resolve_ovn_ref(r).await?),
            None => OvnSource::Koji,
        };

        let source_rev = self.source_revision().await.unwrap_or_else(|e| {
            warn!(error = %e, "source revision unknown; cache key is less precise");
            "unknown".to_string()
        });
        let key = cache_key(&source_rev, &arch, &ovn, &dockerfile);
        let cached = cached_name(image, &key);

        if self.engine.image_exists(&cached).await? {
            info!(image = %cached, "using cached OVN-Kubernetes image");
        } else {
            info!(image = %image, cache = %key, ovn_from = ovn.build_arg(), arch = %arch, "building OVN-Kubernetes image");
            self.engine
                .build(&self.options(&cached, &arch, &ovn, &dockerfile_path))
                .await?;
        }
        if cached != image {
            self.engine.tag(&cached, image).await?;
        }
        Ok(())
    }

    fn options(&self, image: &str, arch: &str, ovn: &OvnSource, dockerfile: &Path) -> BuildOptions {
        let platform = format!("linux/{}", arch);
        let mut build_args: BTreeMap<String, String> = [
            ("BUILDER_IMAGE", BUILDER_IMAGE.to_string()),
            ("OVN_FROM", ovn.build_arg().to_string()),
            ("OVN_KUBERNETES_DIR", ".".to_string()),
            ("BUILDPLATFORM", platform.clone()),
            ("TARGETOS", "linux".to_string()),
            ("TARGETARCH", arch.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        if let OvnSource::Git(sha) = ovn {
            build_args.insert("OVN_REPO".to_string(), OVN_REPO.to_string());
            build_args.insert("OVN_GITREF".to_string(), sha.clone());
        }

        let mut extra_args = Vec::new();
        if self.engine.kind() == EngineKind::Podman {
            if let Some(dir) = &self.cache_dir {
                for (sub, target) in [("go-build", "/root/.cache/go-build"), ("mod", "/go/pkg/mod")] {
                    let host = dir.join(sub);
                    if let Err(e) = std::fs::create_dir_all(&host) {
                        warn!(dir = %host.display(), error = %e, "go cache unavailable");
                        continue;
                    }
                    extra_args.push("--volume".to_string());
                    extra_args.push(format!("{}:{}:Z", host.display(), target));
                }
            }
        }

        BuildOptions {
            context_dir: self.repo.clone(),
            dockerfile: Some(dockerfile.to_path_buf()),
            image: image.to_string(),
            platform: Some(platform),
            build_args,
            extra_args,
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))?;
    Some(base.join("dpu-sim").join("ovn-go-build-cache"))
}
