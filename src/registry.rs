//! Local image registry
//!
//! A `registry:2` container on the orchestrating host, published on
//! [`REGISTRY_PORT`]. Images listed in the topology's `registry` section
//! are built from source, tagged under the registry and pushed before any
//! cluster is brought up, so every node pulls the same build.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::container::{ContainerEngine, RunOptions};
use crate::poll::{poll, Check, PollConfig};
use crate::topology::{RegistryImage, RegistrySettings, REGISTRY_PORT};
use crate::{Error, Result};

/// Container name of the registry
pub const CONTAINER_NAME: &str = "dpu-sim-registry";
/// Image the registry runs
pub const REGISTRY_IMAGE: &str = "registry:2";
/// Docker network kind nodes live on
pub const KIND_NETWORK: &str = "kind";

const READY_WAIT: PollConfig = PollConfig::new(Duration::from_secs(1), 30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// The local registry container and the images pushed to it
pub struct Registry {
    engine: ContainerEngine,
    settings: RegistrySettings,
    http: reqwest::Client,
    ready_wait: PollConfig,
}

impl Registry {
    /// Manage the registry through `engine`
    pub fn new(engine: ContainerEngine, settings: RegistrySettings) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            engine,
            settings,
            http,
            ready_wait: READY_WAIT,
        })
    }

    /// Override how long [`Registry::start`] waits for the HTTP API
    pub fn with_ready_wait(mut self, wait: PollConfig) -> Self {
        self.ready_wait = wait;
        self
    }

    /// Container engine in use
    pub fn engine(&self) -> &ContainerEngine {
        &self.engine
    }

    /// Start the registry unless it already runs, then wait for its API
    pub async fn start(&self) -> Result<()> {
        let state = self.engine.container_state(CONTAINER_NAME).await?;
        if state.running {
            info!(container = CONTAINER_NAME, "registry already running");
            return Ok(());
        }
        if state.exists {
            info!(container = CONTAINER_NAME, "removing stopped registry container");
            self.engine.remove_container(CONTAINER_NAME).await?;
        }

        self.engine
            .run_container(&RunOptions {
                name: CONTAINER_NAME.to_string(),
                image: REGISTRY_IMAGE.to_string(),
                restart: Some("always".to_string()),
                network: Some("bridge".to_string()),
                publish: vec![format!("{0}:{0}", REGISTRY_PORT)],
            })
            .await?;

        self.wait_ready().await?;
        info!(endpoint = %RegistrySettings::endpoint(), "local registry started");
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let url = format!("http://{}/v2/", RegistrySettings::endpoint());
        let http = &self.http;
        let url = url.as_str();
        poll(&self.ready_wait, "local registry", || async move {
            match http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => Check::Ready(()),
                Ok(resp) => {
                    debug!(status = %resp.status(), "registry not ready");
                    Check::NotYet
                }
                Err(e) => {
                    debug!(error = %e, "registry not ready");
                    Check::NotYet
                }
            }
        })
        .await
        .map_err(|e| Error::resource(e.to_string()))
    }

    /// Tag `local_image` under the registry, push it and return the reference
    pub async fn load_image(&self, local_image: &str, tag: &str) -> Result<String> {
        let image_ref = RegistrySettings::image_ref(tag);
        info!(source = %local_image, target = %image_ref, "pushing image to local registry");
        self.engine.tag(local_image, &image_ref).await?;
        self.engine.push(&image_ref, true).await?;
        Ok(image_ref)
    }

    /// Start the registry, then build and push every configured image
    ///
    /// `build` returns the local name of the image it produced.
    pub async fn setup_all<F, Fut>(&self, mut build: F) -> Result<Vec<String>>
    where
        F: FnMut(RegistryImage) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.start().await?;
        let mut pushed = Vec::with_capacity(self.settings.containers.len());
        for image in self.settings.containers.clone() {
            let name = image.name.clone();
            let tag = image.tag.clone();
            let local = build(image)
                .await
                .map_err(|e| Error::resource(format!("image {}: build failed: {}", name, e)))?;
            pushed.push(self.load_image(&local, &tag).await?);
        }
        info!(images = pushed.len(), "registry setup complete");
        Ok(pushed)
    }

    /// Registry address on the kind network, if attached
    pub async fn kind_network_ip(&self) -> Result<Option<String>> {
        let networks = self.engine.container_networks(CONTAINER_NAME).await?;
        if let Some(ep) = networks.get(KIND_NETWORK).filter(|ep| !ep.ip_address.is_empty()) {
            return Ok(Some(ep.ip_address.clone()));
        }
        // podman may prefix the network name
        Ok(networks
            .iter()
            .find(|(name, ep)| name.contains(KIND_NETWORK) && !ep.ip_address.is_empty())
            .map(|(_, ep)| ep.ip_address.clone()))
    }

    /// Attach the registry to the kind network so nodes can reach it
    pub async fn connect_to_kind_network(&self) -> Result<()> {
        if let Ok(Some(ip)) = self.kind_network_ip().await {
            debug!(ip = %ip, "registry already on kind network");
            return Ok(());
        }
        self.engine
            .connect_network(KIND_NETWORK, CONTAINER_NAME)
            .await?;
        info!("registry connected to kind network");
        Ok(())
    }

    /// Remove the registry container; absent is fine
    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.engine.remove_container(CONTAINER_NAME).await {
            debug!(error = %e, "registry container not removed");
        }
        info!(container = CONTAINER_NAME, "local registry stopped");
        Ok(())
    }
}
