//! Teardown of everything a bring-up may have created
//!
//! The backend removes its node instances before its networks and bridges.
//! Saved kubeconfigs go last. Absent resources count as success, so tearing
//! down a half-built or already-removed environment is safe, and a second
//! teardown in a row does nothing.

use tracing::{debug, info};

use crate::backend::{collect_errors, ProvisioningBackend};
use crate::kubeconfig;
use crate::topology::Topology;
use crate::Result;

/// Destroy the substrate and remove saved kubeconfigs
///
/// Every part is attempted even when an earlier one fails; the failures
/// come back together.
pub async fn teardown(backend: &dyn ProvisioningBackend, topology: &Topology) -> Result<()> {
    info!(backend = backend.name(), "tearing down");
    let mut errors = Vec::new();

    if let Err(e) = backend.destroy_substrate().await {
        errors.push(e.to_string());
    }

    let dir = &topology.kubernetes.kubeconfig_dir;
    for cluster in &topology.kubernetes.clusters {
        match kubeconfig::remove(dir, &cluster.name).await {
            Ok(true) => debug!(cluster = %cluster.name, "kubeconfig removed"),
            Ok(false) => {}
            Err(e) => errors.push(format!("kubeconfig for {}: {}", cluster.name, e)),
        }
    }

    collect_errors("teardown", errors)?;
    info!("teardown complete");
    Ok(())
}
