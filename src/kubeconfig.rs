//! Admin kubeconfigs saved on the orchestrating host

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::Result;

/// Where the kubeconfig of `cluster` lives
pub fn path_for(dir: &Path, cluster: &str) -> PathBuf {
    dir.join(format!("{}.kubeconfig", cluster))
}

/// Write the kubeconfig, readable by the owner only
pub async fn save(dir: &Path, cluster: &str, content: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = path_for(dir, cluster);
    tokio::fs::write(&path, content).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(path)
}

/// Remove a saved kubeconfig; returns whether one existed
pub async fn remove(dir: &Path, cluster: &str) -> Result<bool> {
    match tokio::fs::remove_file(path_for(dir, cluster)).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
