//! Deterministic names for host-to-DPU pairing links
//!
//! Bridge names are bounded by the kernel's interface name limit, so the
//! pair is hashed rather than concatenated. The same (host, dpu) pair always
//! yields the same name, which is what lets teardown find bridges created by
//! an earlier run.

use std::fmt::Write;

use aws_lc_rs::digest;

/// Prefix that marks a name as a derived pairing link
pub const LINK_TAG: &str = "h2d-";

/// Linux interface names are limited to IFNAMSIZ - 1 characters
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Derive the bridge name for the link between `host` and `dpu`.
///
/// Callers always pass the host first. The result is at most
/// [`MAX_INTERFACE_NAME_LEN`] characters.
pub fn derive_link_name(host: &str, dpu: &str) -> String {
    let hash = digest::digest(&digest::SHA256, format!("{}-{}", host, dpu).as_bytes());
    let short = hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        });
    sanitize_interface_name(&format!("{}{}", LINK_TAG, short))
}

/// Libvirt network name for the link between `host` and `dpu`
pub fn link_network_name(host: &str, dpu: &str) -> String {
    format!("{}{}-{}", LINK_TAG, host, dpu)
}

/// Strip characters the kernel rejects and clamp to the length limit
pub fn sanitize_interface_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_INTERFACE_NAME_LEN)
        .collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Check a user-supplied bridge name against kernel interface rules
pub fn validate_interface_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("interface name is empty".to_string());
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(format!(
            "interface name '{}' is {} characters, limit is {}",
            name,
            name.len(),
            MAX_INTERFACE_NAME_LEN
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!(
            "interface name '{}' contains invalid character '{}'",
            name, bad
        ));
    }
    Ok(())
}
