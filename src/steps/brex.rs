//! External `br-ex` bridge required by OVN-Kubernetes gateway mode
//!
//! The cluster-plane interface is enslaved to an OVS bridge named `br-ex`
//! through NetworkManager so the configuration survives reboots. The bridge
//! clones the interface MAC so it keeps the same DHCP lease.

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use super::{Step, StepExecutor, Target};
use crate::{Error, Result};

/// Name of the external bridge
pub const BRIDGE: &str = "br-ex";

#[derive(Debug, Deserialize)]
struct Link {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    local: String,
}

/// Interface carrying `address` in `ip -j addr show` output
fn interface_for(json: &str, address: &str) -> Result<Option<String>> {
    let links: Vec<Link> = serde_json::from_str(json)?;
    Ok(links
        .into_iter()
        .find(|l| l.addr_info.iter().any(|a| a.local == address))
        .map(|l| l.ifname))
}

/// Whether the bridge was created or found already in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Bridge created by this call
    Created,
    /// Bridge already existed
    AlreadyPresent,
}

/// Ensure `br-ex` exists on the node, built from the interface holding `cluster_address`
///
/// `management_address` is kept off the default route when it lives on a
/// different interface.
pub async fn ensure_external_bridge(
    exec: &StepExecutor,
    target: Target<'_>,
    management_address: &str,
    cluster_address: &str,
    timeout: Duration,
) -> Result<BridgeOutcome> {
    let links = exec
        .run(
            target,
            &Step::new(
                "br-ex-links",
                format!(
                    "if ip link show {} > /dev/null 2>&1; then echo present; else ip -j addr show; fi",
                    BRIDGE
                ),
                Duration::from_secs(30),
            ),
        )
        .await?;
    if links.output == "present" {
        info!(node = %target.node, "br-ex already present");
        return Ok(BridgeOutcome::AlreadyPresent);
    }

    let uplink = interface_for(&links.output, cluster_address)?.ok_or_else(|| {
        Error::step_failure(
            target.node,
            "br-ex",
            format!("no interface holds {}", cluster_address),
        )
    })?;
    let mgmt = interface_for(&links.output, management_address)?.filter(|m| *m != uplink);

    exec.run(target, &Step::new("br-ex", script(&uplink, mgmt.as_deref()), timeout))
        .await?;
    info!(node = %target.node, uplink = %uplink, "br-ex created");
    Ok(BridgeOutcome::Created)
}

/// NetworkManager commands building the bridge
///
/// Every connection is added only when absent, so a run interrupted
/// part-way can be repeated.
fn script(uplink: &str, mgmt: Option<&str>) -> String {
    let mut s = format!(
        "set -e\n\
         BR={br}\n\
         IF={uplink}\n\
         ensure_conn() {{ name=$1; shift; sudo nmcli -g NAME c show \"$name\" > /dev/null 2>&1 || sudo nmcli c add \"$@\" con-name \"$name\"; }}\n\
         IF_MAC=$(cat /sys/class/net/$IF/address)\n\
         IF_CONN=$(sudo nmcli -g GENERAL.CONNECTION device show $IF 2>/dev/null || echo '')\n\
         ensure_conn $BR type ovs-bridge conn.interface $BR\n\
         ensure_conn ovs-port-$BR type ovs-port conn.interface $BR master $BR\n\
         ensure_conn ovs-if-$BR type ovs-interface slave-type ovs-port conn.interface $BR master ovs-port-$BR\n\
         ensure_conn ovs-port-$IF type ovs-port conn.interface $IF master $BR\n\
         ensure_conn ovs-if-$IF type ethernet conn.interface $IF master ovs-port-$IF\n\
         if [ -n \"$IF_CONN\" ] && [ \"$IF_CONN\" != \"--\" ] && [ \"$IF_CONN\" != \"ovs-if-$IF\" ]; then sudo nmcli conn delete \"$IF_CONN\"; fi\n\
         sudo ip addr flush dev $IF\n\
         for c in $BR ovs-if-$IF ovs-port-$IF ovs-if-$BR ovs-port-$BR; do sudo nmcli conn mod $c connection.autoconnect yes; done\n\
         sudo nmcli conn mod ovs-if-$BR ipv4.method auto ipv4.route-metric 50 ipv4.never-default no\n\
         sudo nmcli conn mod ovs-if-$BR 802-3-ethernet.cloned-mac-address $IF_MAC\n",
        br = BRIDGE,
        uplink = uplink,
    );
    if let Some(mgmt) = mgmt {
        s.push_str(&format!(
            "MGMT_CONN=$(sudo nmcli -g GENERAL.CONNECTION device show {} 2>/dev/null || echo '')\n\
             if [ -n \"$MGMT_CONN\" ] && [ \"$MGMT_CONN\" != \"--\" ]; then\n\
             \x20 sudo nmcli conn mod \"$MGMT_CONN\" ipv4.never-default yes ipv4.ignore-auto-dns yes\n\
             \x20 sudo nmcli conn up \"$MGMT_CONN\"\n\
             fi\n",
            mgmt
        ));
    }
    s.push_str(
        "for c in $BR ovs-if-$IF ovs-port-$IF ovs-if-$BR ovs-port-$BR; do sudo nmcli conn up $c; done\n\
         sudo ovs-vsctl --may-exist add-br br-int\n\
         sudo ovs-vsctl set open_vswitch . external-ids:ovn-bridge-mappings=\"physnet1:br-ex\"\n",
    );
    s
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::testing::{FakeTransport, Reply};

    const ADDRS: &str = r#"[
      {"ifindex":1,"ifname":"lo","addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
      {"ifindex":2,"ifname":"enp1s0","addr_info":[{"family":"inet","local":"192.168.120.11","prefixlen":24}]},
      {"ifindex":3,"ifname":"enp2s0","addr_info":[{"family":"inet","local":"192.168.123.11","prefixlen":24}]},
      {"ifindex":4,"ifname":"enp3s0"}
    ]"#;

    fn target() -> Target<'static> {
        Target {
            node: "master-1",
            address: "192.168.120.11",
        }
    }

    #[test]
    fn finds_interface_by_address() {
        assert_eq!(
            interface_for(ADDRS, "192.168.123.11").unwrap().as_deref(),
            Some("enp2s0")
        );
        assert_eq!(interface_for(ADDRS, "10.9.9.9").unwrap(), None);
        assert!(interface_for("not json", "x").is_err());
    }

    #[tokio::test]
    async fn creates_bridge_on_cluster_interface() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("ip -j addr show", Reply::Ok(ADDRS.into()));
        let outcome = ensure_external_bridge(
            &StepExecutor::new(fake.clone()),
            target(),
            "192.168.120.11",
            "192.168.123.11",
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        assert_eq!(outcome, BridgeOutcome::Created);
        assert_eq!(fake.count_any("IF=enp2s0"), 1);
        assert_eq!(fake.count_any("device show enp1s0"), 1);
        assert_eq!(fake.count_any("physnet1:br-ex"), 1);
    }

    #[tokio::test]
    async fn existing_bridge_is_left_alone() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("ip link show br-ex", Reply::Ok("present\n".into()));
        let outcome = ensure_external_bridge(
            &StepExecutor::new(fake.clone()),
            target(),
            "192.168.120.11",
            "192.168.123.11",
            Duration::from_secs(300),
        )
        .await
        .unwrap();
        assert_eq!(outcome, BridgeOutcome::AlreadyPresent);
        assert_eq!(fake.count_any("nmcli"), 0);
    }

    #[tokio::test]
    async fn missing_cluster_interface_fails_step() {
        let fake = Arc::new(FakeTransport::new());
        fake.on("ip -j addr show", Reply::Ok(ADDRS.into()));
        let err = ensure_external_bridge(
            &StepExecutor::new(fake),
            target(),
            "192.168.120.11",
            "10.1.1.1",
            Duration::from_secs(300),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no interface holds 10.1.1.1"));
    }

    #[test]
    fn every_nmcli_call_runs_under_sudo() {
        let s = script("enp2s0", Some("enp1s0"));
        for line in s.lines() {
            for (i, _) in line.match_indices("nmcli ") {
                assert!(
                    line[..i].ends_with("sudo "),
                    "unprivileged nmcli in: {}",
                    line
                );
            }
        }
        assert!(!s.contains("\nnmcli c add"));
    }

    const NMCLI_STUB: &str = r#"#!/bin/sh
echo "$*" >> "$NM_LOG"
if [ "$1" = "-g" ] && [ "$2" = "GENERAL.CONNECTION" ]; then echo "Wired connection 1"; exit 0; fi
if [ "$1" = "-g" ] && [ "$2" = "NAME" ]; then grep -qx "$5" "$NM_STATE"; exit $?; fi
if [ "$1" = "c" ] && [ "$2" = "add" ]; then
  prev=""
  for a in "$@"; do
    if [ "$prev" = "con-name" ]; then echo "$a" >> "$NM_STATE"; fi
    prev="$a"
  done
fi
exit 0
"#;

    /// Runs the bridge script against stubbed system tools, returning the
    /// `nmcli` invocations and the connections known afterwards
    fn run_with_existing(existing: &[&str]) -> (Vec<String>, Vec<String>) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let stubs = [
            ("nmcli", NMCLI_STUB),
            ("sudo", "#!/bin/sh\nexec \"$@\"\n"),
            ("ip", "#!/bin/sh\nexit 0\n"),
            ("ovs-vsctl", "#!/bin/sh\nexit 0\n"),
            ("cat", "#!/bin/sh\necho 52:54:00:aa:bb:cc\n"),
        ];
        for (name, body) in stubs {
            let path = bin.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let log = dir.path().join("nmcli.log");
        let state = dir.path().join("connections");
        let mut known = existing.join("\n");
        known.push('\n');
        std::fs::write(&state, known).unwrap();
        let script_path = dir.path().join("br-ex.sh");
        std::fs::write(&script_path, script("enp2s0", None)).unwrap();

        let path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let status = std::process::Command::new("sh")
            .arg(&script_path)
            .env("PATH", path)
            .env("NM_LOG", &log)
            .env("NM_STATE", &state)
            .status()
            .unwrap();
        assert!(status.success());

        let read = |p: &std::path::Path| -> Vec<String> {
            std::fs::read_to_string(p)
                .unwrap_or_default()
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        };
        (read(&log), read(&state))
    }

    #[test]
    fn interrupted_run_only_adds_missing_connections() {
        let (calls, known) = run_with_existing(&["br-ex", "ovs-port-br-ex"]);
        let added: Vec<&String> = calls.iter().filter(|c| c.starts_with("c add")).collect();
        assert_eq!(added.len(), 3, "{:?}", added);
        assert!(added.iter().all(|c| !c.ends_with("con-name br-ex")));
        assert!(added.iter().all(|c| !c.ends_with("con-name ovs-port-br-ex")));
        for name in ["br-ex", "ovs-port-br-ex", "ovs-if-br-ex", "ovs-port-enp2s0", "ovs-if-enp2s0"] {
            assert_eq!(known.iter().filter(|k| *k == name).count(), 1, "{}", name);
        }
    }

    #[test]
    fn completed_run_adds_nothing() {
        let (calls, _) = run_with_existing(&[
            "br-ex",
            "ovs-port-br-ex",
            "ovs-if-br-ex",
            "ovs-port-enp2s0",
            "ovs-if-enp2s0",
        ]);
        assert_eq!(calls.iter().filter(|c| c.starts_with("c add")).count(), 0);
        assert!(calls.iter().any(|c| c.starts_with("conn up")));
    }
}
