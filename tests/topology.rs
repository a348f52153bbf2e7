//! Topology loading and link naming through the public API
//!
//! These tests tell the story of a user writing a topology file: what gets
//! filled in for them, which mistakes are caught before anything is
//! provisioned, and which bridge names their host/DPU pairs end up with.

use std::collections::HashSet;
use std::io::Write;

use dpusim::naming::{derive_link_name, link_network_name, MAX_INTERFACE_NAME_LEN};
use dpusim::topology::{CniKind, DeploymentMode, NodeRole, Topology};
use dpusim::Error;

const TOPOLOGY: &str = r#"
networks:
  - name: mgmt-net
    type: mgmt
    bridge_name: virbr-mgmt
    gateway: 192.168.120.1
    subnet_mask: 255.255.255.0
    dhcp_start: 192.168.120.10
    dhcp_end: 192.168.120.200
  - name: k8s-net
    type: k8s
    bridge_name: virbr-k8s
    gateway: 192.168.123.1
    subnet_mask: 255.255.255.0
    dhcp_start: 192.168.123.10
    dhcp_end: 192.168.123.200
vms:
  - name: master-1
    type: host
    k8s_cluster: dpu-cluster
    k8s_role: master
  - name: host-1
    type: host
    k8s_cluster: host-cluster
    k8s_role: master
  - name: dpu-1
    type: dpu
    host: host-1
    k8s_cluster: dpu-cluster
    k8s_role: worker
  - name: dpu-2
    type: dpu
    host: host-1
    k8s_cluster: dpu-cluster
    k8s_role: worker
kubernetes:
  version: "1.32"
  clusters:
    - name: dpu-cluster
      cni: ovn-kubernetes
    - name: host-cluster
      cni: multus
      pod_cidr: 10.200.0.0/16
orchestrator:
  parallelism: 2
"#;

fn write_topology(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// Story: a two-cluster host/DPU topology loads with defaults filled in
#[test]
fn story_topology_file_loads_with_defaults() {
    let file = write_topology(TOPOLOGY);
    let topology = Topology::load(file.path()).unwrap();

    assert_eq!(topology.mode().unwrap(), DeploymentMode::Vm);
    assert_eq!(topology.kubernetes.version, "1.32");
    assert_eq!(topology.orchestrator.parallelism, 2);

    let dpu_cluster = topology.cluster("dpu-cluster").unwrap();
    assert_eq!(dpu_cluster.cni, CniKind::OvnKubernetes);
    assert_eq!(dpu_cluster.pod_cidr, "10.244.0.0/16");
    assert_eq!(topology.cluster("host-cluster").unwrap().pod_cidr, "10.200.0.0/16");

    assert_eq!(topology.node_role(topology.vm("host-1").unwrap()), NodeRole::PairedHost);
    assert_eq!(topology.node_role(topology.vm("master-1").unwrap()), NodeRole::Standalone);
    assert_eq!(topology.cluster_vms("dpu-cluster").count(), 3);
}

/// Story: each host/DPU pair gets its own short, stable bridge
#[test]
fn story_pairing_links_are_derived_per_pair() {
    let file = write_topology(TOPOLOGY);
    let topology = Topology::load(file.path()).unwrap();

    let links = topology.pairing_links();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].network_name, link_network_name("host-1", "dpu-1"));
    assert_eq!(links[0].bridge_name, derive_link_name("host-1", "dpu-1"));
    assert_ne!(links[0].bridge_name, links[1].bridge_name);
    for link in &links {
        assert!(link.bridge_name.starts_with("h2d-"));
        assert!(link.bridge_name.len() <= MAX_INTERFACE_NAME_LEN);
    }

    // a second load of the same file names the same bridges
    let again = Topology::load(file.path()).unwrap().pairing_links();
    assert_eq!(links, again);
}

/// Story: a broken topology is rejected with every problem listed at once
#[test]
fn story_mistakes_are_reported_together() {
    let broken = TOPOLOGY
        .replace("host: host-1\n    k8s_cluster: dpu-cluster\n    k8s_role: worker\n  - name: dpu-2", "host: host-9\n    k8s_cluster: dpu-cluster\n    k8s_role: worker\n  - name: dpu-2")
        .replace("pod_cidr: 10.200.0.0/16", "pod_cidr: 10.200.0.0/99")
        .replace("bridge_name: virbr-mgmt", "bridge_name: virbr-management-net");
    let file = write_topology(&broken);

    match Topology::load(file.path()) {
        Err(Error::Validation(msg)) => {
            assert!(msg.contains("3 problem(s)"), "{}", msg);
            assert!(msg.contains("host-9"));
            assert!(msg.contains("not a valid CIDR"));
            assert!(msg.contains("virbr-management-net"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn unreadable_file_is_a_config_error() {
    let err = Topology::load(std::path::Path::new("/nonexistent/topology.yaml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn link_names_do_not_collide() {
    let names: HashSet<String> = (0..2_000)
        .map(|i| derive_link_name(&format!("host-{}", i), &format!("dpu-{}", i)))
        .collect();
    assert_eq!(names.len(), 2_000);
}
