//! dpusim - simulated host/DPU Kubernetes clusters on libvirt VMs or kind nodes
//!
//! A declarative topology names networks, nodes and clusters. dpusim
//! provisions the substrate through a backend, prepares every node over its
//! transport, initializes each cluster with kubeadm, installs the selected
//! network plugin and joins the workers, then prints a per-cluster summary.
//!
//! # Modules
//!
//! - [`topology`] - Topology document, defaults and validation
//! - [`naming`] - Deterministic bridge and link-network names
//! - [`poll`] - Bounded readiness polling
//! - [`host`] - Commands on the orchestrating host
//! - [`transport`] - Commands on nodes (ssh, docker exec)
//! - [`backend`] - libvirt and kind provisioning backends
//! - [`steps`] - Host preparation, kubeadm and bridge steps
//! - [`k8s`] - Cluster API access with kube-rs, or kubectl on the bootstrap control-plane
//! - [`cni`] - flannel, multus, OVN-Kubernetes and kindnet
//! - [`orchestrator`] - The bring-up state machine
//! - [`container`] - Docker or Podman on the orchestrating host
//! - [`registry`] - Local image registry
//! - [`image`] - OVN-Kubernetes image builds
//! - [`vmctl`] - Start, stop and reach individual VMs
//! - [`report`] - Summary table and exit status
//! - [`teardown`] - Idempotent teardown
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod backend;
pub mod cni;
pub mod container;
pub mod error;
pub mod host;
pub mod image;
pub mod k8s;
pub mod kubeconfig;
pub mod naming;
pub mod orchestrator;
pub mod poll;
pub mod registry;
pub mod render;
pub mod report;
pub mod steps;
pub mod teardown;
pub mod topology;
pub mod transport;
pub mod vmctl;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
