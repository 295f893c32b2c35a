//! Mesh Registry Index
//!
//! Maintains an in-memory model of the cluster's services and their endpoints,
//! from which the configuration distribution engine answers proxy queries. It
//! consumes the following cluster resources:
//!
//! - Each `Service` becomes a registry record keyed by its hostname. Services
//!   labelled with a network, or named by the mesh networks document, also act
//!   as gateways into their network.
//! - Each `Endpoints` (or `EndpointSlice`) lists the addresses of a service.
//!   Addresses that refer to pods are joined with the pod (and its node) to
//!   determine locality, identity and TLS mode.
//! - Each `Pod` is indexed by IP. Endpoints may refer to a pod before the pod
//!   itself is observed; such addresses are withheld and resolved once the pod
//!   arrives.
//! - Each `Node` provides the locality of the pods it runs and the external
//!   addresses of node-port gateways.
//!
//! ```text
//! [ Node ] <- [ Pod ] <- [ Endpoints ] -> [ Service ] -> [ Gateway ]
//! ```
//!
//! Changes that affect proxy configuration are reported through a
//! [`Notifier`](mesh_registry_controller_core::push::Notifier).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
mod controller;
mod endpoints;
mod health;
pub mod metrics;
mod network;
mod node;
mod notify;
mod pod;
mod service;


pub use self::{
    cluster_info::ClusterInfo,
    controller::{Change, Controller, Event, EventStream, Handle, IndexSizes},
    endpoints::{
        EndpointSet, EndpointSetKey, InvalidWorkloadRef, Subset, SubsetAddress, SubsetPort,
        WorkloadRef,
    },
    network::{NetworkTable, DEFAULT_NETWORK_GATEWAY_PORT},
    node::NodeLocality,
    notify::ServiceHandler,
    pod::PodKey,
};
