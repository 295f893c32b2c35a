#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod mesh_networks;

pub use self::{
    labels::Labels,
    mesh_networks::MeshNetworks,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
            HTTPGetAction, LoadBalancerIngress, Node, NodeAddress, NodeSpec, NodeStatus,
            ObjectReference, Pod, PodSpec, PodStatus, Probe, Service, ServicePort, ServiceSpec,
            ServiceStatus, TCPSocketAction,
        },
        discovery::v1::{Endpoint as SliceEndpoint, EndpointConditions, EndpointSlice},
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
pub use kube::api::{ObjectMeta, ResourceExt};
