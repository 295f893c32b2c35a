#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_registry_controller_core as core;
pub use mesh_registry_controller_k8s_api as k8s;
pub use mesh_registry_controller_k8s_index as index;

mod args;
mod dns;
mod notify;
mod watch;

pub use self::args::Args;
