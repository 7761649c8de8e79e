//! podnet - container network backends
//!
//! Network configuration, IPAM and container attach/detach on top of either
//! the netavark binary or a chain of CNI plugins, behind one
//! [`network::ContainerNetwork`] interface.

pub mod config;
pub mod error;
pub mod network;

pub use error::AppError;
