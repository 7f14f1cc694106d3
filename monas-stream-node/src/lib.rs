pub mod application_service;
pub mod domain;
pub mod infrastructure;
pub mod port;

#[cfg(test)]
pub mod test_utils;

pub use domain::*;
pub use port::*;

pub use application_service::{
    DataReceivedOutcome, Node, NodeConfig, NodeError, ProxyConnectionError,
};
