//! hostpath-csi: node-local hostpath CSI driver.
//!
//! Volumes are directories under a volume root on the node. This crate
//! implements the Container Storage Interface (CSI) Identity, Controller and
//! Node services over them, exposing each volume to workloads by bind mounts.

// Generated protobuf code has doc formatting issues
#![allow(clippy::doc_overindented_list_items)]
#![allow(clippy::doc_lazy_continuation)]
// tonic::Status is large by design (176 bytes)
#![allow(clippy::result_large_err)]

pub mod capability;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod locks;
pub mod mount;
pub mod node;
pub mod types;
pub mod volume;

pub mod csi {
    tonic::include_proto!("csi.v1");

    pub use prost_types::Timestamp;

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("csi_descriptor");
}

pub use config::Config;
pub use driver::{Driver, DriverState};
pub use error::{Error, Result};
pub use mount::{HostMounter, Mounter, StageMode};
pub use types::VolumeId;
pub use volume::VolumeStore;

#[cfg(test)]
pub(crate) mod test_util;
