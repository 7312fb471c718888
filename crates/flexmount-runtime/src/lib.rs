//! Capabilities consumed by the flexmount lifecycle manager.
//!
//! This crate holds the seams between the orchestration logic and the outside
//! world: the `ContainerRuntime` trait describing the namespaced image, snapshot,
//! container and task operations of a containerd-style service, the `HostExec`
//! trait for running host binaries, the declarative OCI runtime spec handed to
//! container creation, a `ctr`-driven runtime for real hosts, and in-memory
//! doubles of both capabilities.

pub mod client;
pub mod ctr;
pub mod exec;
pub mod mock;
pub mod oci;

pub use client::{
    ContainerRecord, ContainerRuntime, ExitStatus, ImageConfig, ImageRecord, NewContainer,
    TaskRecord, TaskStatus,
};
pub use ctr::{CtrConfig, CtrRuntime};
pub use exec::{ExecOutput, HostExec, SystemExec};
pub use mock::{Call, MockExec, MockRuntime, Op};
pub use oci::{
    DeviceNode, DeviceRule, LinuxNamespace, MountSpec, ProcessSpec, Propagation,
    RuntimeSpecConfig,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("runtime service unavailable: {0}")]
    Unavailable(String),
    #[error("command '{program}' exited with code {code}: {output}")]
    CommandFailed {
        program: String,
        code: i32,
        output: String,
    },
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("runtime operation failed: {0}")]
    Failed(String),
}

impl RuntimeError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The service itself cannot be reached; retrying the same call is pointless.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
