//! Lifecycle orchestration for privileged FUSE helper containers.
//!
//! The `LifecycleManager` creates a helper container for a volume mount
//! (resolving the image across runtime namespaces, falling back to a host
//! pull, assembling a privileged runtime spec) and tears it down through a
//! bounded stop-wait-delete sequence. The container-runtime service and host
//! process execution are injected capabilities from `flexmount-runtime`.

pub mod cgroup;
pub mod config;
pub mod image;
pub mod lifecycle;
pub mod manager;
pub mod prereq;
pub mod pull;
pub mod retry;
pub mod spec;

pub use cgroup::{detect_cgroup_root, CgroupLayout};
pub use config::{CgroupConfig, ManagerConfig, PullConfig};
pub use image::ImageResolver;
pub use lifecycle::{plan_teardown, TeardownPlan};
pub use manager::{ContainerRequest, LifecycleManager};
pub use prereq::{check_host_prereqs, format_missing, MissingPrereq};
pub use pull::ImagePuller;
pub use retry::{Attempt, RetryFailure, RetryPolicy};

use flexmount_runtime::RuntimeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("container '{0}' not found")]
    ContainerNotFound(String),
    #[error("failed to {action} for container '{container}': {source}")]
    Lifecycle {
        container: String,
        action: &'static str,
        #[source]
        source: RuntimeError,
    },
    #[error("timed out after {timeout:?} waiting for task of container '{container}' to exit")]
    StopTimeout { container: String, timeout: Duration },
    #[error("exit notification for container '{container}' was dropped before the task exited")]
    WaitInterrupted { container: String },
    #[error("importing image '{image}' from source namespace failed after {attempts} attempts: {source}")]
    ImportExhausted {
        image: String,
        attempts: u32,
        #[source]
        source: RuntimeError,
    },
    #[error("image pull tool '{0}' not found")]
    PullToolNotFound(String),
    #[error("failed to pull image '{image}': {source}")]
    PullFailed {
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("credential helper '{helper}' failed: {source}")]
    Credentials {
        helper: String,
        #[source]
        source: RuntimeError,
    },
    #[error("invalid runtime spec: {0}")]
    InvalidSpec(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cannot parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True when the failure means the image or container does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ContainerNotFound(_) => true,
            Self::Runtime(e) => e.is_not_found(),
            _ => false,
        }
    }
}
