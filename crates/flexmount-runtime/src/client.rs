use crate::oci::RuntimeSpecConfig;
use crate::RuntimeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

/// Runtime configuration an image declares for its default process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    pub name: String,
    pub digest: String,
    #[serde(default)]
    pub config: ImageConfig,
}

impl ImageRecord {
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: digest.into(),
            config: ImageConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ImageConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub runtime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Pausing,
    Stopped,
    Unknown,
}

impl TaskStatus {
    /// A task in one of these states has no live process to signal.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Pausing => "pausing",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub container_id: String,
    pub pid: u32,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    pub exited_at: DateTime<Utc>,
}

/// Everything the service needs to create a container bound to a fresh snapshot.
///
/// The runtime spec is moved in; a built spec backs exactly one container.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    pub image: ImageRecord,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub runtime: String,
    pub spec: RuntimeSpecConfig,
}

/// Namespaced operations of a containerd-style container-runtime service.
///
/// Implementations are long-lived handles shared read-only across operations.
/// Lookups of absent objects must return [`RuntimeError::NotFound`], which
/// callers use for control flow.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn get_image(&self, namespace: &str, name: &str) -> Result<ImageRecord, RuntimeError>;

    /// Write the image content, in an archive form `import_images` accepts, to `out`.
    fn export_image(
        &self,
        namespace: &str,
        image: &ImageRecord,
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError>;

    fn import_images(
        &self,
        namespace: &str,
        input: &mut dyn Read,
    ) -> Result<Vec<ImageRecord>, RuntimeError>;

    /// Unpack the image layers into the snapshot store of `snapshotter`.
    fn unpack_image(
        &self,
        namespace: &str,
        image: &ImageRecord,
        snapshotter: &str,
    ) -> Result<(), RuntimeError>;

    fn remove_snapshot(
        &self,
        namespace: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<(), RuntimeError>;

    fn new_container(
        &self,
        namespace: &str,
        request: NewContainer,
    ) -> Result<ContainerRecord, RuntimeError>;

    fn load_container(&self, namespace: &str, id: &str) -> Result<ContainerRecord, RuntimeError>;

    fn delete_container(&self, namespace: &str, id: &str) -> Result<(), RuntimeError>;

    /// Create the container's task with stdout and stderr appended to `log_path`.
    fn new_task(
        &self,
        namespace: &str,
        container_id: &str,
        log_path: &Path,
    ) -> Result<TaskRecord, RuntimeError>;

    fn load_task(&self, namespace: &str, container_id: &str) -> Result<TaskRecord, RuntimeError>;

    fn start_task(&self, namespace: &str, container_id: &str) -> Result<(), RuntimeError>;

    fn task_status(&self, namespace: &str, container_id: &str)
        -> Result<TaskStatus, RuntimeError>;

    /// Signal the task; with `all` set the signal reaches every process in the container.
    fn kill_task(
        &self,
        namespace: &str,
        container_id: &str,
        signal: i32,
        all: bool,
    ) -> Result<(), RuntimeError>;

    /// Register interest in the task exit. The receiver yields one status when
    /// the task stops; dropping it does not cancel the service-side wait.
    fn wait_task(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<Receiver<ExitStatus>, RuntimeError>;

    fn delete_task(&self, namespace: &str, container_id: &str)
        -> Result<ExitStatus, RuntimeError>;
}
