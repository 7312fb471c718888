use crate::cgroup::detect_cgroup_root;
use crate::config::ManagerConfig;
use crate::image::ImageResolver;
use crate::lifecycle::plan_teardown;
use crate::prereq::{check_host_prereqs, MissingPrereq};
use crate::pull::ImagePuller;
use crate::spec::{helper_spec, signal_number, HelperSpec};
use crate::CoreError;
use flexmount_runtime::{
    ContainerRuntime, CtrRuntime, HostExec, NewContainer, RuntimeError, SystemExec,
};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One helper container to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub image: String,
    pub name: String,
    /// Host path the FUSE process mounts onto.
    pub target_path: String,
    pub args: Vec<String>,
}

impl ContainerRequest {
    pub fn new(
        image: impl Into<String>,
        name: impl Into<String>,
        target_path: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            target_path: target_path.into(),
            args,
        }
    }
}

/// Creates and removes helper containers against a container runtime.
///
/// Holds no per-container state: every operation re-reads what the runtime
/// knows. Operations on the same name must be serialized by the caller.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    exec: Arc<dyn HostExec>,
    config: ManagerConfig,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        exec: Arc<dyn HostExec>,
        config: ManagerConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        debug!(
            runtime = runtime.name(),
            namespace = %config.namespace,
            source_namespace = %config.source_namespace,
            "lifecycle manager ready"
        );
        Ok(Self {
            runtime,
            exec,
            config,
        })
    }

    /// Manager backed by the host's `ctr` and the containerd socket in `config`.
    pub fn connect(config: ManagerConfig) -> Result<Self, CoreError> {
        Self::connect_with(Arc::new(SystemExec::new()), config)
    }

    pub fn connect_with(exec: Arc<dyn HostExec>, config: ManagerConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let bin = ImagePuller::new(exec.as_ref(), &config).locate_tool()?;
        let runtime = CtrRuntime::connect(exec.clone(), config.ctr_config(bin))?;
        Self::new(Arc::new(runtime), exec, config)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn check_prereqs(&self) -> Vec<MissingPrereq> {
        check_host_prereqs(self.exec.as_ref(), &self.config)
    }

    pub fn create(
        &self,
        image: &str,
        name: &str,
        target_path: &str,
        args: &[String],
    ) -> Result<PathBuf, CoreError> {
        self.create_container(&ContainerRequest::new(
            image,
            name,
            target_path,
            args.to_vec(),
        ))
    }

    /// Create and start the helper container, returning its task log path.
    ///
    /// Empty `args` run the image's own entrypoint and command.
    ///
    /// Returns once the runtime acknowledges the start; the FUSE mount may not
    /// be ready yet. Nothing is rolled back on failure.
    pub fn create_container(&self, request: &ContainerRequest) -> Result<PathBuf, CoreError> {
        let name = request.name.as_str();
        let ns = self.config.namespace.as_str();

        let log_path = self.allocate_log_file(name, &request.target_path)?;
        debug!(
            container = name,
            target = %request.target_path,
            log = %log_path.display(),
            "allocated task log file"
        );

        let image = ImageResolver::new(self.runtime.as_ref(), self.exec.as_ref(), &self.config)
            .resolve(&request.image)?;

        // Leftover from an earlier attempt that failed after preparing it.
        if let Err(e) = self
            .runtime
            .remove_snapshot(ns, &self.config.snapshotter, name)
        {
            debug!(container = name, "no stale snapshot removed: {e}");
        }

        let cgroup_root = detect_cgroup_root(self.exec.as_ref(), &self.config.cgroup);
        let spec = helper_spec(
            &self.config,
            &HelperSpec {
                container_id: name,
                image: &image,
                target_path: &request.target_path,
                args: &request.args,
                cgroup_root: &cgroup_root,
            },
        )?;

        self.runtime
            .new_container(
                ns,
                NewContainer {
                    id: name.to_owned(),
                    image: image.clone(),
                    snapshotter: self.config.snapshotter.clone(),
                    snapshot_key: name.to_owned(),
                    runtime: self.config.runtime.clone(),
                    spec,
                },
            )
            .map_err(lifecycle(name, "create container"))?;

        let task = self
            .runtime
            .new_task(ns, name, &log_path)
            .map_err(lifecycle(name, "create task"))?;
        self.runtime
            .start_task(ns, name)
            .map_err(lifecycle(name, "start task"))?;

        info!(
            container = name,
            image = %image.name,
            pid = task.pid,
            cgroup = %cgroup_root,
            "helper container started"
        );
        Ok(log_path)
    }

    /// Stop the container's task if it is live, then delete task and container.
    ///
    /// A task that does not exit within the stop timeout is left in place
    /// together with its container.
    pub fn remove_container(&self, name: &str) -> Result<(), CoreError> {
        let ns = self.config.namespace.as_str();
        debug!(container = name, "removing container");

        match self.runtime.load_container(ns, name) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Err(CoreError::ContainerNotFound(name.to_owned())),
            Err(e) => return Err(lifecycle(name, "load container")(e)),
        }

        let status = match self.runtime.load_task(ns, name) {
            Ok(task) => {
                let status = self
                    .runtime
                    .task_status(ns, name)
                    .map_err(lifecycle(name, "query task status"))?;
                debug!(container = name, pid = task.pid, %status, "found task");
                Some(status)
            }
            Err(e) if e.is_not_found() => {
                debug!(container = name, "no task found, removing container");
                None
            }
            Err(e) => return Err(lifecycle(name, "load task")(e)),
        };

        let plan = plan_teardown(status);
        if plan.kill {
            self.stop_task(name)?;
        }
        if plan.delete_task {
            let exit = self
                .runtime
                .delete_task(ns, name)
                .map_err(lifecycle(name, "delete task"))?;
            debug!(container = name, code = exit.code, "task deleted");
        }

        self.runtime
            .delete_container(ns, name)
            .map_err(lifecycle(name, "delete container"))?;
        info!(container = name, "helper container removed");
        Ok(())
    }

    fn stop_task(&self, name: &str) -> Result<(), CoreError> {
        let ns = self.config.namespace.as_str();
        let signal = signal_number(&self.config.stop_signal).ok_or_else(|| {
            CoreError::Config(format!("unsupported stop signal '{}'", self.config.stop_signal))
        })?;

        debug!(container = name, signal, "killing task");
        self.runtime
            .kill_task(ns, name, signal, true)
            .map_err(lifecycle(name, "kill task"))?;

        let exits = self
            .runtime
            .wait_task(ns, name)
            .map_err(lifecycle(name, "wait for task"))?;
        let timeout = self.config.stop_timeout();
        match exits.recv_timeout(timeout) {
            Ok(exit) => {
                debug!(
                    container = name,
                    code = exit.code,
                    exited_at = %exit.exited_at,
                    "task exited"
                );
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(container = name, ?timeout, "task did not exit in time");
                Err(CoreError::StopTimeout {
                    container: name.to_owned(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(CoreError::WaitInterrupted {
                container: name.to_owned(),
            }),
        }
    }

    /// Fresh, never reused log file named after the container and target.
    fn allocate_log_file(&self, name: &str, target_path: &str) -> Result<PathBuf, CoreError> {
        let sanitized = target_path.replace('/', "-");
        let dir = self.config.log_dir();
        std::fs::create_dir_all(&dir)?;
        let (_file, path) = tempfile::Builder::new()
            .prefix(&format!("{name}-{sanitized}-"))
            .tempfile_in(&dir)?
            .keep()
            .map_err(|e| CoreError::Io(e.error))?;
        Ok(path)
    }
}

fn lifecycle<'a>(
    container: &'a str,
    action: &'static str,
) -> impl Fn(RuntimeError) -> CoreError + 'a {
    move |source| CoreError::Lifecycle {
        container: container.to_owned(),
        action,
        source,
    }
}
