//! [`ContainerRuntime`] backed by containerd's `ctr` command line.
//!
//! Every call shells out through a [`HostExec`] as
//! `ctr --address <socket> --namespace <ns> <subcommand>`. Image archives and
//! runtime specs travel through temporary files because `HostExec` only
//! captures text output.

use crate::client::{
    ContainerRecord, ContainerRuntime, ExitStatus, ImageConfig, ImageRecord, NewContainer,
    TaskRecord, TaskStatus,
};
use crate::exec::{ExecOutput, HostExec};
use crate::RuntimeError;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrConfig {
    pub bin: PathBuf,
    /// containerd socket.
    pub address: PathBuf,
    /// Snapshotter imports unpack into.
    pub snapshotter: String,
    /// How often `wait_task` polls the task list.
    pub poll_interval: Duration,
    /// Polling stops after this long and the exit receiver disconnects.
    pub wait_limit: Duration,
}

impl Default for CtrConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("ctr"),
            address: PathBuf::from("/run/containerd/containerd.sock"),
            snapshotter: "overlayfs".to_owned(),
            poll_interval: Duration::from_millis(200),
            wait_limit: Duration::from_secs(60),
        }
    }
}

/// Drives containerd through `ctr`.
///
/// `ctr` has no separate task creation step, so `new_task` only records the
/// log path and the shim comes up in `start_task`. `tasks ls` carries no exit
/// codes, so exits observed by polling report code 0.
pub struct CtrRuntime {
    exec: Arc<dyn HostExec>,
    config: CtrConfig,
    pending: Mutex<HashMap<(String, String), PathBuf>>,
}

impl CtrRuntime {
    pub fn new(exec: Arc<dyn HostExec>, config: CtrConfig) -> Self {
        Self {
            exec,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Build the handle and check the socket answers.
    pub fn connect(exec: Arc<dyn HostExec>, config: CtrConfig) -> Result<Self, RuntimeError> {
        let runtime = Self::new(exec, config);
        let mut args = vec!["--address".to_owned(), runtime.address()];
        args.push("version".to_owned());
        runtime
            .exec
            .run(&runtime.program(), &args)
            .map_err(|e| match e {
                RuntimeError::CommandFailed { output, .. } => {
                    RuntimeError::Unavailable(format!("{}: {output}", runtime.address()))
                }
                other => other,
            })?;
        debug!(address = %runtime.address(), "containerd reachable through ctr");
        Ok(runtime)
    }

    pub fn config(&self) -> &CtrConfig {
        &self.config
    }

    fn program(&self) -> String {
        self.config.bin.display().to_string()
    }

    fn address(&self) -> String {
        self.config.address.display().to_string()
    }

    fn base_args(&self, namespace: &str) -> Vec<String> {
        vec![
            "--address".to_owned(),
            self.address(),
            "--namespace".to_owned(),
            namespace.to_owned(),
        ]
    }

    fn ctr(
        &self,
        namespace: &str,
        subject: (&'static str, &str),
        args: &[&str],
    ) -> Result<ExecOutput, RuntimeError> {
        run_ctr(
            self.exec.as_ref(),
            &self.program(),
            &self.base_args(namespace),
            subject,
            args,
        )
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<(String, String), PathBuf>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn find_image_digest(&self, namespace: &str, name: &str) -> Result<String, RuntimeError> {
        let filter = format!("name=={name}");
        let out = self.ctr(namespace, ("image", name), &["images", "ls", filter.as_str()])?;
        parse_image_digest(&out.stdout, name).ok_or_else(|| RuntimeError::not_found("image", name))
    }

    fn content(&self, namespace: &str, digest: &str) -> Result<Value, RuntimeError> {
        let out = self.ctr(namespace, ("content", digest), &["content", "get", digest])?;
        Ok(serde_json::from_str(&out.stdout)?)
    }

    /// Follow an image index to this host's manifest, then read its config blob.
    fn image_config(&self, namespace: &str, target: &str) -> Result<ImageConfig, RuntimeError> {
        let mut digest = target.to_owned();
        let mut doc = self.content(namespace, &digest)?;
        let selected = doc
            .get("manifests")
            .and_then(Value::as_array)
            .map(|manifests| select_platform(manifests, host_arch()));
        if let Some(selected) = selected {
            digest = selected.ok_or_else(|| {
                RuntimeError::Failed(format!("index {target} has no linux/{} manifest", host_arch()))
            })?;
            doc = self.content(namespace, &digest)?;
        }
        let config_digest = doc
            .pointer("/config/digest")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::Failed(format!("manifest {digest} names no config")))?;
        let blob: OciImage = serde_json::from_value(self.content(namespace, config_digest)?)?;
        Ok(blob.config.into())
    }
}

fn run_ctr(
    exec: &dyn HostExec,
    program: &str,
    base: &[String],
    (kind, name): (&'static str, &str),
    args: &[&str],
) -> Result<ExecOutput, RuntimeError> {
    let mut full = base.to_vec();
    full.extend(args.iter().map(|a| (*a).to_owned()));
    exec.run(program, &full).map_err(|e| classify(e, kind, name))
}

/// Turn `ctr` failure text into the error kinds callers branch on.
fn classify(err: RuntimeError, kind: &'static str, name: &str) -> RuntimeError {
    let RuntimeError::CommandFailed { output, .. } = &err else {
        return err;
    };
    let lower = output.to_lowercase();
    if lower.contains("failed to dial")
        || lower.contains("error while dialing")
        || lower.contains("connection refused")
    {
        RuntimeError::Unavailable(output.clone())
    } else if lower.contains("not found") || lower.contains("does not exist") {
        RuntimeError::not_found(kind, name)
    } else if lower.contains("already exists") {
        RuntimeError::AlreadyExists {
            kind,
            name: name.to_owned(),
        }
    } else {
        err
    }
}

/// `images ls` columns: REF TYPE DIGEST SIZE PLATFORMS LABELS.
fn parse_image_digest(listing: &str, name: &str) -> Option<String> {
    listing.lines().skip(1).find_map(|line| {
        let mut cols = line.split_whitespace();
        (cols.next()? == name).then_some(())?;
        cols.nth(1).map(str::to_owned)
    })
}

/// `images import` reports each image as `unpacking <ref> (<digest>)...done`.
fn parse_imported(output: &str) -> Vec<ImageRecord> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("unpacking ")?;
            let (name, tail) = rest.split_once(" (")?;
            let (digest, _) = tail.split_once(')')?;
            Some(ImageRecord::new(name, digest))
        })
        .collect()
}

struct TaskRow {
    pid: u32,
    status: TaskStatus,
}

/// `tasks ls` columns: TASK PID STATUS.
fn find_task(listing: &str, id: &str) -> Option<TaskRow> {
    listing.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        match cols.as_slice() {
            [task, pid, status, ..] if *task == id => Some(TaskRow {
                pid: pid.parse().unwrap_or(0),
                status: parse_status(status),
            }),
            _ => None,
        }
    })
}

fn parse_status(status: &str) -> TaskStatus {
    match status.to_ascii_uppercase().as_str() {
        "CREATED" => TaskStatus::Created,
        "RUNNING" => TaskStatus::Running,
        "STOPPED" => TaskStatus::Stopped,
        "PAUSED" => TaskStatus::Paused,
        "PAUSING" => TaskStatus::Pausing,
        _ => TaskStatus::Unknown,
    }
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn select_platform(manifests: &[Value], arch: &str) -> Option<String> {
    manifests.iter().find_map(|m| {
        let platform = m.get("platform")?;
        let matches = platform.get("os").and_then(Value::as_str) == Some("linux")
            && platform.get("architecture").and_then(Value::as_str) == Some(arch);
        matches
            .then(|| m.get("digest").and_then(Value::as_str).map(str::to_owned))
            .flatten()
    })
}

#[derive(Debug, Default, Deserialize)]
struct OciImage {
    #[serde(default)]
    config: OciImageConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct OciImageConfig {
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    env: Option<Vec<String>>,
    working_dir: Option<String>,
    stop_signal: Option<String>,
}

impl From<OciImageConfig> for ImageConfig {
    fn from(c: OciImageConfig) -> Self {
        Self {
            entrypoint: c.entrypoint.unwrap_or_default(),
            cmd: c.cmd.unwrap_or_default(),
            env: c.env.unwrap_or_default(),
            working_dir: c.working_dir,
            stop_signal: c.stop_signal,
        }
    }
}

fn temp_file(prefix: &str, suffix: &str) -> Result<tempfile::NamedTempFile, RuntimeError> {
    Ok(tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?)
}

fn poll_exit(
    exec: &dyn HostExec,
    program: &str,
    base: &[String],
    id: &str,
    interval: Duration,
    limit: Duration,
    tx: &Sender<ExitStatus>,
) {
    let deadline = Instant::now() + limit;
    loop {
        let listing = match run_ctr(exec, program, base, ("task", id), &["tasks", "ls"]) {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!(container = id, "task poll failed: {e}");
                return;
            }
        };
        let exited = find_task(&listing, id).map_or(true, |row| row.status == TaskStatus::Stopped);
        if exited {
            let _ = tx.send(ExitStatus {
                code: 0,
                exited_at: Utc::now(),
            });
            return;
        }
        if Instant::now() >= deadline {
            debug!(container = id, ?limit, "gave up polling for task exit");
            return;
        }
        std::thread::sleep(interval);
    }
}

impl ContainerRuntime for CtrRuntime {
    fn name(&self) -> &str {
        "ctr"
    }

    fn get_image(&self, namespace: &str, name: &str) -> Result<ImageRecord, RuntimeError> {
        let digest = self.find_image_digest(namespace, name)?;
        let config = match self.image_config(namespace, &digest) {
            Ok(config) => config,
            Err(e) => {
                warn!(image = name, "image config unreadable, using defaults: {e}");
                ImageConfig::default()
            }
        };
        Ok(ImageRecord::new(name, digest).with_config(config))
    }

    fn export_image(
        &self,
        namespace: &str,
        image: &ImageRecord,
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        let archive = temp_file("flexmount-export-", ".tar")?;
        let path = archive.path().display().to_string();
        self.ctr(
            namespace,
            ("image", &image.name),
            &["images", "export", path.as_str(), image.name.as_str()],
        )?;
        let mut file = archive.reopen()?;
        std::io::copy(&mut file, out)?;
        Ok(())
    }

    fn import_images(
        &self,
        namespace: &str,
        input: &mut dyn Read,
    ) -> Result<Vec<ImageRecord>, RuntimeError> {
        let mut archive = temp_file("flexmount-import-", ".tar")?;
        std::io::copy(input, &mut archive)?;
        archive.flush()?;
        let path = archive.path().display().to_string();
        let out = self.ctr(
            namespace,
            ("archive", &path),
            &[
                "images",
                "import",
                "--snapshotter",
                self.config.snapshotter.as_str(),
                path.as_str(),
            ],
        )?;
        Ok(parse_imported(&out.combined()))
    }

    /// Import already unpacked into the configured snapshotter; this only
    /// confirms the image landed there.
    fn unpack_image(
        &self,
        namespace: &str,
        image: &ImageRecord,
        snapshotter: &str,
    ) -> Result<(), RuntimeError> {
        if snapshotter != self.config.snapshotter {
            return Err(RuntimeError::Failed(format!(
                "ctr imports unpack into '{}', not '{snapshotter}'",
                self.config.snapshotter
            )));
        }
        self.find_image_digest(namespace, &image.name).map(|_| ())
    }

    fn remove_snapshot(
        &self,
        namespace: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<(), RuntimeError> {
        self.ctr(
            namespace,
            ("snapshot", key),
            &["snapshots", "--snapshotter", snapshotter, "rm", key],
        )
        .map(|_| ())
    }

    fn new_container(
        &self,
        namespace: &str,
        request: NewContainer,
    ) -> Result<ContainerRecord, RuntimeError> {
        if request.snapshot_key != request.id {
            return Err(RuntimeError::Failed(format!(
                "ctr names the snapshot after the container; got key '{}' for '{}'",
                request.snapshot_key, request.id
            )));
        }
        let spec_file = temp_file(&format!("{}-", request.id), ".json")?;
        serde_json::to_writer_pretty(spec_file.as_file(), &request.spec.to_oci_json())?;
        let spec_path = spec_file.path().display().to_string();

        self.ctr(
            namespace,
            ("container", &request.id),
            &[
                "containers",
                "create",
                "--snapshotter",
                request.snapshotter.as_str(),
                "--runtime",
                request.runtime.as_str(),
                "--config",
                spec_path.as_str(),
                request.image.name.as_str(),
                request.id.as_str(),
            ],
        )?;
        Ok(ContainerRecord {
            id: request.id,
            image: request.image.name,
            snapshotter: request.snapshotter,
            snapshot_key: request.snapshot_key,
            runtime: request.runtime,
        })
    }

    fn load_container(&self, namespace: &str, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let out = self.ctr(namespace, ("container", id), &["containers", "info", id])?;
        let info: Value = serde_json::from_str(&out.stdout)?;
        let field = |pointer: &str| {
            info.pointer(pointer)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        Ok(ContainerRecord {
            id: id.to_owned(),
            image: field("/Image"),
            snapshotter: field("/Snapshotter"),
            snapshot_key: field("/SnapshotKey"),
            runtime: field("/Runtime/Name"),
        })
    }

    fn delete_container(&self, namespace: &str, id: &str) -> Result<(), RuntimeError> {
        self.ctr(namespace, ("container", id), &["containers", "delete", id])?;
        self.pending().remove(&(namespace.to_owned(), id.to_owned()));
        Ok(())
    }

    fn new_task(
        &self,
        namespace: &str,
        container_id: &str,
        log_path: &Path,
    ) -> Result<TaskRecord, RuntimeError> {
        self.pending().insert(
            (namespace.to_owned(), container_id.to_owned()),
            log_path.to_path_buf(),
        );
        Ok(TaskRecord {
            container_id: container_id.to_owned(),
            pid: 0,
            log_path: Some(log_path.to_path_buf()),
        })
    }

    fn load_task(&self, namespace: &str, container_id: &str) -> Result<TaskRecord, RuntimeError> {
        let out = self.ctr(namespace, ("task", container_id), &["tasks", "ls"])?;
        let row = find_task(&out.stdout, container_id)
            .ok_or_else(|| RuntimeError::not_found("task", container_id))?;
        Ok(TaskRecord {
            container_id: container_id.to_owned(),
            pid: row.pid,
            log_path: None,
        })
    }

    fn start_task(&self, namespace: &str, container_id: &str) -> Result<(), RuntimeError> {
        let log_path = self
            .pending()
            .remove(&(namespace.to_owned(), container_id.to_owned()))
            .ok_or_else(|| RuntimeError::not_found("task", container_id))?;
        let log_uri = format!("file://{}", log_path.display());
        self.ctr(
            namespace,
            ("task", container_id),
            &["tasks", "start", "--detach", "--log-uri", log_uri.as_str(), container_id],
        )
        .map(|_| ())
    }

    fn task_status(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<TaskStatus, RuntimeError> {
        let out = self.ctr(namespace, ("task", container_id), &["tasks", "ls"])?;
        find_task(&out.stdout, container_id)
            .map(|row| row.status)
            .ok_or_else(|| RuntimeError::not_found("task", container_id))
    }

    fn kill_task(
        &self,
        namespace: &str,
        container_id: &str,
        signal: i32,
        all: bool,
    ) -> Result<(), RuntimeError> {
        let signal = signal.to_string();
        let mut args = vec!["tasks", "kill", "--signal", signal.as_str()];
        if all {
            args.push("--all");
        }
        args.push(container_id);
        self.ctr(namespace, ("task", container_id), &args).map(|_| ())
    }

    fn wait_task(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<Receiver<ExitStatus>, RuntimeError> {
        let (tx, rx) = mpsc::channel();
        let exec = Arc::clone(&self.exec);
        let program = self.program();
        let base = self.base_args(namespace);
        let id = container_id.to_owned();
        let interval = self.config.poll_interval;
        let limit = self.config.wait_limit;
        std::thread::Builder::new()
            .name(format!("ctr-wait-{id}"))
            .spawn(move || poll_exit(exec.as_ref(), &program, &base, &id, interval, limit, &tx))?;
        Ok(rx)
    }

    fn delete_task(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<ExitStatus, RuntimeError> {
        self.ctr(
            namespace,
            ("task", container_id),
            &["tasks", "delete", container_id],
        )?;
        Ok(ExitStatus {
            code: 0,
            exited_at: Utc::now(),
        })
    }
}
