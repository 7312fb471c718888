use crate::client::{
    ContainerRecord, ContainerRuntime, ExitStatus, ImageRecord, NewContainer, TaskRecord,
    TaskStatus,
};
use crate::exec::{ExecOutput, HostExec};
use crate::oci::RuntimeSpecConfig;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operations of [`ContainerRuntime`], used to record calls and inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetImage,
    ExportImage,
    ImportImages,
    UnpackImage,
    RemoveSnapshot,
    NewContainer,
    LoadContainer,
    DeleteContainer,
    NewTask,
    LoadTask,
    StartTask,
    TaskStatus,
    KillTask,
    WaitTask,
    DeleteTask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub namespace: String,
    pub target: String,
    pub detail: String,
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

struct MockContainer {
    record: ContainerRecord,
    spec: RuntimeSpecConfig,
}

struct MockTask {
    record: TaskRecord,
    status: TaskStatus,
    exit: Option<ExitStatus>,
    waiters: Vec<Sender<ExitStatus>>,
}

impl MockTask {
    fn stop(&mut self, code: u32) {
        let exit = ExitStatus {
            code,
            exited_at: chrono::Utc::now(),
        };
        self.status = TaskStatus::Stopped;
        self.exit = Some(exit);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(exit);
        }
    }
}

#[derive(Default)]
struct MockState {
    images: HashMap<Key, ImageRecord>,
    unpacked: HashSet<(String, String, String)>,
    snapshots: HashSet<(String, String, String)>,
    containers: HashMap<Key, MockContainer>,
    tasks: HashMap<Key, MockTask>,
    calls: Vec<Call>,
    failures: HashMap<Op, u32>,
    unavailable: bool,
    next_pid: u32,
}

impl MockState {
    fn record(&mut self, op: Op, namespace: &str, target: &str, detail: String) {
        self.calls.push(Call {
            op,
            namespace: namespace.to_owned(),
            target: target.to_owned(),
            detail,
        });
    }

    fn injected(&mut self, op: Op) -> Result<(), RuntimeError> {
        if self.unavailable {
            return Err(RuntimeError::Unavailable(format!("{op:?}: service went away")));
        }
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::Failed(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }

    fn task_mut(&mut self, namespace: &str, id: &str) -> Result<&mut MockTask, RuntimeError> {
        self.tasks
            .get_mut(&key(namespace, id))
            .ok_or_else(|| RuntimeError::not_found("task", id))
    }
}

#[derive(Serialize, Deserialize)]
struct MockArchive {
    images: Vec<ImageRecord>,
}

/// In-memory [`ContainerRuntime`] with call recording and failure injection.
///
/// Killing a running task stops it after the configured exit delay; with no
/// delay configured the signal is ignored and waiters never hear back.
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    exit_after_kill: Mutex<Option<Duration>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_pid: 1000,
                ..MockState::default()
            })),
            exit_after_kill: Mutex::new(Some(Duration::ZERO)),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::Failed(format!("mutex poisoned: {e}")))
    }

    fn guard(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_image(&self, namespace: &str, image: ImageRecord) {
        self.guard().images.insert(key(namespace, &image.name), image);
    }

    pub fn has_image(&self, namespace: &str, name: &str) -> bool {
        self.guard().images.contains_key(&key(namespace, name))
    }

    pub fn is_unpacked(&self, namespace: &str, name: &str, snapshotter: &str) -> bool {
        self.guard().unpacked.contains(&(
            namespace.to_owned(),
            name.to_owned(),
            snapshotter.to_owned(),
        ))
    }

    pub fn add_snapshot(&self, namespace: &str, snapshotter: &str, snapshot_key: &str) {
        self.guard().snapshots.insert((
            namespace.to_owned(),
            snapshotter.to_owned(),
            snapshot_key.to_owned(),
        ));
    }

    pub fn has_snapshot(&self, namespace: &str, snapshotter: &str, snapshot_key: &str) -> bool {
        self.guard().snapshots.contains(&(
            namespace.to_owned(),
            snapshotter.to_owned(),
            snapshot_key.to_owned(),
        ))
    }

    /// Seed a container, optionally with a task in the given state.
    pub fn add_container(&self, namespace: &str, id: &str, task: Option<TaskStatus>) {
        let mut state = self.guard();
        state.containers.insert(
            key(namespace, id),
            MockContainer {
                record: ContainerRecord {
                    id: id.to_owned(),
                    image: "seeded".to_owned(),
                    snapshotter: "overlayfs".to_owned(),
                    snapshot_key: id.to_owned(),
                    runtime: "io.containerd.runc.v2".to_owned(),
                },
                spec: RuntimeSpecConfig::default(),
            },
        );
        if let Some(status) = task {
            state.next_pid += 1;
            let pid = state.next_pid;
            state.tasks.insert(
                key(namespace, id),
                MockTask {
                    record: TaskRecord {
                        container_id: id.to_owned(),
                        pid,
                        log_path: None,
                    },
                    status,
                    exit: None,
                    waiters: Vec::new(),
                },
            );
        }
    }

    pub fn has_container(&self, namespace: &str, id: &str) -> bool {
        self.guard().containers.contains_key(&key(namespace, id))
    }

    pub fn container_spec(&self, namespace: &str, id: &str) -> Option<RuntimeSpecConfig> {
        self.guard()
            .containers
            .get(&key(namespace, id))
            .map(|c| c.spec.clone())
    }

    pub fn container_record(&self, namespace: &str, id: &str) -> Option<ContainerRecord> {
        self.guard()
            .containers
            .get(&key(namespace, id))
            .map(|c| c.record.clone())
    }

    pub fn status_of(&self, namespace: &str, id: &str) -> Option<TaskStatus> {
        self.guard().tasks.get(&key(namespace, id)).map(|t| t.status)
    }

    /// Make the next `count` calls of `op` fail.
    pub fn fail_next(&self, op: Op, count: u32) {
        self.guard().failures.insert(op, count);
    }

    /// While set, every operation fails as if the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.guard().unavailable = unavailable;
    }

    /// `None` makes running tasks ignore kill signals.
    pub fn set_exit_after_kill(&self, delay: Option<Duration>) {
        let mut slot = match self.exit_after_kill.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.guard().calls.clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.guard().calls.iter().map(|c| c.op).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.guard().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.guard().calls.clear();
    }

    fn exit_delay(&self) -> Option<Duration> {
        match self.exit_after_kill.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn get_image(&self, namespace: &str, name: &str) -> Result<ImageRecord, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::GetImage, namespace, name, String::new());
        state.injected(Op::GetImage)?;
        state
            .images
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| RuntimeError::not_found("image", name))
    }

    fn export_image(
        &self,
        namespace: &str,
        image: &ImageRecord,
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::ExportImage, namespace, &image.name, String::new());
        state.injected(Op::ExportImage)?;
        let record = state
            .images
            .get(&key(namespace, &image.name))
            .cloned()
            .ok_or_else(|| RuntimeError::not_found("image", &image.name))?;
        serde_json::to_writer(
            out,
            &MockArchive {
                images: vec![record],
            },
        )?;
        Ok(())
    }

    fn import_images(
        &self,
        namespace: &str,
        input: &mut dyn Read,
    ) -> Result<Vec<ImageRecord>, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::ImportImages, namespace, "", String::new());
        state.injected(Op::ImportImages)?;
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;
        let archive: MockArchive = serde_json::from_slice(&raw)?;
        for image in &archive.images {
            state
                .images
                .insert(key(namespace, &image.name), image.clone());
        }
        Ok(archive.images)
    }

    fn unpack_image(
        &self,
        namespace: &str,
        image: &ImageRecord,
        snapshotter: &str,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::UnpackImage, namespace, &image.name, snapshotter.to_owned());
        state.injected(Op::UnpackImage)?;
        if !state.images.contains_key(&key(namespace, &image.name)) {
            return Err(RuntimeError::not_found("image", &image.name));
        }
        state.unpacked.insert((
            namespace.to_owned(),
            image.name.clone(),
            snapshotter.to_owned(),
        ));
        Ok(())
    }

    fn remove_snapshot(
        &self,
        namespace: &str,
        snapshotter: &str,
        snapshot_key: &str,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.record(
            Op::RemoveSnapshot,
            namespace,
            snapshot_key,
            snapshotter.to_owned(),
        );
        state.injected(Op::RemoveSnapshot)?;
        let removed = state.snapshots.remove(&(
            namespace.to_owned(),
            snapshotter.to_owned(),
            snapshot_key.to_owned(),
        ));
        if removed {
            Ok(())
        } else {
            Err(RuntimeError::not_found("snapshot", snapshot_key))
        }
    }

    fn new_container(
        &self,
        namespace: &str,
        request: NewContainer,
    ) -> Result<ContainerRecord, RuntimeError> {
        let mut state = self.lock()?;
        state.record(
            Op::NewContainer,
            namespace,
            &request.id,
            request.image.name.clone(),
        );
        if state.containers.contains_key(&key(namespace, &request.id)) {
            return Err(RuntimeError::AlreadyExists {
                kind: "container",
                name: request.id,
            });
        }
        if !state
            .images
            .contains_key(&key(namespace, &request.image.name))
        {
            return Err(RuntimeError::not_found("image", &request.image.name));
        }
        let snapshot = (
            namespace.to_owned(),
            request.snapshotter.clone(),
            request.snapshot_key.clone(),
        );
        if state.snapshots.contains(&snapshot) {
            return Err(RuntimeError::AlreadyExists {
                kind: "snapshot",
                name: request.snapshot_key,
            });
        }
        // The snapshot is prepared before the container record is written, so
        // a failure past this point leaves it behind.
        state.snapshots.insert(snapshot);
        state.injected(Op::NewContainer)?;

        let record = ContainerRecord {
            id: request.id.clone(),
            image: request.image.name.clone(),
            snapshotter: request.snapshotter,
            snapshot_key: request.snapshot_key,
            runtime: request.runtime,
        };
        state.containers.insert(
            key(namespace, &request.id),
            MockContainer {
                record: record.clone(),
                spec: request.spec,
            },
        );
        Ok(record)
    }

    fn load_container(&self, namespace: &str, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::LoadContainer, namespace, id, String::new());
        state.injected(Op::LoadContainer)?;
        state
            .containers
            .get(&key(namespace, id))
            .map(|c| c.record.clone())
            .ok_or_else(|| RuntimeError::not_found("container", id))
    }

    fn delete_container(&self, namespace: &str, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::DeleteContainer, namespace, id, String::new());
        state.injected(Op::DeleteContainer)?;
        if state.tasks.contains_key(&key(namespace, id)) {
            return Err(RuntimeError::Failed(format!(
                "cannot delete container {id}: task still exists"
            )));
        }
        let container = state
            .containers
            .remove(&key(namespace, id))
            .ok_or_else(|| RuntimeError::not_found("container", id))?;
        state.snapshots.remove(&(
            namespace.to_owned(),
            container.record.snapshotter,
            container.record.snapshot_key,
        ));
        Ok(())
    }

    fn new_task(
        &self,
        namespace: &str,
        container_id: &str,
        log_path: &Path,
    ) -> Result<TaskRecord, RuntimeError> {
        let mut state = self.lock()?;
        state.record(
            Op::NewTask,
            namespace,
            container_id,
            log_path.display().to_string(),
        );
        state.injected(Op::NewTask)?;
        if !state.containers.contains_key(&key(namespace, container_id)) {
            return Err(RuntimeError::not_found("container", container_id));
        }
        if state.tasks.contains_key(&key(namespace, container_id)) {
            return Err(RuntimeError::AlreadyExists {
                kind: "task",
                name: container_id.to_owned(),
            });
        }

        let mut log = std::fs::OpenOptions::new().append(true).open(log_path)?;
        writeln!(log, "mock task created for {container_id}")?;

        state.next_pid += 1;
        let record = TaskRecord {
            container_id: container_id.to_owned(),
            pid: state.next_pid,
            log_path: Some(log_path.to_path_buf()),
        };
        state.tasks.insert(
            key(namespace, container_id),
            MockTask {
                record: record.clone(),
                status: TaskStatus::Created,
                exit: None,
                waiters: Vec::new(),
            },
        );
        Ok(record)
    }

    fn load_task(&self, namespace: &str, container_id: &str) -> Result<TaskRecord, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::LoadTask, namespace, container_id, String::new());
        state.injected(Op::LoadTask)?;
        Ok(state.task_mut(namespace, container_id)?.record.clone())
    }

    fn start_task(&self, namespace: &str, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::StartTask, namespace, container_id, String::new());
        state.injected(Op::StartTask)?;
        let task = state.task_mut(namespace, container_id)?;
        if task.status != TaskStatus::Created {
            return Err(RuntimeError::Failed(format!(
                "task {container_id} cannot start from state {}",
                task.status
            )));
        }
        task.status = TaskStatus::Running;
        Ok(())
    }

    fn task_status(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<TaskStatus, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::TaskStatus, namespace, container_id, String::new());
        state.injected(Op::TaskStatus)?;
        Ok(state.task_mut(namespace, container_id)?.status)
    }

    fn kill_task(
        &self,
        namespace: &str,
        container_id: &str,
        signal: i32,
        all: bool,
    ) -> Result<(), RuntimeError> {
        let delay = self.exit_delay();
        let mut state = self.lock()?;
        state.record(
            Op::KillTask,
            namespace,
            container_id,
            format!("signal={signal} all={all}"),
        );
        state.injected(Op::KillTask)?;
        let task = state.task_mut(namespace, container_id)?;
        if task.status.is_settled() {
            return Ok(());
        }
        let code = 128 + signal.unsigned_abs();
        match delay {
            Some(d) if d.is_zero() => task.stop(code),
            Some(d) => {
                let shared = Arc::clone(&self.state);
                let k = key(namespace, container_id);
                std::thread::spawn(move || {
                    std::thread::sleep(d);
                    let mut state = match shared.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Some(task) = state.tasks.get_mut(&k) {
                        task.stop(code);
                    }
                });
            }
            None => {}
        }
        Ok(())
    }

    fn wait_task(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<Receiver<ExitStatus>, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::WaitTask, namespace, container_id, String::new());
        state.injected(Op::WaitTask)?;
        let task = state.task_mut(namespace, container_id)?;
        let (tx, rx) = mpsc::channel();
        match (task.status, task.exit) {
            (TaskStatus::Stopped, Some(exit)) => {
                let _ = tx.send(exit);
            }
            _ => task.waiters.push(tx),
        }
        Ok(rx)
    }

    fn delete_task(
        &self,
        namespace: &str,
        container_id: &str,
    ) -> Result<ExitStatus, RuntimeError> {
        let mut state = self.lock()?;
        state.record(Op::DeleteTask, namespace, container_id, String::new());
        state.injected(Op::DeleteTask)?;
        let task = state.task_mut(namespace, container_id)?;
        if !task.status.is_settled() {
            return Err(RuntimeError::Failed(format!(
                "task {container_id} is still {}",
                task.status
            )));
        }
        let exit = task.exit.unwrap_or(ExitStatus {
            code: 0,
            exited_at: chrono::Utc::now(),
        });
        state.tasks.remove(&key(namespace, container_id));
        Ok(exit)
    }
}

type Canned = Result<ExecOutput, (i32, String)>;

#[derive(Default)]
struct MockExecState {
    responses: HashMap<String, Canned>,
    routes: Vec<(String, Vec<String>, Canned)>,
    on_path: HashMap<String, PathBuf>,
    existing: HashSet<PathBuf>,
    invocations: Vec<(String, Vec<String>)>,
}

/// [`HostExec`] answering from canned responses instead of running binaries.
///
/// Programs without a canned response behave like missing binaries.
#[derive(Default)]
pub struct MockExec {
    state: Mutex<MockExecState>,
}

impl MockExec {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, MockExecState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Answer every run of `program` with `stdout` and a zero exit.
    pub fn respond(&self, program: &str, stdout: &str) {
        self.guard()
            .responses
            .insert(program.to_owned(), Ok(ExecOutput::stdout(stdout)));
    }

    pub fn fail(&self, program: &str, code: i32, output: &str) {
        self.guard()
            .responses
            .insert(program.to_owned(), Err((code, output.to_owned())));
    }

    /// Answer runs of `program` whose arguments contain `pattern` as a
    /// contiguous run. Routes win over [`MockExec::respond`]; the most recent
    /// matching route wins over older ones.
    pub fn respond_to(&self, program: &str, pattern: &[&str], stdout: &str) {
        self.route(program, pattern, Ok(ExecOutput::stdout(stdout)));
    }

    pub fn fail_to(&self, program: &str, pattern: &[&str], code: i32, output: &str) {
        self.route(program, pattern, Err((code, output.to_owned())));
    }

    fn route(&self, program: &str, pattern: &[&str], answer: Canned) {
        let pattern = pattern.iter().map(|s| (*s).to_owned()).collect();
        self.guard()
            .routes
            .push((program.to_owned(), pattern, answer));
    }

    /// Put `program` on the search path at `path`.
    pub fn install(&self, program: &str, path: &str) {
        self.guard()
            .on_path
            .insert(program.to_owned(), PathBuf::from(path));
    }

    pub fn add_path(&self, path: &str) {
        self.guard().existing.insert(PathBuf::from(path));
    }

    pub fn invocations(&self) -> Vec<(String, Vec<String>)> {
        self.guard().invocations.clone()
    }
}

impl HostExec for MockExec {
    fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.guard();
        state
            .invocations
            .push((program.to_owned(), args.to_vec()));
        let routed = state.routes.iter().rev().find(|(p, pattern, _)| {
            p == program
                && (pattern.is_empty() || args.windows(pattern.len()).any(|w| w == pattern.as_slice()))
        });
        let answer = routed
            .map(|(_, _, answer)| answer)
            .or_else(|| state.responses.get(program));
        match answer {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err((code, output))) => Err(RuntimeError::CommandFailed {
                program: program.to_owned(),
                code: *code,
                output: output.clone(),
            }),
            None => Err(RuntimeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{program}: not found"),
            ))),
        }
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        self.guard().on_path.get(program).cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.guard();
        state.existing.contains(path) || state.on_path.values().any(|p| p == path)
    }
}
