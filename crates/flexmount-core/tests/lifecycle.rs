//! Create and remove against the in-memory runtime.

use flexmount_core::{CoreError, LifecycleManager, ManagerConfig};
use flexmount_runtime::{
    ImageConfig, ImageRecord, MockExec, MockRuntime, Op, Propagation, TaskStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const NS: &str = "flexmount";
const SOURCE_NS: &str = "k8s.io";
const IMAGE: &str = "img:v1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FLEXMOUNT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flexmount_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

struct Harness {
    rt: Arc<MockRuntime>,
    exec: Arc<MockExec>,
    mgr: LifecycleManager,
    _logs: tempfile::TempDir,
}

fn harness_with(tweak: impl FnOnce(&mut ManagerConfig)) -> Harness {
    init_tracing();
    let logs = tempfile::tempdir().unwrap();
    let rt = Arc::new(MockRuntime::new());
    let exec = Arc::new(MockExec::new());
    let mut config = ManagerConfig {
        log_dir: Some(logs.path().to_path_buf()),
        import_delay_ms: 10,
        stop_timeout_ms: 2_000,
        ..ManagerConfig::default()
    };
    tweak(&mut config);
    let mgr = LifecycleManager::new(rt.clone(), exec.clone(), config).unwrap();
    Harness {
        rt,
        exec,
        mgr,
        _logs: logs,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn run_args() -> Vec<String> {
    vec!["run".to_owned()]
}

fn is_task_op(op: Op) -> bool {
    matches!(
        op,
        Op::LoadTask | Op::TaskStatus | Op::KillTask | Op::WaitTask | Op::DeleteTask
    )
}

// --- create ---

#[test]
fn create_with_local_image() {
    let h = harness();
    h.exec.respond("stat", "cgroup2fs\n");
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));

    let log = h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();

    assert!(log.exists());
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("fuse-a"));
    assert_eq!(h.rt.status_of(NS, "fuse-a"), Some(TaskStatus::Running));
    assert!(h.rt.has_snapshot(NS, "overlayfs", "fuse-a"));
    assert_eq!(h.rt.count(Op::ExportImage), 0);

    let record = h.rt.container_record(NS, "fuse-a").unwrap();
    assert_eq!(record.image, IMAGE);
    assert_eq!(record.snapshot_key, "fuse-a");
    assert_eq!(record.runtime, "io.containerd.runc.v2");

    let spec = h.rt.container_spec(NS, "fuse-a").unwrap();
    assert_eq!(spec.process.args, vec!["run"]);
    assert!(spec.privileged);
    assert_eq!(spec.cgroups_path, "/kubepods.slice/fuse-a");
    assert_eq!(spec.rootfs_propagation, Some(Propagation::Shared));

    let target = spec.mount_at("/fuse_mount").unwrap();
    assert_eq!(target.source, "/mnt/a");
    assert!(target.has_option("rbind"));
    assert!(target.has_option("shared"));
    assert!(spec.mount_at("/etc/flexmount/fuse").unwrap().has_option("ro"));
    assert!(spec.mount_at("/var/log/containers").is_some());
    assert!(spec.devices.iter().any(|d| d.path == "/dev/fuse"));
}

#[test]
fn create_with_image_only_in_source_namespace() {
    let h = harness();
    h.rt.add_image(SOURCE_NS, ImageRecord::new(IMAGE, "sha256:1"));

    h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();

    assert_eq!(h.rt.count(Op::ExportImage), 1);
    assert_eq!(h.rt.count(Op::ImportImages), 1);
    assert_eq!(h.rt.count(Op::UnpackImage), 1);
    assert!(h.rt.has_image(NS, IMAGE));
    assert!(h.rt.is_unpacked(NS, IMAGE, "overlayfs"));
    assert!(h.exec.invocations().iter().all(|(program, _)| program == "stat"));
    assert_eq!(h.rt.status_of(NS, "fuse-a"), Some(TaskStatus::Running));

    // Legacy hierarchy because `stat` had no canned answer.
    let spec = h.rt.container_spec(NS, "fuse-a").unwrap();
    assert_eq!(spec.cgroups_path, "/kubepods/fuse-a");
}

#[test]
fn create_retries_import_until_it_succeeds() {
    let h = harness();
    h.rt.add_image(SOURCE_NS, ImageRecord::new(IMAGE, "sha256:1"));
    h.rt.fail_next(Op::ImportImages, 2);

    let start = Instant::now();
    h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();

    assert_eq!(h.rt.count(Op::ExportImage), 3);
    assert_eq!(h.rt.count(Op::ImportImages), 3);
    assert_eq!(h.rt.count(Op::UnpackImage), 1);
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn import_gives_up_after_ten_attempts_then_pulls() {
    let h = harness_with(|c| c.import_delay_ms = 5);
    h.exec.install("ctr", "/usr/bin/ctr");
    h.exec.fail("/usr/bin/ctr", 1, "failed to resolve reference");
    h.rt.add_image(SOURCE_NS, ImageRecord::new(IMAGE, "sha256:1"));
    h.rt.fail_next(Op::ImportImages, 100);

    let start = Instant::now();
    let err = h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap_err();

    assert!(matches!(err, CoreError::PullFailed { .. }));
    assert_eq!(h.rt.count(Op::ExportImage), 10);
    assert_eq!(h.rt.count(Op::ImportImages), 10);
    assert_eq!(h.rt.count(Op::UnpackImage), 0);
    assert!(start.elapsed() >= Duration::from_millis(45));
    let pulls: Vec<_> = h
        .exec
        .invocations()
        .into_iter()
        .filter(|(program, _)| program == "/usr/bin/ctr")
        .collect();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].1[0], "-n");
    assert_eq!(pulls[0].1[1], NS);
    assert_eq!(h.rt.count(Op::NewContainer), 0);
}

#[test]
fn create_after_failed_attempt_reuses_snapshot_name() {
    let h = harness();
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));
    h.rt.fail_next(Op::NewContainer, 1);

    let first = h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args());
    assert!(first.is_err());
    assert!(h.rt.has_snapshot(NS, "overlayfs", "fuse-a"));
    assert!(!h.rt.has_container(NS, "fuse-a"));

    let second = h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();
    assert!(second.exists());
    assert_eq!(h.rt.status_of(NS, "fuse-a"), Some(TaskStatus::Running));
    assert_eq!(h.rt.count(Op::RemoveSnapshot), 2);
}

#[test]
fn every_attempt_gets_its_own_log_file() {
    let h = harness();
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));

    let first = h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();
    h.mgr.remove_container("fuse-a").unwrap();
    let second = h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();

    assert_ne!(first, second);
    assert!(first.exists() && second.exists());
    let dir = h.mgr.config().log_dir();
    assert_eq!(first.parent(), Some(dir.as_path()));
}

#[test]
fn image_command_and_stop_signal_reach_the_container() {
    let h = harness();
    h.rt.add_image(
        NS,
        ImageRecord::new(IMAGE, "sha256:1").with_config(ImageConfig {
            entrypoint: vec!["/usr/bin/fuse-helper".to_owned()],
            cmd: vec!["--foreground".to_owned()],
            stop_signal: Some("SIGINT".to_owned()),
            ..ImageConfig::default()
        }),
    );

    h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &[]).unwrap();

    let spec = h.rt.container_spec(NS, "fuse-a").unwrap();
    assert_eq!(spec.process.args, vec!["/usr/bin/fuse-helper", "--foreground"]);
    assert_eq!(spec.stop_signal, "SIGINT");

    // Teardown keeps signalling with the configured signal.
    h.mgr.remove_container("fuse-a").unwrap();
    let kill = h
        .rt
        .calls()
        .into_iter()
        .find(|c| c.op == Op::KillTask)
        .unwrap();
    assert_eq!(kill.detail, "signal=15 all=true");
}

#[test]
fn create_rejects_relative_target() {
    let h = harness();
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));
    let err = h
        .mgr
        .create(IMAGE, "fuse-a", "mnt/a", &run_args())
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidSpec(_)));
    assert_eq!(h.rt.count(Op::NewContainer), 0);
}

#[test]
fn failed_stale_snapshot_cleanup_does_not_block_create() {
    let h = harness();
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));
    h.rt.fail_next(Op::RemoveSnapshot, 1);

    h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();

    assert_eq!(h.rt.count(Op::RemoveSnapshot), 1);
    assert_eq!(h.rt.status_of(NS, "fuse-a"), Some(TaskStatus::Running));
}

#[test]
fn stale_snapshot_left_by_failed_cleanup_surfaces_at_container_creation() {
    let h = harness();
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));
    h.rt.add_snapshot(NS, "overlayfs", "fuse-a");
    h.rt.fail_next(Op::RemoveSnapshot, 1);

    let err = h
        .mgr
        .create(IMAGE, "fuse-a", "/mnt/a", &run_args())
        .unwrap_err();

    match err {
        CoreError::Lifecycle {
            container, action, ..
        } => {
            assert_eq!(container, "fuse-a");
            assert_eq!(action, "create container");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!h.rt.has_container(NS, "fuse-a"));
    assert_eq!(h.rt.count(Op::NewTask), 0);
}

// --- remove ---

#[test]
fn remove_running_task() {
    let h = harness();
    h.rt.add_container(NS, "fuse-a", Some(TaskStatus::Running));
    h.rt.set_exit_after_kill(Some(Duration::from_millis(50)));

    let start = Instant::now();
    h.mgr.remove_container("fuse-a").unwrap();

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(
        h.rt.ops(),
        vec![
            Op::LoadContainer,
            Op::LoadTask,
            Op::TaskStatus,
            Op::KillTask,
            Op::WaitTask,
            Op::DeleteTask,
            Op::DeleteContainer,
        ]
    );
    let kill = h
        .rt
        .calls()
        .into_iter()
        .find(|c| c.op == Op::KillTask)
        .unwrap();
    assert_eq!(kill.detail, "signal=15 all=true");
    assert!(!h.rt.has_container(NS, "fuse-a"));
    assert_eq!(h.rt.status_of(NS, "fuse-a"), None);
}

#[test]
fn settled_tasks_are_deleted_without_kill() {
    for status in [TaskStatus::Created, TaskStatus::Stopped] {
        let h = harness();
        h.rt.add_container(NS, "fuse-a", Some(status));

        h.mgr.remove_container("fuse-a").unwrap();

        assert_eq!(h.rt.count(Op::KillTask), 0, "{status}");
        assert_eq!(h.rt.count(Op::WaitTask), 0, "{status}");
        assert_eq!(h.rt.count(Op::DeleteTask), 1, "{status}");
        assert!(!h.rt.has_container(NS, "fuse-a"));
    }
}

#[test]
fn container_without_task_skips_task_operations() {
    let h = harness();
    h.rt.add_container(NS, "fuse-a", None);

    h.mgr.remove_container("fuse-a").unwrap();

    let task_ops: Vec<Op> = h.rt.ops().into_iter().filter(|op| is_task_op(*op)).collect();
    assert_eq!(task_ops, vec![Op::LoadTask]);
    assert_eq!(h.rt.count(Op::DeleteContainer), 1);
    assert!(!h.rt.has_container(NS, "fuse-a"));
}

#[test]
fn stop_timeout_leaves_task_and_container() {
    let h = harness_with(|c| c.stop_timeout_ms = 100);
    h.rt.add_container(NS, "fuse-a", Some(TaskStatus::Running));
    h.rt.set_exit_after_kill(None);

    let start = Instant::now();
    let err = h.mgr.remove_container("fuse-a").unwrap_err();

    assert!(start.elapsed() >= Duration::from_millis(100));
    match err {
        CoreError::StopTimeout { container, timeout } => {
            assert_eq!(container, "fuse-a");
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.rt.count(Op::DeleteTask), 0);
    assert_eq!(h.rt.count(Op::DeleteContainer), 0);
    assert!(h.rt.has_container(NS, "fuse-a"));
    assert_eq!(h.rt.status_of(NS, "fuse-a"), Some(TaskStatus::Running));
}

#[test]
fn kill_failure_is_fatal_and_not_retried() {
    let h = harness();
    h.rt.add_container(NS, "fuse-a", Some(TaskStatus::Paused));
    h.rt.fail_next(Op::KillTask, 1);

    let err = h.mgr.remove_container("fuse-a").unwrap_err();

    assert!(matches!(err, CoreError::Lifecycle { action: "kill task", .. }));
    assert_eq!(h.rt.count(Op::KillTask), 1);
    assert_eq!(h.rt.count(Op::DeleteTask), 0);
}

#[test]
fn delete_task_failure_keeps_container() {
    let h = harness();
    h.rt.add_container(NS, "fuse-a", Some(TaskStatus::Stopped));
    h.rt.fail_next(Op::DeleteTask, 1);

    let err = h.mgr.remove_container("fuse-a").unwrap_err();

    match err {
        CoreError::Lifecycle {
            container, action, ..
        } => {
            assert_eq!(container, "fuse-a");
            assert_eq!(action, "delete task");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.rt.count(Op::DeleteTask), 1);
    assert_eq!(h.rt.count(Op::DeleteContainer), 0);
    assert!(h.rt.has_container(NS, "fuse-a"));
    assert_eq!(h.rt.status_of(NS, "fuse-a"), Some(TaskStatus::Stopped));
}

#[test]
fn delete_container_failure_is_fatal() {
    let h = harness();
    h.rt.add_container(NS, "fuse-a", None);
    h.rt.fail_next(Op::DeleteContainer, 1);

    let err = h.mgr.remove_container("fuse-a").unwrap_err();

    assert!(matches!(
        err,
        CoreError::Lifecycle {
            action: "delete container",
            ..
        }
    ));
    assert_eq!(h.rt.count(Op::DeleteContainer), 1);
    assert!(h.rt.has_container(NS, "fuse-a"));

    // Nothing was torn down, so a second call starts over cleanly.
    h.mgr.remove_container("fuse-a").unwrap();
    assert!(!h.rt.has_container(NS, "fuse-a"));
}

#[test]
fn remove_unknown_container() {
    let h = harness();
    let err = h.mgr.remove_container("fuse-a").unwrap_err();
    assert!(matches!(err, CoreError::ContainerNotFound(_)));
    assert!(h.rt.ops().iter().all(|op| *op == Op::LoadContainer));
}

#[test]
fn create_then_remove_round_trip() {
    let h = harness();
    h.rt.add_image(NS, ImageRecord::new(IMAGE, "sha256:1"));
    h.mgr.create(IMAGE, "fuse-a", "/mnt/a", &run_args()).unwrap();
    h.mgr.remove_container("fuse-a").unwrap();

    assert!(!h.rt.has_container(NS, "fuse-a"));
    assert!(!h.rt.has_snapshot(NS, "overlayfs", "fuse-a"));
}

// --- prerequisites ---

#[test]
fn prereqs_reported_through_manager() {
    let h = harness();
    assert_eq!(h.mgr.check_prereqs().len(), 3);
    for path in ["/usr/bin/ctr", "/dev/fuse", "/etc/flexmount/fuse"] {
        h.exec.add_path(path);
    }
    assert!(h.mgr.check_prereqs().is_empty());
}
