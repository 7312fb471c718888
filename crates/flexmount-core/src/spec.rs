//! Runtime spec assembly for FUSE helper containers.
//!
//! A spec is built by applying a list of setters to an empty
//! [`RuntimeSpecConfig`] in order. Each setter validates its own input and
//! only touches the facets it owns, so later setters refine what earlier
//! ones laid down (host namespaces and extra devices add to the baseline).

use crate::config::ManagerConfig;
use crate::CoreError;
use flexmount_runtime::{
    DeviceNode, DeviceRule, ImageRecord, LinuxNamespace, MountSpec, Propagation,
    RuntimeSpecConfig,
};

const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub const FUSE_DEVICE: &str = "/dev/fuse";
const FUSE_MAJOR: i64 = 10;
const FUSE_MINOR: i64 = 229;

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Identity of the container a spec is being built for.
pub struct SpecContext<'a> {
    pub container_id: &'a str,
}

pub type SpecOpt<'a> =
    Box<dyn Fn(&SpecContext<'_>, &mut RuntimeSpecConfig) -> Result<(), CoreError> + 'a>;

/// Apply `opts` in order to an empty spec.
pub fn build_spec(
    container_id: &str,
    opts: &[SpecOpt<'_>],
) -> Result<RuntimeSpecConfig, CoreError> {
    if container_id.is_empty() || container_id.contains('/') {
        return Err(CoreError::InvalidSpec(format!(
            "invalid container id '{container_id}'"
        )));
    }
    let ctx = SpecContext { container_id };
    let mut spec = RuntimeSpecConfig::default();
    for opt in opts {
        opt(&ctx, &mut spec)?;
    }
    Ok(spec)
}

/// Baseline process, pseudo-filesystem mounts, namespaces and hardening.
pub fn with_default_spec<'a>() -> SpecOpt<'a> {
    Box::new(|_, spec| {
        spec.process.cwd = "/".to_owned();
        spec.process.env = vec![DEFAULT_PATH_ENV.to_owned()];
        spec.process.capabilities = DEFAULT_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect();
        spec.process.no_new_privileges = true;
        spec.mounts = vec![
            MountSpec::new("proc", "proc", "/proc", &["nosuid", "noexec", "nodev"]),
            MountSpec::new(
                "tmpfs",
                "tmpfs",
                "/dev",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            MountSpec::new(
                "devpts",
                "devpts",
                "/dev/pts",
                &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
            ),
            MountSpec::new(
                "tmpfs",
                "shm",
                "/dev/shm",
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ),
            MountSpec::new("mqueue", "mqueue", "/dev/mqueue", &["nosuid", "noexec", "nodev"]),
            MountSpec::new("sysfs", "sysfs", "/sys", &["nosuid", "noexec", "nodev", "ro"]),
            MountSpec::new("tmpfs", "tmpfs", "/run", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        ];
        spec.namespaces = vec![
            LinuxNamespace::Pid,
            LinuxNamespace::Ipc,
            LinuxNamespace::Uts,
            LinuxNamespace::Mount,
            LinuxNamespace::Network,
        ];
        spec.masked_paths = MASKED_PATHS.iter().map(|p| (*p).to_owned()).collect();
        spec.readonly_paths = READONLY_PATHS.iter().map(|p| (*p).to_owned()).collect();
        spec.device_rules = vec![DeviceRule::deny_all()];
        Ok(())
    })
}

/// Access to the standard character devices every container needs.
pub fn with_default_unix_devices<'a>() -> SpecOpt<'a> {
    Box::new(|_, spec| {
        let standard = [
            (1, Some(3)),   // null
            (1, Some(5)),   // zero
            (1, Some(7)),   // full
            (1, Some(8)),   // random
            (1, Some(9)),   // urandom
            (5, Some(0)),   // tty
            (5, Some(1)),   // console
            (5, Some(2)),   // ptmx
            (136, None),    // pts
            (10, Some(200)), // tun
        ];
        spec.device_rules.extend(
            standard
                .into_iter()
                .map(|(major, minor)| DeviceRule::char_device(major, minor, "rwm")),
        );
        Ok(())
    })
}

pub fn with_mounts<'a>(mounts: Vec<MountSpec>) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        for mount in &mounts {
            if !mount.destination.starts_with('/') {
                return Err(CoreError::InvalidSpec(format!(
                    "mount destination '{}' is not absolute",
                    mount.destination
                )));
            }
            if mount.kind == "bind" && !mount.source.starts_with('/') {
                return Err(CoreError::InvalidSpec(format!(
                    "bind mount source '{}' is not absolute",
                    mount.source
                )));
            }
        }
        spec.mounts.extend(mounts.iter().cloned());
        Ok(())
    })
}

/// Environment, working directory and command line declared by the image.
pub fn with_image_config(image: &ImageRecord) -> SpecOpt<'_> {
    Box::new(move |_, spec| {
        for var in &image.config.env {
            let name = env_name(var);
            spec.process.env.retain(|existing| env_name(existing) != name);
            spec.process.env.push(var.clone());
        }
        let mut args = image.config.entrypoint.clone();
        args.extend(image.config.cmd.iter().cloned());
        spec.process.args = args;
        if let Some(dir) = image.config.working_dir.as_deref().filter(|d| !d.is_empty()) {
            spec.process.cwd = dir.to_owned();
        }
        Ok(())
    })
}

// Entries without '=' are passed through as-is; the runtime resolves them.
fn env_name(var: &str) -> &str {
    var.split_once('=').map_or(var, |(name, _)| name)
}

/// Replace the process command line. Empty `args` keep whatever an earlier
/// setter (usually [`with_image_config`]) put there, but the spec must end up
/// with a command either way.
pub fn with_process_args<'a>(args: &'a [String]) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        if !args.is_empty() {
            spec.process.args = args.to_vec();
        }
        match spec.process.args.first() {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err(CoreError::InvalidSpec(
                "no process args given and the image declares no command".to_owned(),
            )),
        }
    })
}

/// Full capability set with masking and no-new-privileges lifted.
pub fn with_privileged<'a>() -> SpecOpt<'a> {
    Box::new(|_, spec| {
        spec.privileged = true;
        spec.process.capabilities = ALL_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect();
        spec.process.no_new_privileges = false;
        spec.masked_paths.clear();
        spec.readonly_paths.clear();
        Ok(())
    })
}

pub fn with_all_devices_allowed<'a>() -> SpecOpt<'a> {
    Box::new(|_, spec| {
        spec.device_rules = vec![DeviceRule::allow_all()];
        Ok(())
    })
}

pub fn with_host_devices<'a>() -> SpecOpt<'a> {
    Box::new(|_, spec| {
        spec.host_devices = true;
        Ok(())
    })
}

/// Share `ns` with the host instead of creating a new one.
pub fn with_host_namespace<'a>(ns: LinuxNamespace) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        spec.namespaces.retain(|existing| *existing != ns);
        Ok(())
    })
}

pub fn with_host_hosts_file<'a>() -> SpecOpt<'a> {
    with_host_file("/etc/hosts")
}

pub fn with_host_resolvconf<'a>() -> SpecOpt<'a> {
    with_host_file("/etc/resolv.conf")
}

fn with_host_file<'a>(path: &'static str) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        spec.mounts.retain(|m| m.destination != path);
        spec.mounts.push(MountSpec::bind(path, path, &["rbind", "ro"]));
        Ok(())
    })
}

/// Create `node` in the container and grant `access` to it.
pub fn with_device<'a>(node: DeviceNode, access: &'a str) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        if access.is_empty() || !access.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
            return Err(CoreError::InvalidSpec(format!(
                "invalid device access '{access}' for {}",
                node.path
            )));
        }
        if !node.path.starts_with("/dev/") {
            return Err(CoreError::InvalidSpec(format!(
                "device path '{}' is outside /dev",
                node.path
            )));
        }
        spec.device_rules
            .push(DeviceRule::char_device(node.major, Some(node.minor), access));
        spec.devices.retain(|d| d.path != node.path);
        spec.devices.push(node.clone());
        Ok(())
    })
}

pub fn fuse_device() -> DeviceNode {
    DeviceNode {
        path: FUSE_DEVICE.to_owned(),
        kind: "c".to_owned(),
        major: FUSE_MAJOR,
        minor: FUSE_MINOR,
        file_mode: Some(0o666),
    }
}

/// Place the container under `parent`, named after its id.
pub fn with_cgroup_parent<'a>(parent: &'a str) -> SpecOpt<'a> {
    Box::new(move |ctx, spec| {
        if !parent.starts_with('/') {
            return Err(CoreError::InvalidSpec(format!(
                "cgroup parent '{parent}' is not absolute"
            )));
        }
        spec.cgroups_path = format!("{}/{}", parent.trim_end_matches('/'), ctx.container_id);
        Ok(())
    })
}

pub fn with_rootfs_propagation<'a>(propagation: Propagation) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        spec.rootfs_propagation = Some(propagation);
        Ok(())
    })
}

pub fn with_stop_signal<'a>(signal: &'a str) -> SpecOpt<'a> {
    Box::new(move |_, spec| {
        if signal_number(signal).is_none() {
            return Err(CoreError::InvalidSpec(format!("unknown stop signal '{signal}'")));
        }
        spec.stop_signal = signal.to_owned();
        Ok(())
    })
}

/// Signal number for a name like `SIGTERM` or `TERM`, or a bare number.
pub fn signal_number(name: &str) -> Option<i32> {
    if let Ok(n) = name.parse::<i32>() {
        return (n > 0).then_some(n);
    }
    let upper = name.to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    let n = match short {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        _ => return None,
    };
    Some(n)
}

/// Resolve `.` and `..` in an absolute path without touching the filesystem.
pub fn normalize_target(path: &str) -> Result<String, CoreError> {
    if !path.starts_with('/') {
        return Err(CoreError::InvalidSpec(format!(
            "target path '{path}' is not absolute"
        )));
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(CoreError::InvalidSpec(
            "target path must not be the filesystem root".to_owned(),
        ));
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Inputs of the helper container spec.
pub struct HelperSpec<'a> {
    pub container_id: &'a str,
    pub image: &'a ImageRecord,
    pub target_path: &'a str,
    pub args: &'a [String],
    pub cgroup_root: &'a str,
}

/// The privileged FUSE helper spec: configuration, target and log bind mounts,
/// host network and devices, `/dev/fuse`, cgroup placement and shared rootfs
/// propagation.
pub fn helper_spec(
    config: &ManagerConfig,
    helper: &HelperSpec<'_>,
) -> Result<RuntimeSpecConfig, CoreError> {
    let target = normalize_target(helper.target_path)?;
    let fuse_config = config.fuse_config_dir.to_string_lossy();
    let shared_logs = config.shared_log_dir.to_string_lossy();
    let mounts = vec![
        MountSpec::bind(&fuse_config, &fuse_config, &["rbind", "ro"]),
        MountSpec::bind(&target, &config.mount_point, &["rbind", "shared"]),
        MountSpec::bind(&shared_logs, &shared_logs, &["rbind", "shared"]),
    ];

    // An image that declares a usable stop signal wins over the configured one.
    let stop_signal = helper
        .image
        .config
        .stop_signal
        .as_deref()
        .filter(|s| signal_number(s).is_some())
        .unwrap_or(&config.stop_signal);

    let opts = vec![
        with_default_spec(),
        with_default_unix_devices(),
        with_mounts(mounts),
        with_image_config(helper.image),
        with_process_args(helper.args),
        with_privileged(),
        with_all_devices_allowed(),
        with_host_devices(),
        with_host_namespace(LinuxNamespace::Network),
        with_host_hosts_file(),
        with_host_resolvconf(),
        with_device(fuse_device(), "rwm"),
        with_cgroup_parent(helper.cgroup_root),
        with_rootfs_propagation(Propagation::Shared),
        with_stop_signal(stop_signal),
    ];
    build_spec(helper.container_id, &opts)
}
