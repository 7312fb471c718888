use crate::config::ManagerConfig;
use flexmount_runtime::HostExec;
use std::fmt;
use std::path::Path;

/// A missing host prerequisite with actionable install instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Check what helper containers need from the host.
/// Empty list means all prerequisites are met.
pub fn check_host_prereqs(exec: &dyn HostExec, config: &ManagerConfig) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    let pull = &config.pull;

    let has_tool = exec.lookup(&pull.tool).is_some()
        || pull.tool_fallbacks.iter().any(|p| exec.exists(p));
    if !has_tool {
        missing.push(MissingPrereq {
            name: pull.tool.clone(),
            purpose: "pulling images absent from the source namespace",
            install_hint: "ships with containerd (usually /usr/bin/ctr)",
        });
    }

    if !exec.exists(Path::new("/dev/fuse")) {
        missing.push(MissingPrereq {
            name: "/dev/fuse".to_owned(),
            purpose: "FUSE device handed to helper containers",
            install_hint: "modprobe fuse",
        });
    }

    if !exec.exists(&config.fuse_config_dir) {
        missing.push(MissingPrereq {
            name: config.fuse_config_dir.display().to_string(),
            purpose: "FUSE configuration mounted read-only into helpers",
            install_hint: "deploy the flexmount driver configuration",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nHelper containers cannot be started until these are present.");
    msg
}
