use crate::config::CgroupConfig;
use flexmount_runtime::HostExec;
use tracing::debug;

/// Filesystem type `stat -f` reports for a unified (v2) cgroup hierarchy.
const UNIFIED_FS_TYPE: &str = "cgroup2fs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupLayout {
    Legacy,
    Unified,
}

impl CgroupLayout {
    pub fn from_fs_type(fs_type: &str) -> Self {
        if fs_type.trim() == UNIFIED_FS_TYPE {
            Self::Unified
        } else {
            Self::Legacy
        }
    }

    pub fn root(self, config: &CgroupConfig) -> &str {
        match self {
            Self::Unified => &config.unified_root,
            Self::Legacy => &config.legacy_root,
        }
    }
}

/// Query the cgroup filesystem type. A failed query means legacy.
pub fn detect_layout(exec: &dyn HostExec, config: &CgroupConfig) -> CgroupLayout {
    let args = [
        "-fc".to_owned(),
        "%T".to_owned(),
        config.fs_path.display().to_string(),
    ];
    match exec.run("stat", &args) {
        Ok(out) => CgroupLayout::from_fs_type(&out.stdout),
        Err(e) => {
            debug!("cgroup type query failed, assuming legacy hierarchy: {e}");
            CgroupLayout::Legacy
        }
    }
}

/// Parent cgroup path for helper containers on this host.
pub fn detect_cgroup_root(exec: &dyn HostExec, config: &CgroupConfig) -> String {
    detect_layout(exec, config).root(config).to_owned()
}
