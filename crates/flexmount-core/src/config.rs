use crate::retry::RetryPolicy;
use crate::CoreError;
use flexmount_runtime::CtrConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    pub tool: String,
    pub tool_fallbacks: Vec<PathBuf>,
    pub credential_helper: String,
    pub credential_region: String,
    pub registry_user: String,
    pub hosts_dir: PathBuf,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            tool: "ctr".to_owned(),
            tool_fallbacks: vec![
                PathBuf::from("/usr/local/bin/ctr"),
                PathBuf::from("/usr/bin/ctr"),
            ],
            credential_helper: "aws".to_owned(),
            credential_region: "us-east-2".to_owned(),
            registry_user: "AWS".to_owned(),
            hosts_dir: PathBuf::from("/etc/containerd/certs.d/"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    pub fs_path: PathBuf,
    pub unified_root: String,
    pub legacy_root: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            fs_path: PathBuf::from("/sys/fs/cgroup/"),
            unified_root: "/kubepods.slice".to_owned(),
            legacy_root: "/kubepods".to_owned(),
        }
    }
}

/// Settings for the lifecycle manager, loadable from TOML.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// containerd socket the `ctr` backend talks to.
    pub address: PathBuf,
    /// Task list polling interval while waiting for a task to exit.
    pub wait_poll_ms: u64,
    /// Runtime namespace the helper containers live in.
    pub namespace: String,
    /// Privileged namespace images are imported from.
    pub source_namespace: String,
    pub snapshotter: String,
    pub runtime: String,
    pub stop_signal: String,
    pub fuse_config_dir: PathBuf,
    /// Container-side destination of the caller's target path.
    pub mount_point: String,
    pub shared_log_dir: PathBuf,
    /// Where per-attempt task log files go; the system temp dir when unset.
    pub log_dir: Option<PathBuf>,
    pub import_attempts: u32,
    pub import_delay_ms: u64,
    pub stop_timeout_ms: u64,
    pub pull: PullConfig,
    pub cgroup: CgroupConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            address: PathBuf::from("/run/containerd/containerd.sock"),
            wait_poll_ms: 200,
            namespace: "flexmount".to_owned(),
            source_namespace: "k8s.io".to_owned(),
            snapshotter: "overlayfs".to_owned(),
            runtime: "io.containerd.runc.v2".to_owned(),
            stop_signal: "SIGTERM".to_owned(),
            fuse_config_dir: PathBuf::from("/etc/flexmount/fuse"),
            mount_point: "/fuse_mount".to_owned(),
            shared_log_dir: PathBuf::from("/var/log/containers"),
            log_dir: None,
            import_attempts: 10,
            import_delay_ms: 3000,
            stop_timeout_ms: 20_000,
            pull: PullConfig::default(),
            cgroup: CgroupConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.namespace.trim().is_empty() || self.source_namespace.trim().is_empty() {
            return Err(CoreError::Config("namespace names must not be empty".to_owned()));
        }
        if self.namespace == self.source_namespace {
            return Err(CoreError::Config(format!(
                "working namespace and source namespace are both '{}'",
                self.namespace
            )));
        }
        if self.import_attempts == 0 {
            return Err(CoreError::Config("import_attempts must be at least 1".to_owned()));
        }
        if self.wait_poll_ms == 0 {
            return Err(CoreError::Config("wait_poll_ms must be positive".to_owned()));
        }
        if self.stop_timeout_ms == 0 {
            return Err(CoreError::Config("stop_timeout_ms must be positive".to_owned()));
        }
        if self.snapshotter.is_empty() || self.runtime.is_empty() {
            return Err(CoreError::Config(
                "snapshotter and runtime must be named".to_owned(),
            ));
        }
        if crate::spec::signal_number(&self.stop_signal).is_none() {
            return Err(CoreError::Config(format!(
                "unsupported stop signal '{}'",
                self.stop_signal
            )));
        }

        let paths = [
            ("address", self.address.as_path()),
            ("fuse_config_dir", self.fuse_config_dir.as_path()),
            ("shared_log_dir", self.shared_log_dir.as_path()),
            ("mount_point", Path::new(&self.mount_point)),
            ("cgroup.fs_path", self.cgroup.fs_path.as_path()),
        ];
        for (field, path) in paths {
            if !path.is_absolute() {
                return Err(CoreError::Config(format!(
                    "{field} must be an absolute path, got '{}'",
                    path.display()
                )));
            }
        }
        if let Some(dir) = &self.log_dir {
            if !dir.is_absolute() {
                return Err(CoreError::Config(format!(
                    "log_dir must be an absolute path, got '{}'",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn import_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.import_attempts,
            Duration::from_millis(self.import_delay_ms),
        )
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Settings for the `ctr` backend found at `bin`.
    ///
    /// The exit poller outlives the stop timeout so a slow exit still reads as
    /// a timeout rather than a dropped notification.
    pub fn ctr_config(&self, bin: PathBuf) -> CtrConfig {
        CtrConfig {
            bin,
            address: self.address.clone(),
            snapshotter: self.snapshotter.clone(),
            poll_interval: Duration::from_millis(self.wait_poll_ms),
            wait_limit: self.stop_timeout() * 2,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ManagerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.import_retry().max_attempts, 10);
        assert_eq!(config.import_retry().delay, Duration::from_secs(3));
        assert_eq!(config.stop_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn empty_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flexmount.toml");
        std::fs::write(&path, "").unwrap();
        assert_eq!(ManagerConfig::load(&path).unwrap(), ManagerConfig::default());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flexmount.toml");
        std::fs::write(
            &path,
            r#"
namespace = "v3io"
import_attempts = 3

[pull]
credential_region = "eu-west-1"
"#,
        )
        .unwrap();
        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.namespace, "v3io");
        assert_eq!(config.import_attempts, 3);
        assert_eq!(config.pull.credential_region, "eu-west-1");
        assert_eq!(config.pull.tool, "ctr");
        assert_eq!(config.source_namespace, "k8s.io");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flexmount.toml");
        let config = ManagerConfig {
            log_dir: Some(dir.path().to_path_buf()),
            stop_timeout_ms: 500,
            ..ManagerConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ManagerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_same_namespaces() {
        let config = ManagerConfig {
            namespace: "k8s.io".to_owned(),
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_attempts_and_timeout() {
        let config = ManagerConfig {
            import_attempts: 0,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ManagerConfig {
            stop_timeout_ms: 0,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_paths_and_unknown_signal() {
        let config = ManagerConfig {
            fuse_config_dir: PathBuf::from("etc/fuse"),
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ManagerConfig {
            stop_signal: "SIGWHATEVER".to_owned(),
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ctr_backend_follows_manager_settings() {
        let config = ManagerConfig {
            address: PathBuf::from("/run/k3s/containerd/containerd.sock"),
            snapshotter: "native".to_owned(),
            stop_timeout_ms: 1_000,
            ..ManagerConfig::default()
        };
        let ctr = config.ctr_config(PathBuf::from("/usr/bin/ctr"));
        assert_eq!(ctr.bin, PathBuf::from("/usr/bin/ctr"));
        assert_eq!(ctr.address, config.address);
        assert_eq!(ctr.snapshotter, "native");
        assert_eq!(ctr.poll_interval, Duration::from_millis(200));
        assert!(ctr.wait_limit > config.stop_timeout());

        let relative = ManagerConfig {
            address: PathBuf::from("containerd.sock"),
            ..ManagerConfig::default()
        };
        assert!(relative.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flexmount.toml");
        std::fs::write(&path, "namespace = [").unwrap();
        assert!(matches!(
            ManagerConfig::load(&path),
            Err(CoreError::ConfigParse(_))
        ));
    }
}
