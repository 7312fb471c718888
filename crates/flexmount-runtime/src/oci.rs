use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const OCI_VERSION: &str = "1.0.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Private,
    Shared,
    Slave,
    Unbindable,
}

impl Propagation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
            Self::Slave => "slave",
            Self::Unbindable => "unbindable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinuxNamespace {
    Pid,
    Network,
    Mount,
    Ipc,
    Uts,
    User,
    Cgroup,
}

impl LinuxNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "network",
            Self::Mount => "mount",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(kind: &str, source: &str, destination: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_owned(),
            kind: kind.to_owned(),
            source: source.to_owned(),
            options: options.iter().map(|o| (*o).to_owned()).collect(),
        }
    }

    pub fn bind(source: &str, destination: &str, options: &[&str]) -> Self {
        Self::new("bind", source, destination, options)
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// A device node created inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub major: i64,
    pub minor: i64,
    pub file_mode: Option<u32>,
}

/// A cgroup device access rule. `None` fields match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    pub allow: bool,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub access: Option<String>,
}

impl DeviceRule {
    pub fn char_device(major: i64, minor: Option<i64>, access: &str) -> Self {
        Self {
            allow: true,
            kind: Some("c".to_owned()),
            major: Some(major),
            minor,
            access: Some(access.to_owned()),
        }
    }

    pub fn allow_all() -> Self {
        Self {
            allow: true,
            kind: Some("a".to_owned()),
            major: None,
            minor: None,
            access: Some("rwm".to_owned()),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allow: false,
            kind: None,
            major: None,
            minor: None,
            access: Some("rwm".to_owned()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: Vec<String>,
    pub no_new_privileges: bool,
}

/// Declarative runtime configuration for one container.
///
/// Built once by the spec builder and moved into container creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpecConfig {
    pub process: ProcessSpec,
    pub mounts: Vec<MountSpec>,
    pub devices: Vec<DeviceNode>,
    pub device_rules: Vec<DeviceRule>,
    /// Namespaces the container gets of its own; anything absent is shared with the host.
    pub namespaces: Vec<LinuxNamespace>,
    /// Expose every host device node inside the container.
    pub host_devices: bool,
    pub privileged: bool,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub cgroups_path: String,
    pub rootfs_propagation: Option<Propagation>,
    pub stop_signal: String,
}

impl RuntimeSpecConfig {
    pub fn mount_at(&self, destination: &str) -> Option<&MountSpec> {
        self.mounts.iter().find(|m| m.destination == destination)
    }

    pub fn has_namespace(&self, ns: LinuxNamespace) -> bool {
        self.namespaces.contains(&ns)
    }

    /// Render the spec in OCI runtime-spec JSON shape.
    pub fn to_oci_json(&self) -> Value {
        let mounts: Vec<Value> = self
            .mounts
            .iter()
            .map(|m| {
                json!({
                    "destination": m.destination,
                    "type": m.kind,
                    "source": m.source,
                    "options": m.options,
                })
            })
            .collect();

        let namespaces: Vec<Value> = self
            .namespaces
            .iter()
            .map(|ns| json!({ "type": ns.as_str() }))
            .collect();

        let devices: Vec<Value> = self
            .devices
            .iter()
            .map(|d| {
                json!({
                    "path": d.path,
                    "type": d.kind,
                    "major": d.major,
                    "minor": d.minor,
                    "fileMode": d.file_mode,
                })
            })
            .collect();

        let rules: Vec<Value> = self
            .device_rules
            .iter()
            .map(|r| {
                json!({
                    "allow": r.allow,
                    "type": r.kind,
                    "major": r.major,
                    "minor": r.minor,
                    "access": r.access,
                })
            })
            .collect();

        let caps = &self.process.capabilities;
        let mut linux = json!({
            "namespaces": namespaces,
            "devices": devices,
            "resources": { "devices": rules },
            "cgroupsPath": self.cgroups_path,
            "maskedPaths": self.masked_paths,
            "readonlyPaths": self.readonly_paths,
        });
        if let Some(propagation) = self.rootfs_propagation {
            linux["rootfsPropagation"] = json!(propagation.as_str());
        }

        json!({
            "ociVersion": OCI_VERSION,
            "process": {
                "terminal": false,
                "user": { "uid": 0, "gid": 0 },
                "args": self.process.args,
                "env": self.process.env,
                "cwd": self.process.cwd,
                "noNewPrivileges": self.process.no_new_privileges,
                "capabilities": {
                    "bounding": caps,
                    "effective": caps,
                    "permitted": caps,
                },
            },
            "root": { "path": "rootfs", "readonly": false },
            "mounts": mounts,
            "linux": linux,
        })
    }
}
