//! Transient-unit property construction.
//!
//! One [LaunchSpec] describes everything a single launch needs; [build]
//! turns it into the ordered directive set handed to the launcher.
//! Resource and filesystem isolation are entirely the manager's job —
//! this module only phrases the request.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use byte_unit::Byte;
use serde::{Deserialize, Serialize};

use crate::env_file;
use crate::error::Result;
use crate::identity::{validate_state_directory, UnitIdentity};

/// A directive value: either a single string or an ordered list.
///
/// Lists exist so one key can be passed several times; the order of the
/// entries within one key is significant and preserved (`ExecStartPre=`
/// lines run in order).  No order is guaranteed across different keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Str(String),
    List(Vec<String>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// Everything one launch needs, fixed at the moment `start` is called
/// and discarded afterwards.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Command to execute, argv[0] first.
    pub cmd: Vec<String>,
    /// Extra arguments appended after `cmd`.
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Variables handed to the unit through the environment file.
    pub environment: BTreeMap<String, String>,
    pub identity: UnitIdentity,
    /// Absolute ceiling on memory use; the kernel OOM killer handles
    /// overruns inside the unit.
    pub memory_max: Option<Byte>,
    /// CPU time as a fraction of one core: 0.5 throttles to half a
    /// core, 2.0 allots two cores.
    pub cpu_limit: Option<f64>,
    pub private_tmp: bool,
    pub private_devices: bool,
    pub no_new_privileges: bool,
    pub readonly_paths: Option<Vec<String>>,
    pub readwrite_paths: Option<Vec<String>>,
    /// Resource-accounting slice shared with other spawned units.
    pub slice: Option<String>,
    /// Caller-supplied directives, applied last; an entry here replaces
    /// any default or derived directive of the same name.
    pub extra_properties: HashMap<String, PropertyValue>,
}

fn push_unless_overridden(
    properties: &mut Vec<(String, PropertyValue)>,
    extra: &HashMap<String, PropertyValue>,
    key: &str,
    value: impl Into<PropertyValue>,
) {
    if !extra.contains_key(key) {
        properties.push((key.to_owned(), value.into()));
    }
}

/// Build the ordered directive set for one launch.
///
/// When the spec carries environment variables they are persisted first,
/// inside the unit's runtime directory under `run_root`, and the
/// resulting file is referenced from the directive set; the path of that
/// file is returned so the caller can remove it once the unit is gone.
pub fn build(
    spec: &LaunchSpec,
    run_root: &Path,
    unit_name: &str,
) -> Result<(Vec<(String, PropertyValue)>, Option<PathBuf>)> {
    let extra = &spec.extra_properties;
    let mut properties = Vec::new();

    // A runtime directory scoped to the unit holds the environment
    // file.  It must survive manager-level restarts, or a `systemctl
    // restart` of the unit could not re-load its environment.
    push_unless_overridden(&mut properties, extra, "RuntimeDirectory", unit_name);
    push_unless_overridden(&mut properties, extra, "RuntimeDirectoryMode", "700");
    push_unless_overridden(
        &mut properties,
        extra,
        "RuntimeDirectoryPreserve",
        "restart",
    );
    // An OOM kill inside the unit (one kernel, one bad allocation) must
    // not take the whole server down; only an explicit stop may.
    push_unless_overridden(&mut properties, extra, "OOMPolicy", "continue");

    if let UnitIdentity::Dynamic { state_directory } = &spec.identity {
        validate_state_directory(state_directory)?;
        push_unless_overridden(&mut properties, extra, "DynamicUser", "yes");
        push_unless_overridden(
            &mut properties,
            extra,
            "StateDirectory",
            state_directory.clone(),
        );
    }

    if let Some(memory_max) = spec.memory_max {
        push_unless_overridden(&mut properties, extra, "MemoryAccounting", "yes");
        push_unless_overridden(
            &mut properties,
            extra,
            "MemoryMax",
            memory_max.as_u64().to_string(),
        );
    }

    if let Some(cpu_limit) = spec.cpu_limit {
        // CPUQuota= takes a percentage of one core; anything above 100
        // spreads over multiple cores.  Needs CONFIG_CFS_BANDWIDTH in
        // the running kernel to have any effect.
        push_unless_overridden(&mut properties, extra, "CPUAccounting", "yes");
        push_unless_overridden(
            &mut properties,
            extra,
            "CPUQuota",
            format!("{}%", (cpu_limit * 100.0).floor() as u64),
        );
    }

    if spec.private_tmp {
        push_unless_overridden(&mut properties, extra, "PrivateTmp", "yes");
    }
    if spec.private_devices {
        push_unless_overridden(&mut properties, extra, "PrivateDevices", "yes");
    }
    if spec.no_new_privileges {
        push_unless_overridden(&mut properties, extra, "NoNewPrivileges", "yes");
    }

    if let Some(paths) = &spec.readonly_paths {
        push_unless_overridden(
            &mut properties,
            extra,
            "ReadOnlyDirectories",
            paths.clone(),
        );
    }
    if let Some(paths) = &spec.readwrite_paths {
        push_unless_overridden(
            &mut properties,
            extra,
            "ReadWriteDirectories",
            paths.clone(),
        );
    }

    for (key, value) in extra {
        properties.push((key.clone(), value.clone()));
    }

    let mut env_file_path = None;
    if !spec.environment.is_empty() {
        // The file lands in the first entry of RuntimeDirectory=, which
        // is a whitespace-separated list of directory names.
        let runtime_dir = properties
            .iter()
            .find(|(key, _)| key == "RuntimeDirectory")
            .and_then(|(_, value)| match value {
                PropertyValue::Str(s) => s.split_whitespace().next(),
                PropertyValue::List(l) => {
                    l.first().and_then(|s| s.split_whitespace().next())
                }
            })
            .unwrap_or(unit_name);
        let path = env_file::write_env_file(
            &run_root.join(runtime_dir),
            unit_name,
            &spec.environment,
        )?;
        properties.push((
            "EnvironmentFile".to_owned(),
            PropertyValue::Str(path.display().to_string()),
        ));
        env_file_path = Some(path);
    }

    Ok((properties, env_file_path))
}
