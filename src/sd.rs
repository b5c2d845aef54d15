//! The service-manager command interface.
//!
//! Every interaction with the manager is one external command with
//! exit-status semantics: `systemd-run` to create and start a transient
//! unit, `systemctl` for everything else.  The manager itself is a black
//! box; activation is asynchronous, so a successful launcher exit only
//! means the request was accepted and the caller must poll.
//!
//! The whole surface hides behind [ServiceManager] so the lifecycle
//! logic can be exercised against an in-memory fake.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use log::warn;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::identity::UnitIdentity;
use crate::properties::{LaunchSpec, PropertyValue};

const SYSTEMCTL: &str = "systemctl";
const SYSTEMD_RUN: &str = "systemd-run";

/// Search path used when neither the unit nor the spawning process has
/// a `PATH` of its own.
pub(crate) const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// The primitive operations of the external service manager.
///
/// Each call maps to a single external invocation.  All of them are
/// idempotent from the caller's perspective; stopping an absent unit
/// yields a non-zero status, and it is the caller's business whether
/// that matters.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Is the unit in the active (running) high-level state?
    async fn is_active(&self, unit: &str) -> Result<bool>;

    /// Is the unit in the failed state?  Independent of [is_active][
    /// ServiceManager::is_active]; an absent unit is neither.
    async fn is_failed(&self, unit: &str) -> Result<bool>;

    /// Does the manager know a unit under this name at all?
    async fn unit_exists(&self, unit: &str) -> Result<bool>;

    /// Request creation and start of a transient unit.  Returns the
    /// launcher's exit status, not the started program's.
    async fn start_transient(
        &self,
        unit: &str,
        spec: &LaunchSpec,
        properties: &[(String, PropertyValue)],
    ) -> Result<ExitStatus>;

    /// Start a pre-installed unit by name.
    async fn start_unit(&self, unit: &str) -> Result<ExitStatus>;

    /// Request termination of the unit.
    async fn stop(&self, unit: &str) -> Result<ExitStatus>;

    /// Clear failed-state bookkeeping so the name can be reused.
    async fn reset_failed(&self, unit: &str) -> Result<ExitStatus>;

    /// The manager's major version, if it can be determined.
    async fn version(&self) -> Option<u32>;
}

/// The production [ServiceManager], shelling out to the host's
/// `systemctl` and `systemd-run`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Systemctl;

impl Systemctl {
    async fn systemctl(&self, args: &[&str], quiet: bool) -> Result<ExitStatus> {
        let mut command = Command::new(SYSTEMCTL);
        command.args(args);
        if quiet {
            // Hide the state word systemctl prints on stdout; stderr
            // stays visible for operator diagnostics.
            command.stdout(Stdio::null());
        }
        command.status().await.map_err(|source| Error::Exec {
            command: SYSTEMCTL.to_owned(),
            source,
        })
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn is_active(&self, unit: &str) -> Result<bool> {
        Ok(self.systemctl(&["is-active", unit], true).await?.success())
    }

    async fn is_failed(&self, unit: &str) -> Result<bool> {
        Ok(self.systemctl(&["is-failed", unit], true).await?.success())
    }

    async fn unit_exists(&self, unit: &str) -> Result<bool> {
        let status = Command::new(SYSTEMCTL)
            .args(["cat", "--", unit])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| Error::Exec {
                command: SYSTEMCTL.to_owned(),
                source,
            })?;
        Ok(status.success())
    }

    async fn start_transient(
        &self,
        unit: &str,
        spec: &LaunchSpec,
        properties: &[(String, PropertyValue)],
    ) -> Result<ExitStatus> {
        let exe = match spec.cmd.first() {
            Some(first) => resolve_exe(first, &spec.environment)?,
            None => return Err(Error::EmptyCommand(unit.to_owned())),
        };

        let mut command = Command::new(SYSTEMD_RUN);
        command.arg("--unit").arg(unit);
        command.arg("--working-directory").arg(&spec.working_dir);
        if let UnitIdentity::Fixed { uid, gid } = spec.identity {
            command.arg(format!("--uid={uid}"));
            command.arg(format!("--gid={gid}"));
        }
        if let Some(slice) = &spec.slice {
            command.arg(format!("--slice={slice}"));
        }
        for (key, value) in properties {
            match value {
                PropertyValue::Str(v) => {
                    command.arg(format!("--property={key}={v}"));
                }
                PropertyValue::List(values) => {
                    for v in values {
                        command.arg(format!("--property={key}={v}"));
                    }
                }
            }
        }
        command.arg(exe);
        command.args(&spec.cmd[1..]);
        command.args(&spec.args);

        command.status().await.map_err(|source| Error::Exec {
            command: SYSTEMD_RUN.to_owned(),
            source,
        })
    }

    async fn start_unit(&self, unit: &str) -> Result<ExitStatus> {
        self.systemctl(&["start", unit], false).await
    }

    async fn stop(&self, unit: &str) -> Result<ExitStatus> {
        self.systemctl(&["stop", unit], false).await
    }

    async fn reset_failed(&self, unit: &str) -> Result<ExitStatus> {
        self.systemctl(&["reset-failed", unit], false).await
    }

    async fn version(&self) -> Option<u32> {
        let output = match Command::new(SYSTEMCTL)
            .arg("--version")
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!("failed to run `systemctl --version`: {err}");
                return None;
            }
        };
        let text = String::from_utf8_lossy(&output.stdout);
        match parse_version(&text) {
            Some(version) => Some(version),
            None => {
                warn!(
                    "failed to parse systemd version from `systemctl \
                     --version` output {:?}",
                    text.lines().next().unwrap_or_default()
                );
                None
            }
        }
    }
}

/// Pull the major version out of `systemctl --version` output, e.g.
/// `systemd 249 (249.11-0ubuntu3.9)`.
fn parse_version(output: &str) -> Option<u32> {
    let token = output.split_whitespace().nth(1)?;
    let digits: String =
        token.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Make the executable path absolute, consulting the unit's own `PATH`
/// first: the launcher resolves the command before the unit environment
/// exists, so a relative name would be looked up in the wrong `PATH`.
fn resolve_exe(
    exe: &str,
    environment: &BTreeMap<String, String>,
) -> Result<String> {
    if exe.contains('/') {
        return Ok(exe.to_owned());
    }
    let path = environment
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_else(|| DEFAULT_PATH.to_owned());
    for dir in path.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(exe);
        if is_executable(&candidate) {
            return Ok(candidate.display().to_string());
        }
    }
    Err(Error::ExeNotFound {
        exe: exe.to_owned(),
        path,
    })
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_version_lines() {
        assert_eq!(
            parse_version("systemd 249 (249.11-0ubuntu3.9)\n+PAM +AUDIT"),
            Some(249)
        );
        assert_eq!(parse_version("systemd 255~rc2 (255~rc2)"), Some(255));
        assert_eq!(parse_version("gibberish"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn resolve_keeps_paths_with_separators() {
        let environment = BTreeMap::new();
        assert_eq!(
            resolve_exe("/usr/bin/env", &environment).unwrap(),
            "/usr/bin/env"
        );
        assert_eq!(
            resolve_exe("./server", &environment).unwrap(),
            "./server"
        );
    }

    #[test]
    fn resolve_searches_the_unit_path_first() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("myserver");
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let mut environment = BTreeMap::new();
        environment.insert(
            "PATH".to_owned(),
            format!("{}:/usr/bin", dir.path().display()),
        );
        assert_eq!(
            resolve_exe("myserver", &environment).unwrap(),
            exe.display().to_string()
        );
    }

    #[test]
    fn resolve_skips_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("myserver"), "data").unwrap();

        let mut environment = BTreeMap::new();
        environment
            .insert("PATH".to_owned(), dir.path().display().to_string());
        let err = resolve_exe("myserver", &environment).unwrap_err();
        assert!(matches!(err, Error::ExeNotFound { .. }));
    }
}
