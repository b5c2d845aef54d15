//! Identity resolution for spawned units.
//!
//! A unit runs either as a pre-provisioned system account, looked up in
//! the user database at spawn time, or as a manager-allocated dynamic
//! account whose home lives in a state directory under [STATE_ROOT].

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::unit_name::TemplateVars;

/// Where the manager keeps the state directories of dynamic accounts.
pub const STATE_ROOT: &str = "/var/lib";

/// How the account for a spawned unit is chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Run as an account that already exists in the system user
    /// database.  The template expands to the account name.
    System { username_template: String },
    /// Let the manager allocate an ephemeral account per unit.  The
    /// template expands to the name of a persistent state directory
    /// under [STATE_ROOT] that doubles as the account's home.
    Dynamic { state_directory_template: String },
}

impl Default for IdentityMode {
    fn default() -> Self {
        Self::System {
            username_template: "{USERNAME}".to_owned(),
        }
    }
}

/// The identity fields of one launch, as the service manager sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitIdentity {
    /// Run with a fixed uid/gid pair.
    Fixed { uid: u32, gid: u32 },
    /// Let the manager allocate the account (`DynamicUser=`), keeping
    /// its state in the named directory.
    Dynamic { state_directory: String },
}

#[derive(Debug)]
pub(crate) struct ResolvedIdentity {
    pub unit: UnitIdentity,
    pub working_dir: PathBuf,
    /// `HOME` to inject into the unit environment.  Only dynamic
    /// accounts need this; fixed accounts get theirs from the manager.
    pub home: Option<String>,
}

/// Reject state directory names the manager would resolve outside its
/// state root.
pub fn validate_state_directory(name: &str) -> Result<()> {
    let path = Path::new(name);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if escapes || name.is_empty() {
        return Err(Error::UnsafeStateDirectory(name.to_owned()));
    }
    Ok(())
}

pub(crate) fn resolve(
    mode: &IdentityMode,
    vars: &TemplateVars<'_>,
    working_dir_template: Option<&str>,
) -> Result<ResolvedIdentity> {
    let working_dir =
        working_dir_template.map(|t| PathBuf::from(vars.expand(t)));
    match mode {
        IdentityMode::System { username_template } => {
            let username = vars.expand(username_template);
            let (uid, gid, home) = lookup_user(&username)?;
            Ok(ResolvedIdentity {
                unit: UnitIdentity::Fixed { uid, gid },
                working_dir: working_dir.unwrap_or(home),
                home: None,
            })
        }
        IdentityMode::Dynamic {
            state_directory_template,
        } => {
            let state_directory = vars.expand(state_directory_template);
            validate_state_directory(&state_directory)?;
            let home = Path::new(STATE_ROOT).join(&state_directory);
            Ok(ResolvedIdentity {
                unit: UnitIdentity::Dynamic { state_directory },
                working_dir: working_dir.unwrap_or_else(|| home.clone()),
                home: Some(home.display().to_string()),
            })
        }
    }
}

/// Look up `(uid, gid, home)` for an account name.
///
/// A missing account is fatal for the spawn and not worth retrying; it
/// means provisioning has not happened for this user.
pub fn lookup_user(username: &str) -> Result<(u32, u32, PathBuf)> {
    match nix::unistd::User::from_name(username) {
        Ok(Some(user)) => {
            Ok((user.uid.as_raw(), user.gid.as_raw(), user.dir))
        }
        Ok(None) => Err(Error::UnknownUser(username.to_owned())),
        Err(err) => Err(Error::IdentityLookup(username.to_owned(), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars<'static> {
        TemplateVars {
            username: "alice",
            user_id: 7,
            server_name: None,
        }
    }

    #[test]
    fn state_directory_validation() {
        validate_state_directory("alice").unwrap();
        validate_state_directory("alice/servers/lab").unwrap();
        for bad in ["/etc", "../etc", "a/../../etc", ""] {
            let err = validate_state_directory(bad).unwrap_err();
            assert!(matches!(err, Error::UnsafeStateDirectory(_)), "{bad}");
        }
    }

    #[test]
    fn dynamic_home_is_under_state_root() {
        let mode = IdentityMode::Dynamic {
            state_directory_template: "{USERNAME}".to_owned(),
        };
        let resolved = resolve(&mode, &vars(), None).unwrap();
        assert_eq!(resolved.home.as_deref(), Some("/var/lib/alice"));
        assert_eq!(resolved.working_dir, Path::new("/var/lib/alice"));
        assert_eq!(
            resolved.unit,
            UnitIdentity::Dynamic {
                state_directory: "alice".to_owned()
            }
        );
    }

    #[test]
    fn dynamic_working_dir_can_be_overridden() {
        let mode = IdentityMode::Dynamic {
            state_directory_template: "{USERNAME}".to_owned(),
        };
        let resolved =
            resolve(&mode, &vars(), Some("/srv/{USERNAME}")).unwrap();
        assert_eq!(resolved.working_dir, Path::new("/srv/alice"));
        assert_eq!(resolved.home.as_deref(), Some("/var/lib/alice"));
    }

    #[test]
    fn dynamic_rejects_escaping_state_directories() {
        let mode = IdentityMode::Dynamic {
            state_directory_template: "../{USERNAME}".to_owned(),
        };
        let err = resolve(&mode, &vars(), None).unwrap_err();
        assert!(matches!(err, Error::UnsafeStateDirectory(_)));
    }

    #[test]
    fn looks_up_root() {
        let (uid, gid, home) = lookup_user("root").unwrap();
        assert_eq!(uid, 0);
        assert_eq!(gid, 0);
        assert!(home.is_absolute());
    }

    #[test]
    fn unknown_user_is_fatal() {
        let err =
            lookup_user("systemd-spawner-no-such-user").unwrap_err();
        assert!(matches!(err, Error::UnknownUser(_)));
    }
}
