use std::process::ExitStatus;

/// The error type of `systemd_spawner`.
///
/// The various errors that can be returned by this crate.  Configuration
/// errors (bad templates, unsafe state directories, invalid environment
/// keys) are never worth retrying; [Error::StartTimeout] indicates a
/// transient or resource problem on the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The expanded unit name is longer than the service manager accepts.
    #[error("unit name `{0}` exceeds the 256 character limit")]
    UnitNameTooLong(String),
    /// A dynamic-identity state directory that would place state outside
    /// the manager's state root.
    #[error("state directory `{0}` must be relative and must not contain `..`")]
    UnsafeStateDirectory(String),
    /// An environment variable name failing identifier validation.
    #[error("`{0}` is not a valid environment variable name")]
    InvalidEnvironmentKey(String),
    /// An environment variable value that cannot be written to the
    /// environment file.
    #[error("the value of environment variable `{0}` cannot be quoted")]
    UnquotableEnvironmentValue(String),
    /// No command was configured for the server to be spawned.
    #[error("no command configured for unit `{0}`")]
    EmptyCommand(String),
    /// A pre-existing active unit under our name could not be stopped.
    #[error("could not stop already existing unit `{0}`")]
    ResidualUnit(String),
    /// The configured account does not exist in the system user database.
    #[error("no user named `{0}` found in the system")]
    UnknownUser(String),
    /// The system user database could not be queried.
    #[error("cannot look up user `{0}`: {1}")]
    IdentityLookup(String, #[source] nix::Error),
    /// The manager does not know a unit under the resolved name.  This is
    /// an administrator problem, not a transient one.
    #[error("unit `{0}` does not exist for your user and cannot be created; contact your administrator")]
    NoSuchUnit(String),
    /// No state directory to keep per-server secrets in.
    #[error("no state directory configured and STATE_DIRECTORY is not set")]
    NoStateDirectory,
    /// The configured executable was not found on the search path.
    #[error("`{exe}` not found on {path}")]
    ExeNotFound { exe: String, path: String },
    /// An external service-manager command could not be invoked at all,
    /// e.g. because the binary is missing.
    #[error("cannot run `{command}`: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The launcher was invoked but reported failure.
    #[error("`{command}` failed with {status}")]
    CommandFailed { command: String, status: ExitStatus },
    /// The unit did not report active within the configured bound.
    #[error("unit `{unit}` failed to start within {timeout} activation checks")]
    StartTimeout { unit: String, timeout: u32 },
    /// An error reading or writing spawner files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Persisted spawner state that cannot be encoded or decoded.
    #[error("cannot decode persisted spawner state: {0}")]
    State(#[from] serde_json::Error),
}

/// Alias for a [Result][std::result::Result] with the error type [Error].
pub type Result<T> = std::result::Result<T, Error>;
