#![doc = include_str!("../README.md")]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use byte_unit::Byte;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

pub mod env_file;
mod error;
pub mod identity;
pub mod properties;
pub mod sd;
pub mod unit_name;

pub use error::{Error, Result};
pub use identity::{IdentityMode, UnitIdentity};
pub use properties::{LaunchSpec, PropertyValue};
pub use sd::{ServiceManager, Systemctl};

use unit_name::TemplateVars;

/// The oldest manager version able to run this spawner.
pub const SYSTEMD_REQUIRED_VERSION: u32 = 243;
/// Below this version `OOMPolicy=continue` is not honored, so an OOM
/// kill inside a unit takes the whole server down.
pub const SYSTEMD_LOWEST_RECOMMENDED_VERSION: u32 = 245;

/// The end user a server is spawned for, as the hub knows them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// The hub's numeric id for the user, available to templates as
    /// `{USERID}`.  Not a uid.
    pub id: u32,
}

/// Options for spawning servers as transient units.
///
/// All templates expand `{USERNAME}`, `{USERID}` and `{SERVERNAME}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientOptions {
    /// Template for the name of the unit.  Spawners for named servers
    /// should include `{SERVERNAME}` to keep names collision-free.
    pub unit_name_template: String,
    pub identity: IdentityMode,
    /// Working directory for the server.  Defaults to the account's
    /// home directory.
    pub working_dir_template: Option<String>,
    /// Value of `SHELL` inside the unit.
    pub default_shell: String,
    /// Directories prepended to the unit's `PATH`.
    pub extra_paths: Vec<String>,
    /// Give the unit its own /tmp, isolated from the system and from
    /// other users.
    pub isolate_tmp: bool,
    /// Give the unit its own /dev with a very limited set of devices.
    pub isolate_devices: bool,
    /// Disallow becoming another user via sudo or setuid binaries.
    pub disable_user_sudo: bool,
    /// Paths the server sees read-only.
    pub readonly_paths: Option<Vec<String>>,
    /// Writable holes punched inside the read-only paths.
    pub readwrite_paths: Option<Vec<String>>,
    pub memory_max: Option<Byte>,
    /// CPU as a fraction of one core; 2.0 means two full cores.
    pub cpu_limit: Option<f64>,
    /// Run every spawned unit inside this slice so their combined
    /// resource use can be capped in one place.
    pub slice: Option<String>,
    /// Extra unit directives, passed through to the launcher.
    pub extra_properties: HashMap<String, PropertyValue>,
    /// Where the manager mounts runtime directories.
    pub run_root: PathBuf,
}

impl Default for TransientOptions {
    fn default() -> Self {
        Self {
            unit_name_template: "singleuser-{USERNAME}".to_owned(),
            identity: IdentityMode::default(),
            working_dir_template: None,
            default_shell: std::env::var("SHELL")
                .unwrap_or_else(|_| "/bin/bash".to_owned()),
            extra_paths: Vec::new(),
            isolate_tmp: false,
            isolate_devices: false,
            disable_user_sudo: true,
            readonly_paths: None,
            readwrite_paths: None,
            memory_max: None,
            cpu_limit: None,
            slice: None,
            extra_properties: HashMap::new(),
            run_root: PathBuf::from("/run"),
        }
    }
}

/// Options for driving units the administrator installed ahead of time
/// instead of creating transient ones.  Resource limits and isolation
/// live in the installed unit files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOptions {
    /// Template for the default server's unit name.
    pub unit_name_template: String,
    /// Template unit (`...@.service`) instantiated with the escaped
    /// server name for named servers.
    pub named_unit_template: String,
    /// Where per-server secrets are kept.  Falls back to the first
    /// entry of `$STATE_DIRECTORY`, which the manager sets when the hub
    /// itself runs with `StateDirectory=`.
    pub state_dir: Option<PathBuf>,
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            unit_name_template: "singleuser-{USERNAME}.service".to_owned(),
            named_unit_template: "singleuser-{USERNAME}@.service".to_owned(),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
enum Flavor {
    Transient(TransientOptions),
    Installed(UnitOptions),
}

/// Liveness of a spawned server, as reported by [Spawner::poll].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Alive,
    /// Not running; the code carries no more detail than "gone", since
    /// the manager only reports coarse unit state.
    NotAlive(i32),
}

/// What [Spawner::preflight] found out about the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advisory {
    /// The manager is too old to run this spawner at all.
    UnsupportedManagerVersion { found: u32, required: u32 },
    /// Spawning works, but OOM kills inside a unit will take the whole
    /// server down.
    OldManagerVersion { found: u32, recommended: u32 },
    /// The manager version could not be determined.
    UnknownManagerVersion,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedManagerVersion { found, required } => write!(
                f,
                "systemd version {required} or higher is required, \
                 version {found} is in use"
            ),
            Self::OldManagerVersion { found, recommended } => write!(
                f,
                "systemd version {recommended} or higher is recommended, \
                 version {found} is in use"
            ),
            Self::UnknownManagerVersion => {
                write!(f, "the systemd version could not be determined")
            }
        }
    }
}

/// The record a spawner leaves behind between hub restarts.
///
/// It intentionally holds the *resolved* unit name rather than the
/// template: if the operator changes templates while servers are
/// running, the persisted name still points at the real unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnerState {
    pub unit_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escaped_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<PathBuf>,
}

impl SpawnerState {
    /// Encode for the hub's opaque state storage.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the hub's opaque state storage.
    pub fn from_json(blob: &str) -> Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// Supervises one server for one user as a service-manager unit.
///
/// A spawner owns exactly one unit name.  Within one spawner,
/// operations run strictly sequentially; spawners for different users
/// are independent and any number of them can run concurrently.
pub struct Spawner {
    user: User,
    escaped_server_name: Option<String>,
    unit_name: String,
    credential_path: Option<PathBuf>,
    cmd: Vec<String>,
    args: Vec<String>,
    environment: BTreeMap<String, String>,
    ip: Option<String>,
    start_timeout: u32,
    poll_interval: Duration,
    manager: Arc<dyn ServiceManager>,
    flavor: Flavor,
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("user", &self.user)
            .field("escaped_server_name", &self.escaped_server_name)
            .field("unit_name", &self.unit_name)
            .field("credential_path", &self.credential_path)
            .field("cmd", &self.cmd)
            .field("args", &self.args)
            .field("environment", &self.environment)
            .field("ip", &self.ip)
            .field("start_timeout", &self.start_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("manager", &"Arc<dyn ServiceManager>")
            .field("flavor", &self.flavor)
            .finish()
    }
}

fn random_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

impl Spawner {
    /// Create a spawner that runs the server as a transient unit.
    ///
    /// `server_name` distinguishes named sub-servers of the same user;
    /// its escaped form is substituted for `{SERVERNAME}`.
    pub fn transient(
        user: User,
        server_name: Option<&str>,
        options: TransientOptions,
    ) -> Result<Self> {
        let escaped = server_name.map(unit_name::escape_name);
        let vars = TemplateVars {
            username: &user.name,
            user_id: user.id,
            server_name: escaped.as_deref(),
        };
        let unit = unit_name::resolve(&options.unit_name_template, &vars)?;
        debug!("user:{} initialized spawner with unit {unit}", user.name);
        Ok(Self::assemble(user, escaped, unit, Flavor::Transient(options)))
    }

    /// Create a spawner that drives a unit the administrator installed
    /// ahead of time.
    pub fn installed(
        user: User,
        server_name: Option<&str>,
        options: UnitOptions,
    ) -> Result<Self> {
        let escaped = server_name.map(unit_name::escape_name);
        let vars = TemplateVars {
            username: &user.name,
            user_id: user.id,
            server_name: escaped.as_deref(),
        };
        let unit = match &escaped {
            Some(instance) => {
                let template = vars.expand(&options.named_unit_template);
                let name = unit_name::instantiate(&template, instance);
                unit_name::validate(&name)?;
                name
            }
            None => unit_name::resolve(&options.unit_name_template, &vars)?,
        };
        debug!("user:{} initialized spawner with unit {unit}", user.name);
        Ok(Self::assemble(user, escaped, unit, Flavor::Installed(options)))
    }

    fn assemble(
        user: User,
        escaped_server_name: Option<String>,
        unit_name: String,
        flavor: Flavor,
    ) -> Self {
        Self {
            user,
            escaped_server_name,
            unit_name,
            credential_path: None,
            cmd: Vec::new(),
            args: Vec::new(),
            environment: BTreeMap::new(),
            ip: None,
            start_timeout: 60,
            poll_interval: Duration::from_secs(1),
            manager: Arc::new(Systemctl),
            flavor,
        }
    }

    /// Set the command that runs the server.  Required for transient
    /// spawners; installed units carry their own `ExecStart=`.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cmd = cmd.into_iter().map(|s| s.as_ref().to_owned()).collect();
        self
    }

    /// Append an argument to the command line.
    pub fn arg<T: AsRef<str>>(mut self, arg: T) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Set the environment handed to the server.  Keys must match
    /// `[A-Za-z_][A-Za-z0-9_]*`; this is checked when the credential
    /// file is written.
    pub fn environment<I>(mut self, environment: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.environment = environment.into_iter().collect();
        self
    }

    /// The address reported back to the hub.  Defaults to 127.0.0.1.
    pub fn ip<T: AsRef<str>>(mut self, ip: T) -> Self {
        self.ip = Some(ip.as_ref().to_owned());
        self
    }

    /// How many activation checks to run before giving up on a start.
    pub fn start_timeout(mut self, checks: u32) -> Self {
        self.start_timeout = checks;
        self
    }

    /// Time between two activation checks.  One second unless tests
    /// need faster clocks.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replace the service manager.  Tests substitute an in-memory
    /// fake here.
    pub fn manager(mut self, manager: Arc<dyn ServiceManager>) -> Self {
        self.manager = manager;
        self
    }

    /// The resolved unit name this spawner owns.
    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// One-time host check, meant to be called by the hub during its
    /// own initialization.  Returns everything worth surfacing to the
    /// operator; an empty list means the host looks fine.
    pub async fn preflight(&self) -> Vec<Advisory> {
        let advisory = match self.manager.version().await {
            Some(found) if found < SYSTEMD_REQUIRED_VERSION => {
                Advisory::UnsupportedManagerVersion {
                    found,
                    required: SYSTEMD_REQUIRED_VERSION,
                }
            }
            Some(found) if found < SYSTEMD_LOWEST_RECOMMENDED_VERSION => {
                Advisory::OldManagerVersion {
                    found,
                    recommended: SYSTEMD_LOWEST_RECOMMENDED_VERSION,
                }
            }
            Some(_) => return Vec::new(),
            None => Advisory::UnknownManagerVersion,
        };
        match advisory {
            Advisory::UnsupportedManagerVersion { .. } => {
                error!("{advisory}");
            }
            _ => warn!("{advisory}"),
        }
        vec![advisory]
    }

    /// Start the server and wait for the unit to report active.
    ///
    /// Returns the address and freshly allocated port the server was
    /// told to listen on.  On failure every credential artifact written
    /// for this attempt is removed again.
    pub async fn start(&mut self) -> Result<(String, u16)> {
        unit_name::validate(&self.unit_name)?;
        let flavor = self.flavor.clone();
        match flavor {
            Flavor::Transient(options) => self.start_transient(&options).await,
            Flavor::Installed(options) => self.start_installed(&options).await,
        }
    }

    async fn start_transient(
        &mut self,
        options: &TransientOptions,
    ) -> Result<(String, u16)> {
        if self.cmd.is_empty() {
            return Err(Error::EmptyCommand(self.unit_name.clone()));
        }
        // Reject unsafe state directories up front, before anything is
        // asked of the manager.
        if let IdentityMode::Dynamic {
            state_directory_template,
        } = &options.identity
        {
            let statedir =
                self.template_vars().expand(state_directory_template);
            identity::validate_state_directory(&statedir)?;
        }

        self.reconcile_residual().await?;

        let port = random_port()?;
        debug!(
            "user:{} using port {port} to start spawning server",
            self.user.name
        );

        let spec = self.launch_spec(options)?;
        let (unit_properties, credential_path) =
            properties::build(&spec, &options.run_root, &self.unit_name)?;
        self.credential_path = credential_path;

        let status = match self
            .manager
            .start_transient(&self.unit_name, &spec, &unit_properties)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                self.discard_credentials();
                return Err(err);
            }
        };
        if !status.success() {
            warn!(
                "user:{} launcher rejected unit {}: {status}",
                self.user.name, self.unit_name
            );
            self.discard_credentials();
            return Err(Error::CommandFailed {
                command: "systemd-run".to_owned(),
                status,
            });
        }

        self.await_activation(port).await
    }

    async fn start_installed(
        &mut self,
        options: &UnitOptions,
    ) -> Result<(String, u16)> {
        if !self.manager.unit_exists(&self.unit_name).await? {
            return Err(Error::NoSuchUnit(self.unit_name.clone()));
        }

        self.reconcile_residual().await?;

        let port = random_port()?;
        debug!(
            "user:{} using port {port} to start spawning server",
            self.user.name
        );

        let secrets_dir = self.secrets_dir(options)?;
        env_file::write(&secrets_dir, "envfile", &self.environment, 0o600)?;
        self.credential_path = Some(secrets_dir);

        let status = match self.manager.start_unit(&self.unit_name).await {
            Ok(status) => status,
            Err(err) => {
                self.discard_credentials();
                return Err(err);
            }
        };
        if !status.success() {
            warn!(
                "user:{} start of unit {} failed: {status}",
                self.user.name, self.unit_name
            );
            self.discard_credentials();
            return Err(Error::CommandFailed {
                command: "systemctl start".to_owned(),
                status,
            });
        }

        self.await_activation(port).await
    }

    /// Reconcile whatever already sits under our unit name.
    ///
    /// An active unit here means a prior hub crash, a naming collision
    /// or a manager restart that lost track; we stop it and take the
    /// name.  A failed unit would block the name forever, so its state
    /// is reset.
    async fn reconcile_residual(&self) -> Result<()> {
        if self.manager.is_active(&self.unit_name).await? {
            info!(
                "user:{} unit {} already exists but is not ours, \
                 stopping it",
                self.user.name, self.unit_name
            );
            match self.manager.stop(&self.unit_name).await {
                Ok(status) if !status.success() => warn!(
                    "user:{} stopping residual unit {} returned {status}",
                    self.user.name, self.unit_name
                ),
                Err(err) => warn!(
                    "user:{} could not invoke stop for residual unit {}: \
                     {err}",
                    self.user.name, self.unit_name
                ),
                Ok(_) => {}
            }
            if self.manager.is_active(&self.unit_name).await? {
                error!(
                    "user:{} could not stop already existing unit {}",
                    self.user.name, self.unit_name
                );
                return Err(Error::ResidualUnit(self.unit_name.clone()));
            }
        }

        if self.manager.is_failed(&self.unit_name).await? {
            info!(
                "user:{} unit {} in a failed state, resetting",
                self.user.name, self.unit_name
            );
            let status = self.manager.reset_failed(&self.unit_name).await?;
            if !status.success() {
                debug!(
                    "user:{} reset-failed of {} returned {status}",
                    self.user.name, self.unit_name
                );
            }
        }
        Ok(())
    }

    async fn await_activation(&mut self, port: u16) -> Result<(String, u16)> {
        for _ in 0..self.start_timeout {
            match self.manager.is_active(&self.unit_name).await {
                Ok(true) => return Ok((self.host(), port)),
                Ok(false) => {}
                Err(err) => {
                    self.discard_credentials();
                    return Err(err);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        info!(
            "user:{} unit {} did not activate in time, removing its \
             credentials",
            self.user.name, self.unit_name
        );
        self.discard_credentials();
        Err(Error::StartTimeout {
            unit: self.unit_name.clone(),
            timeout: self.start_timeout,
        })
    }

    /// Stop the server and release its credentials.
    ///
    /// Safe to call on a unit that is not running: the manager's
    /// refusal is logged and the credential cleanup happens anyway.
    pub async fn stop(&mut self, _force: bool) -> Result<()> {
        info!(
            "user:{} stopping unit {}",
            self.user.name, self.unit_name
        );
        match self.manager.stop(&self.unit_name).await {
            Ok(status) if !status.success() => debug!(
                "user:{} stop of {} returned {status}; the unit was \
                 probably not running",
                self.user.name, self.unit_name
            ),
            Err(err) => warn!(
                "user:{} could not invoke stop for unit {}: {err}",
                self.user.name, self.unit_name
            ),
            Ok(_) => {}
        }
        if let Some(path) = self.credential_path.take() {
            if let Err(err) = env_file::remove_credentials(&path) {
                self.credential_path = Some(path);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Cheap liveness check; called by the hub as often as it likes.
    pub async fn poll(&self) -> ServerStatus {
        match self.manager.is_active(&self.unit_name).await {
            Ok(true) => ServerStatus::Alive,
            Ok(false) => ServerStatus::NotAlive(1),
            Err(err) => {
                debug!(
                    "user:{} liveness check of {} failed: {err}",
                    self.user.name, self.unit_name
                );
                ServerStatus::NotAlive(1)
            }
        }
    }

    /// The record to persist across hub restarts.
    pub fn state(&self) -> SpawnerState {
        SpawnerState {
            unit_name: self.unit_name.clone(),
            escaped_server_name: self.escaped_server_name.clone(),
            credential_path: self.credential_path.clone(),
        }
    }

    /// Reinstate a spawner from persisted state.  The persisted unit
    /// name wins over the template-derived one, so renaming templates
    /// in configuration cannot orphan running servers.
    pub fn load_state(&mut self, state: SpawnerState) {
        self.unit_name = state.unit_name;
        if state.escaped_server_name.is_some() {
            self.escaped_server_name = state.escaped_server_name;
        }
        if state.credential_path.is_some() {
            self.credential_path = state.credential_path;
        }
    }

    fn template_vars(&self) -> TemplateVars<'_> {
        TemplateVars {
            username: &self.user.name,
            user_id: self.user.id,
            server_name: self.escaped_server_name.as_deref(),
        }
    }

    fn host(&self) -> String {
        self.ip.clone().unwrap_or_else(|| "127.0.0.1".to_owned())
    }

    fn launch_spec(&self, options: &TransientOptions) -> Result<LaunchSpec> {
        let vars = self.template_vars();
        let resolved = identity::resolve(
            &options.identity,
            &vars,
            options.working_dir_template.as_deref(),
        )?;

        let mut environment = self.environment.clone();
        if let Some(home) = resolved.home {
            environment.insert("HOME".to_owned(), home);
        }
        if !options.extra_paths.is_empty() {
            let mut entries: Vec<String> = options
                .extra_paths
                .iter()
                .map(|p| vars.expand(p))
                .collect();
            match environment.get("PATH") {
                Some(current) if !current.is_empty() => {
                    entries.push(current.clone());
                }
                _ => entries.push(sd::DEFAULT_PATH.to_owned()),
            }
            environment.insert("PATH".to_owned(), entries.join(":"));
        }
        environment
            .insert("SHELL".to_owned(), options.default_shell.clone());

        let expand_paths = |paths: &Option<Vec<String>>| -> Option<Vec<String>> {
            paths
                .as_ref()
                .map(|ps| ps.iter().map(|p| vars.expand(p)).collect())
        };
        let extra_properties = options
            .extra_properties
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    PropertyValue::Str(s) => {
                        PropertyValue::Str(vars.expand(s))
                    }
                    PropertyValue::List(items) => PropertyValue::List(
                        items.iter().map(|s| vars.expand(s)).collect(),
                    ),
                };
                (key.clone(), value)
            })
            .collect();

        Ok(LaunchSpec {
            cmd: self.cmd.iter().map(|c| vars.expand(c)).collect(),
            args: self.args.iter().map(|a| vars.expand(a)).collect(),
            working_dir: resolved.working_dir,
            environment,
            identity: resolved.unit,
            memory_max: options.memory_max,
            cpu_limit: options.cpu_limit,
            private_tmp: options.isolate_tmp,
            private_devices: options.isolate_devices,
            no_new_privileges: options.disable_user_sudo,
            readonly_paths: expand_paths(&options.readonly_paths),
            readwrite_paths: expand_paths(&options.readwrite_paths),
            slice: options.slice.clone(),
            extra_properties,
        })
    }

    fn secrets_dir(&self, options: &UnitOptions) -> Result<PathBuf> {
        let state_dir = match &options.state_dir {
            Some(dir) => dir.clone(),
            None => std::env::var("STATE_DIRECTORY")
                .ok()
                .and_then(|value| {
                    value.split(':').next().map(PathBuf::from)
                })
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or(Error::NoStateDirectory)?,
        };
        let mut dir = state_dir.join("spawnerconf").join(&self.user.name);
        match &self.escaped_server_name {
            Some(escaped) => {
                dir.push("named");
                dir.push(escaped);
            }
            None => dir.push("default"),
        }
        Ok(dir)
    }

    fn discard_credentials(&mut self) {
        if let Some(path) = self.credential_path.take() {
            if let Err(err) = env_file::remove_credentials(&path) {
                warn!(
                    "user:{} could not remove credentials at {}: {err}",
                    self.user.name,
                    path.display()
                );
            }
        }
    }
}
