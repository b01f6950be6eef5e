use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// environment variable naming the registry rendezvous address
pub const REGISTRY_ENV: &str = "BNB_REGISTRY";

/// host name of this machine, resolved once
pub static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname
        .into_string()
        .unwrap_or_else(|raw: OsString| raw.to_string_lossy().into_owned()),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve hostname, falling back to localhost");
        "localhost".to_string()
    }
});

// check if a file is executable, bare names are looked up in PATH like the launcher does
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    let path = resolve_executable(path)?;

    match File::open(&path).map(|file| file.metadata()) {
        Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
        Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
    }
}

fn resolve_executable(path: &Path) -> Result<PathBuf, ConfigErrors> {
    let not_found = || ConfigErrors::FileNotFound(path.to_path_buf());

    if path.components().count() != 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf()).ok_or_else(not_found);
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
        .ok_or_else(not_found)
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Config file is invalid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Glob is invalid: {0}")]
    InvalidGlob(#[from] globset::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Preflight checks failed, see the log for details")]
    Preflight,
}

/// Which component a preflight check is run for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Registry,
    Slave,
    Master,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub slave: SlaveConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default, alias = "db")]
    pub database: DatabaseConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// rendezvous address every slave and master uses to find the registry
    #[serde(default = "default_registry_address")]
    pub address: String,
    /// silence after which a registered node is dropped
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SlaveConfig {
    #[serde(default = "default_slave_listen")]
    pub listen: String,
    /// address announced to the registry, defaults to `<hostname>:<port>`
    pub advertise: Option<String>,
    /// number of slots, defaults to the number of logical processors
    pub capacity: Option<u32>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// silence after which a master session is dropped
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// failures a task may see before it is permanently failed
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,
    /// listen address of the control endpoint of a standing master
    pub control: Option<String>,
    /// glob applied to directories given as stub inputs
    #[serde(default = "default_stub_glob")]
    pub glob: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SolverConfig {
    // solver executable, invoked as `exec params.. stub options..`
    #[serde(default = "default_solver_exec")]
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// result store location, no store is kept when unset
    pub path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: default_registry_address(),
            liveness_timeout_ms: default_liveness_timeout(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            listen: default_slave_listen(),
            advertise: None,
            capacity: None,
            heartbeat_interval_ms: default_heartbeat_interval(),
            liveness_timeout_ms: default_liveness_timeout(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            request_timeout_ms: default_request_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            liveness_timeout_ms: default_liveness_timeout(),
            dispatch_interval_ms: default_dispatch_interval(),
            discovery_interval_ms: default_discovery_interval(),
            control: None,
            glob: default_stub_glob(),
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            exec: default_solver_exec(),
            params: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SlaveConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// configured capacity or the number of logical processors
    pub fn total_slots(&self) -> u32 {
        self.capacity
            .unwrap_or_else(|| u32::try_from(num_cpus::get()).unwrap_or(u32::MAX))
            .max(1)
    }
}

impl MasterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

impl ClusterConfig {
    /// Load the config file if given, falling back to defaults otherwise. The registry
    /// address from the environment overrides the file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

                Self::parse(&content)?
            }
            None => Self::default(),
        };

        if let Ok(address) = std::env::var(REGISTRY_ENV) {
            if !address.is_empty() {
                config.registry.address = address;
            }
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Check everything a component needs before it starts. All problems are logged at once
    /// instead of piece-by-piece to make debugging easier for users; returns whether any
    /// error was found.
    pub fn preflight_checks(&self, component: Component) -> bool {
        let mut contains_error = false;

        if self.registry.address.is_empty() {
            error!("registry.address must name the registry rendezvous address");
            contains_error = true;
        }

        if self.registry.liveness_timeout_ms == 0 || self.registry.request_timeout_ms == 0 {
            error!("registry timeouts cannot be 0");
            contains_error = true;
        }

        match component {
            Component::Registry => {}
            Component::Slave => {
                if self.slave.capacity == Some(0) {
                    error!("slave.capacity must be at least 1");
                    contains_error = true;
                }

                if self.slave.heartbeat_interval_ms == 0 || self.slave.liveness_timeout_ms == 0 {
                    error!("slave heartbeat interval and liveness timeout cannot be 0");
                    contains_error = true;
                } else if self.slave.heartbeat_interval_ms >= self.slave.liveness_timeout_ms {
                    warn!(
                        "slave.heartbeat_interval_ms is not below slave.liveness_timeout_ms, \
                         sessions may flap"
                    );
                }

                match check_executable(&self.solver.exec) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "Solver target {} is not executable",
                            self.solver.exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if solver.exec ({}) is an executable: {e}",
                            self.solver.exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
            }
            Component::Master => {
                let master = &self.master;

                if master.request_timeout_ms == 0
                    || master.heartbeat_interval_ms == 0
                    || master.liveness_timeout_ms == 0
                    || master.dispatch_interval_ms == 0
                    || master.discovery_interval_ms == 0
                {
                    error!("master intervals and timeouts cannot be 0");
                    contains_error = true;
                } else if master.heartbeat_interval_ms >= master.liveness_timeout_ms {
                    warn!(
                        "master.heartbeat_interval_ms is not below master.liveness_timeout_ms, \
                         slaves may be dropped spuriously"
                    );
                }

                if let Err(e) = globset::Glob::new(&master.glob) {
                    error!("master.glob ({}) is invalid: {e}", master.glob);
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_registry_address() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_slave_listen() -> String {
    "0.0.0.0:7171".to_string()
}

fn default_liveness_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_dispatch_interval() -> u64 {
    500
}

fn default_discovery_interval() -> u64 {
    2000
}

fn default_retry_limit() -> u32 {
    3
}

fn default_stub_glob() -> String {
    "*.nl".to_string()
}

fn default_solver_exec() -> PathBuf {
    PathBuf::from("solver")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ClusterConfig::parse("{}").unwrap();

        assert_eq!(config.registry.address, "127.0.0.1:7070");
        assert_eq!(config.master.retry_limit, 3);
        assert_eq!(config.master.glob, "*.nl");
        assert!(config.slave.capacity.is_none());
        assert!(config.database.path.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ClusterConfig::parse(
            "
registry:
  address: head:9000
slave:
  capacity: 4
solver:
  exec: /opt/bin/bnb-solver
  params: [\"-p\"]
db:
  path: runs.db
",
        )
        .unwrap();

        assert_eq!(config.registry.address, "head:9000");
        assert_eq!(config.registry.liveness_timeout_ms, 5000);
        assert_eq!(config.slave.total_slots(), 4);
        assert_eq!(config.solver.params, vec!["-p".to_string()]);
        assert_eq!(config.database.path, Some(PathBuf::from("runs.db")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ClusterConfig::parse("master:\n  retries: 2\n").is_err());
    }

    #[test]
    fn capacity_defaults_to_at_least_one_slot() {
        assert!(SlaveConfig::default().total_slots() >= 1);
    }

    #[test]
    fn slave_preflight_requires_executable_solver() {
        let mut config = ClusterConfig::default();
        config.solver.exec = PathBuf::from("/definitely/not/a/solver");
        assert!(config.preflight_checks(Component::Slave));

        config.solver.exec = PathBuf::from("/bin/sh");
        assert!(!config.preflight_checks(Component::Slave));

        config.slave.capacity = Some(0);
        assert!(config.preflight_checks(Component::Slave));
    }

    #[test]
    fn bare_solver_names_are_found_in_path() {
        assert!(check_executable(Path::new("sh")).unwrap());
        assert!(matches!(
            check_executable(Path::new("definitely-not-a-solver")),
            Err(ConfigErrors::FileNotFound(_))
        ));

        let mut config = ClusterConfig::default();
        config.solver.exec = PathBuf::from("sh");
        assert!(!config.preflight_checks(Component::Slave));
    }

    #[test]
    fn master_preflight_rejects_zero_timeouts() {
        let mut config = ClusterConfig::default();
        assert!(!config.preflight_checks(Component::Master));

        config.master.request_timeout_ms = 0;
        assert!(config.preflight_checks(Component::Master));
    }
}
