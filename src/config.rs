use crate::pool::PoolConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// What to build, what to run, and where it listens
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the proxy listens on (default: 127.0.0.1:8080)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Exact path that marks the backend dirty instead of being proxied
    #[serde(default = "default_notify_route")]
    pub notify_route: String,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            notify_route: default_notify_route(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// The backend under development
///
/// # Security Warning
///
/// `binary` and `build_command` are executed directly. Configuration files
/// must come from trusted sources only.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Address the started binary is expected to listen on
    #[serde(default = "default_backend_address")]
    pub address: String,

    /// Backend executable, run without arguments
    #[serde(default)]
    pub binary: String,

    /// Build executable, run without arguments
    #[serde(default)]
    pub build_command: String,

    /// How long to poll for the backend after launching it (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when replacing the backend
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    pub fn new(binary: &str, build_command: &str, address: &str) -> Self {
        Self {
            address: address.to_string(),
            binary: binary.to_string(),
            build_command: build_command.to_string(),
            connect_timeout_secs: default_connect_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.binary.is_empty() {
            errors.push("backend requires 'binary' field".to_string());
        }
        if self.build_command.is_empty() {
            errors.push("backend requires 'build_command' field".to_string());
        }
        if self.address.is_empty() {
            errors.push("backend 'address' must not be empty".to_string());
        }
        if self.connect_timeout_secs == 0 {
            errors.push("backend 'connect_timeout_secs' must be greater than 0".to_string());
        }

        errors
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new("", "", &default_backend_address())
    }
}

// Default value functions
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_notify_route() -> String {
    "/__devgate/dirty".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.backend.validate();

        if !self.server.notify_route.starts_with('/') {
            errors.push(format!(
                "server 'notify_route' must start with '/', got '{}'",
                self.server.notify_route
            ));
        }
        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0:9000"
notify_route = "/reload"
pool_max_idle_per_host = 4

[backend]
address = "127.0.0.1:4000"
binary = "./target/debug/app"
build_command = "./build.sh"
connect_timeout_secs = 3
shutdown_grace_period_secs = 1
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind_addr().unwrap().port(), 9000);
        assert_eq!(config.server.notify_route, "/reload");
        assert_eq!(config.server.pool_config().max_idle_per_host, 4);
        assert_eq!(config.backend.address, "127.0.0.1:4000");
        assert_eq!(config.backend.binary, "./target/debug/app");
        assert_eq!(config.backend.build_command, "./build.sh");
        assert_eq!(config.backend.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.backend.shutdown_grace_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml = r#"
[backend]
binary = "./app"
build_command = "./build.sh"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.server.notify_route, "/__devgate/dirty");
        assert_eq!(config.server.pool_idle_timeout_secs, 90);
        assert_eq!(config.backend.address, "127.0.0.1:3000");
        assert_eq!(config.backend.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.backend.shutdown_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_config_parses_but_fails_validation() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("'binary'"));
        assert!(err.contains("'build_command'"));
    }

    #[test]
    fn test_validate_reports_every_error() {
        let mut config = Config::default();
        config.backend = BackendConfig::new("./app", "./build.sh", "");
        config.backend.connect_timeout_secs = 0;
        config.server.notify_route = "dirty".to_string();
        config.server.bind = "not-an-address".to_string();

        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("'address'"));
        assert!(err.contains("'connect_timeout_secs'"));
        assert!(err.contains("'notify_route'"));
        assert!(err.contains("Invalid bind address"));
        assert!(!err.contains("'binary'"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[backend]\nbinary = \"./app\"\nbuild_command = \"make\"\naddress = \"localhost:5000\"\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backend.address, "localhost:5000");
        assert_eq!(config.backend.build_command, "make");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[backend]\nbinary = \"./app\"\n").unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
