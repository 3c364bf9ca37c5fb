//! Configuration manager for miniblog.
//!
//! Values come from `mb-apiserver.yaml`, then `MINIBLOG_*` environment
//! variables and command line flags (see [`Overrides`]).

use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};

use crate::AppState;

const CONFIG_FILE: &str = "mb-apiserver.yaml";
const CONFIG_DIR: &str = ".miniblog";
const MIN_JWT_KEY_LEN: usize = 6;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Transport exposed by the server.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    /// gRPC only.
    Grpc,
    /// gRPC plus an HTTP gateway forwarding to it.
    #[default]
    GrpcGateway,
    /// HTTP only.
    Gin,
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Grpc => "grpc",
            Self::GrpcGateway => "grpc-gateway",
            Self::Gin => "gin",
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StoreDriver {
    #[default]
    Mysql,
    /// Process memory, lost on restart.
    Memory,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    pub server_mode: ServerMode,
    /// HMAC key used to sign tokens.
    #[serde(skip_serializing)]
    pub jwt_key: String,
    /// Claim holding the user id.
    pub identity_key: String,
    /// Token lifetime.
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,
    pub http: Listener,
    pub grpc: Listener,
    pub tls: Tls,
    #[serde(skip_serializing)]
    pub mysql: Mysql,
    pub store: Store,
    pub authz: Authz,
    pub log: Log,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            server_mode: ServerMode::default(),
            jwt_key: crate::token::DEFAULT_KEY.to_owned(),
            identity_key: crate::token::DEFAULT_IDENTITY_KEY.to_owned(),
            expiration: crate::token::DEFAULT_EXPIRATION,
            http: Listener {
                addr: "0.0.0.0:5555".into(),
            },
            grpc: Listener {
                addr: "0.0.0.0:6666".into(),
            },
            tls: Tls::default(),
            mysql: Mysql::default(),
            store: Store::default(),
            authz: Authz::default(),
            log: Log::default(),
            argon2: None,
            path: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Listener {
    /// `host:port`, or `:port` for every interface.
    pub addr: String,
}

/// TLS of the gRPC listener.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Tls {
    pub use_tls: bool,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// MySQL configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Mysql {
    /// Hostname:port of the MySQL instance.
    pub addr: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub max_idle_connections: u32,
    #[serde(with = "humantime_serde")]
    pub max_connection_life_time: Duration,
}

impl Default for Mysql {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3306".into(),
            username: "miniblog".into(),
            password: "miniblog1234".into(),
            database: "miniblog".into(),
            max_connections: 100,
            max_idle_connections: 100,
            max_connection_life_time: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Store {
    pub driver: StoreDriver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Authz {
    /// Delay between two reloads of the authorization rules.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for Authz {
    fn default() -> Self {
        Self {
            refresh_interval: crate::authz::DEFAULT_REFRESH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
        }
    }
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Argon2 {
    /// Memory used while hashing, in KiB.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 19 * 1024, // 19 MiB.
            iterations: 2,
            parallelism: 1,
            hash_length: 32,
        }
    }
}

/// Values given through flags or `MINIBLOG_*` variables. Set values win over
/// the file.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct Overrides {
    /// Transport to expose.
    #[arg(long, env = "MINIBLOG_SERVER_MODE", value_enum)]
    pub server_mode: Option<ServerMode>,
    /// Key used to sign tokens.
    #[arg(long, env = "MINIBLOG_JWT_KEY", hide_env_values = true)]
    pub jwt_key: Option<String>,
    /// Token lifetime, e.g. `2h` or `1h30m`.
    #[arg(long, env = "MINIBLOG_EXPIRATION", value_parser = humantime::parse_duration)]
    pub expiration: Option<Duration>,
    #[arg(long, env = "MINIBLOG_HTTP_ADDR")]
    pub http_addr: Option<String>,
    #[arg(long, env = "MINIBLOG_GRPC_ADDR")]
    pub grpc_addr: Option<String>,
    #[arg(long, env = "MINIBLOG_MYSQL_ADDR")]
    pub mysql_addr: Option<String>,
    #[arg(long, env = "MINIBLOG_MYSQL_USERNAME")]
    pub mysql_username: Option<String>,
    #[arg(long, env = "MINIBLOG_MYSQL_PASSWORD", hide_env_values = true)]
    pub mysql_password: Option<String>,
    #[arg(long, env = "MINIBLOG_MYSQL_DATABASE")]
    pub mysql_database: Option<String>,
    #[arg(long, env = "MINIBLOG_STORE_DRIVER", value_enum)]
    pub store_driver: Option<StoreDriver>,
    #[arg(long, env = "MINIBLOG_LOG_LEVEL")]
    pub log_level: Option<String>,
    #[arg(long, env = "MINIBLOG_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    /// Read `mb-apiserver.yaml` from `path`, `$HOME/.miniblog/` or the
    /// working directory. No file at all gives the defaults.
    pub fn read(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = match path {
            Some(path) => vec![path.to_path_buf()],
            None => std::env::var_os("HOME")
                .map(|home| Path::new(&home).join(CONFIG_DIR).join(CONFIG_FILE))
                .into_iter()
                .chain(std::iter::once(PathBuf::from(CONFIG_FILE)))
                .collect(),
        };

        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }

            let file = File::open(&candidate).map_err(|source| ConfigError::Io {
                path: candidate.clone(),
                source,
            })?;
            let mut config: Configuration = serde_yaml::from_reader(file)?;
            config.path = Some(candidate);
            return Ok(config);
        }

        if let Some(path) = path {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: std::io::ErrorKind::NotFound.into(),
            });
        }
        Ok(Self::default())
    }

    /// File the configuration was read from, `None` for defaults.
    pub fn source(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply flags and environment variables.
    pub fn merge(mut self, overrides: Overrides) -> Self {
        if let Some(mode) = overrides.server_mode {
            self.server_mode = mode;
        }
        if let Some(key) = overrides.jwt_key {
            self.jwt_key = key;
        }
        if let Some(expiration) = overrides.expiration {
            self.expiration = expiration;
        }
        if let Some(addr) = overrides.http_addr {
            self.http.addr = addr;
        }
        if let Some(addr) = overrides.grpc_addr {
            self.grpc.addr = addr;
        }
        if let Some(addr) = overrides.mysql_addr {
            self.mysql.addr = addr;
        }
        if let Some(username) = overrides.mysql_username {
            self.mysql.username = username;
        }
        if let Some(password) = overrides.mysql_password {
            self.mysql.password = password;
        }
        if let Some(database) = overrides.mysql_database {
            self.mysql.database = database;
        }
        if let Some(driver) = overrides.store_driver {
            self.store.driver = driver;
        }
        if let Some(level) = overrides.log_level {
            self.log.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.log.format = format;
        }
        self
    }

    /// Normalize addresses then check every setting the server relies on.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.jwt_key.len() < MIN_JWT_KEY_LEN {
            return Err(ConfigError::Invalid(format!(
                "jwt-key must be at least {MIN_JWT_KEY_LEN} characters long"
            )));
        }
        if self.identity_key.is_empty() {
            return Err(ConfigError::Invalid("identity-key cannot be empty".into()));
        }
        if self.expiration.is_zero() {
            return Err(ConfigError::Invalid("expiration must be positive".into()));
        }

        self.http.addr = normalize_addr(&self.http.addr)?.to_string();
        self.grpc.addr = normalize_addr(&self.grpc.addr)?.to_string();

        if self.tls.use_tls {
            for (name, path) in [("tls.cert", &self.tls.cert), ("tls.key", &self.tls.key)] {
                if !path.is_file() {
                    return Err(ConfigError::Invalid(format!(
                        "{name} `{}` is not a file",
                        path.display()
                    )));
                }
            }
        }

        Ok(self)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        normalize_addr(&self.http.addr)
    }

    pub fn grpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        normalize_addr(&self.grpc.addr)
    }
}

/// Parse `host:port`. A missing host means every interface.
pub fn normalize_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    };

    full.parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid listen address `{addr}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations() {
        let config: Configuration = serde_yaml::from_str(
            r#"
expiration: 1h 30m
mysql:
  max-connection-life-time: 250ms
authz:
  refresh-interval: 45s
"#,
        )
        .unwrap();
        assert_eq!(config.expiration, Duration::from_secs(5400));
        assert_eq!(config.mysql.max_connection_life_time, Duration::from_millis(250));
        assert_eq!(config.authz.refresh_interval, Duration::from_secs(45));

        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Configuration = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.expiration, config.expiration);

        for bad in ["", "h", "10", "10parsecs", "9999999999999999h"] {
            let yaml = format!("expiration: \"{bad}\"");
            assert!(
                serde_yaml::from_str::<Configuration>(&yaml).is_err(),
                "`{bad}` should be rejected"
            );
        }
    }

    #[test]
    fn test_overflowing_expiration_flag() {
        assert!(humantime::parse_duration("9999999999999999h").is_err());
        assert_eq!(
            humantime::parse_duration("2h").unwrap(),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_yaml() {
        let config: Configuration = serde_yaml::from_str(
            r#"
server-mode: gin
jwt-key: another-secret
expiration: 1h30m
http:
  addr: :8080
mysql:
  addr: db:3306
  max-connection-life-time: 30s
store:
  driver: memory
"#,
        )
        .unwrap();

        assert_eq!(config.server_mode, ServerMode::Gin);
        assert_eq!(config.expiration, Duration::from_secs(5400));
        assert_eq!(config.mysql.addr, "db:3306");
        assert_eq!(config.mysql.username, "miniblog");
        assert_eq!(config.mysql.max_connection_life_time, Duration::from_secs(30));
        assert_eq!(config.store.driver, StoreDriver::Memory);
        assert_eq!(config.grpc.addr, "0.0.0.0:6666");

        let config = config.validate().unwrap();
        assert_eq!(config.http.addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_validate() {
        let short = Configuration {
            jwt_key: "12345".into(),
            ..Default::default()
        };
        assert!(matches!(short.validate(), Err(ConfigError::Invalid(_))));

        let bad_addr = Configuration {
            grpc: Listener {
                addr: "nowhere".into(),
            },
            ..Default::default()
        };
        assert!(bad_addr.validate().is_err());

        let tls = Configuration {
            tls: Tls {
                use_tls: true,
                cert: "/definitely/missing.pem".into(),
                key: "/definitely/missing.key".into(),
            },
            ..Default::default()
        };
        assert!(tls.validate().is_err());

        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn test_merge() {
        let config = Configuration::default().merge(Overrides {
            server_mode: Some(ServerMode::Grpc),
            mysql_password: Some("secret".into()),
            ..Default::default()
        });
        assert_eq!(config.server_mode, ServerMode::Grpc);
        assert_eq!(config.mysql.password, "secret");
        assert_eq!(config.mysql.username, "miniblog");
    }

    #[test]
    fn test_explicit_missing_file() {
        let err = Configuration::read(Some(Path::new("/definitely/missing.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
