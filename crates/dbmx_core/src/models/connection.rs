//! Connection configuration and runtime connection models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable identifier of a configured connection.
///
/// Assigned by the connection store (or the registry when no store is
/// attached) and never reused within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub i64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Database engine behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// PostgreSQL
    #[default]
    Postgres,
    /// MySQL
    Mysql,
    /// ClickHouse
    Clickhouse,
    /// SQLite
    Sqlite,
}

impl Engine {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Clickhouse => "clickhouse",
            Self::Sqlite => "sqlite",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" => Some(Self::Mysql),
            "clickhouse" => Some(Self::Clickhouse),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Port used when the configuration leaves it at zero.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
            Self::Clickhouse => 9000,
            Self::Sqlite => 0,
        }
    }

    /// Database used when the configuration leaves it empty.
    pub fn default_database(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "",
            Self::Clickhouse => "default",
            Self::Sqlite => "main",
        }
    }
}

/// SSL mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// No SSL
    Disable,
    /// Use SSL if available (default)
    #[default]
    Prefer,
    /// Require SSL, accept any certificate
    Require,
    /// Require SSL, verify CA
    VerifyCa,
    /// Require SSL, verify CA and hostname
    VerifyFull,
}

impl SslMode {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "disable" => Self::Disable,
            "require" => Self::Require,
            "verify-ca" | "verify_ca" => Self::VerifyCa,
            "verify-full" | "verify_full" => Self::VerifyFull,
            _ => Self::Prefer,
        }
    }
}

/// Login credentials for a server.
///
/// The password lives only in memory; stores never persist it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login username
    pub username: String,
    /// Login password
    #[serde(skip)]
    pub password: String,
}

impl Credentials {
    /// Create credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "method")]
pub enum SshAuth {
    /// Password authentication
    Password {
        /// SSH password, never persisted
        #[serde(skip)]
        password: String,
    },
    /// Private key authentication
    Key {
        /// Path to the private key
        key_path: Option<PathBuf>,
    },
}

impl Default for SshAuth {
    fn default() -> Self {
        Self::Password { password: String::new() }
    }
}

impl SshAuth {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Key { .. } => "key",
        }
    }
}

/// SSH tunnel settings for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    pub auth: SshAuth,
}

impl SshConfig {
    /// Create a new SSH tunnel configuration using password auth.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self { host: host.into(), port: 22, username: username.into(), auth: SshAuth::default() }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set key-based authentication.
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth = SshAuth::Key { key_path: Some(key_path.into()) };
        self
    }
}

/// Static configuration of a database connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database engine
    pub engine: Engine,
    /// Server hostname or IP (file path for SQLite)
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login credentials
    pub credentials: Credentials,
    /// Default database name
    pub database: String,
    /// Display name (1-255 chars)
    pub name: String,
    /// Environment label (e.g., "production")
    pub environment: String,
    /// UI accent color (hex format, e.g., "#FF5733"), empty for none
    pub color: String,
    /// Advanced TLS settings enabled
    pub is_advanced: bool,
    /// SSL configuration
    pub ssl_mode: SslMode,
    /// Optional SSH tunnel settings
    pub ssh: Option<SshConfig>,
}

impl ConnectionConfig {
    /// Create a configuration with required fields and engine defaults.
    pub fn new(
        engine: Engine,
        name: impl Into<String>,
        host: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            engine,
            host: host.into(),
            port: engine.default_port(),
            credentials,
            database: engine.default_database().to_string(),
            name: name.into(),
            environment: String::new(),
            color: String::new(),
            is_advanced: false,
            ssl_mode: SslMode::default(),
            ssh: None,
        }
    }

    /// Set the default database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the UI color.
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// Set the environment label.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Fill empty database and zero port with engine defaults.
    pub fn normalized(mut self) -> Self {
        if self.database.trim().is_empty() {
            self.database = self.engine.default_database().to_string();
        }
        if self.port == 0 {
            self.port = self.engine.default_port();
        }
        self.name = self.name.trim().to_string();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() || self.name.len() > 255 {
            return Err("Name must be 1-255 characters".to_string());
        }
        if self.host.is_empty() && self.engine != Engine::Sqlite {
            return Err("Host is required".to_string());
        }
        if !self.color.is_empty()
            && (!self.color.starts_with('#')
                || self.color.len() != 7
                || !self.color[1..].chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err("Color must be in hex format (#RRGGBB)".to_string());
        }
        if let Some(ref ssh) = self.ssh {
            if ssh.host.is_empty() {
                return Err("SSH host is required".to_string());
            }
            if let SshAuth::Key { key_path: None } = ssh.auth {
                return Err("Key path is required for key-based SSH authentication".to_string());
            }
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        match self.engine {
            Engine::Sqlite => format!("sqlite://{}", self.host),
            engine => format!(
                "{}://{}@{}:{}/{}",
                engine.as_str(),
                self.credentials.username,
                self.host,
                self.port,
                self.database
            ),
        }
    }
}

/// A known connection: its configuration plus runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Stable identifier
    pub id: ConnectionId,
    /// Static configuration
    pub config: ConnectionConfig,
    /// Set only by a successful connect, cleared by disconnect or a detected failure
    pub is_active: bool,
}

impl Connection {
    /// Create an inactive connection.
    pub fn new(id: ConnectionId, config: ConnectionConfig) -> Self {
        Self { id, config, is_active: false }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// UI accent color.
    pub fn color(&self) -> &str {
        &self.config.color
    }
}
