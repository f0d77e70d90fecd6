use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::adoption::OrganizationId;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub uploads: UploadConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let max_connections = env::var("APP_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or(ConfigError::InvalidPoolSize)?;

        let tokens = parse_admin_tokens(&env::var("APP_ADMIN_TOKENS").unwrap_or_default())?;

        let upload_dir = env::var("APP_UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string());
        let public_base_url =
            env::var("APP_UPLOAD_BASE_URL").unwrap_or_else(|_| "/uploads".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            storage: StorageConfig {
                database_url,
                max_connections,
            },
            auth: AuthConfig { tokens },
            uploads: UploadConfig {
                directory: PathBuf::from(upload_dir),
                public_base_url,
            },
        })
    }
}

/// Parses `token=organization_id` pairs separated by commas.
fn parse_admin_tokens(raw: &str) -> Result<BTreeMap<String, OrganizationId>, ConfigError> {
    let mut tokens = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (token, organization) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidAdminToken(entry.to_string()))?;
        let organization = organization
            .trim()
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidAdminToken(entry.to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(ConfigError::InvalidAdminToken(entry.to_string()));
        }
        tokens.insert(token.to_string(), OrganizationId(organization));
    }
    Ok(tokens)
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Persistence backend selection. No database URL means the in-memory backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
}

/// Bearer tokens accepted on administrative routes.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub tokens: BTreeMap<String, OrganizationId>,
}

/// Where uploaded photos are written and how their URLs are formed.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub directory: PathBuf,
    pub public_base_url: String,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidPoolSize,
    InvalidAdminToken(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidPoolSize => {
                write!(f, "APP_DB_MAX_CONNECTIONS must be a positive integer")
            }
            ConfigError::InvalidAdminToken(entry) => write!(
                f,
                "APP_ADMIN_TOKENS entry '{entry}' must look like token=organization_id"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidPoolSize
            | ConfigError::InvalidAdminToken(_) => None,
        }
    }
}
