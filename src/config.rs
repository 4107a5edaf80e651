//! Layered configuration for the dispatcher and backend binaries.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. TOML file named by `CONVERT_CONFIG` (optional)
//! 3. the conventional variables `BASIC_AUTH_USERNAME`, `BASIC_AUTH_PASSWORD`,
//!    `CONSUL_HTTP_ADDR` and `REDIS_URL`
//! 4. `CONVERT_`-prefixed variables, `__` separating nested keys
//!    (`CONVERT_CREDENTIALS__PASSWORD`)

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::capability::CapabilityClass;
use crate::consumer::ReconnectPolicy;
use crate::converter::DocumentToolsConfig;

/// Environment variable naming the optional TOML file.
pub const CONFIG_PATH_ENV: &str = "CONVERT_CONFIG";

const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The single shared credential pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin_password".to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ConfigError::Invalid(
                "credentials.username and credentials.password must be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,
    pub credentials: Credentials,
    pub consul_http_addr: String,
    pub redis_url: String,
    /// Scheme used to reach backends for synchronous forwarding.
    pub backend_scheme: String,
    pub backend_accept_invalid_certs: bool,
    pub forward_timeout_secs: u64,
    pub registry_timeout_secs: u64,
    pub max_upload_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            credentials: Credentials::default(),
            consul_http_addr: "localhost:8500".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            backend_scheme: "http".to_string(),
            backend_accept_invalid_certs: false,
            forward_timeout_secs: 60,
            registry_timeout_secs: 5,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl DispatcherConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials.validate()?;
        require_nonzero("forward_timeout_secs", self.forward_timeout_secs)?;
        require_nonzero("registry_timeout_secs", self.registry_timeout_secs)?;
        if !matches!(self.backend_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "backend_scheme must be http or https, got '{}'",
                self.backend_scheme
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub capability: CapabilityClass,
    pub listen_addr: SocketAddr,
    /// Address announced to the registry; defaults to `$HOSTNAME`.
    pub advertise_address: Option<String>,
    /// Port announced to the registry; defaults to the listen port.
    pub advertise_port: Option<u16>,
    pub service_id: Option<String>,
    pub credentials: Credentials,
    pub consul_http_addr: String,
    pub redis_url: String,
    /// Names the in-flight list; defaults to the service id.
    pub consumer_name: Option<String>,
    pub reconnect_delay_secs: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub health_check_interval_secs: u64,
    pub health_check_scheme: String,
    pub callback_timeout_secs: u64,
    pub registry_timeout_secs: u64,
    pub register_on_start: bool,
    pub max_upload_bytes: usize,
    pub tools: DocumentToolsConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            capability: CapabilityClass::Document,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            advertise_address: None,
            advertise_port: None,
            service_id: None,
            credentials: Credentials::default(),
            consul_http_addr: "localhost:8500".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            consumer_name: None,
            reconnect_delay_secs: 5,
            reconnect_max_attempts: None,
            health_check_interval_secs: 10,
            health_check_scheme: "http".to_string(),
            callback_timeout_secs: 30,
            registry_timeout_secs: 5,
            register_on_start: true,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            tools: DocumentToolsConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn advertise_port(&self) -> u16 {
        self.advertise_port.unwrap_or_else(|| self.listen_addr.port())
    }

    /// Stable per address so a restarted backend replaces its old entry.
    pub fn service_id(&self) -> String {
        self.service_id.clone().unwrap_or_else(|| {
            format!(
                "{}-{}-{}",
                self.capability.service_name(),
                self.advertise_address(),
                self.advertise_port()
            )
        })
    }

    pub fn consumer_name(&self) -> String {
        self.consumer_name.clone().unwrap_or_else(|| self.service_id())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.reconnect_delay_secs),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials.validate()?;
        require_nonzero("reconnect_delay_secs", self.reconnect_delay_secs)?;
        require_nonzero("health_check_interval_secs", self.health_check_interval_secs)?;
        require_nonzero("callback_timeout_secs", self.callback_timeout_secs)?;
        require_nonzero("registry_timeout_secs", self.registry_timeout_secs)?;
        require_nonzero("tools.tool_timeout_secs", self.tools.tool_timeout_secs)?;
        require_nonzero("tools.render_dpi", self.tools.render_dpi as u64)?;
        require_nonzero("tools.page_concurrency", self.tools.page_concurrency as u64)?;
        if self.reconnect_max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "reconnect_max_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_nonzero(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

/// Conventional, unprefixed variable names mapped onto config keys.
fn conventional_env() -> Env {
    Env::raw()
        .only(&[
            "BASIC_AUTH_USERNAME",
            "BASIC_AUTH_PASSWORD",
            "CONSUL_HTTP_ADDR",
            "REDIS_URL",
        ])
        .map(|key| {
            let name = key.as_str();
            if name.eq_ignore_ascii_case("BASIC_AUTH_USERNAME") {
                "credentials.username".into()
            } else if name.eq_ignore_ascii_case("BASIC_AUTH_PASSWORD") {
                "credentials.password".into()
            } else {
                key.into()
            }
        })
}

/// Builds the provider stack on top of `defaults`.
pub fn figment<T: Serialize>(defaults: T, path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(defaults));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment
        .merge(conventional_env())
        .merge(Env::prefixed("CONVERT_").split("__"))
}

/// Extracts `T` from `figment`.
pub fn extract<T: DeserializeOwned>(figment: Figment) -> Result<T, ConfigError> {
    figment
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from)
}

fn load<T>() -> Result<T, ConfigError>
where
    T: Default + Serialize + DeserializeOwned,
{
    let path = config_path();
    if let Some(ref path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
    }
    extract(figment(T::default(), path.as_deref()))
}

/// Loads and validates the dispatcher configuration.
pub fn load_dispatcher_config() -> Result<DispatcherConfig, ConfigError> {
    let config: DispatcherConfig = load()?;
    config.validate()?;
    Ok(config)
}

/// Loads and validates the backend configuration.
pub fn load_backend_config() -> Result<BackendConfig, ConfigError> {
    let config: BackendConfig = load()?;
    config.validate()?;
    Ok(config)
}
