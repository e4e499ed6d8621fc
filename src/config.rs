use serde::Deserialize;
use std::path::Path;

/// Environment variable that, when set, routes `/_nocachecontent/` requests
/// through the explicit-port reverse proxy instead of serving them locally.
pub const CONTENT_GATEWAY_ENV: &str = "CONTENT_GATEWAY_URL";

/// Environment variable selecting the websocket wiring mode. When set to
/// `true`, upgrades are intercepted by a server-wide wrapper; otherwise a
/// direct upgrade-event handler is used.
pub const PROXY_WEB_SOCKETS_ENV: &str = "PROXY_WEB_SOCKETS";

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// EULA gate configuration
    #[serde(default)]
    pub eula: EulaConfig,

    /// Static and no-cache content configuration
    #[serde(default)]
    pub content: ContentConfig,

    /// Per-user backend spawn configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// External auth gateway configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listener port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle pooled connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EulaConfig {
    /// Directory whose existence marks the EULA as accepted
    #[serde(default = "default_eula_marker_dir")]
    pub marker_dir: String,

    /// Static HTML asset streamed while the marker is absent
    #[serde(default = "default_eula_page_path")]
    pub page_path: String,
}

impl Default for EulaConfig {
    fn default() -> Self {
        Self {
            marker_dir: default_eula_marker_dir(),
            page_path: default_eula_page_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    /// Root directory for `/static`, `/custom` and `/_nocachecontent` files
    #[serde(default = "default_static_root")]
    pub static_root: String,

    /// Directory holding one JSON settings file per user
    #[serde(default = "default_settings_dir")]
    pub settings_dir: String,

    /// Where `/` lands when the user has no recorded startup path
    #[serde(default = "default_startup_path")]
    pub default_startup_path: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            static_root: default_static_root(),
            settings_dir: default_settings_dir(),
            default_startup_path: default_startup_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command template for a per-user backend; `{port}` and `{user}` are
    /// substituted before the command is parsed and spawned
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// First port assigned to a spawned backend; subsequent users get
    /// successive ports
    #[serde(default = "default_backend_base_port")]
    pub base_port: u16,

    /// Interval between readiness polls of a freshly spawned backend, in
    /// milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            base_port: default_backend_base_port(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Base URL of the external auth gateway the sign-in/out/callback paths
    /// are handed to
    #[serde(default = "default_auth_gateway")]
    pub gateway_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_auth_gateway(),
        }
    }
}

/// Runtime switches resolved from the environment at load time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeSwitches {
    /// Route `/_nocachecontent/` through the reverse proxy instead of
    /// serving it locally
    pub proxy_nocache_content: bool,

    /// Intercept websocket upgrades with the server-wide wrapper instead of
    /// the direct upgrade-event handler
    pub proxy_web_sockets: bool,
}

impl RuntimeSwitches {
    /// Resolve the switches from the process environment
    pub fn from_env() -> Self {
        Self {
            proxy_nocache_content: std::env::var(CONTENT_GATEWAY_ENV)
                .map(|v| !v.is_empty())
                .unwrap_or(false),
            proxy_web_sockets: std::env::var(PROXY_WEB_SOCKETS_ENV)
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }
}

/// Port of the content gateway named by `CONTENT_GATEWAY_URL`. A URL without
/// an explicit port falls back to the scheme default.
pub fn content_gateway_port(url: &str) -> Option<u16> {
    let uri: hyper::Uri = url.parse().ok()?;
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    })
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_eula_marker_dir() -> String {
    "/content/config/eula".to_string()
}

fn default_eula_page_path() -> String {
    "/srv/nbgate/static/eula.html".to_string()
}

fn default_static_root() -> String {
    "/srv/nbgate/static".to_string()
}

fn default_settings_dir() -> String {
    "/content/config/settings".to_string()
}

fn default_startup_path() -> String {
    "/tree/workspace".to_string()
}

fn default_backend_command() -> String {
    "notebook-server --port {port} --user {user}".to_string()
}

fn default_backend_base_port() -> u16 {
    9000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_auth_gateway() -> String {
    "http://127.0.0.1:8089".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.eula.marker_dir.is_empty() {
            anyhow::bail!("eula.marker_dir must not be empty");
        }
        if self.backend.base_port == 0 {
            anyhow::bail!("backend.base_port must be non-zero");
        }
        if self.backend.command.trim().is_empty() {
            anyhow::bail!("backend.command must not be empty");
        }
        Ok(())
    }
}
