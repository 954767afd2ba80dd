use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "roomdrop";
const APP_NAME: &str = "roomdrop";
const CONFIG_FILE: &str = "config.json";

/// Default listening port of the rendezvous service
pub const DEFAULT_PORT: u16 = 5000;

/// Rendezvous service settings. Nothing else is persisted: rooms live in
/// memory and are lost on restart.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl ServerConfig {
    /// Read `PORT` and `BIND_HOST` from the environment (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid PORT value: {raw}"))?,
            Err(_) => DEFAULT_PORT,
        };
        let host = match std::env::var("BIND_HOST") {
            Ok(raw) => raw
                .trim()
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid BIND_HOST value: {raw}"))?,
            Err(_) => IpAddr::from([0, 0, 0, 0]),
        };

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), DEFAULT_PORT),
        }
    }
}

/// Participant settings, stored as JSON in the platform config dir
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Rendezvous endpoint (`ws://host:port/ws`)
    pub server_url: String,
    /// Where received files are written
    pub download_path: PathBuf,
    /// Local address the initiator listens on for the direct channel
    pub direct_bind: String,
    /// Host advertised to the peer in the setup offer
    pub advertise_host: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub channel_setup_timeout_secs: u64,
    /// Largest declared file size the receiver will buffer
    pub max_file_size: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{DEFAULT_PORT}/ws"),
            download_path: get_download_dir(),
            direct_bind: "0.0.0.0:0".to_string(),
            advertise_host: None,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 2000,
            reconnect_max_delay_ms: 30_000,
            channel_setup_timeout_secs: 30,
            max_file_size: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("ROOMDROP_CONFIG_DIR") {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::get_config_path().ok_or_else(|| anyhow!("No config directory"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The rendezvous URL with `http(s)` mapped to `ws(s)`
    pub fn signaling_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server URL: {}", self.server_url))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(anyhow!("Unsupported URL scheme: {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot rewrite URL scheme of {}", self.server_url))?;
        Ok(url)
    }

    /// Host to put in the setup offer: configured value, else the LAN address
    pub fn advertised_host(&self) -> String {
        if let Some(host) = &self.advertise_host {
            return host.clone();
        }
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string())
    }

    pub fn channel_setup_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_setup_timeout_secs)
    }
}

/// Default download directory: ~/roomdrop
pub fn get_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roomdrop")
}
