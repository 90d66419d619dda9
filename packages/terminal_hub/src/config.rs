use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::output_buffer::DEFAULT_MAX_SCREEN_CHARS;
use crate::registry::{DEFAULT_WORKING_DIR, RegistryConfig};
use crate::runtime::Geometry;

// =============================================================================
// Figment-deserialized from defaults / terminal-hub.toml / env vars
// =============================================================================
//
//   terminal-hub.toml:  [sessions]
//                       shell = "/bin/zsh"
//
//   env var:            HUB_SESSIONS__SHELL=/bin/zsh   (double underscore = nesting)

pub const DEFAULT_CONFIG_FILE: &str = "terminal-hub.toml";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub preview: PreviewSection,
    #[serde(default)]
    pub project: ProjectSection,
}

/// Listener address (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Shell sessions (`[sessions]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Per-session replay buffer, in characters
    #[serde(default = "default_max_buffer_chars")]
    pub max_buffer_chars: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            working_dir: default_working_dir(),
            cols: default_cols(),
            rows: default_rows(),
            max_buffer_chars: default_max_buffer_chars(),
        }
    }
}

/// How detected dev-server ports are exposed (`[preview]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviewSection {
    /// `{port}` is replaced by the detected port.
    #[serde(default = "default_host_template")]
    pub host_template: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Run through `sh -c` by stopPreview. Nothing is killed when unset.
    #[serde(default)]
    pub kill_dev_servers_command: Option<String>,
}

impl Default for PreviewSection {
    fn default() -> Self {
        Self {
            host_template: default_host_template(),
            scheme: default_scheme(),
            kill_dev_servers_command: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Grace period after the last client leaves before sessions are closed.
    #[serde(default = "default_idle_teardown_secs")]
    pub idle_teardown_secs: u64,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            idle_teardown_secs: default_idle_teardown_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_working_dir() -> String {
    DEFAULT_WORKING_DIR.to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    20
}
fn default_max_buffer_chars() -> usize {
    DEFAULT_MAX_SCREEN_CHARS
}
fn default_host_template() -> String {
    "localhost:{port}".to_string()
}
fn default_scheme() -> String {
    "http".to_string()
}
fn default_idle_teardown_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config file → HUB_* env vars.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(HubConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("HUB_").split("__"))
}

impl HubConfig {
    pub fn load(config_file: &Path) -> Result<Self> {
        load_config(config_file)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", config_file.display()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    self.server.host, self.server.port
                )
            })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            working_dir: self.sessions.working_dir.clone(),
            initial_geometry: Geometry {
                cols: self.sessions.cols,
                rows: self.sessions.rows,
            },
            max_buffer_chars: self.sessions.max_buffer_chars,
        }
    }

    pub fn idle_teardown(&self) -> Duration {
        Duration::from_secs(self.project.idle_teardown_secs)
    }
}
