use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub static_files: StaticFilesConfig,

    #[serde(default)]
    pub proxy: Vec<ProxyRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticFilesConfig {
    #[serde(default = "default_static_root")]
    pub root: PathBuf,
}

/// One forwarding rule as written in the config file.
///
/// `rewrite_origin` and `verify_tls` default to true; a rule only states
/// them to opt out.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRuleConfig {
    pub prefix: String,
    pub target: String,

    #[serde(default = "default_true")]
    pub rewrite_origin: bool,

    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_static_root() -> PathBuf {
    PathBuf::from("./dist")
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            root: default_static_root(),
        }
    }
}

impl Config {
    /// Config file path from the CONFIG_PATH env var, or ./config.yaml.
    pub fn path_from_env() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse config file")
    }
}
