use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{InferError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// System instruction placed first in every assembled prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

// -- Model -------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Gateway implementation. Only `"ollama"` ships today.
    #[serde(default = "default_model_backend")]
    pub backend: String,

    /// Model name (or path) handed to the backend.
    #[serde(default = "default_model_name")]
    pub name: String,

    /// `"local"` never fetches missing weights; anything else may pull them.
    #[serde(default = "default_model_provider")]
    pub provider: String,

    /// Base URL of the inference server.
    #[serde(default = "default_model_host")]
    pub host: String,

    /// Context window override in tokens (0 = ask the backend).
    #[serde(default)]
    pub context_length: usize,

    /// HTTP timeout for a single generation call (0 = no timeout).
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

// -- Generation --------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Capacity of the per-session token channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long `stop` waits for the background task before abandoning it.
    #[serde(default = "default_stop_join_timeout_ms")]
    pub stop_join_timeout_ms: u64,
}

// -- Server ------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Origins allowed by CORS. Empty disables the CORS layer.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

// -- Defaults ----------------------------------------------------------------

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful AI coding assistant. Use the chat history to maintain \
     context and the project files to answer questions about the codebase."
        .to_string()
}

fn default_model_backend() -> String {
    "ollama".to_string()
}

fn default_model_name() -> String {
    "deepseek-coder:6.7b-instruct".to_string()
}

fn default_model_provider() -> String {
    "remote".to_string()
}

fn default_model_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_model_timeout_secs() -> u64 {
    600
}

fn default_channel_capacity() -> usize {
    64
}

fn default_stop_join_timeout_ms() -> u64 {
    100
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_model_backend(),
            name: default_model_name(),
            provider: default_model_provider(),
            host: default_model_host(),
            context_length: 0,
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            stop_join_timeout_ms: default_stop_join_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            system_prompt: default_system_prompt(),
            model: ModelConfig::default(),
            generation: GenerationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

// -- Config impl ---------------------------------------------------------

impl Config {
    /// Load config from the given path, or the default XDG config location,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let mut config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path).map_err(InferError::Io)?;
            toml::from_str(&contents)
                .map_err(|e| InferError::Config(format!("parse error: {e}")))?
        } else {
            info!("no config file found, using defaults");
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production).  Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = get("MODEL_NAME_OR_PATH") {
            self.model.name = name;
        }
        if let Some(provider) = get("MODEL_PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(host) = get("OLLAMA_HOST") {
            self.model.host = host;
        }
        if let Some(bind) = get("BIND_ADDR") {
            self.bind = bind;
        }
        if let Some(port) = get("PORT") {
            self.bind = replace_port(&self.bind, port.trim());
        }
    }

    fn validate(&self) -> Result<()> {
        if self.generation.channel_capacity == 0 {
            return Err(InferError::Config(
                "generation.channel_capacity must be at least 1".into(),
            ));
        }
        if self.model.name.trim().is_empty() {
            return Err(InferError::Config("model.name must not be empty".into()));
        }
        Ok(())
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/stream-infer/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("stream-infer")
            .join("config.toml")
    }

    /// Whether missing model weights may be fetched from a remote registry.
    pub fn allows_remote_fetch(&self) -> bool {
        self.model.provider != "local"
    }

    /// Generate the default config file contents.
    pub fn default_config_contents() -> &'static str {
        include_str!("../config.example.toml")
    }
}

fn replace_port(bind: &str, port: &str) -> String {
    match bind.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{bind}:{port}"),
    }
}
