//! Configuration system for ragchat.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/ragchat/config.toml` and/or `.ragchat/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration for the chat client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub endpoint: EndpointConfig,
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub storage: StorageConfig,
}

/// Where the chat server's collaborator endpoints live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the chat server (scheme, host, port).
    pub base_url: String,
    /// Path of the named prompt lookup endpoint.
    pub prompt_path: String,
    /// Path of the similarity search endpoint.
    pub search_path: String,
    /// Path of the streaming generation endpoint.
    pub generate_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4321".to_string(),
            prompt_path: "/api/prompt".to_string(),
            search_path: "/api/search".to_string(),
            generate_path: "/api/generate".to_string(),
        }
    }
}

/// Parameters forwarded to the similarity search collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Minimum similarity a document must have to be returned.
    pub similarity: f64,
    /// Maximum number of documents returned.
    pub limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity: 0.1,
            limit: 3,
        }
    }
}

/// Which few-shot prompt precedes each question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Name of a prompt stored on the server. When unset the built-in prompt is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Where session state is persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Explicit storage file. Defaults to `session.json` in the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the storage file, falling back to the platform data directory.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| {
            directories::ProjectDirs::from("dev", "ragchat", "ragchat")
                .map(|dirs| dirs.data_dir().join("session.json"))
        })
    }
}

impl ChatConfig {
    /// Validate this config and return any problems.
    ///
    /// Returns an empty Vec if the config is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let base = &self.endpoint.base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            problems.push(format!(
                "endpoint.base_url ({base}) must start with http:// or https://"
            ));
        }
        if !self.retrieval.similarity.is_finite()
            || !(0.0..=1.0).contains(&self.retrieval.similarity)
        {
            problems.push(format!(
                "retrieval.similarity ({}) must be between 0.0 and 1.0",
                self.retrieval.similarity
            ));
        }
        if self.retrieval.limit == 0 {
            problems.push("retrieval.limit must be at least 1".to_string());
        }
        if let Some(name) = &self.prompt.name
            && name.trim().is_empty()
        {
            problems.push("prompt.name is set but empty".to_string());
        }
        problems
    }

    /// Like [`validate`](Self::validate), but folds every problem into one error.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: problems.join("; "),
            })
        }
    }
}

/// Load configuration from the standard locations with layered merging.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RAGCHAT_`)
/// 3. Workspace-local config (`.ragchat/config.toml`)
/// 4. User config (`~/.config/ragchat/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ChatConfig>,
) -> Result<ChatConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ChatConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "ragchat", "ragchat") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".ragchat").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // RAGCHAT_ENDPOINT__BASE_URL, RAGCHAT_RETRIEVAL__LIMIT, etc.
    figment = figment.merge(Env::prefixed("RAGCHAT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Extract(Box::new(e)))
}
