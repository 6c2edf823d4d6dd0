use crate::adapter::AdapterSettings;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 3456;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PROJECT_ID: &str = "meta-agents";
pub const DEFAULT_LOCATION: &str = "us-east5";
pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet@20250219";
pub const DEFAULT_HAIKU_MODEL: &str = "claude-3-5-haiku@20241022";
pub const DEFAULT_SERVICE_ACCOUNT_FILE: &str = "./service-account.json";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub project_id: String,
    pub location: String,
    pub model: String,
    pub haiku_model: String,
    pub service_account_file: PathBuf,
    pub vertex_base_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            project_id: DEFAULT_PROJECT_ID.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            model: DEFAULT_MODEL.to_string(),
            haiku_model: DEFAULT_HAIKU_MODEL.to_string(),
            service_account_file: PathBuf::from(DEFAULT_SERVICE_ACCOUNT_FILE),
            vertex_base_url: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Blank values count as unset.
    pub fn from_source<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let port = match get("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|err| format!("invalid PORT {raw:?}: {err}"))?,
            None => defaults.port,
        };
        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port,
            project_id: get("PROJECT_ID").unwrap_or(defaults.project_id),
            location: get("LOCATION").unwrap_or(defaults.location),
            model: get("CLAUDE_MODEL").unwrap_or(defaults.model),
            haiku_model: get("CLAUDE_HAIKU_MODEL").unwrap_or(defaults.haiku_model),
            service_account_file: get("SERVICE_ACCOUNT_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.service_account_file),
            vertex_base_url: get("VERTEX_BASE_URL"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            project_id: self.project_id.clone(),
            location: self.location.clone(),
            model: self.model.clone(),
            service_account_file: self.service_account_file.clone(),
        }
    }

    pub fn model_aliases(&self) -> ModelAliases {
        ModelAliases::new(&self.model, &self.haiku_model)
    }
}

/// Which configured upstream model a legacy alias points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Primary,
    Fast,
}

pub const LEGACY_ALIASES: [(&str, ModelTier); 4] = [
    ("claude-3-sonnet-20240229", ModelTier::Primary),
    ("claude-3-7-sonnet-20250219", ModelTier::Primary),
    ("claude-3-haiku-20240307", ModelTier::Fast),
    ("claude-3-5-haiku-20241022", ModelTier::Fast),
];

#[derive(Debug, Clone)]
pub struct ModelAliases {
    primary: String,
    fast: String,
}

impl ModelAliases {
    pub fn new(primary: impl Into<String>, fast: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fast: fast.into(),
        }
    }

    /// Maps a client alias to the upstream identifier. Unknown or missing aliases fall back to
    /// the primary model with a warning.
    pub fn resolve(&self, requested: Option<&str>) -> String {
        let tier = requested.and_then(|alias| {
            LEGACY_ALIASES
                .iter()
                .find(|(name, _)| *name == alias)
                .map(|(_, tier)| *tier)
        });
        match tier {
            Some(tier) => {
                let upstream_model = match tier {
                    ModelTier::Primary => self.primary.clone(),
                    ModelTier::Fast => self.fast.clone(),
                };
                tracing::info!(
                    requested = ?requested,
                    upstream_model = %upstream_model,
                    "using mapped model"
                );
                upstream_model
            }
            None => {
                tracing::warn!(
                    requested = ?requested,
                    default_model = %self.primary,
                    "requested model not in supported models, using default model"
                );
                self.primary.clone()
            }
        }
    }
}
