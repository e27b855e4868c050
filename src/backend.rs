use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::client::BackendClient;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one backend is required")]
    NoBackends,
    #[error("invalid backend: NAME is required for backend")]
    MissingName,
    #[error("invalid backend: BASE_URL is required for backend {0}")]
    MissingBaseUrl(String),
    #[error("invalid backend: API_KEY is required for backend {0}")]
    MissingApiKey(String),
    #[error("invalid backend: ALLOWED_MODELS needs at least one model for backend {0}")]
    MissingAllowedModels(String),
    #[error("backend name '{0}' is duplicated")]
    DuplicateName(String),
    #[error("backend base URL '{base_url}' is duplicated for {backend}")]
    DuplicateBaseUrl { base_url: String, backend: String },
    #[error(
        "model '{model}' is duplicated for backend {backend}, allowed models must be unique across all backends"
    )]
    DuplicateModel { model: String, backend: String },
    #[error("{0} is required")]
    MissingSetting(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },
}

/// Clones share the lazily built [`BackendClient`], so the client reflects the
/// configuration at the time of first use even if a clone is edited later.
#[derive(Clone)]
pub struct Backend {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub allowed_models: Vec<String>,
    client: Arc<OnceLock<Arc<BackendClient>>>,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        allowed_models: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            allowed_models,
            client: Arc::new(OnceLock::new()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::MissingBaseUrl(self.name.clone()));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey(self.name.clone()));
        }
        if self.allowed_models.iter().all(String::is_empty) {
            return Err(ConfigError::MissingAllowedModels(self.name.clone()));
        }
        Ok(())
    }

    pub fn allows(&self, model: &str) -> bool {
        !model.is_empty() && self.allowed_models.iter().any(|allowed| allowed == model)
    }

    pub fn client(&self) -> Arc<BackendClient> {
        self.client
            .get_or_init(|| Arc::new(BackendClient::new(&self.base_url, &self.api_key)))
            .clone()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"REDACTED")
            .field("allowed_models", &self.allowed_models)
            .finish()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Name: {}, BaseURL: {}, APIKey: REDACTED, AllowedModels: {:?}",
            self.name, self.base_url, self.allowed_models
        )
    }
}

/// Checks every backend in input order: required fields first, then name,
/// base URL and model uniqueness against the backends before it.
pub fn validate_backends(backends: &[Backend]) -> Result<(), ConfigError> {
    if backends.is_empty() {
        return Err(ConfigError::NoBackends);
    }

    let mut names: HashSet<&str> = HashSet::new();
    let mut base_urls: HashSet<&str> = HashSet::new();
    let mut models: HashSet<&str> = HashSet::new();

    for backend in backends {
        backend.validate()?;

        if !names.insert(&backend.name) {
            return Err(ConfigError::DuplicateName(backend.name.clone()));
        }
        if !base_urls.insert(&backend.base_url) {
            return Err(ConfigError::DuplicateBaseUrl {
                base_url: backend.base_url.clone(),
                backend: backend.name.clone(),
            });
        }

        for model in &backend.allowed_models {
            if !models.insert(model) {
                return Err(ConfigError::DuplicateModel {
                    model: model.clone(),
                    backend: backend.name.clone(),
                });
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Arc<[Arc<Backend>]>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Backend>) -> Result<Self, ConfigError> {
        validate_backends(&backends)?;
        Ok(Self {
            backends: backends.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn resolve(&self, model: &str) -> Option<&Arc<Backend>> {
        if model.is_empty() {
            return None;
        }
        self.backends.iter().find(|backend| backend.allows(model))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.iter()
    }
}
