//! The model call seen from a worker: `load(config) -> model`,
//! `model.infer(prompt) -> text`.
//!
//! Real backends live outside this workspace and plug in through
//! [`ModelLoader`]. The registry ships one built-in backend, `echo`, which
//! answers from a lookup table and is what worker processes can always load.

use std::collections::HashMap;
use std::time::Duration;

use llm_backend_types::config::ECHO_BACKEND;
use llm_backend_types::InstanceConfig;
use serde_json::Value;
use thiserror::Error;

/// Reserved echo kwarg: simulated processing time per request.
pub const ECHO_DELAY_KEY: &str = "delay_ms";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported backend '{0}'")]
    UnsupportedBackend(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct InferenceError(pub String);

/// A loaded model instance. Owned by exactly one worker, never shared.
pub trait LanguageModel {
    fn infer(&mut self, prompt: &str) -> Result<String, InferenceError>;
}

/// Materializes models from instance configs.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &InstanceConfig) -> Result<Box<dyn LanguageModel>, LoadError>;
}

impl<F> ModelLoader for F
where
    F: Fn(&InstanceConfig) -> Result<Box<dyn LanguageModel>, LoadError> + Send + Sync,
{
    fn load(&self, config: &InstanceConfig) -> Result<Box<dyn LanguageModel>, LoadError> {
        self(config)
    }
}

type LoaderFn = dyn Fn(&InstanceConfig) -> Result<Box<dyn LanguageModel>, LoadError> + Send + Sync;

/// Loaders keyed by backend type.
pub struct ModelRegistry {
    loaders: HashMap<String, Box<LoaderFn>>,
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry with the backends compiled into this binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ECHO_BACKEND, |config: &InstanceConfig| {
            Ok(Box::new(EchoModel::from_config(config)?) as Box<dyn LanguageModel>)
        });
        registry
    }

    pub fn register<F>(&mut self, backend: impl Into<String>, loader: F)
    where
        F: Fn(&InstanceConfig) -> Result<Box<dyn LanguageModel>, LoadError> + Send + Sync + 'static,
    {
        self.loaders.insert(backend.into(), Box::new(loader));
    }

    /// Registered backend types, sorted.
    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}

impl ModelLoader for ModelRegistry {
    fn load(&self, config: &InstanceConfig) -> Result<Box<dyn LanguageModel>, LoadError> {
        let loader = self
            .loaders
            .get(&config.backend)
            .ok_or_else(|| LoadError::UnsupportedBackend(config.backend.clone()))?;
        loader(config)
    }
}

/// Lookup-table model: each configured prompt maps to a fixed response.
#[derive(Debug, Clone)]
pub struct EchoModel {
    responses: HashMap<String, String>,
    delay: Option<Duration>,
}

impl EchoModel {
    pub fn from_config(config: &InstanceConfig) -> Result<Self, LoadError> {
        let mut responses = HashMap::new();
        let mut delay = None;

        for (key, value) in &config.loader_kwargs {
            match (key.as_str(), value) {
                (ECHO_DELAY_KEY, Value::Number(ms)) => {
                    let ms = ms.as_u64().ok_or_else(|| {
                        LoadError::InvalidConfig(format!("{ECHO_DELAY_KEY} must be a positive integer"))
                    })?;
                    delay = Some(Duration::from_millis(ms));
                }
                (_, Value::String(response)) => {
                    responses.insert(key.clone(), response.clone());
                }
                (_, other) => {
                    return Err(LoadError::InvalidConfig(format!(
                        "echo response for '{key}' must be a string, got {other}"
                    )));
                }
            }
        }

        Ok(Self { responses, delay })
    }
}

impl LanguageModel for EchoModel {
    fn infer(&mut self, prompt: &str) -> Result<String, InferenceError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.responses
            .get(prompt)
            .cloned()
            .ok_or_else(|| InferenceError(format!("no response configured for prompt '{prompt}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_loads_echo() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.backends(), vec!["echo"]);

        let mut model = registry
            .load(&InstanceConfig::echo([("hi", "bonjour")]))
            .unwrap();
        assert_eq!(model.infer("hi").unwrap(), "bonjour");
        assert!(model.infer("bye").is_err());
    }

    #[test]
    fn test_unknown_backend_is_a_load_error() {
        let registry = ModelRegistry::builtin();
        let err = registry
            .load(&InstanceConfig::new("llamacpp", "gguf"))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::UnsupportedBackend(ref b) if b == "llamacpp"));
    }

    #[test]
    fn test_echo_rejects_non_string_responses() {
        let config = InstanceConfig::echo([("hi", "bonjour")]).with_kwarg("count", true);
        assert!(matches!(
            EchoModel::from_config(&config),
            Err(LoadError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_echo_delay_is_not_a_prompt() {
        let config = InstanceConfig::echo([("hi", "bonjour")]).with_kwarg(ECHO_DELAY_KEY, 1);
        let mut model = EchoModel::from_config(&config).unwrap();
        assert_eq!(model.delay, Some(Duration::from_millis(1)));
        assert!(model.infer(ECHO_DELAY_KEY).is_err());
        assert_eq!(model.infer("hi").unwrap(), "bonjour");
    }

    #[test]
    fn test_closure_is_a_loader() {
        let loader = |_: &InstanceConfig| -> Result<Box<dyn LanguageModel>, LoadError> {
            Err(LoadError::Failed("out of memory".to_string()))
        };
        let err = loader.load(&InstanceConfig::new("any", "any")).err().unwrap();
        assert_eq!(err.to_string(), "out of memory");
    }
}
