//! Instance configuration.
//!
//! An `InstanceConfig` describes how a worker materializes its model. Two
//! configs are the same instance setup exactly when they compare equal; the
//! pool relies on that to detect config drift.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Backend type served by the built-in lookup model.
pub const ECHO_BACKEND: &str = "echo";

/// How to load one model instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Backend type, e.g. `llamacpp` or `echo`. Selects the loader family.
    pub backend: String,
    /// Loader name within the backend.
    pub loader: String,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    /// Gateway rewriting loader arguments before the model is created.
    #[serde(default)]
    pub gateway: Option<String>,
    /// Free-form loader parameters.
    #[serde(default)]
    pub loader_kwargs: Map<String, Value>,
}

impl InstanceConfig {
    pub fn new(backend: impl Into<String>, loader: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            loader: loader.into(),
            model_path: None,
            model_version: None,
            gateway: None,
            loader_kwargs: Map::new(),
        }
    }

    /// Config for the built-in echo backend: every prompt maps to a fixed
    /// response.
    pub fn echo<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Self::new(ECHO_BACKEND, "lookup");
        for (prompt, response) in pairs {
            config
                .loader_kwargs
                .insert(prompt.into(), Value::String(response.into()));
        }
        config
    }

    pub fn with_model_path(mut self, path: impl Into<String>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.loader_kwargs.insert(key.into(), value.into());
        self
    }

    /// Short human-readable label for log lines.
    pub fn describe(&self) -> String {
        match &self.model_path {
            Some(path) => format!("{}/{} ({path})", self.backend, self.loader),
            None => format!("{}/{}", self.backend, self.loader),
        }
    }
}
