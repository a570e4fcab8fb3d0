//! Record store seam between the controller and persistence.

use llm_backend_types::InstanceConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A persisted instance configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub config: InstanceConfig,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update of an instance record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstancePatch {
    pub backend: Option<String>,
    pub loader: Option<String>,
    pub model_path: Option<Option<String>>,
    pub model_version: Option<Option<String>>,
    pub gateway: Option<Option<String>>,
    /// Replaces the loader parameters wholesale.
    pub loader_kwargs: Option<Map<String, Value>>,
}

impl InstancePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to a config in place.
    pub fn apply(&self, config: &mut InstanceConfig) {
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        if let Some(loader) = &self.loader {
            config.loader = loader.clone();
        }
        if let Some(model_path) = &self.model_path {
            config.model_path = model_path.clone();
        }
        if let Some(model_version) = &self.model_version {
            config.model_version = model_version.clone();
        }
        if let Some(gateway) = &self.gateway {
            config.gateway = gateway.clone();
        }
        if let Some(kwargs) = &self.loader_kwargs {
            config.loader_kwargs = kwargs.clone();
        }
    }
}

/// CRUD access to instance configuration records.
pub trait RecordStore: Send + Sync {
    fn get_record(&self, id: &str) -> Result<Option<InstanceRecord>, String>;

    /// Insert a new record and return its generated id.
    fn post_record(&self, config: &InstanceConfig) -> Result<String, String>;

    /// Returns `false` if no record has that id.
    fn patch_record(&self, id: &str, patch: &InstancePatch) -> Result<bool, String>;

    /// Returns `false` if no record has that id.
    fn delete_record(&self, id: &str) -> Result<bool, String>;

    fn list_records(&self) -> Result<Vec<InstanceRecord>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_apply_only_touches_given_fields() {
        let mut config = InstanceConfig::new("llamacpp", "gguf").with_model_path("/a.gguf");
        let patch = InstancePatch {
            loader: Some("gguf-mmap".to_string()),
            gateway: Some(Some("openai-compat".to_string())),
            ..InstancePatch::default()
        };
        patch.apply(&mut config);

        assert_eq!(config.backend, "llamacpp");
        assert_eq!(config.loader, "gguf-mmap");
        assert_eq!(config.model_path.as_deref(), Some("/a.gguf"));
        assert_eq!(config.gateway.as_deref(), Some("openai-compat"));
    }

    #[test]
    fn test_patch_can_clear_optional_field() {
        let mut config = InstanceConfig::new("llamacpp", "gguf").with_model_path("/a.gguf");
        let patch = InstancePatch {
            model_path: Some(None),
            ..InstancePatch::default()
        };
        assert!(!patch.is_empty());
        patch.apply(&mut config);
        assert!(config.model_path.is_none());
        assert!(InstancePatch::default().is_empty());
    }
}
