use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
}

/// Known image models, keyed by name. Insertion order matters: the
/// first entry is the default when no model is requested.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(&self, requested: Option<&str>) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.get(requested_value) {
                return Ok(ModelSelection {
                    model: model.clone(),
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!("Requested model '{requested_value}' unknown.")),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let Some(model) = self.registry.list().next().cloned() else {
            return Err("No image models registered.".to_string());
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();
    let mut insert = |name: &str, provider: &str| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
            },
        );
    };

    insert("dall-e-3", "openai");
    insert("gpt-image-1", "openai");
    insert("dryrun-image-1", "dryrun");

    map
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{ModelRegistry, ModelSelector, ModelSpec};

    fn model(name: &str, provider: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
        }
    }

    #[test]
    fn select_returns_requested_model() -> anyhow::Result<()> {
        let selection = ModelSelector::new(None)
            .select(Some("dryrun-image-1"))
            .map_err(anyhow::Error::msg)?;
        assert_eq!(selection.model.name, "dryrun-image-1");
        assert_eq!(selection.model.provider, "dryrun");
        assert!(selection.fallback_reason.is_none());
        Ok(())
    }

    #[test]
    fn select_without_request_uses_default_with_explanation() -> anyhow::Result<()> {
        let selection = ModelSelector::new(None)
            .select(None)
            .map_err(anyhow::Error::msg)?;
        assert_eq!(selection.model.name, "dall-e-3");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
        Ok(())
    }

    #[test]
    fn select_falls_back_when_requested_model_unknown() -> anyhow::Result<()> {
        let selection = ModelSelector::new(None)
            .select(Some("missing"))
            .map_err(anyhow::Error::msg)?;
        assert_eq!(selection.model.name, "dall-e-3");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unknown.")
        );
        Ok(())
    }

    #[test]
    fn select_errors_when_registry_empty() {
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(IndexMap::new()))));
        let err = selector.select(None).err().unwrap_or_default();
        assert_eq!(err, "No image models registered.");
    }

    #[test]
    fn custom_registry_preserves_insertion_order() -> anyhow::Result<()> {
        let mut models = IndexMap::new();
        models.insert("first".to_string(), model("first", "dryrun"));
        models.insert("second".to_string(), model("second", "openai"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None)
            .map_err(anyhow::Error::msg)?;
        assert_eq!(selection.model.name, "first");
        Ok(())
    }
}
