use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One failed stage of a batch item. Storage and generation failures are
/// handled identically by the run loop (skip the item, keep going); the
/// variants exist so reports can say which stage broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("storage failed: {0}")]
    Storage(String),
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::InvalidRequest(_) => "invalid_request",
            ItemError::Generation(_) => "generation",
            ItemError::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub index: usize,
    pub prompt: Option<String>,
    pub error: ItemError,
}

impl ItemFailure {
    pub fn to_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("index".to_string(), Value::Number(self.index.into()));
        payload.insert(
            "prompt".to_string(),
            self.prompt
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "kind".to_string(),
            Value::String(self.error.kind().to_string()),
        );
        payload.insert("error".to_string(), Value::String(self.error.to_string()));
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedArtifact {
    pub file_id: String,
    pub public_url: String,
}

/// Created once per processed item, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success {
        local_path: PathBuf,
        remote: UploadedArtifact,
    },
    Failure(ItemFailure),
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Success { .. })
    }

    pub fn local_path(&self) -> Option<&PathBuf> {
        match self {
            GenerationOutcome::Success { local_path, .. } => Some(local_path),
            GenerationOutcome::Failure(_) => None,
        }
    }
}
