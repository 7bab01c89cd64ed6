//! Model snapshot handed to the checkpoint writer
//!
//! The writer treats the weights blob and the config text as opaque; the
//! serialization schema of either is owned by the model layer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Auxiliary file packaged at the archive root alongside the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Filename inside the archive root
    pub name: String,

    /// Artifact contents
    pub data: Bytes,

    /// Source-path string as it appears in the config text. When set, the
    /// writer rewrites every occurrence to `name` so config references stay
    /// relative to the archive root.
    pub config_reference: Option<String>,
}

impl Artifact {
    /// Artifact without any config reference to rewrite.
    pub fn new(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data,
            config_reference: None,
        }
    }

    /// Artifact whose config reference is rewritten during packaging.
    pub fn referenced(
        name: impl Into<String>,
        data: Bytes,
        config_reference: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            config_reference: Some(config_reference.into()),
        }
    }
}

/// One worker's view of the model state to persist.
///
/// Under model parallelism `weights` holds only this worker's shard; the
/// config and artifacts are replicated and written once by the merge leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Serialized weights for this worker's model-parallel rank
    pub weights: Bytes,

    /// Rendered model configuration text
    pub config_text: String,

    /// Auxiliary files referenced by the config
    pub artifacts: Vec<Artifact>,
}

impl ModelSnapshot {
    /// Snapshot with no artifacts.
    pub fn new(weights: Bytes, config_text: impl Into<String>) -> Self {
        Self {
            weights,
            config_text: config_text.into(),
            artifacts: Vec::new(),
        }
    }

    /// Config text with artifact references rewritten to archive-relative
    /// names.
    pub fn packaged_config_text(&self) -> String {
        let mut text = self.config_text.clone();
        for artifact in &self.artifacts {
            if let Some(reference) = &artifact.config_reference {
                text = text.replace(reference.as_str(), artifact.name.as_str());
            }
        }
        text
    }
}

/// Checkpoint contents restored for one worker.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    /// Model configuration text from the archive root
    pub config_text: String,

    /// Weights for this worker's model-parallel rank
    pub weights: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_reference_rewriting() {
        let mut snapshot = ModelSnapshot::new(
            Bytes::from_static(b"weights"),
            "tokenizer:\n  model: /data/tokenizers/spm_32k.model\n",
        );
        snapshot.artifacts.push(Artifact::referenced(
            "spm_32k.model",
            Bytes::from_static(b"vocab"),
            "/data/tokenizers/spm_32k.model",
        ));

        let text = snapshot.packaged_config_text();
        assert_eq!(text, "tokenizer:\n  model: spm_32k.model\n");
    }

    #[test]
    fn test_unreferenced_artifacts_leave_config_untouched() {
        let mut snapshot = ModelSnapshot::new(Bytes::new(), "model:\n  layers: 12\n");
        snapshot
            .artifacts
            .push(Artifact::new("notes.txt", Bytes::from_static(b"n")));
        assert_eq!(snapshot.packaged_config_text(), snapshot.config_text);
    }
}
