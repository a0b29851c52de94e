//! Code generation seam.
//!
//! A [`CodeGenerator`] turns a submission's selection into transformer source
//! files. The fleet manager stages those files as a config map mounted into
//! every worker pod.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Input handed to the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGenRequest {
    /// Selection or column expression.
    pub selection: String,
    /// Tree name inside the input files.
    pub tree_name: Option<String>,
    /// Requested output format.
    pub result_format: String,
}

/// Generated transformer code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    /// File name to contents.
    pub files: BTreeMap<String, String>,
    /// Image the generator recommends for running this code.
    pub transformer_image: Option<String>,
    /// Transformer language (`python`, `bash`, ...).
    pub language: String,
    /// Script that runs the transformer.
    pub command: String,
}

/// Produces transformer code for a selection.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Generates code for `request`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the selection cannot be compiled.
    async fn generate(&self, request: &CodeGenRequest) -> Result<GeneratedCode>;
}

/// Generator that returns the same code for every valid selection.
#[derive(Debug, Clone)]
pub struct StaticCodeGenerator {
    output: GeneratedCode,
}

impl StaticCodeGenerator {
    /// Wraps fixed output.
    #[must_use]
    pub const fn new(output: GeneratedCode) -> Self {
        Self { output }
    }
}

impl Default for StaticCodeGenerator {
    fn default() -> Self {
        Self::new(GeneratedCode {
            files: BTreeMap::from([(
                "transform_single_file.py".to_string(),
                "def transform_single_file(path, output, format):\n    pass\n".to_string(),
            )]),
            transformer_image: None,
            language: "python".to_string(),
            command: "/generated/transform_single_file.py".to_string(),
        })
    }
}

#[async_trait]
impl CodeGenerator for StaticCodeGenerator {
    async fn generate(&self, request: &CodeGenRequest) -> Result<GeneratedCode> {
        if request.selection.trim().is_empty() {
            return Err(Error::validation("selection must not be empty"));
        }
        Ok(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(selection: &str) -> CodeGenRequest {
        CodeGenRequest {
            selection: selection.into(),
            tree_name: None,
            result_format: "arrow".into(),
        }
    }

    #[tokio::test]
    async fn static_generator_returns_its_output() {
        let generator = StaticCodeGenerator::default();
        let code = generator.generate(&request("[jet_pt]")).await.unwrap();
        assert_eq!(code.language, "python");
        assert!(code.files.contains_key("transform_single_file.py"));
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let err = StaticCodeGenerator::default()
            .generate(&request("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
