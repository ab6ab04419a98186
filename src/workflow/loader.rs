//! Workflow document loader
//!
//! Parses YAML or JSON definition documents, validates them against the
//! schema, and produces `WorkflowDefinition`s.

use std::path::Path;

use serde_json::Value;

use super::definition::WorkflowDefinition;
use super::schema::{validate_document, SchemaViolation};

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("IO error reading {file}: {error}")]
    Io {
        file: String,
        error: std::io::Error,
    },

    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Schema validation failed for {file}: {}", format_violations(.violations))]
    Schema {
        file: String,
        violations: Vec<SchemaViolation>,
    },

    #[error("Serialization error: {0}")]
    Serialize(String),
}

impl DefinitionError {
    /// Every schema violation, empty for parse and IO errors
    pub fn violations(&self) -> &[SchemaViolation] {
        match self {
            DefinitionError::Schema { violations, .. } => violations,
            _ => &[],
        }
    }
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Document encodings the loader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(DocumentFormat::Yaml),
            Some("json") => Some(DocumentFormat::Json),
            _ => None,
        }
    }
}

pub struct WorkflowLoader;

impl WorkflowLoader {
    /// Load a definition file, choosing the format by extension
    pub fn load_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
        let file = path.display().to_string();
        let format = DocumentFormat::from_path(path).ok_or_else(|| DefinitionError::Parse {
            file: file.clone(),
            message: "expected a .yaml, .yml or .json file".to_string(),
        })?;

        let content = std::fs::read_to_string(path).map_err(|error| DefinitionError::Io {
            file: file.clone(),
            error,
        })?;

        Self::load_named(&content, format, &file)
    }

    /// Load a definition from in-memory text
    pub fn load_str(content: &str, format: DocumentFormat) -> Result<WorkflowDefinition, DefinitionError> {
        Self::load_named(content, format, "<inline>")
    }

    fn load_named(
        content: &str,
        format: DocumentFormat,
        file: &str,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let document = Self::parse(content, format, file)?;

        let violations = Self::validate(&document);
        if !violations.is_empty() {
            return Err(DefinitionError::Schema {
                file: file.to_string(),
                violations,
            });
        }

        serde_json::from_value(document).map_err(|e| DefinitionError::Parse {
            file: file.to_string(),
            message: e.to_string(),
        })
    }

    /// Parse text into a generic document without validating it
    pub fn parse(content: &str, format: DocumentFormat, file: &str) -> Result<Value, DefinitionError> {
        let parsed = match format {
            DocumentFormat::Yaml => serde_yaml::from_str::<Value>(content).map_err(|e| e.to_string()),
            DocumentFormat::Json => serde_json::from_str::<Value>(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| DefinitionError::Parse {
            file: file.to_string(),
            message,
        })
    }

    /// Validate a parsed document and list every violation
    pub fn validate(document: &Value) -> Vec<SchemaViolation> {
        validate_document(document)
    }

    /// Serialize a definition back to YAML
    pub fn to_yaml(definition: &WorkflowDefinition) -> Result<String, DefinitionError> {
        serde_yaml::to_string(definition).map_err(|e| DefinitionError::Serialize(e.to_string()))
    }

    /// Serialize a definition to pretty-printed JSON
    pub fn to_json(definition: &WorkflowDefinition) -> Result<String, DefinitionError> {
        serde_json::to_string_pretty(definition).map_err(|e| DefinitionError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const VALID: &str = r#"
metadata:
  id: commit-changes
  name: Commit Changes
  version: 1.0.0
  type: core
steps:
  - id: commit
    action: git-operation
    operation: commit
    inputs:
      message: "WI ${inputs.ID}"
"#;

    #[test]
    fn test_load_file_yaml_and_json() {
        let dir = tempdir().unwrap();
        let yaml = dir.path().join("commit.yaml");
        fs::write(&yaml, VALID).unwrap();

        let def = WorkflowLoader::load_file(&yaml).unwrap();
        assert_eq!(def.id(), "commit-changes");

        let json = dir.path().join("commit.json");
        fs::write(&json, WorkflowLoader::to_json(&def).unwrap()).unwrap();
        assert_eq!(WorkflowLoader::load_file(&json).unwrap(), def);
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, VALID).unwrap();
        assert!(matches!(
            WorkflowLoader::load_file(&path),
            Err(DefinitionError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_error() {
        let err = WorkflowLoader::load_str("metadata: [unclosed", DocumentFormat::Yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::Parse { .. }));
        assert!(err.violations().is_empty());
    }

    #[test]
    fn test_schema_error_lists_violations() {
        let err = WorkflowLoader::load_str("metadata:\n  id: x\n", DocumentFormat::Yaml).unwrap_err();
        let paths: Vec<_> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["metadata.name", "metadata.version", "metadata.type", "steps"]
        );
        assert!(err.to_string().contains("metadata.name: required field is missing"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let def = WorkflowLoader::load_str(VALID, DocumentFormat::Yaml).unwrap();
        let yaml = WorkflowLoader::to_yaml(&def).unwrap();
        let reloaded = WorkflowLoader::load_str(&yaml, DocumentFormat::Yaml).unwrap();
        assert_eq!(reloaded, def);
    }
}
