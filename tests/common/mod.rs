#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use persona_workflows::{WorkflowDefinition, WorkflowLoader, WorkflowRegistry};
use serde_json::{Map, Value};
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_workflow(dir: &Path, filename: &str, content: &str) {
    let path = dir.join(filename);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create workflow subdirectory");
    }
    fs::write(path, content).expect("Failed to write workflow file");
}

pub fn write_engine_config(dir: &Path, content: &str) {
    fs::write(dir.join("engine.yaml"), content).expect("Failed to write engine.yaml");
}

/// Header shared by every test document
pub fn header(id: &str, workflow_type: &str) -> String {
    format!(
        r#"
metadata:
  id: {id}
  name: {id}
  version: "1.0.0"
  type: {workflow_type}
  description: Test workflow {id}
"#
    )
}

/// A workflow with one log step
pub fn simple_workflow(id: &str) -> String {
    format!(
        r#"{}
steps:
  - id: hello
    action: log
    message: Hello from {id}
"#,
        header(id, "utility")
    )
}

/// A workflow with the given type and tags
pub fn tagged_workflow(id: &str, workflow_type: &str, tags: &[&str]) -> String {
    format!(
        r#"
metadata:
  id: {id}
  name: {id}
  version: "1.0.0"
  type: {workflow_type}
  tags: [{tags}]
steps:
  - id: hello
    action: log
    message: hi
"#,
        tags = tags.join(", ")
    )
}

/// A workflow that invokes each dependency in turn
pub fn workflow_with_deps(id: &str, deps: &[&str]) -> String {
    let steps: String = deps
        .iter()
        .map(|dep| {
            format!(
                "  - id: call-{dep}\n    action: execute-workflow\n    workflow: {dep}\n"
            )
        })
        .collect();
    format!("{}\nsteps:\n{}", header(id, "master"), steps)
}

/// A workflow whose only step exits non-zero
pub fn failing_workflow(id: &str) -> String {
    format!(
        r#"{}
steps:
  - id: boom
    action: shell-command
    command: "echo intentional failure >&2; exit 3"
"#,
        header(id, "utility")
    )
}

pub fn parse(yaml: &str) -> WorkflowDefinition {
    WorkflowLoader::load_str(yaml, persona_workflows::workflow::DocumentFormat::Yaml)
        .expect("Failed to parse test workflow")
}

/// In-memory registry holding the given documents
pub fn registry_of(docs: &[&str]) -> Arc<WorkflowRegistry> {
    let registry = WorkflowRegistry::in_memory();
    for doc in docs {
        registry.register(parse(doc));
    }
    Arc::new(registry)
}

pub fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
