//! Workflow registry
//!
//! Scans a directory tree of definition documents and keeps an immutable
//! index snapshot. A scan builds a complete new index and swaps it in at
//! once, so readers never observe a half-built index; concurrent scans are
//! serialized.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::config::CONFIG_FILE_NAME;
use super::definition::{WorkflowDefinition, WorkflowType};
use super::loader::{DefinitionError, DocumentFormat, WorkflowLoader};

/// File name written by `export` and skipped by `scan`
pub const INDEX_FILE_NAME: &str = "index.json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Duplicate workflow id '{id}' in {first} and {second}")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },

    #[error("Workflow root {0} is not a directory")]
    InvalidRoot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Metadata view of an indexed workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl WorkflowSummary {
    fn new(definition: &WorkflowDefinition, path: Option<PathBuf>) -> Self {
        let metadata = &definition.metadata;
        Self {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            workflow_type: metadata.workflow_type,
            description: metadata.description.clone(),
            tags: metadata.tags.clone(),
            author: metadata.author.clone(),
            inputs: definition.inputs.iter().map(|i| i.name.clone()).collect(),
            outputs: definition.outputs.iter().map(|o| o.name.clone()).collect(),
            dependencies: definition.workflow_references(),
            path,
        }
    }

    fn matches_text(&self, needle: &str) -> bool {
        self.id.to_lowercase().contains(needle)
            || self.name.to_lowercase().contains(needle)
            || self.description.to_lowercase().contains(needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

/// Filter for `list`; empty fields match everything
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub workflow_type: Option<WorkflowType>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
}

impl WorkflowFilter {
    pub fn by_type(workflow_type: WorkflowType) -> Self {
        Self {
            workflow_type: Some(workflow_type),
            tags: Vec::new(),
        }
    }

    fn matches(&self, summary: &WorkflowSummary) -> bool {
        if self.workflow_type.is_some_and(|t| t != summary.workflow_type) {
            return false;
        }
        self.tags.iter().all(|tag| summary.tags.contains(tag))
    }
}

/// A file that failed to load during a scan
#[derive(Debug)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub error: RegistryScanError,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryScanError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of a scan: how many workflows were indexed and what failed
#[derive(Debug, Default)]
pub struct ScanReport {
    pub indexed: usize,
    pub failures: Vec<ScanFailure>,
}

/// Aggregate numbers about the index
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub with_dependencies: usize,
    pub last_scan: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    definition: Arc<WorkflowDefinition>,
    summary: WorkflowSummary,
}

#[derive(Debug, Default)]
struct RegistryIndex {
    entries: BTreeMap<String, IndexEntry>,
    last_scan: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ExportedIndex<'a> {
    generated_at: DateTime<Utc>,
    root: Option<&'a Path>,
    workflows: Vec<&'a WorkflowSummary>,
}

/// Index of workflow definitions, shared read-only across runs
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    root: Option<PathBuf>,
    index: RwLock<Arc<RegistryIndex>>,
    scan_lock: Mutex<()>,
}

impl WorkflowRegistry {
    /// Registry backed by a directory tree; call `scan` to populate it
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: Some(root.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Registry without a directory, populated through `register`
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn snapshot(&self) -> Arc<RegistryIndex> {
        let guard = self.index.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn swap(&self, index: RegistryIndex) {
        let mut guard = self.index.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(index);
    }

    /// Rebuild the index from the root directory
    ///
    /// Files that fail to load are reported in the returned `ScanReport`
    /// and do not prevent the remaining files from being indexed.
    #[instrument(skip(self), fields(root = ?self.root))]
    pub fn scan(&self) -> Result<ScanReport, RegistryError> {
        let root = self
            .root
            .clone()
            .ok_or_else(|| RegistryError::InvalidRoot("<in-memory>".to_string()))?;
        if !root.is_dir() {
            return Err(RegistryError::InvalidRoot(root.display().to_string()));
        }

        let _scan = self.scan_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut report = ScanReport::default();
        let mut entries: BTreeMap<String, IndexEntry> = BTreeMap::new();

        let mut files: Vec<PathBuf> = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_definition_file(path))
            .collect();
        files.sort();

        for path in files {
            debug!("Loading workflow definition: {}", path.display());
            match WorkflowLoader::load_file(&path) {
                Ok(definition) => {
                    let id = definition.id().to_string();
                    if let Some(existing) = entries.get(&id) {
                        let first = existing
                            .summary
                            .path
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        let error = RegistryError::DuplicateId {
                            id,
                            first,
                            second: path.display().to_string(),
                        };
                        warn!("{}", error);
                        report.failures.push(ScanFailure {
                            path,
                            error: error.into(),
                        });
                        continue;
                    }

                    let summary = WorkflowSummary::new(&definition, Some(path));
                    entries.insert(
                        id,
                        IndexEntry {
                            definition: Arc::new(definition),
                            summary,
                        },
                    );
                }
                Err(error) => {
                    warn!("Failed to load {}: {}", path.display(), error);
                    report.failures.push(ScanFailure {
                        path,
                        error: error.into(),
                    });
                }
            }
        }

        report.indexed = entries.len();
        info!(
            "Indexed {} workflows ({} failures)",
            report.indexed,
            report.failures.len()
        );

        self.swap(RegistryIndex {
            entries,
            last_scan: Some(Utc::now()),
        });
        Ok(report)
    }

    /// Add or replace a definition without touching the filesystem
    pub fn register(&self, definition: WorkflowDefinition) {
        let _scan = self.scan_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        let mut entries = current.entries.clone();
        let summary = WorkflowSummary::new(&definition, None);
        entries.insert(
            definition.id().to_string(),
            IndexEntry {
                definition: Arc::new(definition),
                summary,
            },
        );

        self.swap(RegistryIndex {
            entries,
            last_scan: current.last_scan,
        });
    }

    /// Resolve a workflow id to its definition
    pub fn get(&self, id: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.snapshot()
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.definition))
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().entries.contains_key(id)
    }

    pub fn summary(&self, id: &str) -> Result<WorkflowSummary, RegistryError> {
        self.snapshot()
            .entries
            .get(id)
            .map(|entry| entry.summary.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries matching the filter, ordered by id
    pub fn list(&self, filter: &WorkflowFilter) -> Vec<WorkflowSummary> {
        self.snapshot()
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.summary))
            .map(|entry| entry.summary.clone())
            .collect()
    }

    /// Case-insensitive match over id, name, description and tags
    pub fn search(&self, text: &str) -> Vec<WorkflowSummary> {
        let needle = text.trim().to_lowercase();
        self.snapshot()
            .entries
            .values()
            .filter(|entry| needle.is_empty() || entry.summary.matches_text(&needle))
            .map(|entry| entry.summary.clone())
            .collect()
    }

    /// Workflows invoked by `id`, optionally following the chain transitively
    pub fn dependencies(&self, id: &str, recursive: bool) -> Result<Vec<String>, RegistryError> {
        let index = self.snapshot();
        let root = index
            .entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if !recursive {
            return Ok(root.summary.dependencies.clone());
        }

        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = root.summary.dependencies.clone();
        while let Some(dep) = stack.pop() {
            if dep == id || !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(entry) = index.entries.get(&dep) {
                stack.extend(entry.summary.dependencies.iter().cloned());
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Workflows that invoke `id` directly
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.snapshot()
            .entries
            .values()
            .filter(|entry| entry.summary.dependencies.iter().any(|d| d == id))
            .map(|entry| entry.summary.id.clone())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let index = self.snapshot();
        let mut by_type = BTreeMap::new();
        for entry in index.entries.values() {
            *by_type
                .entry(entry.summary.workflow_type.to_string())
                .or_insert(0) += 1;
        }

        RegistryStats {
            total: index.entries.len(),
            by_type,
            with_dependencies: index
                .entries
                .values()
                .filter(|e| !e.summary.dependencies.is_empty())
                .count(),
            last_scan: index.last_scan,
        }
    }

    /// Write the index as JSON
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let index = self.snapshot();
        let exported = ExportedIndex {
            generated_at: Utc::now(),
            root: self.root.as_deref(),
            workflows: index.entries.values().map(|e| &e.summary).collect(),
        };
        let json = serde_json::to_string_pretty(&exported)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn is_definition_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name == CONFIG_FILE_NAME || name == INDEX_FILE_NAME || name.starts_with('.') {
        return false;
    }
    DocumentFormat::from_path(path).is_some()
}
