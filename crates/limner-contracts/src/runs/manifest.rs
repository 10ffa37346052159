use std::path::{Path, PathBuf};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE_NAME: &str = ".manifest.json";

/// Outcome of the most recent generation attempt for one slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub success: bool,
    pub error: Option<String>,
}

/// `entity_type -> slug -> entry`, kept in insertion order on disk.
pub type ManifestDocument = IndexMap<String, IndexMap<String, ManifestEntry>>;

/// Whole-document JSON manifest of per-slug outcomes.
///
/// Every mutation reads the full document, replaces one leaf and writes the
/// full document back. There is no locking: a single writer process is assumed.
#[derive(Debug, Clone)]
pub struct GenerationManifest {
    path: PathBuf,
}

impl GenerationManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(base: &Path) -> Self {
        Self::new(base.join(MANIFEST_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty manifest.
    pub fn load(&self) -> anyhow::Result<ManifestDocument> {
        if !self.path.exists() {
            return Ok(ManifestDocument::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading manifest {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(ManifestDocument::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("malformed manifest {}", self.path.display()))
    }

    pub fn record_result(
        &self,
        entity_type: &str,
        slug: &str,
        path: &str,
        success: bool,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut manifest = self.load()?;
        manifest.entry(entity_type.to_string()).or_default().insert(
            slug.to_string(),
            ManifestEntry {
                path: path.to_string(),
                success,
                error: error.map(str::to_string),
            },
        );
        self.save(&manifest)
    }

    pub fn is_already_generated(&self, entity_type: &str, slug: &str) -> anyhow::Result<bool> {
        let manifest = self.load()?;
        Ok(manifest
            .get(entity_type)
            .and_then(|entries| entries.get(slug))
            .map(|entry| entry.success)
            .unwrap_or(false))
    }

    pub fn count_generated(&self, entity_type: Option<&str>) -> anyhow::Result<usize> {
        let manifest = self.load()?;
        let count = |entries: &IndexMap<String, ManifestEntry>| {
            entries.values().filter(|entry| entry.success).count()
        };
        Ok(match entity_type {
            Some(entity_type) => manifest.get(entity_type).map(count).unwrap_or(0),
            None => manifest.values().map(count).sum(),
        })
    }

    pub fn entries(&self, entity_type: &str) -> anyhow::Result<IndexMap<String, ManifestEntry>> {
        let mut manifest = self.load()?;
        Ok(manifest.shift_remove(entity_type).unwrap_or_default())
    }

    fn save(&self, manifest: &ManifestDocument) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(manifest)?)
            .with_context(|| format!("failed writing manifest {}", self.path.display()))?;
        Ok(())
    }
}
