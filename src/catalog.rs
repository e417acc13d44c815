// ============================================
// bootsmith - catalog.rs
// ============================================
// The OS catalog: which operating systems this tool knows how to
// install, where their images come from, and the keyword data the
// matcher scores against.
//
// The catalog is configuration, not code. A default copy ships inside
// the binary (data/catalog.toml, embedded at compile time) and the
// --catalog flag swaps in any other TOML file with the same shape.
// Entries are loaded once at startup and never mutated.
// ============================================

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// The default catalog, compiled into the binary.
const DEFAULT_CATALOG: &str = include_str!("../data/catalog.toml");

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("catalog rule targets unknown entry '{0}'")]
    UnknownRuleTarget(String),
}

// ============================================
// DATA STRUCTURES
// ============================================

/// Where an image for one version comes from.
/// Either a direct download URL, or a repository that must be cloned
/// and built locally (handled by the build adapter).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SourceLocator {
    Url { url: String },
    Repo { repo: String },
}

/// One installable version of an entry, e.g. ("24.04", url).
/// Versions keep their file order - the first one is the default.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionSource {
    pub label: String,
    #[serde(flatten)]
    pub source: SourceLocator,
}

/// One operating system the tool knows about.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    /// Unique identifier (e.g., "ubuntu", "kali")
    pub id: String,
    /// Display name for output (e.g., "Kali Linux")
    pub name: String,
    /// Ordered version list, newest first
    pub versions: Vec<VersionSource>,
    /// Keywords the matcher scores against
    pub keywords: Vec<String>,
}

impl CatalogEntry {
    /// The default (first-listed) version, if any.
    pub fn default_version(&self) -> Option<&VersionSource> {
        self.versions.first()
    }

    /// Look up a version by its label.
    pub fn version(&self, label: &str) -> Option<&VersionSource> {
        self.versions.iter().find(|v| v.label == label)
    }
}

/// A use-case bonus rule: if any trigger word appears in the query,
/// `target` gains `bonus` points. Evaluated uniformly by the matcher -
/// adding, removing, or reordering rules needs no code change.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreRule {
    pub triggers: Vec<String>,
    pub target: String,
    pub bonus: i32,
}

/// The whole catalog: entries plus scoring rules.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
    #[serde(default)]
    pub rules: Vec<ScoreRule>,
}

// ============================================
// LOADING
// ============================================

impl Catalog {
    /// Load the catalog that ships inside the binary.
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_toml(DEFAULT_CATALOG)
    }

    /// Load a catalog from a TOML file on disk.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse catalog TOML and validate rule targets.
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = toml::from_str(content)?;

        // Every rule must point at an entry that exists - catching a typo
        // here beats silently never firing the rule.
        for rule in &catalog.rules {
            if !catalog.entries.iter().any(|e| e.id == rule.target) {
                return Err(CatalogError::UnknownRuleTarget(rule.target.clone()));
            }
        }

        log::debug!(
            "catalog loaded: {} entries, {} rules",
            catalog.entries.len(),
            catalog.rules.len()
        );
        Ok(catalog)
    }

    /// Look up an entry by its identifier.
    pub fn entry(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

// ============================================
// TESTS
// ============================================
