use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// File in the data directory that holds the catalog
pub const CATALOG_FILE: &str = "db.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Collection {0} already exists")]
    AlreadyExists(String),

    #[error("Collection {0} does not exist")]
    NotFound(String),

    #[error("Collection {name} is not a {expected}")]
    WrongType {
        name: String,
        expected: CollectionKind,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// The four kinds of collection a name can refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Item,
    Hash,
    List,
    Sorted,
}

impl CollectionKind {
    /// Extension of the collection's files: `<name>.<kind>[.<part>]`
    pub fn extension(&self) -> &'static str {
        match self {
            CollectionKind::Item => "item",
            CollectionKind::Hash => "hash",
            CollectionKind::List => "list",
            CollectionKind::Sorted => "sorted",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogMetadata {
    collections: BTreeMap<String, CollectionKind>,
}

/// Persisted map from collection name to collection kind.
/// Every change is written to disk before it returns.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    metadata: CatalogMetadata,
}

impl Catalog {
    /// Load the catalog of a data directory, or start an empty one
    pub fn open<P: AsRef<Path>>(data_dir: P) -> CatalogResult<Self> {
        let path = data_dir.as_ref().join(CATALOG_FILE);
        let metadata = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            CatalogMetadata::default()
        };
        info!(
            path = %path.display(),
            collections = metadata.collections.len(),
            "loaded catalog"
        );
        Ok(Self { path, metadata })
    }

    fn save(&self) -> CatalogResult<()> {
        let content = serde_json::to_string_pretty(&self.metadata)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    /// All collections by name
    pub fn collections(&self) -> &BTreeMap<String, CollectionKind> {
        &self.metadata.collections
    }

    pub fn get(&self, name: &str) -> Option<CollectionKind> {
        self.metadata.collections.get(name).copied()
    }

    /// Register a new collection
    pub fn add(&mut self, name: &str, kind: CollectionKind) -> CatalogResult<()> {
        if self.metadata.collections.contains_key(name) {
            return Err(CatalogError::AlreadyExists(name.to_string()));
        }
        self.metadata.collections.insert(name.to_string(), kind);
        self.save()
    }

    /// Forget a collection
    pub fn remove(&mut self, name: &str) -> CatalogResult<()> {
        if self.metadata.collections.remove(name).is_none() {
            return Err(CatalogError::NotFound(name.to_string()));
        }
        self.save()
    }

    /// Ensure `name` exists and is of the given kind
    pub fn check(&self, name: &str, kind: CollectionKind) -> CatalogResult<()> {
        match self.get(name) {
            None => Err(CatalogError::NotFound(name.to_string())),
            Some(found) if found != kind => Err(CatalogError::WrongType {
                name: name.to_string(),
                expected: kind,
            }),
            Some(_) => Ok(()),
        }
    }
}
