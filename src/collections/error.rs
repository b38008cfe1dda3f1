use thiserror::Error;

use crate::catalog::{CatalogError, CollectionKind};
use crate::codec::DecodeError;
use crate::file::FileError;
use crate::iterator::{IterHandle, IteratorError};

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Collection {0} does not exist")]
    NotFound(String),

    #[error("Collection {name} is not a {expected}")]
    WrongType {
        name: String,
        expected: CollectionKind,
    },

    #[error("Collection {0} already exists")]
    AlreadyExists(String),

    #[error("Invalid collection name {0:?}")]
    InvalidName(String),

    #[error("Index {index} is out of bounds in list of size {size}")]
    OutOfBounds { index: i64, size: u64 },

    #[error("Key types do not match: {left} and {right}")]
    KeyTypeMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("Key cannot include uniquifier")]
    ReservedKeyElement,

    #[error("No matching key")]
    NoMatchingKey,

    #[error("Key is a prefix of a stored key, or a stored key is a prefix of it")]
    KeyPrefixConflict,

    #[error("Collection {0} has active iterators")]
    IteratorActive(String),

    #[error("Unknown iterator {0}")]
    UnknownIterator(IterHandle),

    #[error("Item {0} has not been set")]
    ItemNotSet(String),

    #[error("Record of {size} bytes is too large to store in a page")]
    RecordTooLarge { size: usize },

    #[error("Corrupted collection: {0}")]
    Corrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("File error: {0}")]
    File(FileError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Catalog error: {0}")]
    Catalog(CatalogError),
}

impl CollectionError {
    /// Short name of the error kind, used as the prefix of error responses
    pub fn kind(&self) -> &'static str {
        match self {
            CollectionError::NotFound(_) => "NotFound",
            CollectionError::WrongType { .. } => "WrongType",
            CollectionError::AlreadyExists(_) => "AlreadyExists",
            CollectionError::InvalidName(_) => "InvalidName",
            CollectionError::OutOfBounds { .. } => "OutOfBounds",
            CollectionError::KeyTypeMismatch { .. } => "KeyTypeMismatch",
            CollectionError::ReservedKeyElement => "ReservedKeyElement",
            CollectionError::NoMatchingKey => "NoMatchingKey",
            CollectionError::KeyPrefixConflict => "KeyPrefixConflict",
            CollectionError::IteratorActive(_) => "IteratorActive",
            CollectionError::UnknownIterator(_) => "UnknownIterator",
            CollectionError::ItemNotSet(_) => "ItemNotSet",
            CollectionError::RecordTooLarge { .. } => "RecordTooLarge",
            CollectionError::Corrupted(_) => "Corrupted",
            CollectionError::Internal(_) => "Internal",
            CollectionError::File(_) => "File",
            CollectionError::Decode(_) => "Decode",
            CollectionError::Catalog(_) => "Catalog",
        }
    }
}

impl From<FileError> for CollectionError {
    fn from(err: FileError) -> Self {
        match err {
            // Overflow is only meaningful where a split or merge handles it.
            FileError::PageOverflow { .. } => {
                CollectionError::Internal(format!("unhandled page overflow: {err}"))
            }
            other => CollectionError::File(other),
        }
    }
}

impl From<CatalogError> for CollectionError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::AlreadyExists(name) => CollectionError::AlreadyExists(name),
            CatalogError::NotFound(name) => CollectionError::NotFound(name),
            CatalogError::WrongType { name, expected } => {
                CollectionError::WrongType { name, expected }
            }
            other => CollectionError::Catalog(other),
        }
    }
}

impl From<IteratorError> for CollectionError {
    fn from(err: IteratorError) -> Self {
        match err {
            IteratorError::Unknown(handle) => CollectionError::UnknownIterator(handle),
            IteratorError::Active(name) => CollectionError::IteratorActive(name),
        }
    }
}

pub type CollectionResult<T> = Result<T, CollectionError>;
