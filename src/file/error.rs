use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u32),

    #[error("Page {page} is past the end of {path} ({page_count} pages)")]
    PageNotFound {
        path: String,
        page: u32,
        page_count: u32,
    },

    #[error("File {0} contains a partial page")]
    PartialPage(String),

    /// A record did not fit in a single page. Callers that can split or
    /// merge nodes match on this and recover.
    #[error("Record of {needed} bytes does not fit in a page ({available} bytes available)")]
    PageOverflow { needed: usize, available: usize },

    #[error("Page {page} of {path} holds a malformed record")]
    MalformedRecord { path: String, page: u32 },
}

impl FileError {
    pub fn is_overflow(&self) -> bool {
        matches!(self, FileError::PageOverflow { .. })
    }
}

pub type FileResult<T> = Result<T, FileError>;
