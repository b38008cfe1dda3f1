//! The four collection kinds and the storage context they share.

mod error;
mod free_list;
pub mod hash;
pub mod item;
pub mod list;
pub mod sorted;

use std::path::{Path, PathBuf};

use crate::catalog::{Catalog, CollectionKind};
use crate::codec::Record;
use crate::file::{FileResult, PageCache, PageId, PagedFileManager};

pub use error::{CollectionError, CollectionResult};
pub use hash::HashCollection;
pub use list::ListCollection;
pub use sorted::{Key, KeyElement, SortedCollection};

/// Everything a collection operation touches: the page cache holding the
/// collection files and the catalog naming them
pub struct Storage {
    data_dir: PathBuf,
    pub(crate) cache: PageCache,
    pub(crate) catalog: Catalog,
}

impl Storage {
    /// Open the storage of a data directory, creating the directory if needed
    pub fn open<P: AsRef<Path>>(data_dir: P, cache_pages: usize) -> CollectionResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir).map_err(crate::file::FileError::from)?;
        let catalog = Catalog::open(&data_dir)?;
        Ok(Self {
            data_dir,
            cache: PageCache::with_capacity(PagedFileManager::new(), cache_pages),
            catalog,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// File of a collection: `<name>.<kind>[.<part>]` in the data directory
    pub fn path(&self, name: &str, kind: CollectionKind, part: Option<&str>) -> PathBuf {
        let file_name = match part {
            Some(part) => format!("{name}.{kind}.{part}"),
            None => format!("{name}.{kind}"),
        };
        self.data_dir.join(file_name)
    }

    /// Fail unless `name` is unused and can be used as a file name
    pub(crate) fn check_new_name(&self, name: &str) -> CollectionResult<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(CollectionError::InvalidName(name.to_string()));
        }
        if self.catalog.get(name).is_some() {
            return Err(CollectionError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    /// Decode the record stored in a page
    pub(crate) fn read<R: Record>(&mut self, path: &Path, page: PageId) -> CollectionResult<R> {
        let bytes = self.cache.read_record(path, page)?;
        Ok(R::from_bytes(bytes)?)
    }

    /// Encode a record into a page. Overflow is returned untouched so the
    /// caller can split.
    pub(crate) fn write<R: Record>(&mut self, path: &Path, page: PageId, record: &R) -> FileResult<()> {
        self.cache.write_record(path, page, &record.to_bytes())
    }

    /// Flush every page and close every file
    pub fn shutdown(&mut self) -> CollectionResult<()> {
        Ok(self.cache.shutdown()?)
    }
}

/// Shape of a paged tree, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from root to leaf; a lone root leaf has depth 0
    pub depth: u32,
    /// Pages in the file, header included
    pub page_count: u32,
    /// Pages on the free-page list
    pub free_pages: u32,
}

impl TreeStats {
    /// Pages holding the header or a node
    pub fn pages_in_use(&self) -> u32 {
        self.page_count - self.free_pages
    }
}
