use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use tracing::debug;

use super::error::{FileError, FileResult};
use super::{PAGE_SIZE, PageId};

/// Identifies one opened data file for as long as it stays open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u32);

struct OpenFile {
    file: File,
    /// Length in pages, kept in step with every resize made through the manager
    page_count: PageId,
}

/// Owns the descriptors of the data files in use. Files are opened on first
/// use by path and stay open until removed or [`close_all`](Self::close_all).
/// Handles are never reused, so a handle that outlives its file is detected.
#[derive(Default)]
pub struct PagedFileManager {
    files: AHashMap<FileHandle, OpenFile>,
    by_path: AHashMap<PathBuf, FileHandle>,
    next_handle: u32,
}

fn not_found_or_io(path: &Path) -> impl FnOnce(std::io::Error) -> FileError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => FileError::FileNotFound(path.display().to_string()),
        _ => FileError::Io(e),
    }
}

impl PagedFileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty file. Fails if the file already exists.
    pub fn create_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<()> {
        let path = path.as_ref();
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => FileError::FileAlreadyExists(path.display().to_string()),
                _ => FileError::Io(e),
            })?;
        debug!(path = %path.display(), "created file");
        Ok(())
    }

    /// Handle of `path`, opening the file if it is not open yet
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<FileHandle> {
        let path = path.as_ref();
        if let Some(&handle) = self.by_path.get(path) {
            return Ok(handle);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(not_found_or_io(path))?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(FileError::PartialPage(path.display().to_string()));
        }

        let handle = FileHandle(self.next_handle);
        self.next_handle += 1;
        self.files.insert(
            handle,
            OpenFile {
                file,
                page_count: (len / PAGE_SIZE as u64) as PageId,
            },
        );
        self.by_path.insert(path.to_path_buf(), handle);
        Ok(handle)
    }

    /// Handle of `path` if it is currently open
    pub fn handle_of<P: AsRef<Path>>(&self, path: P) -> Option<FileHandle> {
        self.by_path.get(path.as_ref()).copied()
    }

    fn entry(&self, handle: FileHandle) -> FileResult<&OpenFile> {
        self.files
            .get(&handle)
            .ok_or(FileError::InvalidHandle(handle.0))
    }

    pub fn file(&self, handle: FileHandle) -> FileResult<&File> {
        Ok(&self.entry(handle)?.file)
    }

    pub fn get_page_count(&self, handle: FileHandle) -> FileResult<PageId> {
        Ok(self.entry(handle)?.page_count)
    }

    /// Truncate or extend a file to exactly `page_count` pages
    pub fn set_page_count(&mut self, handle: FileHandle, page_count: PageId) -> FileResult<()> {
        let entry = self
            .files
            .get_mut(&handle)
            .ok_or(FileError::InvalidHandle(handle.0))?;
        if entry.page_count != page_count {
            entry.file.set_len(page_count as u64 * PAGE_SIZE as u64)?;
            entry.page_count = page_count;
        }
        Ok(())
    }

    /// Delete a file, closing it first if it is open
    pub fn remove_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<()> {
        let path = path.as_ref();
        if let Some(handle) = self.by_path.remove(path) {
            self.files.remove(&handle);
        }
        fs::remove_file(path).map_err(not_found_or_io(path))?;
        debug!(path = %path.display(), "removed file");
        Ok(())
    }

    pub fn sync_all(&mut self) -> FileResult<()> {
        for open in self.files.values() {
            open.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop every descriptor. Files are reopened on their next use.
    pub fn close_all(&mut self) {
        let count = self.files.len();
        self.files.clear();
        self.by_path.clear();
        debug!(count, "closed files");
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }
}
