use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use super::error::{FileError, FileResult};
use super::file_manager::{FileHandle, PagedFileManager};
use super::{DEFAULT_CACHE_PAGES, PAGE_SIZE, PageId, offset_in_page, page_of, pages_to_fit};

/// Bytes taken by the length prefix of a page record
pub const RECORD_HEADER: usize = 4;

/// Largest record payload that fits in one page
pub const MAX_RECORD_LEN: usize = PAGE_SIZE - RECORD_HEADER;

/// Bytes a record with a payload of `payload_len` bytes occupies in its page
pub fn record_size(payload_len: usize) -> usize {
    RECORD_HEADER + payload_len
}

/// A key identifying a mapped page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PageKey {
    file: FileHandle,
    page_id: PageId,
}

/// Memory-mapped page cache.
///
/// Every page of every data file is reached through a single shared, writable
/// mapping owned by this cache. A page is mapped at most once at a time: the
/// mapping table is keyed by `(file, page)`, so a second request for a page
/// that is already mapped resolves to the existing mapping instead of mapping
/// it again. When the table is full the least recently used mapping is
/// unmapped; its contents stay in the file because mappings are shared.
pub struct PageCache {
    /// Underlying file manager
    file_manager: PagedFileManager,
    /// Live page mappings in LRU order
    pages: LruCache<PageKey, MmapMut>,
}

impl PageCache {
    /// Create a new page cache
    pub fn new(file_manager: PagedFileManager) -> Self {
        Self::with_capacity(file_manager, DEFAULT_CACHE_PAGES)
    }

    /// Create a new page cache keeping at most `capacity` pages mapped
    pub fn with_capacity(file_manager: PagedFileManager, capacity: usize) -> Self {
        Self {
            file_manager,
            pages: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Number of pages currently mapped
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// Create an empty file. Fails if it already exists.
    pub fn create_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<()> {
        self.file_manager.create_file(path)
    }

    /// Delete a file, dropping its mappings and descriptor
    pub fn remove_file<P: AsRef<Path>>(&mut self, path: P) -> FileResult<()> {
        let path = path.as_ref();
        if let Some(handle) = self.file_manager.handle_of(path) {
            self.discard_pages(handle, 0);
        }
        self.file_manager.remove_file(path)
    }

    /// Number of whole pages in a file
    pub fn get_page_count<P: AsRef<Path>>(&mut self, path: P) -> FileResult<PageId> {
        let handle = self.file_manager.open_file(path)?;
        self.file_manager.get_page_count(handle)
    }

    /// Truncate or extend a file to exactly `page_count` pages
    pub fn set_page_count<P: AsRef<Path>>(&mut self, path: P, page_count: PageId) -> FileResult<()> {
        let handle = self.file_manager.open_file(path)?;
        // Unmap truncated pages first; touching them afterwards would fault.
        self.discard_pages(handle, page_count);
        self.file_manager.set_page_count(handle, page_count)
    }

    /// Bytes of one page
    pub fn page<P: AsRef<Path>>(&mut self, path: P, page: PageId) -> FileResult<&[u8]> {
        Ok(&self.mapping(path.as_ref(), page)?[..])
    }

    /// Mutable bytes of one page. Writes land in the file through the mapping.
    pub fn page_mut<P: AsRef<Path>>(&mut self, path: P, page: PageId) -> FileResult<&mut [u8]> {
        Ok(&mut self.mapping(path.as_ref(), page)?[..])
    }

    /// Payload of the length-prefixed record stored in a page
    pub fn read_record<P: AsRef<Path>>(&mut self, path: P, page: PageId) -> FileResult<&[u8]> {
        let path = path.as_ref();
        let bytes = self.page(path, page)?;

        let mut len_bytes = [0u8; RECORD_HEADER];
        len_bytes.copy_from_slice(&bytes[..RECORD_HEADER]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(FileError::MalformedRecord {
                path: path.display().to_string(),
                page,
            });
        }
        Ok(&bytes[RECORD_HEADER..RECORD_HEADER + len])
    }

    /// Store a record in a page. A payload that cannot fit returns
    /// `PageOverflow` and leaves the page untouched.
    pub fn write_record<P: AsRef<Path>>(
        &mut self,
        path: P,
        page: PageId,
        payload: &[u8],
    ) -> FileResult<()> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(FileError::PageOverflow {
                needed: record_size(payload.len()),
                available: PAGE_SIZE,
            });
        }

        let bytes = self.page_mut(path, page)?;
        bytes[..RECORD_HEADER].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes[RECORD_HEADER..RECORD_HEADER + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Read `length` bytes starting at `start`, or everything up to the end of
    /// the file if no length is given
    pub fn get_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        start: u64,
        length: Option<u64>,
    ) -> FileResult<Vec<u8>> {
        let path = path.as_ref();
        let end = match length {
            Some(length) => start + length,
            None => self.get_page_count(path)? as u64 * PAGE_SIZE as u64,
        };

        let mut contents = Vec::with_capacity(end.saturating_sub(start) as usize);
        let mut position = start;
        while position < end {
            let offset = offset_in_page(position);
            let chunk = (PAGE_SIZE - offset).min((end - position) as usize);
            let bytes = self.page(path, page_of(position))?;
            contents.extend_from_slice(&bytes[offset..offset + chunk]);
            position += chunk as u64;
        }
        Ok(contents)
    }

    /// Overwrite a byte range starting at `start`. The range must already be
    /// inside the file.
    pub fn set_file_segment<P: AsRef<Path>>(
        &mut self,
        path: P,
        bytes: &[u8],
        start: u64,
    ) -> FileResult<()> {
        let path = path.as_ref();
        let mut written = 0;
        while written < bytes.len() {
            let position = start + written as u64;
            let offset = offset_in_page(position);
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - written);
            let page = self.page_mut(path, page_of(position))?;
            page[offset..offset + chunk].copy_from_slice(&bytes[written..written + chunk]);
            written += chunk;
        }
        Ok(())
    }

    /// Replace a file's contents, creating it if needed. The file is resized
    /// to the fewest whole pages that hold `bytes`.
    pub fn set_file<P: AsRef<Path>>(&mut self, path: P, bytes: &[u8]) -> FileResult<()> {
        let path = path.as_ref();
        match self.file_manager.open_file(path) {
            Ok(_) => {}
            Err(FileError::FileNotFound(_)) => self.create_file(path)?,
            Err(e) => return Err(e),
        }
        self.set_page_count(path, pages_to_fit(bytes.len() as u64))?;
        self.set_file_segment(path, bytes, 0)
    }

    /// Copy `length` bytes from `source` to `destination` within one file.
    /// The regions may overlap. The file grows first if the destination ends
    /// past its current end.
    pub fn copy_within_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        source: u64,
        length: u64,
        destination: u64,
    ) -> FileResult<()> {
        let path = path.as_ref();
        let required = pages_to_fit(destination + length);
        if required > self.get_page_count(path)? {
            self.set_page_count(path, required)?;
        }
        let bytes = self.get_file(path, source, Some(length))?;
        self.set_file_segment(path, &bytes, destination)
    }

    /// Flush every mapping and sync every open file
    pub fn flush_all(&mut self) -> FileResult<()> {
        for (_, mapping) in self.pages.iter() {
            mapping.flush()?;
        }
        self.file_manager.sync_all()
    }

    /// Flush, unmap every page and close every file. The cache stays usable:
    /// later accesses reopen files on demand.
    pub fn shutdown(&mut self) -> FileResult<()> {
        self.flush_all()?;
        self.pages.clear();
        self.file_manager.close_all();
        debug!("page cache shut down");
        Ok(())
    }

    /// The mapping of one page, creating it if needed
    fn mapping(&mut self, path: &Path, page: PageId) -> FileResult<&mut MmapMut> {
        let file = self.file_manager.open_file(path)?;
        let key = PageKey {
            file,
            page_id: page,
        };

        if !self.pages.contains(&key) {
            let page_count = self.file_manager.get_page_count(file)?;
            if page >= page_count {
                return Err(FileError::PageNotFound {
                    path: path.display().to_string(),
                    page,
                    page_count,
                });
            }

            let handle = self.file_manager.file(file)?;
            // SAFETY: mapping a file is unsafe because another process could
            // truncate or rewrite it underneath us. Data files are owned by
            // this process only, the page was checked to lie inside the file,
            // and truncation through `set_page_count` unmaps affected pages
            // before shrinking.
            let mapping = unsafe {
                MmapOptions::new()
                    .offset(page as u64 * PAGE_SIZE as u64)
                    .len(PAGE_SIZE)
                    .map_mut(handle)?
            };
            self.pages.put(key, mapping);
        }

        self.pages
            .get_mut(&key)
            .ok_or_else(|| FileError::PageNotFound {
                path: path.display().to_string(),
                page,
                page_count: 0,
            })
    }

    /// Unmap every page of `file` at or after `from`
    fn discard_pages(&mut self, file: FileHandle, from: PageId) {
        let stale: Vec<PageKey> = self
            .pages
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| key.file == file && key.page_id >= from)
            .collect();
        for key in stale {
            if let Some(mapping) = self.pages.pop(&key)
                && let Err(e) = mapping.flush()
            {
                warn!(page = key.page_id, error = %e, "failed to flush discarded page");
            }
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!(error = %e, "failed to flush page cache on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PageCache) {
        let temp_dir = tempfile::tempdir().unwrap();
        (temp_dir, PageCache::new(PagedFileManager::new()))
    }

    #[test]
    fn test_record_survives_shutdown() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.list");

        cache.create_file(&path).unwrap();
        cache.set_page_count(&path, 2).unwrap();
        cache.write_record(&path, 1, b"hello pages").unwrap();
        cache.shutdown().unwrap();
        assert_eq!(cache.mapped_pages(), 0);

        let mut reopened = PageCache::new(PagedFileManager::new());
        assert_eq!(reopened.get_page_count(&path).unwrap(), 2);
        assert_eq!(reopened.read_record(&path, 1).unwrap(), b"hello pages");
    }

    #[test]
    fn test_overflow_leaves_page_untouched() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.list");

        cache.create_file(&path).unwrap();
        cache.set_page_count(&path, 1).unwrap();
        cache.write_record(&path, 0, b"small").unwrap();

        let too_big = vec![7u8; MAX_RECORD_LEN + 1];
        let result = cache.write_record(&path, 0, &too_big);
        assert!(matches!(result, Err(FileError::PageOverflow { .. })));
        assert_eq!(cache.read_record(&path, 0).unwrap(), b"small");

        let exact = vec![9u8; MAX_RECORD_LEN];
        cache.write_record(&path, 0, &exact).unwrap();
        assert_eq!(cache.read_record(&path, 0).unwrap().len(), MAX_RECORD_LEN);
    }

    #[test]
    fn test_page_past_end_is_an_error() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.list");

        cache.create_file(&path).unwrap();
        cache.set_page_count(&path, 1).unwrap();
        let result = cache.page(&path, 1);
        assert!(matches!(
            result,
            Err(FileError::PageNotFound {
                page: 1,
                page_count: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_segments_span_page_boundaries() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.hash.directory");

        cache.create_file(&path).unwrap();
        cache.set_page_count(&path, 3).unwrap();

        let bytes: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let start = PAGE_SIZE as u64 - 50;
        cache.set_file_segment(&path, &bytes, start).unwrap();

        let read = cache.get_file(&path, start, Some(bytes.len() as u64)).unwrap();
        assert_eq!(read, bytes);

        let whole = cache.get_file(&path, 0, None).unwrap();
        assert_eq!(whole.len(), 3 * PAGE_SIZE);
        assert_eq!(&whole[start as usize..start as usize + bytes.len()], &bytes[..]);
    }

    #[test]
    fn test_copy_within_file_grows_file() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.hash.directory");

        let original: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 13) as u8).collect();
        cache.set_file(&path, &original).unwrap();
        assert_eq!(cache.get_page_count(&path).unwrap(), 1);

        cache
            .copy_within_file(&path, 0, PAGE_SIZE as u64, PAGE_SIZE as u64)
            .unwrap();
        assert_eq!(cache.get_page_count(&path).unwrap(), 2);
        assert_eq!(
            cache.get_file(&path, PAGE_SIZE as u64, None).unwrap(),
            original
        );
    }

    #[test]
    fn test_copy_within_file_overlapping() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.bin");

        let original: Vec<u8> = (0..100u8).collect();
        cache.set_file(&path, &original).unwrap();
        cache.copy_within_file(&path, 0, 100, 10).unwrap();

        let read = cache.get_file(&path, 0, Some(110)).unwrap();
        assert_eq!(&read[..10], &original[..10]);
        assert_eq!(&read[10..], &original[..]);
    }

    #[test]
    fn test_shrink_unmaps_truncated_pages() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.list");

        cache.create_file(&path).unwrap();
        cache.set_page_count(&path, 4).unwrap();
        cache.write_record(&path, 3, b"doomed").unwrap();
        cache.write_record(&path, 0, b"kept").unwrap();

        cache.set_page_count(&path, 1).unwrap();
        assert!(matches!(
            cache.page(&path, 3),
            Err(FileError::PageNotFound { .. })
        ));
        assert_eq!(cache.read_record(&path, 0).unwrap(), b"kept");

        cache.set_page_count(&path, 4).unwrap();
        assert_eq!(cache.read_record(&path, 3).unwrap(), b"");
    }

    #[test]
    fn test_lru_bounds_live_mappings() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut cache = PageCache::with_capacity(PagedFileManager::new(), 2);
        let path = temp_dir.path().join("a.list");

        cache.create_file(&path).unwrap();
        cache.set_page_count(&path, 8).unwrap();
        for page in 0..8u32 {
            cache.write_record(&path, page, &page.to_le_bytes()).unwrap();
        }
        assert!(cache.mapped_pages() <= 2);

        for page in 0..8u32 {
            assert_eq!(cache.read_record(&path, page).unwrap(), page.to_le_bytes());
        }
    }

    #[test]
    fn test_remove_file_drops_mappings() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.item");

        cache.set_file(&path, b"value").unwrap();
        assert_eq!(cache.mapped_pages(), 1);

        cache.remove_file(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(cache.mapped_pages(), 0);
        assert!(matches!(
            cache.get_page_count(&path),
            Err(FileError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_set_file_resizes() {
        let (temp_dir, mut cache) = setup();
        let path = temp_dir.path().join("a.item");

        cache.set_file(&path, &vec![1u8; 2 * PAGE_SIZE + 1]).unwrap();
        assert_eq!(cache.get_page_count(&path).unwrap(), 3);

        cache.set_file(&path, b"short").unwrap();
        assert_eq!(cache.get_page_count(&path).unwrap(), 1);
        assert_eq!(cache.get_file(&path, 0, Some(5)).unwrap(), b"short");
    }
}
