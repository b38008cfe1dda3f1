mod error;
mod file_manager;
mod page_cache;

pub use error::{FileError, FileResult};
pub use file_manager::{FileHandle, PagedFileManager};
pub use page_cache::{MAX_RECORD_LEN, PageCache, record_size};

/// Page size in bytes (4KB). Fixed at build time; existing data files are
/// only readable by a build with the same value.
pub const PAGE_SIZE: usize = 4096;

/// Default number of live page mappings kept by the page cache
pub const DEFAULT_CACHE_PAGES: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Page that contains the given byte offset
pub fn page_of(byte: u64) -> PageId {
    (byte / PAGE_SIZE as u64) as PageId
}

/// Offset of the given byte within its page
pub fn offset_in_page(byte: u64) -> usize {
    (byte & (PAGE_SIZE as u64 - 1)) as usize
}

/// Number of whole pages needed to hold `bytes` bytes
pub fn pages_to_fit(bytes: u64) -> PageId {
    bytes.div_ceil(PAGE_SIZE as u64) as PageId
}
