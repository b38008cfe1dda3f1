use std::path::Path;

use crate::codec::{DecodeResult, Decoder, Encoder, Record};
use crate::file::PageId;

use super::{CollectionError, CollectionResult, Storage};

/// Terminates the free-page chain. Page 0 is always a header, never free.
pub const FREE_LIST_END: PageId = 0;

/// Contents of a page on the free-page list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreePage {
    pub next: PageId,
}

impl Record for FreePage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_u32(self.next);
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        Ok(Self {
            next: decoder.get_u32()?,
        })
    }
}

/// Take a page off the list headed by `head`, or append one to the file if
/// the list is empty
pub fn take_page(storage: &mut Storage, path: &Path, head: &mut PageId) -> CollectionResult<PageId> {
    if *head == FREE_LIST_END {
        let page = storage.cache.get_page_count(path)?;
        storage.cache.set_page_count(path, page + 1)?;
        return Ok(page);
    }

    let page = *head;
    let free: FreePage = storage.read(path, page)?;
    *head = free.next;
    Ok(page)
}

/// Push a vacated page onto the list headed by `head`, overwriting its contents
pub fn release_page(
    storage: &mut Storage,
    path: &Path,
    head: &mut PageId,
    page: PageId,
) -> CollectionResult<()> {
    storage.write(path, page, &FreePage { next: *head })?;
    *head = page;
    Ok(())
}

/// Length of the list headed by `head`
pub fn count_pages(storage: &mut Storage, path: &Path, head: PageId) -> CollectionResult<u32> {
    let page_count = storage.cache.get_page_count(path)?;
    let mut count = 0;
    let mut page = head;
    while page != FREE_LIST_END {
        if count >= page_count {
            return Err(CollectionError::Corrupted(format!(
                "free-page list of {} loops",
                path.display()
            )));
        }
        let free: FreePage = storage.read(path, page)?;
        page = free.next;
        count += 1;
    }
    Ok(count)
}
