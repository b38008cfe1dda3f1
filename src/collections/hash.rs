//! Extendible hash table.
//!
//! Two files per collection:
//!
//! * `<name>.hash.directory`: a header (`depth: u32`, `size: u64`) followed by
//!   `2^depth` bucket page numbers (`u32` each). Slot `i` points at the bucket
//!   holding every key whose hash has `i` as its low `depth` bits.
//! * `<name>.hash.buckets`: one [`Bucket`] record per page. A bucket with local
//!   depth `d` is shared by the `2^(depth - d)` slots that agree on the low `d`
//!   bits.
//!
//! A bucket that no longer fits its page is split on the next hash bit, doubling
//! the directory first when the bucket is already at full depth. The directory
//! never shrinks and emptied buckets are kept.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::CollectionKind;
use crate::codec::{DecodeResult, Decoder, Encoder, Record};
use crate::file::{PAGE_SIZE, PageId, record_size};
use crate::iterator::{IterHandle, IteratorRegistry};

use super::{CollectionError, CollectionResult, Storage};

const HEADER_BYTES: u64 = 12;
const BUCKET_INDEX_BYTES: u64 = 4;
/// Hashes are 32 bits wide, so no directory can use more bits than that
const MAX_DEPTH: u32 = 32;

/// Stable across processes, unlike the std and ahash hashers
fn full_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Low `depth` bits of a hash
fn depth_hash(hash: u32, depth: u32) -> u32 {
    if depth >= MAX_DEPTH {
        hash
    } else {
        hash & ((1 << depth) - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirectoryHeader {
    depth: u32,
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BucketItem {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Items whose hashes share the bucket's low `depth` bits
#[derive(Debug, Clone, PartialEq, Eq)]
struct Bucket {
    depth: u32,
    items: Vec<BucketItem>,
}

impl Bucket {
    /// Page bytes taken by a bucket holding only this item
    fn lone_item_size(key: &[u8], value: &[u8]) -> usize {
        record_size(4 + 4 + 4 + key.len() + 4 + value.len())
    }
}

impl Record for Bucket {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_u32(self.depth);
        encoder.put_len(self.items.len());
        for item in &self.items {
            encoder.put_bytes(&item.key);
            encoder.put_bytes(&item.value);
        }
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let depth = decoder.get_u32()?;
        let count = decoder.get_len()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let key = decoder.get_bytes()?;
            let value = decoder.get_bytes()?;
            items.push(BucketItem { key, value });
        }
        Ok(Self { depth, items })
    }
}

/// Resumable position in a hash table: buckets in page order, items in
/// bucket order
pub struct HashCursor {
    buckets: PathBuf,
    next_page: PageId,
    page_count: PageId,
    buffered: VecDeque<BucketItem>,
}

impl HashCursor {
    fn next(&mut self, storage: &mut Storage) -> CollectionResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some((item.key, item.value)));
            }
            if self.next_page >= self.page_count {
                return Ok(None);
            }
            let bucket: Bucket = storage.read(&self.buckets, self.next_page)?;
            self.next_page += 1;
            self.buffered = bucket.items.into();
        }
    }
}

/// Operations on every hash collection, plus their live iterators
#[derive(Default)]
pub struct HashCollection {
    iterators: IteratorRegistry<HashCursor>,
}

impl HashCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(storage: &Storage, name: &str) -> (PathBuf, PathBuf) {
        (
            storage.path(name, CollectionKind::Hash, Some("directory")),
            storage.path(name, CollectionKind::Hash, Some("buckets")),
        )
    }

    pub fn create(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<()> {
        storage.check_new_name(name)?;
        let (directory, buckets) = Self::paths(storage, name);

        storage.cache.create_file(&directory)?;
        storage.cache.set_page_count(&directory, 1)?;
        write_header(storage, &directory, DirectoryHeader { depth: 0, size: 0 })?;
        set_bucket_page(storage, &directory, 0, 0)?;

        storage.cache.create_file(&buckets)?;
        storage.cache.set_page_count(&buckets, 1)?;
        let empty = Bucket {
            depth: 0,
            items: Vec::new(),
        };
        storage.write(&buckets, 0, &empty)?;

        storage.catalog.add(name, CollectionKind::Hash)?;
        Ok(())
    }

    pub fn drop(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        self.iterators.check_no_iterators(name)?;
        let (directory, buckets) = Self::paths(storage, name);
        storage.cache.remove_file(&directory)?;
        storage.cache.remove_file(&buckets)?;
        storage.catalog.remove(name)?;
        Ok(())
    }

    pub fn get(
        &mut self,
        storage: &mut Storage,
        name: &str,
        key: &[u8],
    ) -> CollectionResult<Option<Vec<u8>>> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        let (directory, buckets) = Self::paths(storage, name);
        let header = read_header(storage, &directory)?;
        let index = depth_hash(full_hash(key), header.depth);
        let page = bucket_page(storage, &directory, index)?;
        let bucket: Bucket = storage.read(&buckets, page)?;
        Ok(bucket
            .items
            .into_iter()
            .find(|item| item.key == key)
            .map(|item| item.value))
    }

    /// Insert or overwrite `key`
    pub fn set(
        &mut self,
        storage: &mut Storage,
        name: &str,
        key: &[u8],
        value: &[u8],
    ) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        self.iterators.check_no_iterators(name)?;

        let size = Bucket::lone_item_size(key, value);
        if size > PAGE_SIZE {
            return Err(CollectionError::RecordTooLarge { size });
        }

        let (directory, buckets) = Self::paths(storage, name);
        let mut header = read_header(storage, &directory)?;
        let hash = full_hash(key);
        let page = bucket_page(storage, &directory, depth_hash(hash, header.depth))?;
        let mut bucket: Bucket = storage.read(&buckets, page)?;

        let new_key = match bucket.items.iter_mut().find(|item| item.key == key) {
            Some(item) => {
                item.value = value.to_vec();
                false
            }
            None => {
                bucket.items.push(BucketItem {
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
                header.size += 1;
                true
            }
        };

        let old_depth = header.depth;
        if write_bucket(storage, &buckets, page, &bucket)? {
            let index = depth_hash(hash, bucket.depth);
            split_bucket(storage, &directory, &buckets, index, page, bucket, &mut header)?;
        }
        if new_key || header.depth != old_depth {
            write_header(storage, &directory, header)?;
        }
        Ok(())
    }

    /// Delete `key` if present
    pub fn remove(&mut self, storage: &mut Storage, name: &str, key: &[u8]) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        self.iterators.check_no_iterators(name)?;

        let (directory, buckets) = Self::paths(storage, name);
        let mut header = read_header(storage, &directory)?;
        let page = bucket_page(storage, &directory, depth_hash(full_hash(key), header.depth))?;
        let mut bucket: Bucket = storage.read(&buckets, page)?;

        let Some(position) = bucket.items.iter().position(|item| item.key == key) else {
            return Ok(());
        };
        bucket.items.remove(position);
        storage.write(&buckets, page, &bucket)?;
        header.size -= 1;
        write_header(storage, &directory, header)
    }

    pub fn size(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<u64> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        let (directory, _) = Self::paths(storage, name);
        Ok(read_header(storage, &directory)?.size)
    }

    /// Number of hash bits the directory currently uses
    pub fn depth(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<u32> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        let (directory, _) = Self::paths(storage, name);
        Ok(read_header(storage, &directory)?.depth)
    }

    pub fn iter(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<IterHandle> {
        storage.catalog.check(name, CollectionKind::Hash)?;
        let (_, buckets) = Self::paths(storage, name);
        let page_count = storage.cache.get_page_count(&buckets)?;
        let cursor = HashCursor {
            buckets,
            next_page: 0,
            page_count,
            buffered: VecDeque::new(),
        };
        Ok(self.iterators.register(name, cursor))
    }

    /// Next item of an iteration. The handle is closed once it is exhausted.
    pub fn iter_next(
        &mut self,
        storage: &mut Storage,
        handle: &IterHandle,
    ) -> CollectionResult<Option<(Vec<u8>, Vec<u8>)>> {
        let item = self.iterators.get_mut(handle)?.next(storage)?;
        if item.is_none() {
            self.iterators.close(handle)?;
        }
        Ok(item)
    }

    pub fn iter_break(&mut self, handle: &IterHandle) -> CollectionResult<()> {
        Ok(self.iterators.close(handle)?)
    }
}

fn read_header(storage: &mut Storage, directory: &Path) -> CollectionResult<DirectoryHeader> {
    let bytes = storage.cache.get_file(directory, 0, Some(HEADER_BYTES))?;
    let mut decoder = Decoder::new(&bytes);
    Ok(DirectoryHeader {
        depth: decoder.get_u32()?,
        size: decoder.get_u64()?,
    })
}

fn write_header(
    storage: &mut Storage,
    directory: &Path,
    header: DirectoryHeader,
) -> CollectionResult<()> {
    let mut encoder = Encoder::new();
    encoder.put_u32(header.depth);
    encoder.put_u64(header.size);
    storage.cache.set_file_segment(directory, &encoder.finish(), 0)?;
    Ok(())
}

fn slot_offset(index: u32) -> u64 {
    HEADER_BYTES + index as u64 * BUCKET_INDEX_BYTES
}

fn bucket_page(storage: &mut Storage, directory: &Path, index: u32) -> CollectionResult<PageId> {
    let bytes = storage
        .cache
        .get_file(directory, slot_offset(index), Some(BUCKET_INDEX_BYTES))?;
    Ok(Decoder::new(&bytes).get_u32()?)
}

fn set_bucket_page(
    storage: &mut Storage,
    directory: &Path,
    index: u32,
    page: PageId,
) -> CollectionResult<()> {
    storage
        .cache
        .set_file_segment(directory, &page.to_le_bytes(), slot_offset(index))?;
    Ok(())
}

/// Write a bucket, reporting whether it overflowed its page
fn write_bucket(
    storage: &mut Storage,
    buckets: &Path,
    page: PageId,
    bucket: &Bucket,
) -> CollectionResult<bool> {
    match storage.write(buckets, page, bucket) {
        Ok(()) => Ok(false),
        Err(e) if e.is_overflow() => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Split the overflowing bucket at directory `index` (at its local depth) that
/// lives on `page`, repeating on whichever half still overflows
fn split_bucket(
    storage: &mut Storage,
    directory: &Path,
    buckets: &Path,
    mut index: u32,
    mut page: PageId,
    bucket: Bucket,
    header: &mut DirectoryHeader,
) -> CollectionResult<()> {
    let Bucket { mut depth, mut items } = bucket;
    loop {
        if depth == header.depth {
            if header.depth == MAX_DEPTH {
                return Err(CollectionError::Internal(
                    "hash directory cannot grow past 32 bits".to_string(),
                ));
            }
            let slots = 1u64 << header.depth;
            storage.cache.copy_within_file(
                directory,
                HEADER_BYTES,
                slots * BUCKET_INDEX_BYTES,
                HEADER_BYTES + slots * BUCKET_INDEX_BYTES,
            )?;
            header.depth += 1;
            debug!(depth = header.depth, "doubled hash directory");
        }

        let index1 = index | (1 << depth);
        depth += 1;
        let (items0, items1): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| depth_hash(full_hash(&item.key), depth) == index);

        let page1 = storage.cache.get_page_count(buckets)?;
        storage.cache.set_page_count(buckets, page1 + 1)?;
        let step = 1u64 << depth;
        let mut slot = index1 as u64;
        while slot < 1u64 << header.depth {
            set_bucket_page(storage, directory, slot as u32, page1)?;
            slot += step;
        }
        debug!(page, page1, depth, "split hash bucket");

        let bucket0 = Bucket {
            depth,
            items: items0,
        };
        let bucket1 = Bucket {
            depth,
            items: items1,
        };
        let overflow0 = write_bucket(storage, buckets, page, &bucket0)?;
        let overflow1 = write_bucket(storage, buckets, page1, &bucket1)?;
        match (overflow0, overflow1) {
            (false, false) => return Ok(()),
            (true, true) => {
                return Err(CollectionError::Internal(
                    "both halves of a split bucket overflowed".to_string(),
                ));
            }
            (true, false) => items = bucket0.items,
            (false, true) => {
                items = bucket1.items;
                index = index1;
                page = page1;
            }
        }
    }
}
