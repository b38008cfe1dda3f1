//! Sorted map from composite keys to byte values.
//!
//! A B-tree stored one node per page, with page 0 holding the
//! [`SortedHeader`]. Inner nodes route by the largest key of each child and
//! leaves form a linked list in key order, so range scans never climb back up
//! the tree. Keys that compare equal are made distinct with a trailing
//! [`KeyElement::Uniquifier`].

mod key;
mod node;
#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::CollectionKind;
use crate::file::{PAGE_SIZE, PageId, record_size};
use crate::iterator::{IterHandle, IteratorRegistry};

use super::free_list::{self, FREE_LIST_END};
use super::{CollectionError, CollectionResult, Storage, TreeStats};

pub use key::{Key, KeyElement, compare_keys};
pub use node::{MAX_KEY_SIZE, MIN_NODE_LENGTH, SortedHeader, SortedNode};

use key::{encoded_key_len, lower_bound, uniquifier};

const HEADER_PAGE: PageId = 0;
const INITIAL_ROOT_PAGE: PageId = 1;

/// One step of a root-to-leaf walk: the child followed in an inner node, or
/// the first position not below the search key in the leaf
struct PathItem {
    page: PageId,
    node: SortedNode,
    index: usize,
}

/// Resumable position in a scan along the leaf chain
pub struct SortedCursor {
    file: PathBuf,
    next_leaf: PageId,
    buffered: VecDeque<(Key, Vec<u8>)>,
    end: Option<Key>,
    inclusive: bool,
}

impl SortedCursor {
    fn next(&mut self, storage: &mut Storage) -> CollectionResult<Option<(Key, Vec<u8>)>> {
        loop {
            if let Some((key, value)) = self.buffered.pop_front() {
                if let Some(end) = &self.end {
                    let ordering = compare_keys(&key, end)?;
                    if ordering == Ordering::Greater || (ordering == Ordering::Equal && !self.inclusive) {
                        self.finish();
                        return Ok(None);
                    }
                }
                return Ok(Some((key, value)));
            }
            if self.next_leaf == FREE_LIST_END {
                return Ok(None);
            }
            match storage.read(&self.file, self.next_leaf)? {
                SortedNode::Leaf { keys, values, next } => {
                    self.buffered = keys.into_iter().zip(values).collect();
                    self.next_leaf = next;
                }
                SortedNode::Inner { .. } => return Err(not_a_leaf(&self.file)),
            }
        }
    }

    fn finish(&mut self) {
        self.buffered.clear();
        self.next_leaf = FREE_LIST_END;
    }
}

/// Operations on every sorted map, plus their live iterators
#[derive(Default)]
pub struct SortedCollection {
    iterators: IteratorRegistry<SortedCursor>,
}

impl SortedCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn file(storage: &Storage, name: &str) -> PathBuf {
        storage.path(name, CollectionKind::Sorted, None)
    }

    pub fn create(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<()> {
        storage.check_new_name(name)?;
        let file = Self::file(storage, name);

        storage.cache.create_file(&file)?;
        storage.cache.set_page_count(&file, 2)?;
        let header = SortedHeader {
            root: INITIAL_ROOT_PAGE,
            size: 0,
            free_page: FREE_LIST_END,
        };
        storage.write(&file, HEADER_PAGE, &header)?;
        storage.write(&file, INITIAL_ROOT_PAGE, &SortedNode::empty_leaf(FREE_LIST_END))?;

        storage.catalog.add(name, CollectionKind::Sorted)?;
        Ok(())
    }

    pub fn drop(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::Sorted)?;
        self.iterators.check_no_iterators(name)?;
        storage.cache.remove_file(Self::file(storage, name))?;
        storage.catalog.remove(name)?;
        Ok(())
    }

    /// Every entry whose key starts with `prefix`, in key order. The empty
    /// prefix matches the whole map.
    pub fn get(
        &mut self,
        storage: &mut Storage,
        name: &str,
        prefix: &[KeyElement],
    ) -> CollectionResult<Vec<(Key, Vec<u8>)>> {
        storage.catalog.check(name, CollectionKind::Sorted)?;
        let file = Self::file(storage, name);
        let mut cursor = open_cursor(storage, file, prefix, Some(prefix.to_vec()), true)?;
        let mut entries = Vec::new();
        while let Some(entry) = cursor.next(storage)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Insert an entry. If an equal key is already stored, both keys get a
    /// uniquifier and the new entry sorts before the old one. A key that is a
    /// strict prefix of a stored key, or the other way round, is refused.
    pub fn insert(
        &mut self,
        storage: &mut Storage,
        name: &str,
        key: &[KeyElement],
        value: &[u8],
    ) -> CollectionResult<()> {
        if key.iter().any(|element| matches!(element, KeyElement::Uniquifier(_))) {
            return Err(CollectionError::ReservedKeyElement);
        }
        storage.catalog.check(name, CollectionKind::Sorted)?;
        self.iterators.check_no_iterators(name)?;
        let key_size = encoded_key_len(key);
        if key_size > MAX_KEY_SIZE {
            return Err(CollectionError::RecordTooLarge { size: key_size });
        }

        let file = Self::file(storage, name);
        let mut header: SortedHeader = storage.read(&file, HEADER_PAGE)?;
        let mut path = lookup(storage, &file, &header, key)?;
        let mut key = key.to_vec();
        let Some(PathItem {
            node: SortedNode::Leaf { keys, values, next },
            index,
            ..
        }) = path.last_mut()
        else {
            return Err(not_a_leaf(&file));
        };
        let index = *index;

        // Equal keys are contiguous and newest first, so the newest one sits
        // at the insert position, or starts a later leaf when the position
        // is the end of this one.
        let new_uniquifier = match keys.get_mut(index) {
            Some(existing) if duplicates(&existing[..], &key)? => match uniquifier(existing) {
                Some(old) => Some(old + 1),
                None => {
                    existing.push(KeyElement::Uniquifier(0));
                    Some(1)
                }
            },
            Some(_) => None,
            None => match first_key_from(storage, &file, *next)? {
                Some(first) if duplicates(&first, &key)? => match uniquifier(&first) {
                    Some(old) => Some(old + 1),
                    None => {
                        return Err(CollectionError::Corrupted(format!(
                            "equal keys without uniquifiers in {}",
                            file.display()
                        )));
                    }
                },
                _ => None,
            },
        };
        if let Some(new_uniquifier) = new_uniquifier {
            key.push(KeyElement::Uniquifier(new_uniquifier));
        }
        let size = SortedNode::lone_entry_len(&key, value);
        if size > PAGE_SIZE {
            return Err(CollectionError::RecordTooLarge { size });
        }

        keys.insert(index, key.clone());
        values.insert(index, value.to_vec());
        let key_is_max = index + 1 == keys.len();
        save_with_overflow(storage, &file, &mut header, path, &key, key_is_max)?;

        header.size += 1;
        storage.write(&file, HEADER_PAGE, &header)?;
        Ok(())
    }

    /// Remove the entry stored under `key`. The key must match a stored key
    /// exactly, apart from a uniquifier it was given; among equal keys the
    /// newest entry goes first.
    pub fn remove(&mut self, storage: &mut Storage, name: &str, key: &[KeyElement]) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::Sorted)?;
        self.iterators.check_no_iterators(name)?;

        let file = Self::file(storage, name);
        let mut header: SortedHeader = storage.read(&file, HEADER_PAGE)?;
        let mut path = lookup_first_match(storage, &file, &header, key)?;
        let Some(PathItem {
            node: SortedNode::Leaf { keys, values, .. },
            index,
            ..
        }) = path.last_mut()
        else {
            return Err(not_a_leaf(&file));
        };
        let index = *index;
        match keys.get(index) {
            Some(stored) if is_exact_match(stored, key)? => {}
            _ => return Err(CollectionError::NoMatchingKey),
        }
        keys.remove(index);
        values.remove(index);

        // Only try to coalesce a node if its child coalesced
        while let Some(PathItem { page, node, .. }) = path.pop() {
            if !try_coalesce(storage, &file, &mut header, &mut path, page, &node)? {
                storage.write(&file, page, &node)?;
                break;
            }
        }

        header.size -= 1;
        storage.write(&file, HEADER_PAGE, &header)?;
        Ok(())
    }

    pub fn size(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<u64> {
        storage.catalog.check(name, CollectionKind::Sorted)?;
        let file = Self::file(storage, name);
        let header: SortedHeader = storage.read(&file, HEADER_PAGE)?;
        Ok(header.size)
    }

    /// Depth, page count and free pages of the map's tree
    pub fn stats(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<TreeStats> {
        storage.catalog.check(name, CollectionKind::Sorted)?;
        let file = Self::file(storage, name);
        let header: SortedHeader = storage.read(&file, HEADER_PAGE)?;

        let mut depth = 0;
        let mut page = header.root;
        while let SortedNode::Inner { children, .. } = storage.read::<SortedNode>(&file, page)? {
            page = children[0];
            depth += 1;
        }

        Ok(TreeStats {
            depth,
            page_count: storage.cache.get_page_count(&file)?,
            free_pages: free_list::count_pages(storage, &file, header.free_page)?,
        })
    }

    /// Iterate in key order from the first key not below `start` until a key
    /// passes `end`. A key equal to `end` (as a prefix) is only yielded when
    /// `inclusive` is set.
    pub fn iter(
        &mut self,
        storage: &mut Storage,
        name: &str,
        start: Option<&[KeyElement]>,
        end: Option<&[KeyElement]>,
        inclusive: bool,
    ) -> CollectionResult<IterHandle> {
        storage.catalog.check(name, CollectionKind::Sorted)?;
        let file = Self::file(storage, name);
        let cursor = open_cursor(
            storage,
            file,
            start.unwrap_or_default(),
            end.map(<[KeyElement]>::to_vec),
            inclusive,
        )?;
        Ok(self.iterators.register(name, cursor))
    }

    /// Next entry of an iteration. The handle is closed once it is exhausted.
    pub fn iter_next(
        &mut self,
        storage: &mut Storage,
        handle: &IterHandle,
    ) -> CollectionResult<Option<(Key, Vec<u8>)>> {
        let entry = self.iterators.get_mut(handle)?.next(storage)?;
        if entry.is_none() {
            self.iterators.close(handle)?;
        }
        Ok(entry)
    }

    pub fn iter_break(&mut self, handle: &IterHandle) -> CollectionResult<()> {
        Ok(self.iterators.close(handle)?)
    }
}

fn not_a_leaf(file: &Path) -> CollectionError {
    CollectionError::Corrupted(format!("path in {} does not end in a leaf", file.display()))
}

fn not_inner(file: &Path) -> CollectionError {
    CollectionError::Corrupted(format!("leaf used as a parent in {}", file.display()))
}

/// Whether `stored` is `key`, possibly followed by the uniquifier the map gave it
fn is_exact_match(stored: &[KeyElement], key: &[KeyElement]) -> CollectionResult<bool> {
    let own_len = if uniquifier(stored).is_some() && key.len() < stored.len() {
        stored.len() - 1
    } else {
        stored.len()
    };
    Ok(own_len == key.len() && compare_keys(stored, key)? == Ordering::Equal)
}

/// Whether a stored key and a key being inserted are equal keys. Keys that
/// are only equal because one is a prefix of the other cannot both be stored.
fn duplicates(stored: &[KeyElement], key: &[KeyElement]) -> CollectionResult<bool> {
    if compare_keys(stored, key)? != Ordering::Equal {
        return Ok(false);
    }
    let own_len = stored.len() - usize::from(uniquifier(stored).is_some());
    if own_len != key.len() {
        return Err(CollectionError::KeyPrefixConflict);
    }
    Ok(true)
}

/// First key of the leaf chain starting at `page`, skipping empty leaves
fn first_key_from(storage: &mut Storage, file: &Path, mut page: PageId) -> CollectionResult<Option<Key>> {
    while page != FREE_LIST_END {
        match storage.read(file, page)? {
            SortedNode::Leaf { keys, next, .. } => match keys.into_iter().next() {
                Some(first) => return Ok(Some(first)),
                None => page = next,
            },
            SortedNode::Inner { .. } => return Err(not_a_leaf(file)),
        }
    }
    Ok(None)
}

/// Move `path` from the leaf it ends in to the next leaf in tree order.
/// Returns false, leaving `path` unusable, if it ended in the last leaf.
fn advance_to_next_leaf(storage: &mut Storage, file: &Path, path: &mut Vec<PathItem>) -> CollectionResult<bool> {
    path.pop();
    let mut page = loop {
        let Some(parent) = path.last_mut() else {
            return Ok(false);
        };
        let SortedNode::Inner { children, .. } = &parent.node else {
            return Err(not_inner(file));
        };
        if let Some(&sibling) = children.get(parent.index + 1) {
            parent.index += 1;
            break sibling;
        }
        path.pop();
    };
    loop {
        let node: SortedNode = storage.read(file, page)?;
        let first_child = match &node {
            SortedNode::Inner { children, .. } => children.first().copied(),
            SortedNode::Leaf { .. } => None,
        };
        let is_leaf = node.is_leaf();
        path.push(PathItem { page, node, index: 0 });
        match first_child {
            Some(child) => page = child,
            None if is_leaf => return Ok(true),
            None => return Err(CollectionError::Corrupted(format!(
                "inner node without children in {}",
                file.display()
            ))),
        }
    }
}

/// Walk from the root to the leaf where `key` belongs
fn lookup(
    storage: &mut Storage,
    file: &Path,
    header: &SortedHeader,
    key: &[KeyElement],
) -> CollectionResult<Vec<PathItem>> {
    let mut path = Vec::new();
    let mut page = header.root;
    loop {
        let node: SortedNode = storage.read(file, page)?;
        let index = lower_bound(node.keys(), key)?;
        let child = match &node {
            SortedNode::Inner { children, .. } => Some(children[index]),
            SortedNode::Leaf { .. } => None,
        };
        path.push(PathItem { page, node, index });
        match child {
            Some(child) => page = child,
            None => return Ok(path),
        }
    }
}

/// Like [`lookup`], but if the leaf holds nothing at or after `key` and the
/// next non-empty leaf starts with a key equal to it, the path to that leaf
/// instead. Deleting a leaf's largest key leaves its routing key behind, so
/// an equal key can sit just past the leaf the search lands in. The path is
/// moved along the tree rather than searched again, since a search would be
/// routed by the same stale key.
fn lookup_first_match(
    storage: &mut Storage,
    file: &Path,
    header: &SortedHeader,
    key: &[KeyElement],
) -> CollectionResult<Vec<PathItem>> {
    let mut path = lookup(storage, file, header, key)?;
    let Some(PathItem {
        node: SortedNode::Leaf { keys, next, .. },
        index,
        ..
    }) = path.last()
    else {
        return Err(not_a_leaf(file));
    };
    if *index < keys.len() {
        return Ok(path);
    }
    match first_key_from(storage, file, *next)? {
        Some(first) if compare_keys(&first, key)? == Ordering::Equal => {}
        _ => return Ok(path),
    }

    loop {
        if !advance_to_next_leaf(storage, file, &mut path)? {
            return Err(CollectionError::Corrupted(format!(
                "leaf chain and tree disagree in {}",
                file.display()
            )));
        }
        match path.last() {
            Some(PathItem {
                node: SortedNode::Leaf { keys, .. },
                ..
            }) if keys.is_empty() => {}
            _ => return Ok(path),
        }
    }
}

fn open_cursor(
    storage: &mut Storage,
    file: PathBuf,
    start: &[KeyElement],
    end: Option<Key>,
    inclusive: bool,
) -> CollectionResult<SortedCursor> {
    let header: SortedHeader = storage.read(&file, HEADER_PAGE)?;
    let path = lookup(storage, &file, &header, start)?;
    let Some(PathItem {
        node: SortedNode::Leaf { keys, values, next },
        index,
        ..
    }) = path.into_iter().last()
    else {
        return Err(not_a_leaf(&file));
    };
    Ok(SortedCursor {
        buffered: keys.into_iter().zip(values).skip(index).collect(),
        next_leaf: next,
        file,
        end,
        inclusive,
    })
}

/// Save the nodes on `path` from the leaf up, splitting any node that no
/// longer fits its page. When the inserted `key` became a node's largest key,
/// the routing key for that node is replaced in the nearest ancestor that
/// has one.
fn save_with_overflow(
    storage: &mut Storage,
    file: &Path,
    header: &mut SortedHeader,
    mut path: Vec<PathItem>,
    key: &Key,
    mut key_is_max: bool,
) -> CollectionResult<()> {
    let mut modified = true;
    while let Some(PathItem { page, node, .. }) = path.pop() {
        let mut parent_modified = false;
        let mut piece_count = 1;

        if modified {
            let (mut pieces, separators) = node.split_to_fit();
            piece_count = pieces.len();
            if piece_count == 1 {
                storage.write(file, page, &pieces[0])?;
            } else {
                let mut pages = vec![page];
                for _ in 1..piece_count {
                    pages.push(free_list::take_page(storage, file, &mut header.free_page)?);
                }
                for (index, piece) in pieces.iter_mut().enumerate() {
                    if let Some(next_page) = pages.get(index + 1) {
                        piece.set_next(*next_page);
                    }
                    storage.write(file, pages[index], piece)?;
                }
                debug!(file = %file.display(), page, pieces = piece_count, "split sorted node");

                match path.last_mut() {
                    Some(parent) => {
                        let SortedNode::Inner { keys, children } = &mut parent.node else {
                            return Err(not_inner(file));
                        };
                        keys.splice(parent.index..parent.index, separators);
                        children.splice(parent.index + 1..parent.index + 1, pages[1..].iter().copied());
                        parent_modified = true;
                    }
                    None => {
                        let root_page = free_list::take_page(storage, file, &mut header.free_page)?;
                        let root = SortedNode::Inner {
                            keys: separators,
                            children: pages,
                        };
                        storage.write(file, root_page, &root)?;
                        header.root = root_page;
                        debug!(file = %file.display(), root = root_page, "new sorted root");
                    }
                }
            }
        }

        if key_is_max {
            key_is_max = false;
            if let Some(parent) = path.last_mut() {
                let SortedNode::Inner { keys, .. } = &mut parent.node else {
                    return Err(not_inner(file));
                };
                let slot = parent.index + piece_count - 1;
                if slot < keys.len() {
                    keys[slot] = key.clone();
                    parent_modified = true;
                } else {
                    // The last child has no routing key here; the parent's
                    // own maximum changed instead
                    key_is_max = true;
                }
            }
        }

        modified = parent_modified;
        if !modified && !key_is_max {
            break;
        }
    }
    Ok(())
}

/// Merge an under-full node with under-full neighbours. The left node of each
/// pair survives so no leaf's `next` link has to change from outside the
/// pair. `path` ends with the node's parent. Returns whether a merge
/// happened; if so the merged node has been written.
fn try_coalesce(
    storage: &mut Storage,
    file: &Path,
    header: &mut SortedHeader,
    path: &mut Vec<PathItem>,
    page: PageId,
    node: &SortedNode,
) -> CollectionResult<bool> {
    let Some(parent) = path.last_mut() else {
        return Ok(false);
    };
    if node.record_len() >= MIN_NODE_LENGTH {
        return Ok(false);
    }
    let SortedNode::Inner { keys, children } = &mut parent.node else {
        return Err(not_inner(file));
    };
    let mut this_index = parent.index;
    let mut this_page = page;

    struct Candidate {
        left: bool,
        length: usize,
    }
    let mut candidates = Vec::new();
    for left in [true, false] {
        let sibling_index = if left {
            this_index.checked_sub(1)
        } else {
            Some(this_index + 1).filter(|index| *index < children.len())
        };
        let Some(sibling_index) = sibling_index else {
            continue;
        };
        let length = record_size(storage.cache.read_record(file, children[sibling_index])?.len());
        if length < MIN_NODE_LENGTH {
            candidates.push(Candidate { left, length });
        }
    }

    let mut merged: Option<SortedNode> = None;
    let mut freed = Vec::new();
    while let Some(smallest) = (0..candidates.len()).min_by_key(|&i| candidates[i].length) {
        let candidate = candidates.remove(smallest);
        let current = merged.as_ref().unwrap_or(node);
        let sibling_index = if candidate.left { this_index - 1 } else { this_index + 1 };
        let sibling_page = children[sibling_index];
        let sibling: SortedNode = storage.read(file, sibling_page)?;
        if sibling.is_leaf() != current.is_leaf() {
            return Err(CollectionError::Corrupted(format!(
                "siblings of different kinds in {}",
                file.display()
            )));
        }

        let left_index = this_index.min(sibling_index);
        let (left, right) = if candidate.left {
            (&sibling, current)
        } else {
            (current, &sibling)
        };
        let Some(combined) = SortedNode::merged(left, &keys[left_index], right) else {
            break;
        };

        keys.remove(left_index);
        children.remove(left_index + 1);
        if candidate.left {
            freed.push(this_page);
            this_page = sibling_page;
            this_index -= 1;
        } else {
            freed.push(sibling_page);
        }
        let fits_more = combined.record_len() < MIN_NODE_LENGTH;
        merged = Some(combined);
        if !fits_more {
            break;
        }
    }
    let Some(merged) = merged else {
        return Ok(false);
    };
    parent.index = this_index;

    // A root left with a single child is replaced by that child
    if children.len() == 1 && path.len() == 1 {
        path.pop();
        freed.push(header.root);
        header.root = this_page;
        debug!(file = %file.display(), root = this_page, "collapsed sorted root");
    }

    storage.write(file, this_page, &merged)?;
    for page in freed {
        free_list::release_page(storage, file, &mut header.free_page, page)?;
    }
    debug!(file = %file.display(), page = this_page, "coalesced sorted node");
    Ok(true)
}
