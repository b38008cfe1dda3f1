//! Ordered list addressed by position.
//!
//! The list is a height-balanced tree stored one node per page. Inner nodes
//! record the number of values below each child, so a position is resolved by
//! subtracting subtree sizes on the way down; no keys are stored. Page 0 holds
//! the [`ListHeader`]. Nodes that outgrow their page are split, nodes that drop
//! below [`MIN_NODE_LENGTH`] merge with a small neighbour, and vacated pages go
//! on a free-page list for reuse.

mod node;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::CollectionKind;
use crate::file::{PAGE_SIZE, PageId, record_size};
use crate::iterator::{IterHandle, IteratorRegistry};

use super::free_list::{self, FREE_LIST_END};
use super::{CollectionError, CollectionResult, Storage, TreeStats};

pub use node::{Child, ListHeader, ListNode, MIN_NODE_LENGTH};

const HEADER_PAGE: PageId = 0;
const INITIAL_ROOT_PAGE: PageId = 1;

/// One step of a root-to-leaf walk. For inner nodes `index` is the child that
/// was followed; for the leaf it is the position within the leaf.
struct PathItem {
    page: PageId,
    node: ListNode,
    index: usize,
}

/// Resumable position in a list iteration over `[next, end)`
pub struct ListCursor {
    file: PathBuf,
    next: u64,
    end: u64,
    buffered: VecDeque<Vec<u8>>,
}

impl ListCursor {
    fn next(&mut self, storage: &mut Storage) -> CollectionResult<Option<Vec<u8>>> {
        if self.buffered.is_empty() {
            if self.next >= self.end {
                return Ok(None);
            }
            // Buffer the rest of the leaf holding the next position
            let header: ListHeader = storage.read(&self.file, HEADER_PAGE)?;
            let path = lookup(storage, &self.file, &header, self.next as i64, false)?;
            let Some(PathItem {
                node: ListNode::Leaf(mut values),
                index,
                ..
            }) = path.into_iter().last()
            else {
                return Err(not_a_leaf(&self.file));
            };
            let remaining = (self.end - self.next) as usize;
            values.truncate((index + remaining).min(values.len()));
            self.buffered = values.drain(index..).collect();
        }

        let value = self.buffered.pop_front();
        if value.is_some() {
            self.next += 1;
        }
        Ok(value)
    }
}

/// Operations on every list collection, plus their live iterators
#[derive(Default)]
pub struct ListCollection {
    iterators: IteratorRegistry<ListCursor>,
}

impl ListCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn file(storage: &Storage, name: &str) -> PathBuf {
        storage.path(name, CollectionKind::List, None)
    }

    pub fn create(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<()> {
        storage.check_new_name(name)?;
        let file = Self::file(storage, name);

        storage.cache.create_file(&file)?;
        storage.cache.set_page_count(&file, 2)?;
        let header = ListHeader {
            child: Child {
                size: 0,
                page: INITIAL_ROOT_PAGE,
            },
            free_page: FREE_LIST_END,
        };
        storage.write(&file, HEADER_PAGE, &header)?;
        storage.write(&file, INITIAL_ROOT_PAGE, &ListNode::Leaf(Vec::new()))?;

        storage.catalog.add(name, CollectionKind::List)?;
        Ok(())
    }

    pub fn drop(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::List)?;
        self.iterators.check_no_iterators(name)?;
        storage.cache.remove_file(Self::file(storage, name))?;
        storage.catalog.remove(name)?;
        Ok(())
    }

    /// Value at `index`; negative indices count from the end
    pub fn get(&mut self, storage: &mut Storage, name: &str, index: i64) -> CollectionResult<Vec<u8>> {
        storage.catalog.check(name, CollectionKind::List)?;
        let file = Self::file(storage, name);
        let header: ListHeader = storage.read(&file, HEADER_PAGE)?;
        let path = lookup(storage, &file, &header, index, false)?;
        match path.into_iter().last() {
            Some(PathItem {
                node: ListNode::Leaf(mut values),
                index,
                ..
            }) => Ok(values.swap_remove(index)),
            _ => Err(not_a_leaf(&file)),
        }
    }

    /// Replace the value at `index`
    pub fn set(
        &mut self,
        storage: &mut Storage,
        name: &str,
        index: i64,
        value: &[u8],
    ) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::List)?;
        self.iterators.check_no_iterators(name)?;
        check_value_fits(value)?;

        let file = Self::file(storage, name);
        let mut header: ListHeader = storage.read(&file, HEADER_PAGE)?;
        let mut path = lookup(storage, &file, &header, index, false)?;
        match path.last_mut() {
            Some(PathItem {
                node: ListNode::Leaf(values),
                index,
                ..
            }) => values[*index] = value.to_vec(),
            _ => return Err(not_a_leaf(&file)),
        }
        save_with_overflow(storage, &file, &mut header, path, false)
    }

    /// Insert `value` before `index`, or append when no index is given
    pub fn insert(
        &mut self,
        storage: &mut Storage,
        name: &str,
        index: Option<i64>,
        value: &[u8],
    ) -> CollectionResult<()> {
        storage.catalog.check(name, CollectionKind::List)?;
        self.iterators.check_no_iterators(name)?;
        check_value_fits(value)?;

        let file = Self::file(storage, name);
        let mut header: ListHeader = storage.read(&file, HEADER_PAGE)?;
        let index = index.unwrap_or(header.child.size as i64);
        let mut path = lookup(storage, &file, &header, index, true)?;
        match path.last_mut() {
            Some(PathItem {
                node: ListNode::Leaf(values),
                index,
                ..
            }) => values.insert(*index, value.to_vec()),
            _ => return Err(not_a_leaf(&file)),
        }
        save_with_overflow(storage, &file, &mut header, path, true)
    }

    /// Remove and return the value at `index`, or the last value when no
    /// index is given
    pub fn remove(
        &mut self,
        storage: &mut Storage,
        name: &str,
        index: Option<i64>,
    ) -> CollectionResult<Vec<u8>> {
        storage.catalog.check(name, CollectionKind::List)?;
        self.iterators.check_no_iterators(name)?;

        let file = Self::file(storage, name);
        let mut header: ListHeader = storage.read(&file, HEADER_PAGE)?;
        let mut path = lookup(storage, &file, &header, index.unwrap_or(-1), false)?;
        let removed = match path.last_mut() {
            Some(PathItem {
                node: ListNode::Leaf(values),
                index,
                ..
            }) => values.remove(*index),
            _ => return Err(not_a_leaf(&file)),
        };

        // Only try to coalesce a node if its child coalesced
        let mut coalesced = true;
        while let Some(PathItem { page, node, .. }) = path.pop() {
            coalesced = coalesced && try_coalesce(storage, &file, &mut header, &mut path, &node)?;
            if !coalesced {
                write_node(storage, &file, page, &node)?;
                let parent_child = match path.last_mut() {
                    Some(parent) => child_mut(&file, parent)?,
                    None => &mut header.child,
                };
                parent_child.size -= 1;
            }
        }
        storage.write(&file, HEADER_PAGE, &header)?;
        Ok(removed)
    }

    pub fn size(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<u64> {
        storage.catalog.check(name, CollectionKind::List)?;
        let file = Self::file(storage, name);
        let header: ListHeader = storage.read(&file, HEADER_PAGE)?;
        Ok(header.child.size)
    }

    /// Depth, page count and free pages of the list's tree
    pub fn stats(&mut self, storage: &mut Storage, name: &str) -> CollectionResult<TreeStats> {
        storage.catalog.check(name, CollectionKind::List)?;
        let file = Self::file(storage, name);
        let header: ListHeader = storage.read(&file, HEADER_PAGE)?;

        let mut depth = 0;
        let mut page = header.child.page;
        while let ListNode::Inner(children) = storage.read::<ListNode>(&file, page)? {
            let Some(first) = children.first() else {
                return Err(CollectionError::Corrupted(format!(
                    "empty inner node on page {page} of {}",
                    file.display()
                )));
            };
            page = first.page;
            depth += 1;
        }

        Ok(TreeStats {
            depth,
            page_count: storage.cache.get_page_count(&file)?,
            free_pages: free_list::count_pages(storage, &file, header.free_page)?,
        })
    }

    /// Iterate over positions `[start, end)`. Missing bounds default to the
    /// whole list; negative bounds count from the end and out-of-range bounds
    /// are clamped.
    pub fn iter(
        &mut self,
        storage: &mut Storage,
        name: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> CollectionResult<IterHandle> {
        storage.catalog.check(name, CollectionKind::List)?;
        let file = Self::file(storage, name);
        let header: ListHeader = storage.read(&file, HEADER_PAGE)?;
        let size = header.child.size;

        let clamp = |bound: i64| -> u64 {
            let bound = if bound < 0 { bound + size as i64 } else { bound };
            bound.clamp(0, size as i64) as u64
        };
        let start = start.map_or(0, clamp);
        let end = end.map_or(size, clamp);

        let cursor = ListCursor {
            file,
            next: start,
            end,
            buffered: VecDeque::new(),
        };
        Ok(self.iterators.register(name, cursor))
    }

    /// Next value of an iteration. The handle is closed once it is exhausted.
    pub fn iter_next(
        &mut self,
        storage: &mut Storage,
        handle: &IterHandle,
    ) -> CollectionResult<Option<Vec<u8>>> {
        let value = self.iterators.get_mut(handle)?.next(storage)?;
        if value.is_none() {
            self.iterators.close(handle)?;
        }
        Ok(value)
    }

    pub fn iter_break(&mut self, handle: &IterHandle) -> CollectionResult<()> {
        Ok(self.iterators.close(handle)?)
    }
}

fn not_a_leaf(file: &Path) -> CollectionError {
    CollectionError::Corrupted(format!("path in {} does not end in a leaf", file.display()))
}

fn check_value_fits(value: &[u8]) -> CollectionResult<()> {
    let size = ListNode::lone_value_len(value);
    if size > PAGE_SIZE {
        return Err(CollectionError::RecordTooLarge { size });
    }
    Ok(())
}

/// The child entry a path item descended through
fn child_mut<'a>(file: &Path, item: &'a mut PathItem) -> CollectionResult<&'a mut Child> {
    match &mut item.node {
        ListNode::Inner(children) => children
            .get_mut(item.index)
            .ok_or_else(|| CollectionError::Corrupted(format!("bad child index in {}", file.display()))),
        ListNode::Leaf(_) => Err(CollectionError::Corrupted(format!(
            "leaf used as a parent in {}",
            file.display()
        ))),
    }
}

/// Walk from the root to the leaf holding `index`. In insert mode the
/// position one past the end is also valid and resolves to the end of the
/// rightmost eligible leaf.
fn lookup(
    storage: &mut Storage,
    file: &Path,
    header: &ListHeader,
    index: i64,
    insert: bool,
) -> CollectionResult<Vec<PathItem>> {
    let size = header.child.size;
    let signed_size = size as i64;
    if index < -signed_size || index >= signed_size + insert as i64 {
        return Err(CollectionError::OutOfBounds { index, size });
    }
    let mut position = (if index < 0 { index + signed_size } else { index }) as u64;

    let mut path = Vec::new();
    let mut page = header.child.page;
    loop {
        let node: ListNode = storage.read(file, page)?;
        match &node {
            ListNode::Inner(children) => {
                let mut found = None;
                for (child_index, child) in children.iter().enumerate() {
                    if position < child.size || (insert && position == child.size) {
                        found = Some((child_index, child.page));
                        break;
                    }
                    position -= child.size;
                }
                let Some((child_index, child_page)) = found else {
                    return Err(CollectionError::Corrupted(format!(
                        "child sizes on page {page} of {} do not cover position",
                        file.display()
                    )));
                };
                path.push(PathItem {
                    page,
                    node,
                    index: child_index,
                });
                page = child_page;
            }
            ListNode::Leaf(_) => {
                path.push(PathItem {
                    page,
                    node,
                    index: position as usize,
                });
                return Ok(path);
            }
        }
    }
}

fn write_node(storage: &mut Storage, file: &Path, page: PageId, node: &ListNode) -> CollectionResult<()> {
    Ok(storage.write(file, page, node)?)
}

/// Save the nodes on `path` from the leaf up, splitting any node that no
/// longer fits its page. On insert every ancestor's subtree size grows by one;
/// a plain overwrite stops at the first node that saves without splitting.
fn save_with_overflow(
    storage: &mut Storage,
    file: &Path,
    header: &mut ListHeader,
    mut path: Vec<PathItem>,
    insert: bool,
) -> CollectionResult<()> {
    let mut made_split = false;
    while let Some(PathItem { page, node, .. }) = path.pop() {
        if node.record_len() <= PAGE_SIZE {
            write_node(storage, file, page, &node)?;
            if !insert {
                break;
            }
            if let Some(parent) = path.last_mut() {
                child_mut(file, parent)?.size += 1;
            }
            continue;
        }

        let pieces = node.split_to_fit();
        let mut children = Vec::with_capacity(pieces.len());
        for (piece_index, piece) in pieces.iter().enumerate() {
            let piece_page = if piece_index == 0 {
                page
            } else {
                free_list::take_page(storage, file, &mut header.free_page)?
            };
            write_node(storage, file, piece_page, piece)?;
            children.push(Child {
                size: piece.size(),
                page: piece_page,
            });
        }
        debug!(file = %file.display(), page, pieces = children.len(), "split list node");
        made_split = true;

        match path.last_mut() {
            Some(parent) => match &mut parent.node {
                ListNode::Inner(parent_children) => {
                    parent_children.splice(parent.index..=parent.index, children);
                }
                ListNode::Leaf(_) => return Err(not_a_leaf(file)),
            },
            None => {
                let root_page = free_list::take_page(storage, file, &mut header.free_page)?;
                write_node(storage, file, root_page, &ListNode::Inner(children))?;
                header.child.page = root_page;
            }
        }
    }

    if insert {
        header.child.size += 1;
    }
    if insert || made_split {
        storage.write(file, HEADER_PAGE, header)?;
    }
    Ok(())
}

/// Merge an under-full node with under-full neighbours, freeing their pages.
/// `path` ends with the node's parent. Returns whether a merge happened; if so
/// the merged node has been written and its size recorded in the parent.
fn try_coalesce(
    storage: &mut Storage,
    file: &Path,
    header: &mut ListHeader,
    path: &mut Vec<PathItem>,
    node: &ListNode,
) -> CollectionResult<bool> {
    let Some(parent) = path.last_mut() else {
        return Ok(false);
    };
    if node.record_len() >= MIN_NODE_LENGTH {
        return Ok(false);
    }
    let ListNode::Inner(children) = &mut parent.node else {
        return Err(not_a_leaf(file));
    };
    let mut this_index = parent.index;

    struct Candidate {
        left: bool,
        index: usize,
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
        let length = record_size(storage.cache.read_record(file, children[sibling_index].page)?.len());
        if length < MIN_NODE_LENGTH {
            candidates.push(Candidate {
                left,
                index: sibling_index,
                length,
            });
        }
    }
    if candidates.is_empty() {
        return Ok(false);
    }

    let mut merged = node.clone();
    let mut freed = Vec::new();
    loop {
        let Some(smallest) = (0..candidates.len()).min_by_key(|&i| candidates[i].length) else {
            break;
        };
        let candidate = candidates.remove(smallest);
        let sibling_page = children[candidate.index].page;
        let sibling: ListNode = storage.read(file, sibling_page)?;
        if !merged.absorb(sibling, candidate.left) {
            return Err(CollectionError::Corrupted(format!(
                "siblings of different kinds in {}",
                file.display()
            )));
        }
        freed.push(sibling_page);
        children.remove(candidate.index);
        if candidate.left {
            this_index -= 1;
            for other in &mut candidates {
                other.index -= 1;
            }
        }

        if candidates.is_empty() || merged.record_len() >= MIN_NODE_LENGTH {
            break;
        }
    }

    let this_child = &mut children[this_index];
    this_child.size = merged.size();
    let this_child = *this_child;
    let only_child = children.len() == 1;
    parent.index = this_index;

    // A root left with a single child is replaced by that child
    if only_child && path.len() == 1 {
        path.pop();
        freed.push(header.child.page);
        header.child = this_child;
        debug!(file = %file.display(), root = this_child.page, "collapsed list root");
    }

    write_node(storage, file, this_child.page, &merged)?;
    for page in freed {
        free_list::release_page(storage, file, &mut header.free_page, page)?;
    }
    debug!(file = %file.display(), page = this_child.page, "coalesced list node");
    Ok(true)
}
