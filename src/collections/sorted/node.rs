use crate::codec::{DecodeError, DecodeResult, Decoder, Encoder, Record};
use crate::file::{PAGE_SIZE, PageId, record_size};

use super::key::{Key, KeyElement, decode_key, encode_key, encoded_key_len};

/// Nodes whose record is smaller than this try to merge with a sibling.
/// Below half a page because merging inner nodes pulls a key down from the
/// parent.
pub const MIN_NODE_LENGTH: usize = PAGE_SIZE * 45 / 100;

/// Largest encoded key accepted on insert, so that every inner node can hold
/// several keys
pub const MAX_KEY_SIZE: usize = PAGE_SIZE / 4;

const INNER_TAG: u8 = 0;
const LEAF_TAG: u8 = 1;

/// Page 0 of a sorted map file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortedHeader {
    pub root: PageId,
    /// Number of entries in the map
    pub size: u64,
    /// Head of the free-page list
    pub free_page: PageId,
}

impl Record for SortedHeader {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_u32(self.root);
        encoder.put_u64(self.size);
        encoder.put_u32(self.free_page);
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        Ok(Self {
            root: decoder.get_u32()?,
            size: decoder.get_u64()?,
            free_page: decoder.get_u32()?,
        })
    }
}

/// A B-tree node. In an inner node `keys[i]` is the largest key under
/// `children[i]`; the last child has no key, so there is one key fewer than
/// children. Leaves are chained through `next` in key order.
#[derive(Debug, Clone, PartialEq)]
pub enum SortedNode {
    Inner {
        keys: Vec<Key>,
        children: Vec<PageId>,
    },
    Leaf {
        keys: Vec<Key>,
        values: Vec<Vec<u8>>,
        next: PageId,
    },
}

impl SortedNode {
    pub fn empty_leaf(next: PageId) -> Self {
        SortedNode::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, SortedNode::Leaf { .. })
    }

    pub fn keys(&self) -> &[Key] {
        match self {
            SortedNode::Inner { keys, .. } | SortedNode::Leaf { keys, .. } => keys,
        }
    }

    /// Number of children or entries
    pub fn len(&self) -> usize {
        match self {
            SortedNode::Inner { children, .. } => children.len(),
            SortedNode::Leaf { keys, .. } => keys.len(),
        }
    }

    /// Bytes this node takes in its page
    pub fn record_len(&self) -> usize {
        let body = match self {
            SortedNode::Inner { keys, children } => {
                4 + 4 * children.len() + 4 + keys.iter().map(|key| encoded_key_len(key)).sum::<usize>()
            }
            SortedNode::Leaf { keys, values, .. } => {
                4 + 4
                    + keys.iter().map(|key| encoded_key_len(key)).sum::<usize>()
                    + values.iter().map(|value| 4 + value.len()).sum::<usize>()
            }
        };
        record_size(1 + body)
    }

    /// Bytes a leaf holding only this entry takes in its page
    pub fn lone_entry_len(key: &[KeyElement], value: &[u8]) -> usize {
        record_size(1 + 4 + 4 + encoded_key_len(key) + 4 + value.len())
    }

    fn entry_len(&self, index: usize) -> usize {
        match self {
            SortedNode::Inner { keys, .. } => 4 + keys.get(index).map_or(0, |key| encoded_key_len(key)),
            SortedNode::Leaf { keys, values, .. } => encoded_key_len(&keys[index]) + 4 + values[index].len(),
        }
    }

    /// Entry index that divides the node's bytes roughly in half,
    /// leaving at least one entry on each side
    fn byte_midpoint(&self) -> usize {
        let total: usize = (0..self.len()).map(|i| self.entry_len(i)).sum();
        let mut running = 0;
        for index in 0..self.len() {
            running += self.entry_len(index);
            if running * 2 >= total {
                return (index + 1).clamp(1, self.len() - 1);
            }
        }
        self.len() - 1
    }

    /// Move the entries from `at` onwards into a new right sibling. Returns the
    /// sibling and the key separating the two: a copy of the left leaf's last
    /// key, or the inner key that no longer has a child to its left.
    fn split_off(&mut self, at: usize) -> (SortedNode, Key) {
        match self {
            SortedNode::Leaf { keys, values, next } => {
                let right = SortedNode::Leaf {
                    keys: keys.split_off(at),
                    values: values.split_off(at),
                    next: *next,
                };
                (right, keys[at - 1].clone())
            }
            SortedNode::Inner { keys, children } => {
                let right = SortedNode::Inner {
                    keys: keys.split_off(at),
                    children: children.split_off(at),
                };
                let separator = keys.remove(at - 1);
                (right, separator)
            }
        }
    }

    /// Split into consecutive pieces that each fit in a page, along with the
    /// keys separating neighbouring pieces. Leaf pieces still need their
    /// `next` links pointed at each other once they have pages.
    pub fn split_to_fit(self) -> (Vec<SortedNode>, Vec<Key>) {
        let mut pieces = Vec::new();
        let mut separators = Vec::new();
        self.split_into(&mut pieces, &mut separators);
        (pieces, separators)
    }

    fn split_into(mut self, pieces: &mut Vec<SortedNode>, separators: &mut Vec<Key>) {
        if self.record_len() <= PAGE_SIZE || self.len() < 2 {
            pieces.push(self);
            return;
        }
        let (right, separator) = self.split_off(self.byte_midpoint());
        self.split_into(pieces, separators);
        separators.push(separator);
        right.split_into(pieces, separators);
    }

    pub fn set_next(&mut self, page: PageId) {
        if let SortedNode::Leaf { next, .. } = self {
            *next = page;
        }
    }

    /// Join two adjacent siblings of the same kind. An inner merge takes the
    /// parent's `separator` between the two key lists and is refused if the
    /// result would not fit in a page.
    pub fn merged(left: &SortedNode, separator: &Key, right: &SortedNode) -> Option<SortedNode> {
        match (left, right) {
            (
                SortedNode::Leaf { keys, values, .. },
                SortedNode::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next,
                },
            ) => Some(SortedNode::Leaf {
                keys: keys.iter().chain(right_keys).cloned().collect(),
                values: values.iter().chain(right_values).cloned().collect(),
                next: *next,
            }),
            (
                SortedNode::Inner { keys, children },
                SortedNode::Inner {
                    keys: right_keys,
                    children: right_children,
                },
            ) => {
                let mut merged_keys = keys.clone();
                merged_keys.push(separator.clone());
                merged_keys.extend(right_keys.iter().cloned());
                let node = SortedNode::Inner {
                    keys: merged_keys,
                    children: children.iter().chain(right_children).copied().collect(),
                };
                (node.record_len() <= PAGE_SIZE).then_some(node)
            }
            _ => None,
        }
    }
}

impl Record for SortedNode {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            SortedNode::Inner { keys, children } => {
                encoder.put_u8(INNER_TAG);
                encoder.put_len(children.len());
                for child in children {
                    encoder.put_u32(*child);
                }
                encoder.put_len(keys.len());
                for key in keys {
                    encode_key(key, encoder);
                }
            }
            SortedNode::Leaf { keys, values, next } => {
                encoder.put_u8(LEAF_TAG);
                encoder.put_u32(*next);
                encoder.put_len(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    encode_key(key, encoder);
                    encoder.put_bytes(value);
                }
            }
        }
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        match decoder.get_u8()? {
            INNER_TAG => {
                let count = decoder.get_len()?;
                let children = (0..count)
                    .map(|_| decoder.get_u32())
                    .collect::<DecodeResult<Vec<_>>>()?;
                let count = decoder.get_len()?;
                let keys = (0..count)
                    .map(|_| decode_key(decoder))
                    .collect::<DecodeResult<Vec<_>>>()?;
                if children.is_empty() || keys.len() + 1 != children.len() {
                    return Err(DecodeError::Malformed("sorted inner node"));
                }
                Ok(SortedNode::Inner { keys, children })
            }
            LEAF_TAG => {
                let next = decoder.get_u32()?;
                let count = decoder.get_len()?;
                let mut keys = Vec::with_capacity(count);
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(decode_key(decoder)?);
                    values.push(decoder.get_bytes()?);
                }
                Ok(SortedNode::Leaf { keys, values, next })
            }
            tag => Err(DecodeError::UnknownTag {
                what: "sorted node",
                tag,
            }),
        }
    }
}
