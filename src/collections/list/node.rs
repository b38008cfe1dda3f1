use crate::codec::{DecodeError, DecodeResult, Decoder, Encoder, Record};
use crate::file::{PAGE_SIZE, PageId, record_size};

/// Nodes whose record is smaller than this try to merge with a sibling.
/// Kept below half a page so a freshly split node is never merge-eligible.
pub const MIN_NODE_LENGTH: usize = PAGE_SIZE * 45 / 100;

const INNER_TAG: u8 = 0;
const LEAF_TAG: u8 = 1;

/// A subtree reference: its page and how many values it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub size: u64,
    pub page: PageId,
}

impl Child {
    const ENCODED_LEN: usize = 12;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_u64(self.size);
        encoder.put_u32(self.page);
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        Ok(Self {
            size: decoder.get_u64()?,
            page: decoder.get_u32()?,
        })
    }
}

/// Page 0 of a list file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    /// The root node and the list's length
    pub child: Child,
    /// Head of the free-page list
    pub free_page: PageId,
}

impl Record for ListHeader {
    fn encode(&self, encoder: &mut Encoder) {
        self.child.encode(encoder);
        encoder.put_u32(self.free_page);
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        Ok(Self {
            child: Child::decode(decoder)?,
            free_page: decoder.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListNode {
    Inner(Vec<Child>),
    Leaf(Vec<Vec<u8>>),
}

impl ListNode {
    /// Number of children or values
    pub fn len(&self) -> usize {
        match self {
            ListNode::Inner(children) => children.len(),
            ListNode::Leaf(values) => values.len(),
        }
    }

    /// Number of values in the subtree
    pub fn size(&self) -> u64 {
        match self {
            ListNode::Inner(children) => children.iter().map(|child| child.size).sum(),
            ListNode::Leaf(values) => values.len() as u64,
        }
    }

    /// Bytes this node takes in its page
    pub fn record_len(&self) -> usize {
        let entries: usize = match self {
            ListNode::Inner(children) => children.len() * Child::ENCODED_LEN,
            ListNode::Leaf(values) => values.iter().map(|value| 4 + value.len()).sum(),
        };
        record_size(1 + 4 + entries)
    }

    /// Bytes a leaf holding only `value` takes in its page
    pub fn lone_value_len(value: &[u8]) -> usize {
        record_size(1 + 4 + 4 + value.len())
    }

    fn entry_len(&self, index: usize) -> usize {
        match self {
            ListNode::Inner(_) => Child::ENCODED_LEN,
            ListNode::Leaf(values) => 4 + values[index].len(),
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

    /// Remove and return the entries from `at` onwards
    fn split_off(&mut self, at: usize) -> ListNode {
        match self {
            ListNode::Inner(children) => ListNode::Inner(children.split_off(at)),
            ListNode::Leaf(values) => ListNode::Leaf(values.split_off(at)),
        }
    }

    /// Split into consecutive pieces that each fit in a page. A node that fits
    /// comes back whole.
    pub fn split_to_fit(self) -> Vec<ListNode> {
        let mut pieces = Vec::new();
        self.split_into(&mut pieces);
        pieces
    }

    fn split_into(mut self, pieces: &mut Vec<ListNode>) {
        if self.record_len() <= PAGE_SIZE || self.len() < 2 {
            pieces.push(self);
            return;
        }
        let right = self.split_off(self.byte_midpoint());
        self.split_into(pieces);
        right.split_into(pieces);
    }

    /// Merge a sibling's entries into this node, on the left or right side.
    /// Returns false if the two nodes are not the same kind.
    pub fn absorb(&mut self, sibling: ListNode, sibling_is_left: bool) -> bool {
        match (self, sibling) {
            (ListNode::Inner(children), ListNode::Inner(mut other)) => {
                if sibling_is_left {
                    other.append(children);
                    *children = other;
                } else {
                    children.append(&mut other);
                }
                true
            }
            (ListNode::Leaf(values), ListNode::Leaf(mut other)) => {
                if sibling_is_left {
                    other.append(values);
                    *values = other;
                } else {
                    values.append(&mut other);
                }
                true
            }
            _ => false,
        }
    }
}

impl Record for ListNode {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            ListNode::Inner(children) => {
                encoder.put_u8(INNER_TAG);
                encoder.put_len(children.len());
                for child in children {
                    child.encode(encoder);
                }
            }
            ListNode::Leaf(values) => {
                encoder.put_u8(LEAF_TAG);
                encoder.put_len(values.len());
                for value in values {
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
                    .map(|_| Child::decode(decoder))
                    .collect::<DecodeResult<_>>()?;
                Ok(ListNode::Inner(children))
            }
            LEAF_TAG => {
                let count = decoder.get_len()?;
                let values = (0..count)
                    .map(|_| decoder.get_bytes())
                    .collect::<DecodeResult<_>>()?;
                Ok(ListNode::Leaf(values))
            }
            tag => Err(DecodeError::UnknownTag {
                what: "list node",
                tag,
            }),
        }
    }
}
