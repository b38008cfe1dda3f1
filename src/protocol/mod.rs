//! Messages exchanged with the server and the framing that delimits them.
//!
//! Every message is a JSON document preceded by its length as an unsigned
//! LEB128 varint. A connection carries any number of request/response pairs.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CollectionKind;
use crate::collections::Key;
use crate::iterator::IterHandle;

/// Largest frame accepted in either direction
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream contains a partial message")]
    PartialMessage,

    #[error("Frame length prefix is malformed")]
    InvalidLength,

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// One command, one variant per collection operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    List,

    ItemCreate { name: String },
    ItemDrop { name: String },
    ItemGet { name: String },
    ItemSet { name: String, value: Vec<u8> },

    HashCreate { name: String },
    HashDrop { name: String },
    HashGet { name: String, key: Vec<u8> },
    HashSet { name: String, key: Vec<u8>, value: Vec<u8> },
    HashDelete { name: String, key: Vec<u8> },
    HashSize { name: String },
    HashIter { name: String },
    HashIterNext { iter: IterHandle },
    HashIterBreak { iter: IterHandle },

    ListCreate { name: String },
    ListDrop { name: String },
    ListGet { name: String, index: i64 },
    ListSet { name: String, index: i64, value: Vec<u8> },
    ListInsert { name: String, index: Option<i64>, value: Vec<u8> },
    ListDelete { name: String, index: Option<i64> },
    ListSize { name: String },
    ListIter { name: String, start: Option<i64>, end: Option<i64> },
    ListIterNext { iter: IterHandle },
    ListIterBreak { iter: IterHandle },

    SortedCreate { name: String },
    SortedDrop { name: String },
    SortedGet { name: String, key: Key },
    SortedInsert { name: String, key: Key, value: Vec<u8> },
    SortedDelete { name: String, key: Key },
    SortedSize { name: String },
    SortedIter {
        name: String,
        start: Option<Key>,
        end: Option<Key>,
        inclusive: bool,
    },
    SortedIterNext { iter: IterHandle },
    SortedIterBreak { iter: IterHandle },
}

/// Result of a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Response {
    Ok,
    /// `<ErrorKind>: <message>`
    Error(String),
    Collections(BTreeMap<String, CollectionKind>),
    Bytes(Vec<u8>),
    OptionalBytes(Option<Vec<u8>>),
    Size(u64),
    Iter(IterHandle),
    /// Next key and value of a hash iteration
    Pair(Option<(Vec<u8>, Vec<u8>)>),
    /// Entries of a sorted map matching a prefix
    Pairs(Vec<(Key, Vec<u8>)>),
    /// Next entry of a sorted map iteration
    SortedPair(Option<(Key, Vec<u8>)>),
}

fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        if value < 0x80 {
            writer.write_all(&[value as u8])?;
            return Ok(());
        }
        writer.write_all(&[(value as u8 & 0x7F) | 0x80])?;
        value >>= 7;
    }
}

/// Read a varint length. `None` means the stream ended cleanly before it.
fn read_varint<R: Read>(reader: &mut R) -> ProtocolResult<Option<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    loop {
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return if shift == 0 {
                    Ok(None)
                } else {
                    Err(ProtocolError::PartialMessage)
                };
            }
            Err(e) => return Err(e.into()),
        }
        if shift > 63 {
            return Err(ProtocolError::InvalidLength);
        }
        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Write one length-prefixed frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> ProtocolResult<()> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    write_varint(writer, len)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read one length-prefixed frame, or `None` at a clean end of stream
pub fn read_frame<R: Read>(reader: &mut R) -> ProtocolResult<Option<Vec<u8>>> {
    let Some(len) = read_varint(reader)? else {
        return Ok(None);
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => Ok(Some(payload)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProtocolError::PartialMessage),
        Err(e) => Err(e.into()),
    }
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> ProtocolResult<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload)
}

pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> ProtocolResult<Option<T>> {
    match read_frame(reader)? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}
