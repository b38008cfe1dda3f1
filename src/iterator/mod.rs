//! Handle-based registry of live iterator cursors.
//!
//! A collection registers a cursor under its name and hands the returned
//! [`IterHandle`] to the client. Mutations of a collection are refused while
//! any of its iterators is registered.

use std::fmt;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Length of an iterator handle in bytes
pub const ITER_BYTE_LENGTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IteratorError {
    #[error("Unknown iterator {0}")]
    Unknown(IterHandle),

    #[error("Collection {0} has active iterators")]
    Active(String),
}

pub type IteratorResult<T> = Result<T, IteratorError>;

/// Opaque random identifier of a registered iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterHandle([u8; ITER_BYTE_LENGTH]);

impl IterHandle {
    fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ITER_BYTE_LENGTH]> for IterHandle {
    fn from(bytes: [u8; ITER_BYTE_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for IterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

struct RegisteredIterator<C> {
    name: String,
    cursor: C,
}

/// Live iterators of one collection type, generic over its cursor
pub struct IteratorRegistry<C> {
    iterators: AHashMap<IterHandle, RegisteredIterator<C>>,
    /// Number of live iterators per collection name
    active: AHashMap<String, usize>,
}

impl<C> IteratorRegistry<C> {
    pub fn new() -> Self {
        Self {
            iterators: AHashMap::new(),
            active: AHashMap::new(),
        }
    }

    /// Store a cursor for `name` and mint a fresh handle for it
    pub fn register(&mut self, name: &str, cursor: C) -> IterHandle {
        let mut handle = IterHandle::random();
        while self.iterators.contains_key(&handle) {
            handle = IterHandle::random();
        }

        self.iterators.insert(
            handle,
            RegisteredIterator {
                name: name.to_string(),
                cursor,
            },
        );
        *self.active.entry(name.to_string()).or_insert(0) += 1;
        debug!(collection = name, iterator = %handle, "registered iterator");
        handle
    }

    /// The cursor behind a handle
    pub fn get_mut(&mut self, handle: &IterHandle) -> IteratorResult<&mut C> {
        self.iterators
            .get_mut(handle)
            .map(|registered| &mut registered.cursor)
            .ok_or(IteratorError::Unknown(*handle))
    }

    /// Forget a handle and its cursor
    pub fn close(&mut self, handle: &IterHandle) -> IteratorResult<()> {
        let registered = self
            .iterators
            .remove(handle)
            .ok_or(IteratorError::Unknown(*handle))?;

        if let Some(count) = self.active.get_mut(&registered.name) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&registered.name);
            }
        }
        debug!(collection = %registered.name, iterator = %handle, "closed iterator");
        Ok(())
    }

    /// Number of live iterators over `name`
    pub fn active_count(&self, name: &str) -> usize {
        self.active.get(name).copied().unwrap_or(0)
    }

    /// Fail if any iterator over `name` is live
    pub fn check_no_iterators(&self, name: &str) -> IteratorResult<()> {
        if self.active_count(name) > 0 {
            return Err(IteratorError::Active(name.to_string()));
        }
        Ok(())
    }
}

impl<C> Default for IteratorRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
