//! Command layer: one [`Database`] owns the storage and a store per
//! collection kind, and turns each [`Request`] into a [`Response`].

use std::path::PathBuf;

use tracing::{info, warn};

use crate::collections::{
    CollectionResult, HashCollection, ListCollection, SortedCollection, Storage, item,
};
use crate::file::DEFAULT_CACHE_PAGES;
use crate::protocol::{Request, Response};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
    /// Maximum number of pages mapped at once
    pub cache_pages: usize,
}

impl DatabaseConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

pub struct Database {
    storage: Storage,
    hashes: HashCollection,
    lists: ListCollection,
    sorted: SortedCollection,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> CollectionResult<Self> {
        let storage = Storage::open(&config.data_dir, config.cache_pages)?;
        info!(
            data_dir = %config.data_dir.display(),
            cache_pages = config.cache_pages,
            collections = storage.catalog().collections().len(),
            "opened database"
        );
        Ok(Self {
            storage,
            hashes: HashCollection::new(),
            lists: ListCollection::new(),
            sorted: SortedCollection::new(),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Run one command. Failures come back as [`Response::Error`] carrying
    /// `<ErrorKind>: <message>`.
    pub fn execute(&mut self, request: Request) -> Response {
        match self.run(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "command failed");
                Response::Error(format!("{}: {}", e.kind(), e))
            }
        }
    }

    fn run(&mut self, request: Request) -> CollectionResult<Response> {
        let storage = &mut self.storage;
        let response = match request {
            Request::List => Response::Collections(storage.catalog().collections().clone()),

            Request::ItemCreate { name } => {
                item::create(storage, &name)?;
                Response::Ok
            }
            Request::ItemDrop { name } => {
                item::drop(storage, &name)?;
                Response::Ok
            }
            Request::ItemGet { name } => Response::Bytes(item::get(storage, &name)?),
            Request::ItemSet { name, value } => {
                item::set(storage, &name, &value)?;
                Response::Ok
            }

            Request::HashCreate { name } => {
                self.hashes.create(storage, &name)?;
                Response::Ok
            }
            Request::HashDrop { name } => {
                self.hashes.drop(storage, &name)?;
                Response::Ok
            }
            Request::HashGet { name, key } => {
                Response::OptionalBytes(self.hashes.get(storage, &name, &key)?)
            }
            Request::HashSet { name, key, value } => {
                self.hashes.set(storage, &name, &key, &value)?;
                Response::Ok
            }
            Request::HashDelete { name, key } => {
                self.hashes.remove(storage, &name, &key)?;
                Response::Ok
            }
            Request::HashSize { name } => Response::Size(self.hashes.size(storage, &name)?),
            Request::HashIter { name } => Response::Iter(self.hashes.iter(storage, &name)?),
            Request::HashIterNext { iter } => Response::Pair(self.hashes.iter_next(storage, &iter)?),
            Request::HashIterBreak { iter } => {
                self.hashes.iter_break(&iter)?;
                Response::Ok
            }

            Request::ListCreate { name } => {
                self.lists.create(storage, &name)?;
                Response::Ok
            }
            Request::ListDrop { name } => {
                self.lists.drop(storage, &name)?;
                Response::Ok
            }
            Request::ListGet { name, index } => Response::Bytes(self.lists.get(storage, &name, index)?),
            Request::ListSet { name, index, value } => {
                self.lists.set(storage, &name, index, &value)?;
                Response::Ok
            }
            Request::ListInsert { name, index, value } => {
                self.lists.insert(storage, &name, index, &value)?;
                Response::Ok
            }
            Request::ListDelete { name, index } => {
                Response::Bytes(self.lists.remove(storage, &name, index)?)
            }
            Request::ListSize { name } => Response::Size(self.lists.size(storage, &name)?),
            Request::ListIter { name, start, end } => {
                Response::Iter(self.lists.iter(storage, &name, start, end)?)
            }
            Request::ListIterNext { iter } => {
                Response::OptionalBytes(self.lists.iter_next(storage, &iter)?)
            }
            Request::ListIterBreak { iter } => {
                self.lists.iter_break(&iter)?;
                Response::Ok
            }

            Request::SortedCreate { name } => {
                self.sorted.create(storage, &name)?;
                Response::Ok
            }
            Request::SortedDrop { name } => {
                self.sorted.drop(storage, &name)?;
                Response::Ok
            }
            Request::SortedGet { name, key } => Response::Pairs(self.sorted.get(storage, &name, &key)?),
            Request::SortedInsert { name, key, value } => {
                self.sorted.insert(storage, &name, &key, &value)?;
                Response::Ok
            }
            Request::SortedDelete { name, key } => {
                self.sorted.remove(storage, &name, &key)?;
                Response::Ok
            }
            Request::SortedSize { name } => Response::Size(self.sorted.size(storage, &name)?),
            Request::SortedIter {
                name,
                start,
                end,
                inclusive,
            } => Response::Iter(self.sorted.iter(
                storage,
                &name,
                start.as_deref(),
                end.as_deref(),
                inclusive,
            )?),
            Request::SortedIterNext { iter } => {
                Response::SortedPair(self.sorted.iter_next(storage, &iter)?)
            }
            Request::SortedIterBreak { iter } => {
                self.sorted.iter_break(&iter)?;
                Response::Ok
            }
        };
        Ok(response)
    }

    /// Flush every page, unmap and close every file
    pub fn shutdown(&mut self) -> CollectionResult<()> {
        info!("shutting down database");
        self.storage.shutdown()
    }
}

#[cfg(test)]
mod tests;
