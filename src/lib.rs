pub mod catalog;
pub mod client;
pub mod codec;
pub mod collections;
pub mod database;
pub mod file;
pub mod iterator;
pub mod protocol;
pub mod server;

pub use catalog::{Catalog, CatalogError, CollectionKind};
pub use client::{Client, ClientError, ClientResult};
pub use collections::{CollectionError, CollectionResult, Key, KeyElement, Storage};
pub use database::{Database, DatabaseConfig};
pub use file::{DEFAULT_CACHE_PAGES, FileError, PAGE_SIZE, PageCache, PageId, PagedFileManager};
pub use iterator::{IterHandle, IteratorRegistry};
pub use protocol::{ProtocolError, Request, Response};
pub use server::{ServerError, ServerHandle};
