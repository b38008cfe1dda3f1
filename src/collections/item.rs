//! A named slot holding a single byte value.
//!
//! The value lives in `<name>.item`, written whole on every `set`. The file
//! does not exist until the first `set`.

use crate::catalog::CollectionKind;
use crate::codec::{Decoder, Encoder};
use crate::file::FileError;

use super::{CollectionError, CollectionResult, Storage};

pub fn create(storage: &mut Storage, name: &str) -> CollectionResult<()> {
    storage.check_new_name(name)?;
    storage.catalog.add(name, CollectionKind::Item)?;
    Ok(())
}

pub fn drop(storage: &mut Storage, name: &str) -> CollectionResult<()> {
    storage.catalog.check(name, CollectionKind::Item)?;
    let path = storage.path(name, CollectionKind::Item, None);
    match storage.cache.remove_file(&path) {
        Ok(()) | Err(FileError::FileNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    storage.catalog.remove(name)?;
    Ok(())
}

pub fn get(storage: &mut Storage, name: &str) -> CollectionResult<Vec<u8>> {
    storage.catalog.check(name, CollectionKind::Item)?;
    let path = storage.path(name, CollectionKind::Item, None);
    let contents = match storage.cache.get_file(&path, 0, None) {
        Ok(contents) => contents,
        Err(FileError::FileNotFound(_)) => return Err(CollectionError::ItemNotSet(name.to_string())),
        Err(e) => return Err(e.into()),
    };
    Ok(Decoder::new(&contents).get_bytes()?)
}

pub fn set(storage: &mut Storage, name: &str, value: &[u8]) -> CollectionResult<()> {
    storage.catalog.check(name, CollectionKind::Item)?;
    let path = storage.path(name, CollectionKind::Item, None);
    let mut encoder = Encoder::new();
    encoder.put_bytes(value);
    storage.cache.set_file(&path, &encoder.finish())?;
    Ok(())
}
