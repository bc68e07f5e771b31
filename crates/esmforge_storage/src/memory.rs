use std::collections::BTreeMap;
use std::io;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::file_store::validate_key;
use crate::file_store::FileStat;
use crate::file_store::FileStore;

/// In-memory driver for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
  files: RwLock<BTreeMap<String, (Vec<u8>, SystemTime)>>,
}

impl MemoryFileStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl FileStore for MemoryFileStore {
  fn stat(&self, path: &str) -> io::Result<FileStat> {
    validate_key(path)?;
    let files = self.files.read();
    let (data, modified) = files
      .get(path)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path))?;
    Ok(FileStat {
      size: data.len() as u64,
      modified: *modified,
    })
  }

  fn read(&self, path: &str) -> io::Result<Vec<u8>> {
    validate_key(path)?;
    self
      .files
      .read()
      .get(path)
      .map(|(data, _)| data.clone())
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path))
  }

  fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
    validate_key(path)?;
    self
      .files
      .write()
      .insert(path.to_string(), (data.to_vec(), SystemTime::now()));
    Ok(())
  }

  fn remove(&self, path: &str) -> io::Result<()> {
    validate_key(path)?;
    self.files.write().remove(path);
    Ok(())
  }

  fn remove_prefix(&self, prefix: &str) -> io::Result<Vec<String>> {
    let mut files = self.files.write();
    let keys: Vec<String> = files
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();
    for key in &keys {
      files.remove(key);
    }
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn behaves_like_the_local_driver() {
    let store = MemoryFileStore::new();
    store.write("builds/v2/a.mjs", b"a").unwrap();
    store.write("builds/v2/a.mjs.map", b"m").unwrap();
    store.write("builds/v2/b.mjs", b"b").unwrap();

    assert_eq!(store.read("builds/v2/a.mjs").unwrap(), b"a");
    assert_eq!(store.stat("builds/v2/b.mjs").unwrap().size, 1);
    assert_eq!(
      store.remove_prefix("builds/v2/a.mjs").unwrap(),
      vec!["builds/v2/a.mjs".to_string(), "builds/v2/a.mjs.map".to_string()]
    );
    assert_eq!(
      store.stat("builds/v2/a.mjs").unwrap_err().kind(),
      io::ErrorKind::NotFound
    );
  }
}
