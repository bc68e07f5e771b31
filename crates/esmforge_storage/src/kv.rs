use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use mockall::automock;
use parking_lot::RwLock;

use crate::file_store::validate_key;

pub type KvStoreRef = Arc<dyn KvStore + Send + Sync>;

/// Metadata records co-located with the artefact store.
///
/// Keys mirror artefact paths (`builds/v2/react@18.2.0/...mjs`), so purging a
/// package is one prefix delete against each store with the same prefix.
/// `delete_prefix` returns the removed records because callers need the
/// record bodies to locate sibling files (`.map`, `.css`) for removal.
#[automock]
pub trait KvStore {
  fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
  fn put(&self, key: &str, value: &[u8]) -> io::Result<()>;
  fn delete(&self, key: &str) -> io::Result<()>;
  fn delete_prefix(&self, prefix: &str) -> io::Result<Vec<(String, Vec<u8>)>>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
  records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvStore for MemoryKvStore {
  fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
    Ok(self.records.read().get(key).cloned())
  }

  fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
    validate_key(key)?;
    self.records.write().insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> io::Result<()> {
    self.records.write().remove(key);
    Ok(())
  }

  fn delete_prefix(&self, prefix: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut records = self.records.write();
    let keys: Vec<String> = records
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();
    let mut removed = Vec::with_capacity(keys.len());
    for key in keys {
      if let Some(value) = records.remove(&key) {
        removed.push((key, value));
      }
    }
    Ok(removed)
  }
}

/// Disk-backed driver: one file per record under a root directory, the key
/// being the relative path. Suits single-node deployments; larger ones plug
/// a database behind the trait.
#[derive(Debug)]
pub struct LocalKvStore {
  root: PathBuf,
}

impl LocalKvStore {
  pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    Ok(Self { root })
  }

  fn resolve(&self, key: &str) -> io::Result<PathBuf> {
    validate_key(key)?;
    Ok(self.root.join(key))
  }
}

impl KvStore for LocalKvStore {
  fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
    match fs::read(self.resolve(key)?) {
      Ok(data) => Ok(Some(data)),
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(err) => Err(err),
    }
  }

  fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
    let path = self.resolve(key)?;
    if let Some(dir) = path.parent() {
      fs::create_dir_all(dir)?;
    }
    fs::write(path, value)
  }

  fn delete(&self, key: &str) -> io::Result<()> {
    match fs::remove_file(self.resolve(key)?) {
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
      other => other,
    }
  }

  fn delete_prefix(&self, prefix: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut removed = Vec::new();
    let mut stack = vec![self.root.clone()];
    while let Some(dir) = stack.pop() {
      let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
        Err(err) => return Err(err),
      };
      for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
          stack.push(path);
          continue;
        }
        let key = path
          .strip_prefix(&self.root)
          .map_err(|_| io::Error::new(io::ErrorKind::Other, "path escaped kv root"))?
          .to_string_lossy()
          .replace('\\', "/");
        if key.starts_with(prefix) {
          let value = fs::read(&path)?;
          fs::remove_file(&path)?;
          removed.push((key, value));
        }
      }
    }
    removed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn drivers() -> (tempfile::TempDir, Vec<KvStoreRef>) {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalKvStore::new(dir.path().join("db")).unwrap();
    (dir, vec![Arc::new(MemoryKvStore::new()), Arc::new(local)])
  }

  #[test]
  fn put_get_delete() {
    let (_dir, stores) = drivers();
    for store in stores {
      let key = "builds/v2/react@18.2.0/es2022/react.mjs";
      assert_eq!(store.get(key).unwrap(), None);
      store.put(key, br#"{"d":true}"#).unwrap();
      assert_eq!(store.get(key).unwrap().as_deref(), Some(br#"{"d":true}"#.as_ref()));
      store.delete(key).unwrap();
      assert_eq!(store.get(key).unwrap(), None);
    }
  }

  #[test]
  fn delete_prefix_returns_removed_records() {
    let (_dir, stores) = drivers();
    for store in stores {
      store.put("builds/v2/react@18.2.0/es2022/react.mjs", b"1").unwrap();
      store.put("builds/v2/react@18.2.0/es2022/jsx-runtime.mjs", b"2").unwrap();
      store.put("builds/v2/preact@10.13.0/es2022/preact.mjs", b"3").unwrap();

      let removed = store.delete_prefix("builds/v2/react@18.2.0").unwrap();
      assert_eq!(removed.len(), 2);
      assert!(removed.iter().all(|(k, _)| k.starts_with("builds/v2/react@18.2.0")));
      assert_eq!(store.get("builds/v2/preact@10.13.0/es2022/preact.mjs").unwrap().as_deref(), Some(b"3".as_ref()));
      assert!(store.delete_prefix("builds/v2/react@18.2.0").unwrap().is_empty());
    }
  }
}
