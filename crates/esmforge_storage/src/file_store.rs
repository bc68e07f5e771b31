use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use mockall::automock;

pub type FileStoreRef = Arc<dyn FileStore + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileStat {
  pub size: u64,
  pub modified: SystemTime,
}

/// Flat keyed blob storage for build artefacts.
///
/// Keys are `/`-separated relative paths (`builds/v2/react@18.2.0/...`).
/// Missing keys surface as `io::ErrorKind::NotFound`. Writes must be atomic:
/// a concurrent reader sees either the prior absence or the full file, never
/// a partial write.
#[automock]
pub trait FileStore {
  fn stat(&self, path: &str) -> io::Result<FileStat>;
  fn read(&self, path: &str) -> io::Result<Vec<u8>>;
  fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;
  fn remove(&self, path: &str) -> io::Result<()>;
  /// Remove every file under `prefix`, returning the removed keys.
  fn remove_prefix(&self, prefix: &str) -> io::Result<Vec<String>>;
}

pub(crate) fn validate_key(path: &str) -> io::Result<()> {
  if path.is_empty()
    || path.starts_with('/')
    || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
  {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("invalid storage key '{path}'"),
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_bad_keys() {
    assert!(validate_key("/absolute").is_err());
    assert!(validate_key("a//b").is_err());
    assert!(validate_key("a/../b").is_err());
    assert!(validate_key("").is_err());
    assert!(validate_key("builds/v2/react@18.2.0/es2022/react.mjs").is_ok());
  }
}
