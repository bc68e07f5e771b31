use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::file_store::validate_key;
use crate::file_store::FileStat;
use crate::file_store::FileStore;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Local-filesystem driver rooted at a directory.
///
/// Writes go through a temp file in the destination directory followed by a
/// rename, which is atomic on the same filesystem.
#[derive(Debug)]
pub struct LocalFileStore {
  root: PathBuf,
}

impl LocalFileStore {
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

impl FileStore for LocalFileStore {
  fn stat(&self, path: &str) -> io::Result<FileStat> {
    let meta = fs::metadata(self.resolve(path)?)?;
    if !meta.is_file() {
      return Err(io::Error::new(io::ErrorKind::NotFound, path));
    }
    Ok(FileStat {
      size: meta.len(),
      modified: meta.modified()?,
    })
  }

  fn read(&self, path: &str) -> io::Result<Vec<u8>> {
    fs::read(self.resolve(path)?)
  }

  fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
    let target = self.resolve(path)?;
    let dir = target
      .parent()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, path))?;
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
      ".{}.{}.tmp",
      target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default(),
      TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    ));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &target)
  }

  fn remove(&self, path: &str) -> io::Result<()> {
    match fs::remove_file(self.resolve(path)?) {
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
      other => other,
    }
  }

  fn remove_prefix(&self, prefix: &str) -> io::Result<Vec<String>> {
    let mut removed = Vec::new();
    collect_files(&self.root, &self.root, &mut |key, full_path| {
      if key.starts_with(prefix) {
        fs::remove_file(full_path)?;
        removed.push(key.to_string());
      }
      Ok(())
    })?;
    removed.sort();
    Ok(removed)
  }
}

fn collect_files(
  root: &Path,
  dir: &Path,
  visit: &mut impl FnMut(&str, &Path) -> io::Result<()>,
) -> io::Result<()> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(err) => return Err(err),
  };
  for entry in entries {
    let entry = entry?;
    let path = entry.path();
    if entry.file_type()?.is_dir() {
      collect_files(root, &path, visit)?;
    } else {
      let key = path
        .strip_prefix(root)
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "path escaped store root"))?
        .to_string_lossy()
        .replace('\\', "/");
      visit(&key, &path)?;
    }
  }
  Ok(())
}
