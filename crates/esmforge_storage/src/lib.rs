//! Storage for build artefacts and their metadata records.
//!
//! Artefacts are content-addressed by identity path and never rewritten
//! after creation; metadata keys mirror artefact paths so a single prefix
//! delete purges both stores.

pub mod file_store;
pub mod kv;
pub mod local;
pub mod memory;

pub use file_store::{FileStat, FileStore, FileStoreRef, MockFileStore};
pub use kv::{KvStore, KvStoreRef, LocalKvStore, MemoryKvStore, MockKvStore};
pub use local::LocalFileStore;
pub use memory::MemoryFileStore;
