pub mod args;
pub mod error;
pub mod hash;
pub mod identity;
pub mod types;

pub use args::{decode_args_prefix, encode_args_prefix};
pub use error::{ErrorKind, ForgeError};
pub use identity::{BuildIdentity, BundleMode};
pub use types::*;
