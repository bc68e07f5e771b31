pub mod build_args;
pub mod build_result;
pub mod pkg;
pub mod target;

pub use build_args::BuildArgs;
pub use build_result::BuildResult;
pub use pkg::{is_commitish, is_full_version, to_module_bare_name, Pkg, PkgOrigin, PkgRequest};
pub use target::{target_from_ua, Target};
