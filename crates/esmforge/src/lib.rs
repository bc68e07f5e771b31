//! esmforge: a transforming CDN for registry packages.
//!
//! A request names a package at a version with build modifiers; the response
//! is a browser-ready ES module whose unresolved imports have been rewritten
//! into further URLs on this same CDN. The heart of the system is the build
//! pipeline: URL → canonical build identity → single-flight build job →
//! persisted artefact.

pub mod build;
pub mod bundler;
pub mod config;
pub mod dts;
pub mod queue;
pub mod router;
pub mod state;

pub use config::Config;
pub use state::AppState;
