//! Everything that talks to the package ecosystem: registry metadata,
//! version resolution, source installation, and CJS export analysis.

pub mod analyzer;
pub mod github;
pub mod installer;
pub mod manifest;
pub mod npmrc;
pub mod registry;

pub use analyzer::{CjsAnalysis, ExportAnalyzer, ExportAnalyzerRef, MockExportAnalyzer, NodeExportAnalyzer};
pub use installer::{Installer, MockPackageInstaller, PackageInstaller, PackageInstallerRef};
pub use manifest::{BrowserReplacement, PackageManifest, Packument, SideEffects};
pub use npmrc::{NpmRc, RegistryAuth};
pub use registry::{MockPackageRegistry, PackageRegistry, PackageRegistryRef, RegistryClient};
