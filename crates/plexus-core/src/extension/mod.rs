//! Extension packages: manifests, installation, loading and the catalog.
//!
//! An extension is a folder under `<data_dir>/extensions/` containing a
//! `manifest.json`, or a built-in compiled into the runtime. Active
//! extensions contribute service handlers during `onLoad`.

pub mod builtin;
mod installer;
mod loader;
mod manifest;
mod registry;

pub use installer::{package_stem, STAGING_PREFIX};
pub use loader::{BuiltinLoader, Extension, ExtensionContext, ExtensionLoader, BUILTIN_SCHEME};
pub use manifest::{
    ActivationPoint, CapabilityType, ExtensionManifest, ExtensionRecord, InstallReport,
    InstallationState,
};
pub use registry::ExtensionRegistry;
