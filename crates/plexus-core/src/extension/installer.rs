//! Extension package unpacking.
//!
//! Packages are `.zip`, `.tgz`/`.tar.gz` or `.tar.zst` archives. Contents may
//! be wrapped in a single top directory (npm packs into `package/`). The
//! package root must hold a `manifest.json`, or a `package.json` whose
//! `main` names the entrypoint and whose `plexus` section declares the
//! capability type and activation points.
//!
//! Installation is two-phase: [`stage`] unpacks into a hidden directory
//! inside the extensions directory and validates the manifest, [`commit`]
//! moves the staged root into `<extensions_dir>/<folder>` with a rename.
//! A failed stage leaves nothing behind.

use super::manifest::{is_single_component, ActivationPoint, CapabilityType, ExtensionManifest};
use crate::config::PathsConfig;
use crate::error::{PlexusError, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Prefix of staging directories; skipped when scanning.
pub const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageFormat {
    Zip,
    TarGz,
    TarZst,
}

impl PackageFormat {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(PackageFormat::Zip)
        } else if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
            Some(PackageFormat::TarGz)
        } else if name.ends_with(".tar.zst") {
            Some(PackageFormat::TarZst)
        } else {
            None
        }
    }
}

/// An unpacked, validated package waiting to be committed.
pub struct StagedPackage {
    pub manifest: ExtensionManifest,
    root: PathBuf,
    // Removed on drop, together with anything not committed.
    _staging: TempDir,
}

/// npm-style `package.json`.
#[derive(Debug, Deserialize)]
struct PackageJson {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    plexus: PackageExtras,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageExtras {
    #[serde(default)]
    entrypoint: Option<String>,
    #[serde(default)]
    capability_type: Option<CapabilityType>,
    #[serde(default)]
    activation_points: Vec<ActivationPoint>,
}

impl From<PackageJson> for ExtensionManifest {
    fn from(pkg: PackageJson) -> Self {
        ExtensionManifest {
            name: pkg.name,
            version: pkg.version,
            description: pkg.description,
            entrypoint: pkg.plexus.entrypoint.or(pkg.main).unwrap_or_default(),
            capability_type: pkg.plexus.capability_type,
            activation_points: pkg.plexus.activation_points,
        }
    }
}

/// Name to report for a package whose manifest could not be read.
pub fn package_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    for suffix in [".tar.gz", ".tar.zst", ".tgz", ".zip"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    name
}

/// Unpack and validate `package` inside `extensions_dir`.
pub fn stage(package: &Path, extensions_dir: &Path) -> Result<StagedPackage> {
    let format = PackageFormat::detect(package).ok_or_else(|| PlexusError::InstallationFailed {
        message: format!("unsupported package format: {}", package.display()),
    })?;

    fs::create_dir_all(extensions_dir).map_err(|e| PlexusError::io_with_path(e, extensions_dir))?;
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(extensions_dir)
        .map_err(|e| PlexusError::io_with_path(e, extensions_dir))?;
    let unpacked = staging.path().join("unpacked");
    fs::create_dir_all(&unpacked).map_err(|e| PlexusError::io_with_path(e, &unpacked))?;

    debug!("Unpacking {} ({:?})", package.display(), format);
    match format {
        PackageFormat::Zip => extract_zip(package, &unpacked)?,
        PackageFormat::TarGz => {
            let file = open(package)?;
            let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
            unpack_tar(tar::Archive::new(decoder), &unpacked)?
        }
        PackageFormat::TarZst => {
            let file = open(package)?;
            let decoder = zstd::Decoder::new(BufReader::new(file)).map_err(|e| {
                PlexusError::InstallationFailed {
                    message: format!("invalid zstd stream: {}", e),
                }
            })?;
            unpack_tar(tar::Archive::new(decoder), &unpacked)?
        }
    }

    let root = package_root(&unpacked)?;
    let manifest = read_package_manifest(&root)?;
    manifest.validate()?;
    manifest.write_to(&root)?;

    Ok(StagedPackage {
        manifest,
        root,
        _staging: staging,
    })
}

/// Move a staged package into `<extensions_dir>/<folder>`, replacing any
/// previous install of the same extension.
pub fn commit(staged: StagedPackage, extensions_dir: &Path) -> Result<(ExtensionManifest, PathBuf)> {
    let folder = staged.manifest.folder_name();
    let target = extensions_dir.join(&folder);
    if !is_single_component(&folder) || target.parent() != Some(extensions_dir) {
        return Err(PlexusError::InstallationFailed {
            message: format!("refusing to install {} outside {}", staged.manifest.name, extensions_dir.display()),
        });
    }
    if target.exists() {
        debug!("Replacing existing install at {}", target.display());
        fs::remove_dir_all(&target).map_err(|e| PlexusError::io_with_path(e, &target))?;
    }
    fs::rename(&staged.root, &target).map_err(|e| PlexusError::io_with_path(e, &target))?;

    info!(
        "Installed {} {} into {}",
        staged.manifest.name,
        staged.manifest.version,
        target.display()
    );
    Ok((staged.manifest, target))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| PlexusError::io_with_path(e, path))
}

fn extract_zip(package: &Path, dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(open(package)?).map_err(|e| PlexusError::InstallationFailed {
        message: format!("invalid zip archive: {}", e),
    })?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| PlexusError::InstallationFailed {
            message: format!("failed to read zip entry {}: {}", i, e),
        })?;

        // Entries escaping the destination are dropped.
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let outpath = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| PlexusError::io_with_path(e, &outpath))?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| PlexusError::io_with_path(e, parent))?;
        }
        let mut outfile = File::create(&outpath).map_err(|e| PlexusError::io_with_path(e, &outpath))?;
        std::io::copy(&mut entry, &mut outfile).map_err(|e| PlexusError::io_with_path(e, &outpath))?;
    }
    Ok(())
}

fn unpack_tar<R: std::io::Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    archive.unpack(dest).map_err(|e| PlexusError::InstallationFailed {
        message: format!("failed to extract archive: {}", e),
    })
}

/// The unpacked directory itself, or its only child directory when the
/// archive wraps everything in one folder.
fn package_root(unpacked: &Path) -> Result<PathBuf> {
    if unpacked.join(PathsConfig::MANIFEST_FILE_NAME).is_file() || unpacked.join("package.json").is_file() {
        return Ok(unpacked.to_path_buf());
    }

    let entries: Vec<_> = fs::read_dir(unpacked)
        .map_err(|e| PlexusError::io_with_path(e, unpacked))?
        .filter_map(|e| e.ok())
        .collect();

    match entries.as_slice() {
        [only] if only.path().is_dir() => Ok(only.path()),
        _ => Ok(unpacked.to_path_buf()),
    }
}

fn read_package_manifest(root: &Path) -> Result<ExtensionManifest> {
    let manifest_path = root.join(PathsConfig::MANIFEST_FILE_NAME);
    if manifest_path.is_file() {
        let raw = fs::read_to_string(&manifest_path).map_err(|e| PlexusError::io_with_path(e, &manifest_path))?;
        return serde_json::from_str(&raw).map_err(|e| PlexusError::InvalidManifest {
            message: format!("{}: {}", PathsConfig::MANIFEST_FILE_NAME, e),
        });
    }

    let package_path = root.join("package.json");
    if package_path.is_file() {
        let raw = fs::read_to_string(&package_path).map_err(|e| PlexusError::io_with_path(e, &package_path))?;
        let pkg: PackageJson = serde_json::from_str(&raw).map_err(|e| PlexusError::InvalidManifest {
            message: format!("package.json: {}", e),
        })?;
        return Ok(pkg.into());
    }

    Err(PlexusError::InvalidManifest {
        message: "package contains neither manifest.json nor package.json".into(),
    })
}
