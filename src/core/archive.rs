//! ROM archive expansion into self-removing scratch directories

use crate::core::error::{FlashError, Precondition, Result};
use flate2::read::GzDecoder;
use log::{debug, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// How a flash source on disk should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    Zip,
    TarGz,
    /// A plain file (image or payload)
    File,
}

impl SourceKind {
    /// Classify by file name; directories are checked on disk
    pub fn detect(path: &Path) -> Self {
        if path.is_dir() {
            return SourceKind::Directory;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            SourceKind::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            SourceKind::TarGz
        } else {
            SourceKind::File
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, SourceKind::Zip | SourceKind::TarGz)
    }
}

/// Extension of a file for error messages (`.tar.gz` kept whole)
pub fn display_extension(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match name.find('.') {
        Some(idx) => name[idx..].to_string(),
        None => name,
    }
}

/// Archive file name minus its archive extension
pub fn archive_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let lower = name.to_ascii_lowercase();
    for ext in [".tar.gz", ".tgz", ".zip"] {
        if lower.ends_with(ext) {
            return name[..name.len() - ext.len()].to_string();
        }
    }
    name
}

/// Directory that is removed when dropped, success or failure
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<parent>/<name>`, replacing any leftover from an earlier run
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = parent.join(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        debug!("Created scratch directory {}", path.display());
        Ok(Self { path })
    }

    /// Scratch directory keyed by an archive's base name
    pub fn for_archive(parent: &Path, archive: &Path) -> Result<Self> {
        Self::create(parent, &archive_stem(archive))
    }

    /// `<prefix>_<pid>`, so a concurrent run never clears this one's output
    pub fn unique(parent: &Path, prefix: &str) -> Result<Self> {
        Self::create(parent, &format!("{}_{}", prefix, std::process::id()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", self.path.display(), e);
            }
        } else {
            debug!("Removed scratch directory {}", self.path.display());
        }
    }
}

/// One extracted member, for progress display
#[derive(Debug, Clone)]
pub struct ExtractProgress {
    /// 1-based index of this member
    pub current: usize,
    /// Member count when known up front (zip), else 0
    pub total: usize,
    pub name: String,
}

fn archive_error(path: &Path, message: impl ToString) -> FlashError {
    FlashError::Archive {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Expand a `.zip` or `.tar.gz`/`.tgz` into `dest`. Returns the member count.
///
/// Unsupported extensions fail before anything is read.
pub fn extract(
    archive: &Path,
    dest: &Path,
    on_member: &mut dyn FnMut(ExtractProgress),
) -> Result<usize> {
    match SourceKind::detect(archive) {
        SourceKind::Zip => extract_zip(archive, dest, on_member),
        SourceKind::TarGz => extract_tar_gz(archive, dest, on_member),
        _ => Err(FlashError::precondition(Precondition::UnsupportedArchive(
            display_extension(archive),
        ))),
    }
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    on_member: &mut dyn FnMut(ExtractProgress),
) -> Result<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_error(archive, e))?;
    let total = zip.len();

    for index in 0..total {
        let mut member = zip.by_index(index).map_err(|e| archive_error(archive, e))?;
        // Members escaping the destination are skipped
        let relative = match member.enclosed_name() {
            Some(path) => path,
            None => {
                warn!("Skipping unsafe archive member {}", member.name());
                continue;
            }
        };
        let out_path = dest.join(&relative);

        if member.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut member, &mut out)?;
        }

        on_member(ExtractProgress {
            current: index + 1,
            total,
            name: relative.display().to_string(),
        });
    }

    Ok(total)
}

fn extract_tar_gz(
    archive: &Path,
    dest: &Path,
    on_member: &mut dyn FnMut(ExtractProgress),
) -> Result<usize> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut count = 0;

    for entry in tar.entries().map_err(|e| archive_error(archive, e))? {
        let mut entry = entry.map_err(|e| archive_error(archive, e))?;
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if !entry.unpack_in(dest).map_err(|e| archive_error(archive, e))? {
            warn!("Skipping unsafe archive member {}", name);
            continue;
        }
        count += 1;
        on_member(ExtractProgress {
            current: count,
            total: 0,
            name,
        });
    }

    Ok(count)
}

/// Pack `dir` into `<dir>.tar.gz` next to it. Returns the archive path.
pub fn compress_dir(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| archive_error(dir, "directory has no name"))?;
    let target = dir.with_file_name(format!("{}.tar.gz", name));

    let file = File::create(&target)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(&name, dir)
        .map_err(|e| archive_error(dir, e))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| archive_error(&target, e))?;

    Ok(target)
}

/// All `.img` files under `dir`, sorted by path
pub fn find_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case("img"))
                .unwrap_or(false)
        })
        .collect();
    images.sort();
    images
}

/// Partition name inferred from an image file (file name minus extension)
pub fn partition_name(image: &Path) -> String {
    image
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
