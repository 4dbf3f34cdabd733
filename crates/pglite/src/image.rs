//! One-time extraction of the guest filesystem image.

use std::{
    fs,
    io::{self, Read, Write as _},
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Data directory version file, relative to the working directory. Present
/// once the image has been extracted.
pub const MARKER: &str = "tmp/pglite/base/PG_VERSION";

/// Guest binary inside the extracted image.
pub const GUEST_BINARY: &str = "tmp/pglite/bin/postgres.wasi";

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// The marker file existed; nothing was touched.
    AlreadyPresent,
    /// The archive was unpacked.
    Extracted { entries: usize },
}

/// Guarded extraction of a compressed image into a destination root.
#[derive(Debug, Clone)]
pub struct ImageMaterializer {
    marker: PathBuf,
    dest_root: PathBuf,
}

impl ImageMaterializer {
    /// Materializer for `dest_root` guarded by the default [`MARKER`].
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        let dest_root = dest_root.into();
        Self {
            marker: dest_root.join(MARKER),
            dest_root,
        }
    }

    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    pub fn is_materialized(&self) -> bool {
        self.marker.exists()
    }

    /// # Errors
    /// See [`ensure_image`].
    pub fn ensure(&self, archive: &[u8]) -> Result<Materialized> {
        ensure_image(&self.marker, archive, &self.dest_root)
    }
}

/// Unpack the gzip-compressed tar `archive` under `dest_root` unless `marker`
/// already exists.
///
/// Entries are applied in stream order. Callers must not run two extractions
/// against the same `dest_root` at once.
///
/// # Errors
/// - [`Error::CorruptArchive`] if the gzip or tar stream cannot be read.
/// - [`Error::UnsupportedEntryKind`] for entries other than directories,
///   regular files and symlinks. No later entries are applied.
/// - [`Error::UnsafeEntryPath`] for absolute paths or paths containing `..`.
/// - [`Error::ExtractionFailed`] when writing to disk fails.
pub fn ensure_image(marker: &Path, archive: &[u8], dest_root: &Path) -> Result<Materialized> {
    if marker.exists() {
        debug!(marker = %marker.display(), "guest image already present");
        return Ok(Materialized::AlreadyPresent);
    }

    info!(dest = %dest_root.display(), "extracting guest image");
    let entries = extract(archive, dest_root)?;
    info!(entries, "guest image extracted");
    Ok(Materialized::Extracted { entries })
}

fn extract(archive: &[u8], dest_root: &Path) -> Result<usize> {
    let mut archive = Archive::new(GzDecoder::new(archive));
    let mut buf = vec![0; COPY_CHUNK];
    let mut count = 0;

    for entry in archive.entries().map_err(Error::CorruptArchive)? {
        let mut entry = entry.map_err(Error::CorruptArchive)?;
        let name = entry.path().map_err(Error::CorruptArchive)?.into_owned();
        let rel = relative_entry_path(&name)?;
        reject_symlinked_parent(dest_root, &rel, &name)?;
        let dest = dest_root.join(rel);
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Directory => {
                let mode = entry.header().mode().map_err(Error::CorruptArchive)?;
                create_dir(&dest, mode)?;
            }
            EntryType::Regular => write_file(&dest, &mut entry, &mut buf)?,
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(Error::CorruptArchive)?
                    .ok_or_else(|| {
                        Error::CorruptArchive(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("symlink without target: {}", name.display()),
                        ))
                    })?
                    .into_owned();
                create_symlink(&target, &dest)?;
            }
            other => {
                return Err(Error::UnsupportedEntryKind {
                    kind: char::from(other.as_byte()),
                    path: name,
                });
            }
        }
        count += 1;
    }

    Ok(count)
}

fn relative_entry_path(name: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafeEntryPath {
                    path: name.to_path_buf(),
                });
            }
        }
    }
    Ok(out)
}

/// Fail if a directory on the way from `dest_root` to `rel` is a symlink, so
/// an earlier link entry cannot redirect later writes out of the root.
fn reject_symlinked_parent(dest_root: &Path, rel: &Path, name: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = dest_root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match current.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::UnsafeEntryPath {
                    path: name.to_path_buf(),
                });
            }
            Ok(_) => {}
            // Nothing below a missing directory can be a link yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(extraction_failed(&current)(e)),
        }
    }
    Ok(())
}

fn extraction_failed(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::ExtractionFailed {
        path: path.to_path_buf(),
        source,
    }
}

fn create_dir(dest: &Path, mode: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        builder.mode(mode & 0o7777);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dest).map_err(extraction_failed(dest))
}

fn create_parent(dest: &Path) -> Result<()> {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(extraction_failed(parent))
        }
        _ => Ok(()),
    }
}

fn write_file(dest: &Path, content: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    create_parent(dest)?;
    let mut file = fs::File::create(dest).map_err(extraction_failed(dest))?;
    loop {
        let n = match content.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::CorruptArchive(e)),
        };
        file.write_all(&buf[..n]).map_err(extraction_failed(dest))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, dest: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;

    create_parent(dest)?;
    match symlink(target, dest) {
        Ok(()) => Ok(()),
        // Left behind by an extraction that stopped before the marker was
        // written.
        Err(e)
            if e.kind() == io::ErrorKind::AlreadyExists
                && dest
                    .symlink_metadata()
                    .is_ok_and(|m| m.file_type().is_symlink()) =>
        {
            fs::remove_file(dest).map_err(extraction_failed(dest))?;
            symlink(target, dest).map_err(extraction_failed(dest))
        }
        Err(e) => Err(extraction_failed(dest)(e)),
    }
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, dest: &Path) -> Result<()> {
    Err(Error::UnsupportedEntryKind {
        kind: char::from(EntryType::Symlink.as_byte()),
        path: dest.to_path_buf(),
    })
}
