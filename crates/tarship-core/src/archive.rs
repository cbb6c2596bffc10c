//! Archiver: directory tree → tar archive
//!
//! Packing runs in two passes. The first walks the source tree and collects
//! every entry (so the total is known up front), the second streams each
//! entry into the archive. Only one file's data is in flight at a time.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};
use crate::progress::{Progress, ProgressSink, ProgressUnit};

/// Kind of an archive entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Map a tar entry type; `None` for kinds we don't materialize
    pub fn from_tar(entry_type: tar::EntryType) -> Option<Self> {
        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => Some(EntryKind::File),
            tar::EntryType::Directory => Some(EntryKind::Directory),
            tar::EntryType::Symlink => Some(EntryKind::Symlink),
            _ => None,
        }
    }
}

/// Metadata of one archived filesystem object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Slash-separated path relative to the archive root
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub link_target: Option<String>,
}

/// Pack `source` into a tar archive at `destination`.
///
/// Emits one `Items` progress tick per entry. On failure the archive may be
/// left truncated; it is never valid to assume atomicity.
pub fn pack(source: &Path, destination: &Path, sink: &dyn ProgressSink) -> Result<PathBuf> {
    let root = match source.canonicalize() {
        Ok(root) => root,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(source.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if !root.is_dir() {
        return Err(TransferError::io(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", source.display()),
        ));
    }

    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let exclude = absolute_destination(destination);
    let entries = collect_entries(&root, exclude.as_deref())?;
    let total = entries.len() as u64;

    info!(
        "Packing {} entries from {:?} into {:?}",
        total, root, destination
    );

    let file = File::create(destination)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    let label = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pack".into());
    let mut progress = Progress::new(sink, label, ProgressUnit::Items, Some(total));

    for path in &entries {
        let relative = path.strip_prefix(&root).map_err(|_| {
            TransferError::io(
                io::ErrorKind::Other,
                format!("{} is outside {}", path.display(), root.display()),
            )
        })?;

        builder.append_path_with_name(path, relative)?;
        debug!("archived {}", relative.display());
        progress.advance(1);
    }

    let writer = builder.into_inner()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    progress.finish();

    info!("Packed {} entries into {:?}", total, destination);
    Ok(destination.to_path_buf())
}

/// Walk `root` depth-first with siblings sorted by name.
///
/// The root itself is not an entry. Symlinks are listed, never followed.
fn collect_entries(root: &Path, exclude: Option<&Path>) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        if exclude == Some(entry.path()) {
            debug!("skipping destination archive {:?}", entry.path());
            continue;
        }
        entries.push(entry.into_path());
    }

    Ok(entries)
}

/// Best-effort absolute form of the destination, used to keep an archive
/// written inside its own source tree out of itself.
fn absolute_destination(destination: &Path) -> Option<PathBuf> {
    let name = destination.file_name()?;
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.canonicalize().ok()?,
        _ => std::env::current_dir().ok()?.canonicalize().ok()?,
    };
    Some(parent.join(name))
}

/// List the entries of a local archive without extracting anything
pub fn list(archive: &Path) -> Result<Vec<ArchiveEntry>> {
    let file = match File::open(archive) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(archive.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = tar::Archive::new(io::BufReader::new(file));
    let mut out = Vec::new();

    for entry in reader.entries().map_err(corrupt)? {
        let entry = entry.map_err(corrupt)?;
        let header = entry.header();
        let Some(kind) = EntryKind::from_tar(header.entry_type()) else {
            continue;
        };

        let path = entry.path().map_err(corrupt)?;
        let path = path.to_string_lossy().trim_end_matches('/').to_string();
        let link_target = entry
            .link_name()
            .map_err(corrupt)?
            .map(|t| t.to_string_lossy().into_owned());

        out.push(ArchiveEntry {
            path,
            kind,
            size: entry.size(),
            mode: header.mode().map_err(corrupt)?,
            link_target,
        });
    }

    Ok(out)
}

fn corrupt(e: io::Error) -> TransferError {
    TransferError::CorruptArchive(e.to_string())
}
