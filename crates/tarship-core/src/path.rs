//! Path validation and remote path helpers
//!
//! Local paths are `std::path` values. Remote paths are always slash-separated
//! strings, whatever platform the client runs on, because they are interpreted
//! by the session on the far side.

use crate::error::ProtocolError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolve a slash-separated relative path inside a base directory.
///
/// Rejects absolute paths, `..` components, null bytes and over-long names.
/// Works on paths that do not exist yet; symlinks are not followed.
pub fn safe_path(base: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    if relative.contains('\0') {
        return Err(ProtocolError::InvalidPath("path contains null byte".into()));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(ProtocolError::InvalidPath(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let relative_path = Path::new(relative);

    if relative_path.is_absolute() {
        return Err(ProtocolError::InvalidPath(
            "absolute paths not allowed".into(),
        ));
    }

    let mut result = base.to_path_buf();

    for component in relative_path.components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::InvalidPath(format!(
                        "filename too long: {} bytes (max {})",
                        name_str.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::ParentDir => {
                return Err(ProtocolError::InvalidPath(
                    "parent directory (..) not allowed".into(),
                ));
            }
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir => {
                return Err(ProtocolError::InvalidPath(
                    "rooted paths not allowed".into(),
                ));
            }
        }
    }

    if !result.starts_with(base) {
        return Err(ProtocolError::InvalidPath(
            "path escapes base directory".into(),
        ));
    }

    Ok(result)
}

/// Resolve a remote path (as sent by a client) inside the served root.
///
/// Leading slashes are treated as relative to the root, so `/backups/a.tar`
/// and `backups/a.tar` name the same file.
pub fn resolve_in_root(root: &Path, remote: &str) -> Result<PathBuf, ProtocolError> {
    safe_path(root, remote.trim_start_matches('/'))
}

/// Resolve a remote path inside `root` and check that the directories on
/// the way don't lead out of it through symlinks already on disk.
///
/// `root` must be canonical. The parent of the target must exist. The final
/// component is not resolved, so it may itself be a symlink; callers that
/// open the target use [`refuse_symlink`] as well.
pub fn confine(root: &Path, remote: &str) -> io::Result<PathBuf> {
    let lexical = resolve_in_root(root, remote)?;
    let (Some(parent), Some(name)) = (lexical.parent(), lexical.file_name()) else {
        return Ok(lexical);
    };
    if lexical == root {
        return Ok(lexical);
    }

    let real_parent = parent.canonicalize()?;
    if !real_parent.starts_with(root) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} leads outside the served root", remote),
        ));
    }
    Ok(real_parent.join(name))
}

/// Fail if `path` exists and is a symlink
pub fn refuse_symlink(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} is a symlink", path.display()),
        )),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Convert an archive entry path into normalized slash-separated components.
///
/// Entry paths come from untrusted archives; anything that could land
/// outside the extraction directory is rejected. Returns `None` for paths
/// that name the archive root itself (`.` or empty).
pub fn entry_relative_path(path: &Path) -> Result<Option<String>, ProtocolError> {
    let mut parts: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Normal(name) => {
                let name = name.to_str().ok_or_else(|| {
                    ProtocolError::InvalidPath(format!("non UTF-8 entry name: {:?}", name))
                })?;
                if name.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::InvalidPath(format!(
                        "filename too long: {} bytes (max {})",
                        name.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                parts.push(name.to_string());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ProtocolError::InvalidPath(format!(
                    "entry escapes destination: {}",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ProtocolError::InvalidPath(format!(
                    "absolute entry path: {}",
                    path.display()
                )));
            }
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// Join a remote directory and a slash-separated relative path
pub fn join_remote(base: &str, relative: &str) -> String {
    let absolute = base.starts_with('/');
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if base.is_empty() {
        if absolute {
            format!("/{}", relative)
        } else {
            relative.to_string()
        }
    } else if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Parent of a remote path, if any
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Render a local path as a remote (slash-separated) path
pub fn to_remote(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            Component::Normal(name) => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&name.to_string_lossy());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str("..");
            }
            Component::Prefix(p) => out.push_str(&p.as_os_str().to_string_lossy()),
        }
    }
    out
}
