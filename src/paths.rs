//! Path normalization and archive-layout helpers.
use std::path::{Path, PathBuf};

/// Normalizes a path to the form stored in the database: forward slashes, no trailing slash.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> String {
    let s = path.as_ref().to_string_lossy().replace('\\', "/");
    if s.len() > 1 {
        s.trim_end_matches('/').to_string()
    } else {
        s
    }
}

/// Absolute, symlink-free form of an existing project root, so `.` and its absolute
/// spelling name the same project. A root that does not exist yet is made absolute
/// against the current directory.
pub fn canonical_root(root: &Path) -> PathBuf {
    match std::fs::canonicalize(root) {
        Ok(path) => path,
        Err(_) if root.is_relative() => std::env::current_dir()
            .map(|cwd| cwd.join(root))
            .unwrap_or_else(|_| root.to_path_buf()),
        Err(_) => root.to_path_buf(),
    }
}

/// Path of `path` relative to `root`; falls back to the file name when `path` is outside `root`.
pub fn relative_to(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf()),
    }
}

/// Archive location for a live file: `version_dir` mirrors the project-relative path.
pub fn archive_path(version_dir: &Path, project_root: &Path, live_path: &Path) -> PathBuf {
    version_dir.join(relative_to(project_root, live_path))
}

pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}

/// Moves a file, falling back to copy + remove when a plain rename is not possible.
pub fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}
