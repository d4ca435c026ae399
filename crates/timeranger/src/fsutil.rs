//! Filesystem helpers: recursive mkdir with permissions, exclusive create,
//! persistent JSON files, and filtered ordered directory listings.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::error::Result;

/// Creates a directory (and missing parents), applying `mode` on Unix.
///
/// Existing directories are left untouched.
///
/// # Errors
///
/// Returns an error if creation fails.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    set_mode(path, mode)?;
    Ok(())
}

/// Applies Unix permission bits to a path. No-op on other platforms.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Creates a file that must not already exist, applying `mode` on Unix.
///
/// # Errors
///
/// Returns `AlreadyExists` if another process created it first.
pub fn create_exclusive(path: &Path, mode: u32) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    set_mode(path, mode)?;
    Ok(file)
}

/// Writes a JSON value to a file, pretty-printed, replacing any prior content.
///
/// # Errors
///
/// Returns an error if writing or serialization fails.
pub fn write_json(path: &Path, value: &Value, mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let body = serde_json::to_vec_pretty(value)?;
    file.write_all(&body)?;
    file.flush()?;
    set_mode(path, mode)?;
    Ok(())
}

/// Loads a JSON value from a file.
///
/// # Errors
///
/// Returns `TrError::Io` if the file cannot be read, `TrError::Json` if it
/// does not parse.
pub fn read_json(path: &Path) -> Result<Value> {
    let mut body = String::new();
    File::open(path)?.read_to_string(&mut body)?;
    Ok(serde_json::from_str(&body)?)
}

/// Lists directory entry names in lexical order, keeping only those matching
/// `filter` (when given) and, optionally, only subdirectories.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_sorted(dir: &Path, filter: Option<&Regex>, dirs_only: bool) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if dirs_only && !entry.file_type()?.is_dir() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => continue, // non-UTF-8 names are never ours
        };
        if let Some(re) = filter {
            if !re.is_match(&name) {
                continue;
            }
        }
        names.push(name);
    }
    names.sort_unstable();
    Ok(names)
}

/// Returns true if an open error means the process is out of descriptors.
pub fn is_fd_exhaustion(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EMFILE) || err.raw_os_error() == Some(libc::ENFILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn ensure_dir_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("a/b/c");
        ensure_dir(&dir, 0o755).unwrap();
        ensure_dir(&dir, 0o755).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn exclusive_create_fails_second_time() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("marker.json");
        create_exclusive(&path, 0o644).unwrap();
        assert!(create_exclusive(&path, 0o644).is_err());
    }

    #[test]
    fn json_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("v.json");
        let value = json!({"filename_mask": "%Y-%m-%d", "rpermission": 420});
        write_json(&path, &value, 0o644).unwrap();
        assert_eq!(read_json(&path).unwrap(), value);
    }

    #[test]
    fn sorted_filtered_listing() {
        let tmp = TempDir::new().unwrap();
        for name in ["2024-01-02.md2", "2024-01-01.md2", "2024-01-01.json", "x"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        let re = Regex::new(r"\.md2$").unwrap();
        let names = list_sorted(tmp.path(), Some(&re), false).unwrap();
        assert_eq!(names, vec!["2024-01-01.md2", "2024-01-02.md2"]);
    }
}
