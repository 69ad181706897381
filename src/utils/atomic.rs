//! Atomic file operations
//!
//! Collection files are rewritten with the temp-file pattern:
//!
//! 1. Write everything to `<name>.tmp`
//! 2. `sync_all()` the temp file
//! 3. Rename over the final path (atomic on POSIX filesystems)
//!
//! A crash leaves either the previous file or the new one, never a torn write.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const TEMP_SUFFIX: &str = "tmp";

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Atomically replace `path` with whatever `write_fn` writes
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = temp_path_for(path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    write_fn(&mut writer)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Remove `.tmp` leftovers from interrupted writes; returns how many were removed
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> io::Result<usize> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(0);
    }

    let mut cleaned = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == TEMP_SUFFIX).unwrap_or(false) {
            fs::remove_file(&path)?;
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_with() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.jsonl");

        atomic_write_with(&path, |w| {
            writeln!(w, "{{\"id\":1}}")?;
            writeln!(w, "{{\"id\":2}}")
        })
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"id\":1}\n{\"id\":2}\n");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("streams.jsonl");

        atomic_write_with(&path, |w| w.write_all(b"x")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x");
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("versions.jsonl");
        fs::write(&path, "old").unwrap();

        let result = atomic_write_with(&path, |_| {
            Err(io::Error::new(io::ErrorKind::Other, "serialization failed"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn test_cleanup_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("events.jsonl.tmp"), "partial").unwrap();
        fs::write(temp_dir.path().join("events.jsonl"), "keep").unwrap();

        let cleaned = cleanup_temp_files(temp_dir.path()).unwrap();
        assert_eq!(cleaned, 1);
        assert!(temp_dir.path().join("events.jsonl").exists());
    }
}
