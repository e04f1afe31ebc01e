//! Filesystem helpers shared by the snapshot and clone paths.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Flush a directory entry table to disk so renames inside it are durable
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Write a file via temp file + rename, fsyncing both the file and its parent
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
    let tmp_path = parent.join(format!("{}.tmp", name));

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    fsync_dir(parent)
}

/// Hard-link `src` to `dst`, copying when linking is not possible
pub fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
        File::open(dst)?.sync_all()?;
    }
    Ok(())
}

/// Size and CRC32 of a file
pub fn file_checksum(path: &Path) -> io::Result<(u64, u32)> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hasher.finalize()))
}

/// Time since a path was last modified; zero when it is in the future
pub fn path_age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

/// True for a bare file name with no directory components
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_and_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_file_atomic(&path, b"hello").unwrap();

        let (size, crc) = file_checksum(&path).unwrap();
        assert_eq!(size, 5);
        assert_eq!(crc, crc32fast::hash(b"hello"));
        assert!(!dir.path().join("meta.json.tmp").exists());
    }

    #[test]
    fn test_link_or_copy() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.dat");
        let dst = dir.path().join("b.dat");
        fs::write(&src, b"rows").unwrap();

        link_or_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"rows");
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("abc_0.dat"));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }
}
