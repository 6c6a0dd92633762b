//! Local filesystem session.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use filetime::FileTime;

use super::{DirEntry, Session};
use crate::error::ConnectError;

/// Session on the local filesystem. Connecting is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSession;

impl Session for LocalSession {
    fn connect(&mut self) -> Result<(), ConnectError> {
        Ok(())
    }

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry in {}: {}", dir, e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            // Follow symlinks, a linked file is listed as a file. A link that
            // cannot be followed is listed too, so reading it fails for that
            // file alone.
            let metadata = match fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("cannot follow {}/{}: {}", dir, name, e);
                    match entry.metadata() {
                        Ok(metadata) => metadata,
                        Err(e) => {
                            tracing::warn!("skipping {}/{}: {}", dir, name, e);
                            continue;
                        }
                    }
                }
            };
            entries.push(DirEntry {
                name,
                is_dir: metadata.is_dir(),
                size: metadata.is_file().then(|| metadata.len()),
                modified: metadata.modified().ok(),
            });
        }
        Ok(entries)
    }

    fn read(&mut self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn exists(&mut self, path: &str) -> io::Result<bool> {
        Path::new(path).try_exists()
    }

    fn mkdir_all(&mut self, dir: &str) -> io::Result<()> {
        match fs::metadata(dir) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} exists but is not a directory", dir),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dir),
            Err(e) => Err(e),
        }
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn set_modified(&mut self, path: &str, time: SystemTime) -> io::Result<()> {
        filetime::set_file_mtime(path, FileTime::from_system_time(time))
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    #[test]
    fn test_read_dir_reports_files_and_dirs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join("sub")).expect("Failed to create subdir");
        fs::write(temp_dir.path().join("file1.txt"), b"test data 1").expect("Failed to write");

        let mut session = LocalSession;
        let mut entries = session
            .read_dir(&path_str(temp_dir.path()))
            .expect("Failed to read dir");
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file1.txt");
        assert_eq!(entries[0].size, Some(11));
        assert!(entries[1].is_dir);
        assert_eq!(entries[1].size, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_dir_lists_dangling_symlink() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("a.txt"), b"a").expect("Failed to write");
        std::os::unix::fs::symlink(temp_dir.path().join("gone"), temp_dir.path().join("b.txt"))
            .expect("Failed to create symlink");

        let mut session = LocalSession;
        let mut entries = session
            .read_dir(&path_str(temp_dir.path()))
            .expect("Failed to read dir");
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(!entries[1].is_dir);
        assert!(session.read(&path_str(&temp_dir.path().join("b.txt"))).is_err());
    }

    #[test]
    fn test_write_and_preserve_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = path_str(&temp_dir.path().join("dest.txt"));
        let mut session = LocalSession;

        session.write(&path, b"test content").expect("Failed to write");
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        session.set_modified(&path, mtime).expect("Failed to set mtime");

        let metadata = fs::metadata(&path).expect("Failed to stat");
        assert_eq!(metadata.modified().expect("Failed to read mtime"), mtime);
        assert_eq!(session.read(&path).expect("Failed to read"), b"test content");
    }

    #[test]
    fn test_mkdir_all_rejects_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("plain");
        fs::write(&file, b"x").expect("Failed to write");

        let mut session = LocalSession;
        assert!(session.mkdir_all(&path_str(&file)).is_err());
        let nested = temp_dir.path().join("a").join("b");
        session.mkdir_all(&path_str(&nested)).expect("Failed to create dirs");
        assert!(nested.is_dir());
    }

    #[test]
    fn test_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut session = LocalSession;
        let path = temp_dir.path().join("marker");
        assert!(!session.exists(&path_str(&path)).expect("Failed to check"));
        fs::write(&path, b"").expect("Failed to write");
        assert!(session.exists(&path_str(&path)).expect("Failed to check"));
    }
}
