//! The "byte handler" collaborator (component C1 in the design): everything this
//! crate needs from a filesystem-like namespace, kept behind a trait so the
//! cleaner's directory-walking and chain-merging logic can be exercised against
//! an in-memory namespace in tests instead of real files.

use crate::{Flush, ReadAt, Result, VhdError, WriteAt};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// How a file is opened through a [`ByteHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for read+write.
    ReadWrite,
    /// Create a new file, failing if one already exists at that path.
    CreateNew,
}

/// A single opened file: positional read/write plus the size/truncate
/// operations the VHD engine needs to grow files in place.
pub trait ByteHandle: ReadAt + WriteAt + Flush {
    fn size(&self) -> Result<u64>;
    fn set_len(&self, len: u64) -> Result<()>;
}

/// Directory-namespace operations plus the ability to open a file as a
/// [`ByteHandle`]. Implementations own the lifetime of what `open` returns;
/// release-on-drop is expected (idiomatic `Drop`-based RAII rather than an
/// explicit close callback).
pub trait ByteHandler {
    type Handle: ByteHandle;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle>;
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn unlink(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;
}

/// Real-filesystem implementation of [`ByteHandler`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FsHandler;

pub struct FsHandle(RefCell<File>);

impl ReadAt for FsHandle {
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        let mut file = self.0.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.read(data).map_err(From::from)
    }
}

impl WriteAt for FsHandle {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = self.0.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write(data).map_err(From::from)
    }
}

impl Flush for FsHandle {
    fn flush(&self) -> Result<()> {
        self.0.borrow_mut().flush().map_err(From::from)
    }
}

impl ByteHandle for FsHandle {
    fn size(&self) -> Result<u64> {
        Ok(self.0.borrow().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.0.borrow().set_len(len).map_err(From::from)
    }
}

impl ByteHandler for FsHandler {
    type Handle = FsHandle;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle> {
        let file = match mode {
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            OpenMode::CreateNew => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?,
        };
        Ok(FsHandle(RefCell::new(file)))
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            out.push(entry?.path());
        }
        Ok(out)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(From::from)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(From::from)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(From::from)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        fs::write(path, data).map_err(From::from)
    }
}

/// In-memory namespace used by tests: every "file" is a growable byte buffer
/// keyed by path, shared behind a mutex so multiple open handles observe the
/// same content (mirroring how a real filesystem behaves).
#[derive(Clone, Default)]
pub struct MemHandler {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemHandle {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    path: PathBuf,
}

impl ReadAt for MemHandle {
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        let files = self.files.lock().unwrap();
        let content = files
            .get(&self.path)
            .ok_or_else(|| VhdError::NotFound(self.path.display().to_string()))?;
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let n = std::cmp::min(data.len(), content.len() - offset);
        data[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }
}

impl WriteAt for MemHandle {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut files = self.files.lock().unwrap();
        let content = files
            .get_mut(&self.path)
            .ok_or_else(|| VhdError::NotFound(self.path.display().to_string()))?;
        let offset = offset as usize;
        let end = offset + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);
        Ok(data.len())
    }
}

impl Flush for MemHandle {
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl ByteHandle for MemHandle {
    fn size(&self) -> Result<u64> {
        let files = self.files.lock().unwrap();
        Ok(files
            .get(&self.path)
            .map(|c| c.len() as u64)
            .unwrap_or(0))
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let content = files
            .get_mut(&self.path)
            .ok_or_else(|| VhdError::NotFound(self.path.display().to_string()))?;
        content.resize(len as usize, 0);
        Ok(())
    }
}

impl ByteHandler for MemHandler {
    type Handle = MemHandle;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle> {
        let mut files = self.files.lock().unwrap();
        match mode {
            OpenMode::CreateNew if files.contains_key(path) => {
                return Err(VhdError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    path.display().to_string(),
                )))
            }
            OpenMode::CreateNew => {
                files.insert(path.to_path_buf(), Vec::new());
            }
            OpenMode::ReadWrite if !files.contains_key(path) => {
                return Err(VhdError::NotFound(path.display().to_string()))
            }
            OpenMode::ReadWrite => {}
        }
        Ok(MemHandle {
            files: self.files.clone(),
            path: path.to_path_buf(),
        })
    }

    /// Lists immediate children of `dir`, the same as a real directory
    /// listing would. There are no separate directory entries in this
    /// in-memory store, so a child living several components below `dir`
    /// (e.g. `dir/a/b/file`) is reported as the pseudo-entry `dir/a`, the way
    /// `fs::read_dir` would report `a` as a subdirectory without descending
    /// into it.
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for path in files.keys() {
            if let Ok(rel) = path.strip_prefix(dir) {
                if let Some(first) = rel.components().next() {
                    seen.insert(dir.join(first.as_os_str()));
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| VhdError::NotFound(path.display().to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let content = files
            .remove(from)
            .ok_or_else(|| VhdError::NotFound(from.display().to_string()))?;
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| VhdError::NotFound(path.display().to_string()))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_new_rejects_existing_path() {
        let handler = MemHandler::new();
        let path = Path::new("/a.vhd");
        handler.open(path, OpenMode::CreateNew).unwrap();
        assert!(handler.open(path, OpenMode::CreateNew).is_err());
    }

    #[test]
    fn read_write_not_found_for_missing_path() {
        let handler = MemHandler::new();
        let err = handler.open(Path::new("/missing.vhd"), OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, VhdError::NotFound(_)));
    }

    #[test]
    fn handles_share_underlying_storage() {
        let handler = MemHandler::new();
        let path = Path::new("/a.vhd");
        let h1 = handler.open(path, OpenMode::CreateNew).unwrap();
        h1.write_all_at(0, b"hello").unwrap();

        let h2 = handler.open(path, OpenMode::ReadWrite).unwrap();
        let mut buf = [0_u8; 5];
        h2.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn set_len_grows_and_truncates() {
        let handler = MemHandler::new();
        let path = Path::new("/a.vhd");
        let handle = handler.open(path, OpenMode::CreateNew).unwrap();
        handle.set_len(10).unwrap();
        assert_eq!(handle.size().unwrap(), 10);
        handle.set_len(2).unwrap();
        assert_eq!(handle.size().unwrap(), 2);
    }

    #[test]
    fn rename_moves_content_under_new_path() {
        let handler = MemHandler::new();
        let from = Path::new("/a.vhd");
        let to = Path::new("/b.vhd");
        let handle = handler.open(from, OpenMode::CreateNew).unwrap();
        handle.write_all_at(0, b"payload").unwrap();

        handler.rename(from, to).unwrap();
        assert!(!handler.exists(from));
        assert!(handler.exists(to));
        assert_eq!(handler.read_file(to).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn unlink_removes_the_path() {
        let handler = MemHandler::new();
        let path = Path::new("/a.vhd");
        handler.open(path, OpenMode::CreateNew).unwrap();
        handler.unlink(path).unwrap();
        assert!(!handler.exists(path));
        assert!(matches!(handler.unlink(path), Err(VhdError::NotFound(_))));
    }

    #[test]
    fn list_reports_immediate_children_only() {
        let handler = MemHandler::new();
        handler.write_file(Path::new("/vm/a/disk.vhd"), b"x").unwrap();
        handler.write_file(Path::new("/vm/b/disk.vhd"), b"y").unwrap();

        let mut entries = handler.list(Path::new("/vm")).unwrap();
        entries.sort();
        assert_eq!(entries, vec![PathBuf::from("/vm/a"), PathBuf::from("/vm/b")]);
    }
}
