use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::storage::{resolve, StorageLocation, StorageWriter};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Storage in a directory the process can access with its own permissions.
#[derive(Debug, Clone)]
pub struct PathStorage {
    root: PathBuf,
}

impl PathStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

struct FileWriter {
    inner: BufWriter<File>,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl StorageWriter for FileWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        let file = self
            .inner
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;
        file.sync_all()?;
        Ok(())
    }
}

impl StorageLocation for PathStorage {
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        let dir = resolve(&self.root, dir)?;
        std::fs::create_dir_all(&dir)
            .map_err(Error::from)
            .add_msg(format!("Cannot create {dir:?}"))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let path = resolve(&self.root, path)?;
        Ok(path.symlink_metadata().is_ok())
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let dir = resolve(&self.root, dir)?;
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(Error::from(e).add_msg(format!("Cannot list {dir:?}"))),
        };
        let mut names = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    fn create_file(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let path = resolve(&self.root, path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .map_err(Error::from)
            .add_msg(format!("Cannot create {path:?}"))?;
        Ok(Box::new(FileWriter {
            inner: BufWriter::new(file),
        }))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let path = resolve(&self.root, path)?;
        match File::open(&path) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{}", path.display())))
            }
            Err(e) => Err(Error::from(e).add_msg(format!("Cannot open {path:?}"))),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = resolve(&self.root, from)?;
        let to = resolve(&self.root, to)?;
        std::fs::rename(&from, &to)
            .map_err(Error::from)
            .add_msg(format!("Cannot rename {from:?} to {to:?}"))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let path = resolve(&self.root, path)?;
        let res = match path.symlink_metadata() {
            Ok(md) if md.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        res.map_err(Error::from)
            .add_msg(format!("Cannot delete {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::storage::tests::exercise_storage;
    use tempfile::TempDir;

    #[test]
    fn test_path_storage() {
        let dir = TempDir::new().unwrap();
        exercise_storage(&PathStorage::new(dir.path()));
    }

    #[test]
    fn test_uncommitted_file_is_visible_only_by_name() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        let mut writer = storage.create_file(Path::new("x.tmp")).unwrap();
        writer.write_all(b"partial").unwrap();
        drop(writer);
        assert!(storage.exists(Path::new("x.tmp")).unwrap());
        storage.delete(Path::new("x.tmp")).unwrap();
        assert!(storage.list(Path::new("")).unwrap().is_empty());
    }
}
