use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::shell::process::ShellWriter;
use crate::backup::shell::{CommandLine, ShellHandler};
use crate::backup::storage::{resolve, StorageLocation, StorageWriter};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage reached through the privileged shell.
#[derive(Debug, Clone)]
pub struct PrivilegedStorage {
    root: PathBuf,
    shell: Arc<ShellHandler>,
}

impl PrivilegedStorage {
    pub fn new<P: Into<PathBuf>>(root: P, shell: Arc<ShellHandler>) -> Self {
        Self {
            root: root.into(),
            shell,
        }
    }

    fn test(&self, flag: &str, path: &Path) -> Result<bool> {
        let test = CommandLine::new("[")
            .arg(flag)
            .path(path)
            .arg("] || [ -L")
            .path(path)
            .arg("]");
        Ok(self.shell.run(test)?.is_success())
    }
}

impl StorageWriter for ShellWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        self.finish()
    }
}

impl StorageLocation for PrivilegedStorage {
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        let dir = resolve(&self.root, dir)?;
        let mkdir = self.shell.tool("mkdir")?;
        self.shell
            .run_checked(CommandLine::new(mkdir).arg("-p").path(&dir))
            .map(|_| ())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let path = resolve(&self.root, path)?;
        self.test("-e", &path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let dir = resolve(&self.root, dir)?;
        if !self
            .shell
            .run(CommandLine::new("[ -d").path(&dir).arg("]"))?
            .is_success()
        {
            return Ok(vec![]);
        }
        let ls = self.shell.tool("ls")?;
        let mut names = self
            .shell
            .run_checked(CommandLine::new(ls).arg("-1A").path(&dir))?
            .out()
            .iter()
            .filter(|l| !l.is_empty())
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    fn create_file(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let path = resolve(&self.root, path)?;
        if let Some(parent) = path.parent() {
            let mkdir = self.shell.tool("mkdir")?;
            self.shell
                .run_checked(CommandLine::new(mkdir).arg("-p").path(parent))?;
        }
        let cat = self.shell.tool("cat")?;
        let writer = self
            .shell
            .spawn_writer(CommandLine::new(cat).arg(">").path(&path))?;
        Ok(Box::new(writer))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let path = resolve(&self.root, path)?;
        if !self
            .shell
            .run(CommandLine::new("[ -f").path(&path).arg("]"))?
            .is_success()
        {
            return Err(Error::NotFound(format!("{}", path.display())));
        }
        let cat = self.shell.tool("cat")?;
        let reader = self
            .shell
            .spawn_reader(CommandLine::new(cat).path(&path))
            .add_msg(format!("Cannot open {path:?}"))?;
        Ok(Box::new(reader))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = resolve(&self.root, from)?;
        let to = resolve(&self.root, to)?;
        let mv = self.shell.tool("mv")?;
        self.shell
            .run_checked(CommandLine::new(mv).arg("-f").path(&from).path(&to))
            .map(|_| ())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let path = resolve(&self.root, path)?;
        let rm = self.shell.tool("rm")?;
        self.shell
            .run_checked(CommandLine::new(rm).arg("-rf").path(&path))
            .map(|_| ())
    }
}
