use crate::backup::archive::entry::{normalize_member_path, EntryKind, FileEntry};
use crate::backup::archive::exclude::ExcludeMatcher;
use crate::backup::archive::frame::{drain, open_archive, write_archive};
use crate::backup::archive::name::ArchiveName;
use crate::backup::archive::tree;
use crate::backup::archive::tree::run_script;
use crate::backup::archive::{
    ArchiveEngine, ArchiveOptions, ArchiveStrategy, ArchiveTarget, BackupOutcome, RestoreOutcome,
};
use crate::backup::cancel::{CancelToken, CancellableReader};
use crate::backup::finish::Finish;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFnName, AddMsg};
use crate::backup::shell::{CommandLine, ShellHandler};
use crate::backup::storage::StorageLocation;
use function_name::named;
use std::collections::BTreeSet;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What `mknod` and `mkfifo` print when the destination filesystem or the
/// privilege level cannot hold the node.
const UNSUPPORTED_MARKERS: [&str; 2] = ["operation not permitted", "not supported"];

/// Walks and packs in process; every byte still comes through the privileged shell.
#[derive(Debug, Clone)]
pub struct StreamEngine {
    shell: Arc<ShellHandler>,
    storage: Arc<dyn StorageLocation>,
}

impl StreamEngine {
    pub fn new(shell: Arc<ShellHandler>, storage: Arc<dyn StorageLocation>) -> Self {
        Self { shell, storage }
    }

    /// Every entry below `source`, parents before children, sorted by path.
    pub fn walk(&self, source: &Path, exclude: &ExcludeMatcher) -> Result<Vec<FileEntry>> {
        tree::walk(&self.shell, source, exclude)
    }

    fn append<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        source: &Path,
        entry: &FileEntry,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut header = entry.tar_header()?;
        match entry.kind {
            EntryKind::Regular => self.append_file(builder, &mut header, source, entry, cancel),
            EntryKind::Symlink => {
                let link_target = entry.link_target.clone().unwrap_or_default();
                builder.append_link(&mut header, &entry.path, link_target)?;
                Ok(())
            }
            _ => {
                builder.append_data(&mut header, &entry.path, io::empty())?;
                Ok(())
            }
        }
    }

    fn append_file<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        header: &mut tar::Header,
        source: &Path,
        entry: &FileEntry,
        cancel: &CancelToken,
    ) -> Result<()> {
        let full_path = source.join(&entry.path);
        let reader = self
            .shell
            .spawn_reader(CommandLine::new(self.shell.tool("cat")?).path(&full_path))?;
        let mut exact = ExactReader::new(CancellableReader::new(reader, cancel), entry.size);
        let appended = builder.append_data(header, &entry.path, &mut exact);
        let shrank = exact.shrank;
        let reader = exact.inner.into_inner();

        if let Err(e) = appended {
            cancel.check()?;
            // a failing cat explains a short read better than the short read does
            reader.finish()?;
            if shrank {
                return Err(Error::DataChanged { path: full_path });
            }
            return Err(e.into());
        }

        let extra = reader.finish()?;
        if extra > 0 {
            tracing::warn!(
                "{:?} grew while archiving, kept the first {} bytes",
                full_path,
                entry.size
            );
        }
        tracing::trace!("Archived {:?} ({} bytes)", entry.path, entry.size);
        Ok(())
    }

    fn flush(&self, structure: &mut Vec<CommandLine>) -> Result<()> {
        run_script(&self.shell, structure)?;
        structure.clear();
        Ok(())
    }

    /// Extracts every member. Symlinks are created last, so nothing the archive
    /// carries is ever written through one.
    fn restore_entries<R: Read>(
        &self,
        archive: &mut tar::Archive<R>,
        destination: &Path,
        kept_links: &BTreeSet<PathBuf>,
        cancel: &CancelToken,
        outcome: &mut RestoreOutcome,
    ) -> Result<Vec<FileEntry>> {
        let mkdir = self.shell.tool("mkdir")?;
        let ln = self.shell.tool("ln")?;
        let cat = self.shell.tool("cat")?;

        let mut restored = Vec::new();
        let mut links = Vec::new();
        let mut link_paths = BTreeSet::new();
        let mut structure = Vec::new();
        let members = archive
            .entries()
            .map_err(|e| Error::archive_corrupt(e.to_string()))?;
        for member in members {
            cancel.check()?;
            let mut member = member.map_err(|e| Error::archive_corrupt(e.to_string()))?;
            let entry = match FileEntry::from_tar_entry(&member) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(Error::UnsupportedEntryType { path, kind }) => {
                    tracing::warn!("Skipping {:?}: unsupported {} member", path, kind);
                    outcome.skipped.push(path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let is_link = entry.kind == EntryKind::Symlink;
            refuse_below_link(&entry.path, kept_links, !is_link)?;
            refuse_below_link(&entry.path, &link_paths, false)?;
            let path = destination.join(&entry.path);

            match entry.kind {
                EntryKind::Directory => {
                    structure.push(CommandLine::new(&mkdir).arg("-p").path(&path))
                }
                EntryKind::Symlink => {
                    link_paths.insert(entry.path.clone());
                    links.push(entry);
                    continue;
                }
                EntryKind::Regular => {
                    self.flush(&mut structure)?;
                    let mut writer = self
                        .shell
                        .spawn_writer(CommandLine::new(&cat).arg(">").path(&path))?;
                    if let Err(e) = io::copy(&mut member, &mut writer) {
                        if e.kind() == io::ErrorKind::BrokenPipe {
                            writer.finish()?;
                        }
                        return Err(e.into());
                    }
                    writer.finish()?;
                }
                EntryKind::HardLink => {
                    self.flush(&mut structure)?;
                    let original = entry
                        .link_target
                        .as_deref()
                        .map(normalize_member_path)
                        .transpose()?
                        .flatten()
                        .ok_or_else(|| {
                            Error::archive_corrupt(format!("{:?} links to nothing", entry.path))
                        })?;
                    refuse_below_link(&original, kept_links, true)?;
                    refuse_below_link(&original, &link_paths, true)?;
                    self.shell.run_checked(
                        CommandLine::new(&ln)
                            .arg("-f")
                            .path(destination.join(original))
                            .path(&path),
                    )?;
                }
                EntryKind::Fifo | EntryKind::CharDevice | EntryKind::BlockDevice => {
                    self.flush(&mut structure)?;
                    if !self.make_special(&entry, &path)? {
                        outcome.skipped.push(entry.path.clone());
                        continue;
                    }
                }
                EntryKind::Socket => continue,
            }
            tracing::trace!("Restored {:?}", entry.path);
            restored.push(entry);
        }

        let rm = self.shell.tool("rm")?;
        for link in &links {
            let path = destination.join(&link.path);
            let link_target = link.link_target.as_deref().unwrap_or(Path::new(""));
            structure.push(CommandLine::new(&rm).arg("-rf").path(&path));
            structure.push(CommandLine::new(&ln).arg("-s").path(link_target).path(&path));
        }
        self.flush(&mut structure)?;
        tracing::trace!("Created {} symlinks", links.len());

        // a symlink member replaced whatever an earlier member put at its path
        restored.retain(|e| !e.path.ancestors().any(|a| link_paths.contains(a)));
        restored.extend(links);
        restored.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(restored)
    }

    /// `false` when the destination cannot hold the entry.
    fn make_special(&self, entry: &FileEntry, path: &Path) -> Result<bool> {
        let create = match (entry.kind, entry.device) {
            (EntryKind::Fifo, _) => CommandLine::new(self.shell.tool("mkfifo")?).path(path),
            (EntryKind::CharDevice, Some((major, minor))) => {
                CommandLine::new(self.shell.tool("mknod")?)
                    .path(path)
                    .arg(format!("c {major} {minor}"))
            }
            (EntryKind::BlockDevice, Some((major, minor))) => {
                CommandLine::new(self.shell.tool("mknod")?)
                    .path(path)
                    .arg(format!("b {major} {minor}"))
            }
            _ => return Ok(false),
        };
        self.shell
            .run_checked(CommandLine::new(self.shell.tool("rm")?).arg("-f").path(path))?;
        let res = self.shell.run(&create)?;
        if res.is_success() {
            return Ok(true);
        }
        if !is_unsupported(res.err()) {
            return Err(Error::shell_command_failed(
                create.as_os_str().to_string_lossy(),
                res.exit_code(),
                res.err().clone(),
            ));
        }
        tracing::warn!(
            "{}: {}",
            Error::UnsupportedEntryType {
                path: entry.path.clone(),
                kind: entry.kind.to_string(),
            },
            res.err().join(" ")
        );
        Ok(false)
    }

    /// Owner, mode and mtime, deepest entries first so directory times stick.
    fn apply_attributes(&self, destination: &Path, restored: &[FileEntry]) -> Result<()> {
        let chown = self.shell.tool("chown")?;
        let chmod = self.shell.tool("chmod")?;
        let touch = self.shell.tool("touch")?;
        let mut script = Vec::with_capacity(restored.len() * 3);
        for entry in restored.iter().rev() {
            let path = destination.join(&entry.path);
            let owner = format!("{}:{}", entry.uid, entry.gid);
            let mtime = format!("@{}", entry.mtime);
            if entry.kind == EntryKind::Symlink {
                script.push(CommandLine::new(&chown).arg("-h").arg(&owner).path(&path));
                script.push(
                    CommandLine::new(&touch)
                        .arg("-c -h -m -d")
                        .arg(&mtime)
                        .path(&path)
                        .arg("2>/dev/null || true"),
                );
            } else {
                script.push(CommandLine::new(&chown).arg(&owner).path(&path));
                script.push(
                    CommandLine::new(&chmod)
                        .arg(format!("{:o}", entry.mode))
                        .path(&path),
                );
                script.push(
                    CommandLine::new(&touch)
                        .arg("-c -m -d")
                        .arg(&mtime)
                        .path(&path),
                );
            }
        }
        run_script(&self.shell, &script)
    }
}

/// Refuses `path` when one of its ancestors, or the path itself when
/// `including_self`, is one of `links`.
fn refuse_below_link(path: &Path, links: &BTreeSet<PathBuf>, including_self: bool) -> Result<()> {
    let skip = if including_self { 0 } else { 1 };
    match path.ancestors().skip(skip).find(|a| links.contains(*a)) {
        Some(link) => Err(Error::archive_corrupt(format!(
            "member {path:?} lies below the symlink {link:?}"
        ))),
        None => Ok(()),
    }
}

fn is_unsupported(stderr: &[String]) -> bool {
    stderr.iter().any(|line| {
        let line = line.to_lowercase();
        UNSUPPORTED_MARKERS.iter().any(|m| line.contains(m))
    })
}

impl ArchiveEngine for StreamEngine {
    fn strategy(&self) -> ArchiveStrategy {
        ArchiveStrategy::Stream
    }

    #[named]
    fn backup(
        &self,
        target: &ArchiveTarget,
        source: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<BackupOutcome> {
        let exclude = ExcludeMatcher::build(&options.exclude)?;
        let entries = self.walk(source, &exclude)?;
        write_archive(
            self.storage.as_ref(),
            target,
            options,
            ArchiveStrategy::Stream,
            cancel,
            |sink| {
                let mut builder = tar::Builder::new(sink);
                for entry in &entries {
                    cancel.check()?;
                    self.append(&mut builder, source, entry, cancel)
                        .add_msg(format!("Cannot archive {:?}", entry.path))?;
                }
                Finish::finish(builder)?;
                Ok(Some(entries.len() as u64))
            },
        )
        .add_fn_name(function_path!())
    }

    #[named]
    fn restore(
        &self,
        target: &ArchiveTarget,
        archive: &ArchiveName,
        destination: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreOutcome> {
        // opening reads and authenticates the first chunk, so a wrong key fails here
        let (source, probe) = open_archive(self.storage.as_ref(), target, archive, options)?;
        let exclude = ExcludeMatcher::build(&options.exclude)?;
        tree::clear_destination(&self.shell, destination, &exclude)
            .add_fn_name(function_path!())?;
        self.shell
            .run_checked(CommandLine::new(self.shell.tool("mkdir")?).arg("-p").path(destination))?;
        let kept_links = tree::symlinks(&self.shell, destination)?;

        let mut outcome = RestoreOutcome::default();
        let mut tar = tar::Archive::new(source);
        let restored = self
            .restore_entries(&mut tar, destination, &kept_links, cancel, &mut outcome)
            .and_then(|restored| drain(&mut tar.into_inner()).map(|_| restored))
            .map_err(|e| probe.classify(e))
            .add_fn_name(function_path!())?;

        cancel.check()?;
        self.apply_attributes(destination, &restored)?;
        outcome.entries = Some(restored.len() as u64);
        tracing::info!(
            "Restored {} entries of {} into {:?}",
            restored.len(),
            archive,
            destination
        );
        Ok(outcome)
    }
}

/// Yields exactly `remaining` bytes; a source that ends early fails the read.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    shrank: bool,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, remaining: u64) -> Self {
        Self {
            inner,
            remaining,
            shrank: false,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            self.shrank = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
