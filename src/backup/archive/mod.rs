//! Tar archives of one data directory, written and read by two interchangeable
//! strategies.
//!
//! The stream strategy walks the tree itself and builds the tar bytes in
//! process; the command strategy lets the privileged shell's `tar` do the walk.
//! Both share [`frame`], so either one restores what the other wrote.

pub mod command;
pub mod entry;
pub mod exclude;
pub mod frame;
pub mod name;
pub mod stream;
pub mod tree;

use crate::backup::archive::command::CommandEngine;
use crate::backup::archive::exclude::ExcludeGlob;
use crate::backup::archive::name::ArchiveName;
use crate::backup::archive::stream::StreamEngine;
use crate::backup::cancel::CancelToken;
use crate::backup::compress::CompressorConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::result_error::result::Result;
use crate::backup::shell::ShellHandler;
use crate::backup::storage::StorageLocation;
use bon::Builder;
use derive_more::{Display, From};
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which archive of which package an operation is about.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct ArchiveTarget {
    /// Package name
    owner: String,
    /// Data kind, also the archive's base name
    relative_data_path: String,
    /// Backup instance directory inside the storage location
    storage_root: PathBuf,
}

impl ArchiveTarget {
    pub fn new<O: Into<String>, K: Into<String>, P: Into<PathBuf>>(
        owner: O,
        relative_data_path: K,
        storage_root: P,
    ) -> Self {
        Self {
            owner: owner.into(),
            relative_data_path: relative_data_path.into(),
            storage_root: storage_root.into(),
        }
    }
}

/// Compression always applies before encryption.
#[derive(Clone, Debug, Default, Builder)]
pub struct ArchiveOptions {
    #[builder(default)]
    pub compressor: CompressorConfig,
    #[builder(default)]
    pub encryptor: EncryptorConfig,
    #[builder(default)]
    pub exclude: Vec<ExcludeGlob>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStrategy {
    #[default]
    #[display("stream")]
    Stream,
    #[display("command")]
    Command,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupOutcome {
    pub archive: ArchiveName,
    /// Path inside the storage location
    pub path: PathBuf,
    /// Known only when the entries went through this process
    pub entries: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub entries: Option<u64>,
    /// Entries the destination could not represent
    pub skipped: Vec<PathBuf>,
}

pub trait ArchiveEngine {
    fn strategy(&self) -> ArchiveStrategy;

    fn backup(
        &self,
        target: &ArchiveTarget,
        source: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<BackupOutcome>;

    fn restore(
        &self,
        target: &ArchiveTarget,
        archive: &ArchiveName,
        destination: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreOutcome>;
}

#[derive(From)]
pub enum Engine {
    Stream(StreamEngine),
    Command(CommandEngine),
}

impl ArchiveStrategy {
    pub fn engine(self, shell: Arc<ShellHandler>, storage: Arc<dyn StorageLocation>) -> Engine {
        match self {
            ArchiveStrategy::Stream => StreamEngine::new(shell, storage).into(),
            ArchiveStrategy::Command => CommandEngine::new(shell, storage).into(),
        }
    }
}

impl ArchiveEngine for Engine {
    fn strategy(&self) -> ArchiveStrategy {
        match self {
            Engine::Stream(e) => e.strategy(),
            Engine::Command(e) => e.strategy(),
        }
    }

    fn backup(
        &self,
        target: &ArchiveTarget,
        source: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<BackupOutcome> {
        match self {
            Engine::Stream(e) => e.backup(target, source, options, cancel),
            Engine::Command(e) => e.backup(target, source, options, cancel),
        }
    }

    fn restore(
        &self,
        target: &ArchiveTarget,
        archive: &ArchiveName,
        destination: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreOutcome> {
        match self {
            Engine::Stream(e) => e.restore(target, archive, destination, options, cancel),
            Engine::Command(e) => e.restore(target, archive, destination, options, cancel),
        }
    }
}

/// Finds the committed archive for `target`, whatever layers it was written with.
pub fn locate_archive(
    storage: &dyn StorageLocation,
    target: &ArchiveTarget,
) -> Result<Option<ArchiveName>> {
    Ok(storage
        .list(target.storage_root())?
        .iter()
        .filter_map(|name| ArchiveName::parse(name))
        .find(|name| &name.kind == target.relative_data_path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::entry::{EntryKind, FileEntry};
    use crate::backup::archive::exclude::ExcludeMatcher;
    use crate::backup::encrypt::tests::quick_aes;
    use crate::backup::shell::ShellConfig;
    use crate::backup::storage::path::PathStorage;
    use std::collections::BTreeMap;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        shell: Arc<ShellHandler>,
        storage: Arc<dyn StorageLocation>,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("source");
            let root = dir.path().join("storage");
            std::fs::create_dir_all(&root).unwrap();
            build_tree(&source);
            Self {
                source,
                shell: Arc::new(ShellHandler::new(ShellConfig::unprivileged())),
                storage: Arc::new(PathStorage::new(&root)),
                root,
                _dir: dir,
            }
        }

        fn engine(&self, strategy: ArchiveStrategy) -> Engine {
            strategy.engine(self.shell.clone(), self.storage.clone())
        }

        fn restore_dir(&self, name: &str) -> PathBuf {
            self.root.parent().unwrap().join(name)
        }

        /// Entries keyed by path, with what a restore can not carry over removed.
        fn snapshot(&self, dir: &Path) -> BTreeMap<PathBuf, FileEntry> {
            let matcher = ExcludeMatcher::build(&[]).unwrap();
            StreamEngine::new(self.shell.clone(), self.storage.clone())
                .walk(dir, &matcher)
                .unwrap()
                .into_iter()
                .map(|mut e| {
                    if e.kind == EntryKind::Symlink {
                        e.mtime = 0;
                        e.mode = 0;
                    }
                    (e.path.clone(), e)
                })
                .collect()
        }
    }

    fn build_tree(source: &Path) {
        std::fs::create_dir_all(source.join("files/nested")).unwrap();
        std::fs::create_dir_all(source.join("cache")).unwrap();
        std::fs::write(source.join("files/hello.txt"), b"hello world").unwrap();
        std::fs::write(source.join("files/nested/big.bin"), vec![7u8; 200_000]).unwrap();
        std::fs::write(source.join("files/with space.txt"), b"spaced").unwrap();
        std::fs::write(source.join("cache/junk"), b"junk").unwrap();
        std::fs::write(source.join("empty"), b"").unwrap();
        symlink("files/hello.txt", source.join("link")).unwrap();
        symlink("/nonexistent/target", source.join("dangling")).unwrap();
        std::fs::set_permissions(
            source.join("files/hello.txt"),
            std::fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        std::fs::set_permissions(
            source.join("files/nested"),
            std::fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        let fifo = std::process::Command::new("mkfifo")
            .arg(source.join("files/pipe"))
            .status()
            .unwrap();
        assert!(fifo.success());
        let touch = std::process::Command::new("touch")
            .arg("-m")
            .arg("-d")
            .arg("@1600000000")
            .arg(source.join("files/hello.txt"))
            .arg(source.join("files/nested"))
            .status()
            .unwrap();
        assert!(touch.success());
    }

    fn target() -> ArchiveTarget {
        ArchiveTarget::new("org.example.app", "data", "org.example.app/2024-01-01T00h00m00s")
    }

    fn excluding_cache() -> ArchiveOptions {
        ArchiveOptions::builder()
            .exclude(vec![ExcludeGlob::new("cache").unwrap()])
            .build()
    }

    fn without_cache(mut snapshot: BTreeMap<PathBuf, FileEntry>) -> BTreeMap<PathBuf, FileEntry> {
        snapshot.retain(|path, _| !path.starts_with("cache"));
        snapshot
    }

    /// Regular file contents under `dir`, keyed by relative path.
    fn contents(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let relative = e.path().strip_prefix(dir).unwrap().to_path_buf();
                (relative, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn round_trip(backup: ArchiveStrategy, restore: ArchiveStrategy, options: ArchiveOptions) {
        let fx = Fixture::new();
        let outcome = fx
            .engine(backup)
            .backup(&target(), &fx.source, &options, &CancelToken::new())
            .unwrap();
        assert_eq!(
            locate_archive(fx.storage.as_ref(), &target()).unwrap(),
            Some(outcome.archive.clone())
        );

        let destination = fx.restore_dir("restored");
        fx.engine(restore)
            .restore(
                &target(),
                &outcome.archive,
                &destination,
                &options,
                &CancelToken::new(),
            )
            .unwrap();

        let expected = without_cache(fx.snapshot(&fx.source));
        let actual = fx.snapshot(&destination);
        assert_eq!(actual, expected, "{backup} -> {restore}");
        let mut expected_contents = contents(&fx.source);
        expected_contents.retain(|path, _| !path.starts_with("cache"));
        assert_eq!(contents(&destination), expected_contents);
        assert_eq!(
            std::fs::read(destination.join("files/nested/big.bin")).unwrap(),
            vec![7u8; 200_000]
        );
        assert_eq!(
            std::fs::read_link(destination.join("dangling")).unwrap(),
            PathBuf::from("/nonexistent/target")
        );
    }

    #[test]
    fn test_stream_to_stream() {
        round_trip(ArchiveStrategy::Stream, ArchiveStrategy::Stream, excluding_cache());
    }

    #[test]
    fn test_stream_to_command() {
        round_trip(ArchiveStrategy::Stream, ArchiveStrategy::Command, excluding_cache());
    }

    #[test]
    fn test_command_to_stream() {
        round_trip(ArchiveStrategy::Command, ArchiveStrategy::Stream, excluding_cache());
    }

    #[test]
    fn test_command_to_command() {
        round_trip(ArchiveStrategy::Command, ArchiveStrategy::Command, excluding_cache());
    }

    #[test]
    fn test_encrypted_both_ways() {
        for (backup, restore) in [
            (ArchiveStrategy::Stream, ArchiveStrategy::Command),
            (ArchiveStrategy::Command, ArchiveStrategy::Stream),
        ] {
            let options = ArchiveOptions::builder()
                .encryptor(quick_aes())
                .exclude(vec![ExcludeGlob::new("cache").unwrap()])
                .build();
            round_trip(backup, restore, options);
        }
    }

    #[test]
    fn test_uncompressed_both_ways() {
        let options = ArchiveOptions::builder()
            .compressor(CompressorConfig::None)
            .exclude(vec![ExcludeGlob::new("cache").unwrap()])
            .build();
        round_trip(ArchiveStrategy::Stream, ArchiveStrategy::Command, options.clone());
        round_trip(ArchiveStrategy::Command, ArchiveStrategy::Stream, options);
    }

    #[test]
    fn test_unchanged_tree_archives_decode_identically() {
        let fx = Fixture::new();
        let engine = fx.engine(ArchiveStrategy::Stream);
        let decode = |dir: &str| {
            let target = ArchiveTarget::new("org.example.app", "data", dir);
            let outcome = engine
                .backup(&target, &fx.source, &excluding_cache(), &CancelToken::new())
                .unwrap();
            let (source, _) =
                frame::open_archive(fx.storage.as_ref(), &target, &outcome.archive, &excluding_cache())
                    .unwrap();
            let mut archive = tar::Archive::new(source);
            archive
                .entries()
                .unwrap()
                .filter_map(|e| FileEntry::from_tar_entry(&e.unwrap()).unwrap())
                .collect::<Vec<_>>()
        };
        let first = decode("org.example.app/first");
        let second = decode("org.example.app/second");
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_tampered_encrypted_archive_is_corrupt() {
        for (backup, restore) in [
            (ArchiveStrategy::Stream, ArchiveStrategy::Stream),
            (ArchiveStrategy::Stream, ArchiveStrategy::Command),
            (ArchiveStrategy::Command, ArchiveStrategy::Stream),
            (ArchiveStrategy::Command, ArchiveStrategy::Command),
        ] {
            let fx = Fixture::new();
            let options = ArchiveOptions::builder().encryptor(quick_aes()).build();
            let outcome = fx
                .engine(backup)
                .backup(&target(), &fx.source, &options, &CancelToken::new())
                .unwrap();
            let file = fx.root.join(&outcome.path);
            let mut bytes = std::fs::read(&file).unwrap();
            for index in [0, bytes.len() / 2, bytes.len() - 1] {
                bytes[index] ^= 0x20;
                std::fs::write(&file, &bytes).unwrap();
                let err = fx
                    .engine(restore)
                    .restore(
                        &target(),
                        &outcome.archive,
                        &fx.restore_dir(&format!("r{index}")),
                        &options,
                        &CancelToken::new(),
                    )
                    .unwrap_err();
                assert!(err.is_archive_corrupt(), "{backup} -> {restore} at {index}: {err}");
                bytes[index] ^= 0x20;
            }
        }
    }

    #[test]
    fn test_cancelled_backup_leaves_no_archive() {
        for strategy in [ArchiveStrategy::Stream, ArchiveStrategy::Command] {
            let fx = Fixture::new();
            let cancel = CancelToken::new();
            cancel.cancel();
            let err = fx
                .engine(strategy)
                .backup(&target(), &fx.source, &ArchiveOptions::default(), &cancel)
                .unwrap_err();
            assert!(err.is_cancelled());
            assert_eq!(locate_archive(fx.storage.as_ref(), &target()).unwrap(), None);
            let leftovers = fx.storage.list(target().storage_root()).unwrap();
            assert!(leftovers.iter().all(|n| !n.ends_with(".tmp")), "{leftovers:?}");
        }
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let fx = Fixture::new();
        for strategy in [ArchiveStrategy::Stream, ArchiveStrategy::Command] {
            let res = fx.engine(strategy).backup(
                &target(),
                &fx.source.join("missing"),
                &ArchiveOptions::default(),
                &CancelToken::new(),
            );
            assert!(res.is_err());
            assert_eq!(locate_archive(fx.storage.as_ref(), &target()).unwrap(), None);
        }
    }

    #[test]
    fn test_names_are_kept_byte_for_byte() {
        let latin1 = OsStr::from_bytes(b"caf\xe9.txt");
        let newline = OsStr::from_bytes(b"two\nlines");
        for (backup, restore) in [
            (ArchiveStrategy::Stream, ArchiveStrategy::Stream),
            (ArchiveStrategy::Stream, ArchiveStrategy::Command),
            (ArchiveStrategy::Command, ArchiveStrategy::Stream),
        ] {
            let fx = Fixture::new();
            std::fs::write(fx.source.join("files").join(latin1), b"latin1").unwrap();
            std::fs::write(fx.source.join(newline), b"newline").unwrap();
            symlink(latin1, fx.source.join("to-cafe")).unwrap();

            let outcome = fx
                .engine(backup)
                .backup(&target(), &fx.source, &excluding_cache(), &CancelToken::new())
                .unwrap();
            let destination = fx.restore_dir("restored");
            fx.engine(restore)
                .restore(
                    &target(),
                    &outcome.archive,
                    &destination,
                    &excluding_cache(),
                    &CancelToken::new(),
                )
                .unwrap();

            assert_eq!(
                std::fs::read(destination.join("files").join(latin1)).unwrap(),
                b"latin1",
                "{backup} -> {restore}"
            );
            assert_eq!(std::fs::read(destination.join(newline)).unwrap(), b"newline");
            assert_eq!(
                std::fs::read_link(destination.join("to-cafe")).unwrap(),
                Path::new(latin1)
            );
            let expected = without_cache(fx.snapshot(&fx.source));
            assert_eq!(fx.snapshot(&destination), expected, "{backup} -> {restore}");
        }
    }

    #[test]
    fn test_restore_replaces_destination_contents() {
        for strategy in [ArchiveStrategy::Stream, ArchiveStrategy::Command] {
            let fx = Fixture::new();
            let outcome = fx
                .engine(ArchiveStrategy::Stream)
                .backup(&target(), &fx.source, &excluding_cache(), &CancelToken::new())
                .unwrap();

            let outside = fx.restore_dir("outside");
            std::fs::create_dir_all(&outside).unwrap();
            std::fs::write(outside.join("precious"), b"precious").unwrap();
            let destination = fx.restore_dir("restored");
            std::fs::create_dir_all(destination.join("files")).unwrap();
            std::fs::create_dir_all(destination.join("cache")).unwrap();
            std::fs::write(destination.join("stale.txt"), b"stale").unwrap();
            std::fs::write(destination.join("files/stale"), b"stale").unwrap();
            std::fs::write(destination.join("cache/kept"), b"kept").unwrap();
            symlink(&outside, destination.join("old-link")).unwrap();

            fx.engine(strategy)
                .restore(
                    &target(),
                    &outcome.archive,
                    &destination,
                    &excluding_cache(),
                    &CancelToken::new(),
                )
                .unwrap();

            let mut expected = contents(&fx.source);
            expected.retain(|path, _| !path.starts_with("cache"));
            expected.insert(PathBuf::from("cache/kept"), b"kept".to_vec());
            assert_eq!(contents(&destination), expected, "{strategy}");
            assert!(std::fs::symlink_metadata(destination.join("old-link")).is_err());
            assert_eq!(std::fs::read(outside.join("precious")).unwrap(), b"precious");
            assert_eq!(std::fs::read_dir(&outside).unwrap().count(), 1);
        }
    }

    #[test]
    fn test_sockets_are_left_out() {
        let fx = Fixture::new();
        let _listener = UnixListener::bind(fx.source.join("files/sock")).unwrap();
        let matcher = ExcludeMatcher::build(&[]).unwrap();
        let walked = StreamEngine::new(fx.shell.clone(), fx.storage.clone())
            .walk(&fx.source, &matcher)
            .unwrap();
        assert!(walked.iter().all(|e| e.path != Path::new("files/sock")));
        assert!(walked.iter().any(|e| e.path == Path::new("files/hello.txt")));

        let outcome = fx
            .engine(ArchiveStrategy::Stream)
            .backup(&target(), &fx.source, &excluding_cache(), &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.entries, Some(walked.len() as u64 - 2));
        for strategy in [ArchiveStrategy::Stream, ArchiveStrategy::Command] {
            let destination = fx.restore_dir(&format!("restored-{strategy}"));
            fx.engine(strategy)
                .restore(
                    &target(),
                    &outcome.archive,
                    &destination,
                    &excluding_cache(),
                    &CancelToken::new(),
                )
                .unwrap();
            assert!(std::fs::symlink_metadata(destination.join("files/sock")).is_err());
            assert_eq!(
                std::fs::read(destination.join("files/hello.txt")).unwrap(),
                b"hello world"
            );
        }
    }
}
