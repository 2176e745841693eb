//! Archive framing shared by both strategies: the writer layers around the tar
//! bytes, the properties sidecar, and the commit protocol.
//!
//! An archive only exists under its final name once every layer finished and
//! the storage committed the bytes. Until then it lives under a `.tmp` name that
//! is removed on any failure, so a torn write never looks like a valid archive.

use crate::backup::archive::name::ArchiveName;
use crate::backup::archive::{ArchiveOptions, ArchiveStrategy, ArchiveTarget, BackupOutcome};
use crate::backup::cancel::CancelToken;
use crate::backup::compress::{open_decompressor, Compressor, CompressorBuilder, Decompressor};
use crate::backup::encrypt::aes::EncryptionParams;
use crate::backup::encrypt::{Decryptor, Encryptor, EncryptorBuilder};
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::storage::{StorageLocation, StorageWriter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io;
use std::io::{BufReader, BufWriter, IntoInnerError, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const FORMAT_VERSION: u32 = 1;

pub type ArchiveSink = Compressor<Encryptor<BufWriter<Box<dyn StorageWriter>>>>;

pub type ArchiveSource = ProbedReader<Decompressor<Decryptor<BufReader<Box<dyn Read + Send>>>>>;

/// Sidecar written next to every archive.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveProperties {
    pub format_version: u32,
    pub owner: String,
    pub kind: String,
    pub strategy: ArchiveStrategy,
    pub compressed: bool,
    pub encryption: Option<EncryptionParams>,
    pub created: DateTime<Utc>,
    pub entries: Option<u64>,
}

/// Writes one archive. `fill` receives the innermost writer and produces the
/// tar bytes, returning the number of entries when it knows it.
pub(crate) fn write_archive<F>(
    storage: &dyn StorageLocation,
    target: &ArchiveTarget,
    options: &ArchiveOptions,
    strategy: ArchiveStrategy,
    cancel: &CancelToken,
    fill: F,
) -> Result<BackupOutcome>
where
    F: FnOnce(&mut ArchiveSink) -> Result<Option<u64>>,
{
    cancel.check()?;
    let name = ArchiveName::for_options(target.relative_data_path(), options);
    let dir = target.storage_root();
    let tmp_path = dir.join(name.tmp_file_name());
    let final_path = dir.join(name.to_string());
    let properties_path = dir.join(name.properties_file_name());
    let params = options.encryptor.generate_params();

    storage.ensure_dir(dir)?;
    let written = (|| -> Result<Option<u64>> {
        let writer = storage.create_file(&tmp_path)?;
        let encryptor = options
            .encryptor
            .build_encryptor(BufWriter::new(writer), params.as_ref())?;
        let mut sink = options.compressor.build_compressor(encryptor)?;
        let entries = fill(&mut sink)?;
        cancel.check()?;
        close_sink(sink)?;
        Ok(entries)
    })();

    let entries = match written {
        Ok(entries) => entries,
        Err(e) => {
            discard(storage, &tmp_path);
            let e = if cancel.is_cancelled() { Error::Cancelled } else { e };
            return Err(e.add_msg(format!("Cannot write archive {final_path:?}")));
        }
    };

    let properties = ArchiveProperties {
        format_version: FORMAT_VERSION,
        owner: target.owner().clone(),
        kind: name.kind.clone(),
        strategy,
        compressed: name.compressed,
        encryption: params,
        created: Utc::now(),
        entries,
    };
    let committed = write_properties(storage, &properties_path, &properties)
        .and_then(|_| storage.rename(&tmp_path, &final_path));
    if let Err(e) = committed {
        discard(storage, &tmp_path);
        return Err(e);
    }

    tracing::info!(
        "Created archive {:?} for {} with {} strategy",
        final_path,
        target.owner(),
        strategy
    );
    Ok(BackupOutcome {
        archive: name,
        path: final_path,
        entries,
    })
}

fn close_sink(sink: ArchiveSink) -> Result<()> {
    let writer = sink
        .finish()?
        .finish()?
        .into_inner()
        .map_err(IntoInnerError::into_error)?;
    writer.commit()
}

fn discard(storage: &dyn StorageLocation, tmp_path: &std::path::Path) {
    if let Err(e) = storage.delete(tmp_path) {
        tracing::warn!("Cannot remove unfinished archive {:?}: {}", tmp_path, e);
    }
}

fn write_properties(
    storage: &dyn StorageLocation,
    path: &std::path::Path,
    properties: &ArchiveProperties,
) -> Result<()> {
    let mut writer = storage.create_file(path)?;
    serde_json::to_writer_pretty(&mut writer, properties)?;
    writer.commit()
}

pub fn read_properties(
    storage: &dyn StorageLocation,
    target: &ArchiveTarget,
    name: &ArchiveName,
) -> Result<Option<ArchiveProperties>> {
    let path = target.storage_root().join(name.properties_file_name());
    if !storage.exists(&path)? {
        return Ok(None);
    }
    serde_json::from_reader(storage.open_file(&path)?)
        .map(Some)
        .map_err(|e| Error::archive_corrupt(format!("unreadable archive properties {path:?}: {e}")))
}

/// Opens an archive for reading with every layer its name announces undone.
pub(crate) fn open_archive(
    storage: &dyn StorageLocation,
    target: &ArchiveTarget,
    name: &ArchiveName,
    options: &ArchiveOptions,
) -> Result<(ArchiveSource, ReadProbe)> {
    let params = if name.encrypted {
        let properties = read_properties(storage, target, name)?;
        Some(
            properties
                .and_then(|p| p.encryption)
                .ok_or_else(|| Error::archive_corrupt(format!("{name} has no encryption parameters")))?,
        )
    } else {
        None
    };

    let path = target.storage_root().join(name.to_string());
    let raw = storage.open_file(&path)?;
    let decryptor = options
        .encryptor
        .build_decryptor(BufReader::new(raw), params.as_ref())
        .map_err(|e| match e {
            Error::EncryptionKeyMissing(_) => e,
            e => Error::archive_corrupt(e.to_string()),
        })?;
    let decompressor = open_decompressor(decryptor, name.compressed)?;
    let probe = ReadProbe::default();
    Ok((
        ProbedReader {
            inner: decompressor,
            probe: probe.clone(),
        },
        probe,
    ))
}

/// Remembers whether the read side of an archive ever failed, so errors from
/// a copy can be blamed on the archive or on the destination.
#[derive(Clone, Debug, Default)]
pub struct ReadProbe {
    failed: Arc<AtomicBool>,
}

impl ReadProbe {
    pub fn tripped(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Read-side failures become `ArchiveCorrupt`; the rest pass through.
    pub fn classify(&self, error: Error) -> Error {
        if self.tripped() && !error.is_cancelled() && !error.is_archive_corrupt() {
            Error::archive_corrupt(error.to_string())
        } else {
            error
        }
    }
}

pub struct ProbedReader<R> {
    inner: R,
    probe: ReadProbe,
}

impl<R: Read> Read for ProbedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| {
            self.probe.failed.store(true, Ordering::SeqCst);
        })
    }
}

/// Reads the decoded stream to its end so trailing tags and checksums get verified.
pub(crate) fn drain<R: Read>(reader: &mut R) -> Result<u64> {
    io::copy(reader, &mut io::sink())
        .map_err(|e| Error::archive_corrupt(format!("archive trailer is damaged: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::encrypt::tests::quick_aes;
    use crate::backup::storage::path::PathStorage;
    use std::path::Path;
    use tempfile::TempDir;

    fn target() -> ArchiveTarget {
        ArchiveTarget::new("org.example.app", "data", "org.example.app/2024-01-01T00h00m00s")
    }

    fn write(storage: &PathStorage, options: &ArchiveOptions, payload: &'static [u8]) -> Result<BackupOutcome> {
        write_archive(
            storage,
            &target(),
            options,
            ArchiveStrategy::Stream,
            &CancelToken::new(),
            |sink| {
                sink.write_all(payload)?;
                Ok(Some(1))
            },
        )
    }

    fn read_all(storage: &PathStorage, options: &ArchiveOptions, name: &ArchiveName) -> Result<Vec<u8>> {
        let (mut source, probe) = open_archive(storage, &target(), name, options)?;
        let mut out = Vec::new();
        source
            .read_to_end(&mut out)
            .map_err(|e| probe.classify(e.into()))?;
        Ok(out)
    }

    #[test]
    fn test_layers_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        let options = ArchiveOptions::builder().encryptor(quick_aes()).build();
        let outcome = write(&storage, &options, b"tar bytes").unwrap();
        assert_eq!(outcome.archive.to_string(), "data.tar.gz.enc");

        let listed = storage.list(target().storage_root()).unwrap();
        assert_eq!(listed, vec!["data.properties.json", "data.tar.gz.enc"]);

        let properties = read_properties(&storage, &target(), &outcome.archive)
            .unwrap()
            .unwrap();
        assert_eq!(properties.format_version, FORMAT_VERSION);
        assert_eq!(properties.entries, Some(1));
        assert!(properties.compressed);
        assert!(properties.encryption.is_some());

        assert_eq!(read_all(&storage, &options, &outcome.archive).unwrap(), b"tar bytes");
    }

    #[test]
    fn test_failed_fill_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        let options = ArchiveOptions::builder().build();
        let res = write_archive(
            &storage,
            &target(),
            &options,
            ArchiveStrategy::Stream,
            &CancelToken::new(),
            |sink| {
                sink.write_all(b"half")?;
                Err(Error::Cancelled)
            },
        );
        assert!(res.unwrap_err().is_cancelled());
        assert!(storage.list(target().storage_root()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_sidecar_for_encrypted_archive() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        let options = ArchiveOptions::builder().encryptor(quick_aes()).build();
        let outcome = write(&storage, &options, b"x").unwrap();
        storage
            .delete(&target().storage_root().join(outcome.archive.properties_file_name()))
            .unwrap();
        let err = read_all(&storage, &options, &outcome.archive).unwrap_err();
        assert!(err.is_archive_corrupt());
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        let options = ArchiveOptions::builder()
            .compressor(CompressorConfig::None)
            .encryptor(quick_aes())
            .build();
        let outcome = write(&storage, &options, b"0123456789").unwrap();
        let file = dir.path().join(&outcome.path);
        let mut bytes = std::fs::read(&file).unwrap();
        bytes[3] ^= 0x40;
        std::fs::write(&file, bytes).unwrap();
        let err = read_all(&storage, &options, &outcome.archive).unwrap_err();
        assert!(err.is_archive_corrupt(), "{err}");
    }

    #[test]
    fn test_plain_archive_ignores_passphrase() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        let outcome = write(&storage, &ArchiveOptions::builder().build(), b"clear").unwrap();
        let with_key = ArchiveOptions::builder().encryptor(quick_aes()).build();
        assert_eq!(read_all(&storage, &with_key, &outcome.archive).unwrap(), b"clear");
        assert!(Path::new(&dir.path().join(&outcome.path)).exists());
    }
}
