pub mod gzip;

use crate::backup::compress::gzip::GzipConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::From;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use io_enum::{Read, Write};
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{Chain, Cursor, Read, Write};
use std::result;
use validator::{Validate, ValidationErrors};

pub static GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
}

/// Restore side; the inner reader is prefixed with the bytes consumed by the magic check.
#[derive(Read)]
pub enum Decompressor<R: Read> {
    None(Chain<Cursor<Vec<u8>>, R>),
    Gzip(GzDecoder<Chain<Cursor<Vec<u8>>, R>>),
}

#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    #[serde(alias = "gz")]
    Gzip(GzipConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Gzip(GzipConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Gzip(gzip) => gzip.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Gzip(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Gzip(gzip) => gzip.build_compressor(writer),
        }
    }
}

impl CompressorConfig {
    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressorConfig::None)
    }
}

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<&'static str> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Gzip(_) => Some("gz"),
        }
    }
}

/// Opens the restore side of the compression layer.
///
/// Whether the stream is compressed comes from the archive name; the first two
/// bytes are only checked against it. Both mismatches are `ArchiveCorrupt`.
pub fn open_decompressor<R: Read>(mut reader: R, compressed: bool) -> Result<Decompressor<R>> {
    let mut head = Vec::with_capacity(GZIP_MAGIC.len());
    (&mut reader)
        .take(GZIP_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .map_err(|e| Error::archive_corrupt(format!("cannot read archive header: {e}")))?;
    let has_magic = head.as_slice() == GZIP_MAGIC;

    if compressed && !has_magic {
        return Err(Error::archive_corrupt("Input is not in the .gz format"));
    }
    if !compressed && has_magic {
        return Err(Error::archive_corrupt(
            "archive is gzip compressed but its name does not say so",
        ));
    }

    let reader = Cursor::new(head).chain(reader);
    Ok(if compressed {
        Decompressor::Gzip(GzDecoder::new(reader))
    } else {
        Decompressor::None(reader)
    })
}
