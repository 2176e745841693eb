pub mod aes;

use crate::backup::encrypt::aes::{AesStreamReader, AesStreamWriter, EncryptionParams, DEFAULT_KDF_ROUNDS};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::From;
use io_enum::{Read, Write};
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, Read, Write};
use std::result;
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Encryptor<W: Write> {
    None(W),
    Aes(AesStreamWriter<W>),
}

#[derive(Read, From)]
pub enum Decryptor<R: Read> {
    None(R),
    Aes(AesStreamReader<R>),
}

#[derive(Clone, Validate, Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct AesConfig {
    #[validate(nested)]
    pub passphrase: RedactedString,
    /// PBKDF2 rounds for new archives; restores use the count stored with the archive
    #[serde(default = "default_kdf_rounds")]
    #[validate(range(min = 1000))]
    pub kdf_rounds: u32,
}

fn default_kdf_rounds() -> u32 {
    DEFAULT_KDF_ROUNDS
}

impl AesConfig {
    pub fn new<S: Into<RedactedString>>(passphrase: S) -> Self {
        Self {
            passphrase: passphrase.into(),
            kdf_rounds: DEFAULT_KDF_ROUNDS,
        }
    }
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug)]
#[serde(tag = "encryptor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EncryptorConfig {
    #[default]
    None,
    Aes(AesConfig),
}

impl Validate for EncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            EncryptorConfig::None => Ok(()),
            EncryptorConfig::Aes(inner) => inner.validate(),
        }
    }
}

pub trait EncryptorBuilder<W: Write> {
    /// `params` is `None` exactly when encryption is off.
    fn build_encryptor(&self, writer: W, params: Option<&EncryptionParams>) -> Result<Encryptor<W>>;
}

impl<W: Write> Finish<W> for Encryptor<W> {
    fn finish(self) -> result::Result<W, IoError> {
        match self {
            Encryptor::None(w) => Ok(w),
            Encryptor::Aes(w) => w.finish(),
        }
    }
}

impl<W: Write> EncryptorBuilder<W> for EncryptorConfig {
    fn build_encryptor(&self, writer: W, params: Option<&EncryptionParams>) -> Result<Encryptor<W>> {
        match (self, params) {
            (EncryptorConfig::Aes(aes), Some(params)) => {
                tracing::debug!("Encrypting with AES-256-GCM stream");
                Ok(AesStreamWriter::new(writer, &aes.passphrase, params)?.into())
            }
            (EncryptorConfig::None, None) => Ok(writer.into()),
            (EncryptorConfig::Aes(_), None) => Err(Error::EncryptionKeyMissing(
                "encryption parameters were not generated".into(),
            )),
            (EncryptorConfig::None, Some(_)) => Err(Error::EncryptionKeyMissing(
                "encryption requested but no passphrase is configured".into(),
            )),
        }
    }
}

impl EncryptorConfig {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, EncryptorConfig::Aes(_))
    }

    /// Fresh parameters for one new archive.
    pub fn generate_params(&self) -> Option<EncryptionParams> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Aes(aes) => Some(EncryptionParams::generate(aes.kdf_rounds)),
        }
    }

    /// Restore side. `params` come from the archive's sidecar; `None` means the
    /// archive was written in the clear, which any config can read.
    pub fn build_decryptor<R: Read>(
        &self,
        reader: R,
        params: Option<&EncryptionParams>,
    ) -> Result<Decryptor<R>> {
        match (self, params) {
            (_, None) => Ok(Decryptor::None(reader)),
            (EncryptorConfig::Aes(aes), Some(params)) => {
                Ok(AesStreamReader::new(reader, &aes.passphrase, params)?.into())
            }
            (EncryptorConfig::None, Some(_)) => Err(Error::EncryptionKeyMissing(
                "archive is encrypted but no passphrase is configured".into(),
            )),
        }
    }
}

impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> Option<&'static str> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Aes(_) => Some("enc"),
        }
    }
}
