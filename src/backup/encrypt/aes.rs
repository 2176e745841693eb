//! AES-256-GCM in the STREAM construction.
//!
//! The plaintext is cut into 64 KiB segments, each sealed on its own with a
//! counter nonce; the final segment carries a last-block flag, so truncation at
//! a segment boundary fails authentication like any flipped byte does.

use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use sha2::Sha256;
use std::io;
use std::io::{Read, Write};
use zeroize::Zeroize;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const TAG_SIZE: usize = 16;
pub const IV_SIZE: usize = 7;
pub const SALT_SIZE: usize = 16;
pub const DEFAULT_KDF_ROUNDS: u32 = 100_000;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// Per-archive key material stored next to the archive, never inside it.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    #[serde_as(as = "Base64")]
    pub salt: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub iv: Vec<u8>,
    pub kdf_rounds: u32,
}

impl EncryptionParams {
    /// Fresh random salt and IV.
    pub fn generate(kdf_rounds: u32) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        let mut iv = vec![0u8; IV_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);
        Self {
            salt,
            iv,
            kdf_rounds,
        }
    }

    pub(crate) fn cipher(&self, passphrase: &RedactedString) -> Result<Aes256Gcm> {
        if self.iv.len() != IV_SIZE || self.salt.is_empty() || self.kdf_rounds == 0 {
            return Err(Error::archive_corrupt(format!(
                "invalid encryption parameters (iv {} bytes, salt {} bytes, {} rounds)",
                self.iv.len(),
                self.salt.len(),
                self.kdf_rounds
            )));
        }
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            passphrase.expose().as_bytes(),
            &self.salt,
            self.kdf_rounds,
            &mut key,
        );
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
        key.zeroize();
        Ok(cipher)
    }
}

pub struct AesStreamWriter<W: Write> {
    inner: W,
    stream: EncryptorBE32<Aes256Gcm>,
    buffer: Vec<u8>,
}

impl<W: Write> AesStreamWriter<W> {
    pub fn new(inner: W, passphrase: &RedactedString, params: &EncryptionParams) -> Result<Self> {
        let cipher = params.cipher(passphrase)?;
        Ok(Self {
            inner,
            stream: EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&params.iv)),
            buffer: Vec::with_capacity(CHUNK_SIZE + 1),
        })
    }

    /// Seals the buffered tail as the last segment.
    pub fn finish(self) -> io::Result<W> {
        let Self {
            mut inner,
            stream,
            mut buffer,
        } = self;
        let sealed = stream
            .encrypt_last(buffer.as_slice())
            .map_err(|_| io::Error::other("encryption failed"))?;
        buffer.zeroize();
        inner.write_all(&sealed)?;
        Ok(inner)
    }
}

impl<W: Write> Write for AesStreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        // a full segment stays buffered until more data proves it is not the last one
        while self.buffer.len() > CHUNK_SIZE {
            let sealed = self
                .stream
                .encrypt_next(&self.buffer[..CHUNK_SIZE])
                .map_err(|_| io::Error::other("encryption failed"))?;
            self.buffer.drain(..CHUNK_SIZE);
            self.inner.write_all(&sealed)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct AesStreamReader<R: Read> {
    inner: R,
    stream: Option<DecryptorBE32<Aes256Gcm>>,
    sealed: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
}

impl<R: Read> AesStreamReader<R> {
    pub fn new(inner: R, passphrase: &RedactedString, params: &EncryptionParams) -> Result<Self> {
        let cipher = params.cipher(passphrase)?;
        Ok(Self {
            inner,
            stream: Some(DecryptorBE32::from_aead(
                cipher,
                GenericArray::from_slice(&params.iv),
            )),
            sealed: Vec::with_capacity(SEALED_CHUNK_SIZE + 1),
            plain: Vec::new(),
            pos: 0,
        })
    }

    fn open_next_segment(&mut self) -> io::Result<()> {
        let mut eof = false;
        let mut buf = [0u8; 8192];
        while self.sealed.len() <= SEALED_CHUNK_SIZE && !eof {
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                eof = true;
            } else {
                self.sealed.extend_from_slice(&buf[..n]);
            }
        }

        self.plain.zeroize();
        self.pos = 0;
        if self.sealed.len() > SEALED_CHUNK_SIZE {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(());
            };
            self.plain = stream
                .decrypt_next(&self.sealed[..SEALED_CHUNK_SIZE])
                .map_err(|_| authentication_failed())?;
            self.sealed.drain(..SEALED_CHUNK_SIZE);
        } else if let Some(stream) = self.stream.take() {
            self.plain = stream
                .decrypt_last(self.sealed.as_slice())
                .map_err(|_| authentication_failed())?;
            self.sealed.clear();
        }
        Ok(())
    }
}

impl<R: Read> Read for AesStreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.stream.is_none() {
                return Ok(0);
            }
            self.open_next_segment()?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn authentication_failed() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "encrypted segment failed authentication",
    )
}
