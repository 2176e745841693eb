//! Cooperative cancellation shared between a batch and the archive operations it runs.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Fails the next read once the token is cancelled.
pub struct CancellableReader<'a, R> {
    inner: R,
    token: &'a CancelToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub fn new(inner: R, token: &'a CancelToken) -> Self {
        Self { inner, token }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(std::io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}
