use flate2::write::GzEncoder;
use std::io::{Error, Write};

/// Ends a writer layer, flushing whatever trailer it owes, and hands back the inner writer.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for GzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for tar::Builder<W> {
    fn finish(self) -> Result<W, Error> {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;

    #[test]
    fn test_gz_finish_writes_trailer() {
        let encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let bytes = Finish::finish(encoder).unwrap();
        // header plus crc32 and size trailer
        assert!(bytes.len() >= 18);
    }

    #[test]
    fn test_tar_finish_writes_end_blocks() {
        let builder = tar::Builder::new(Vec::new());
        let bytes = Finish::finish(builder).unwrap();
        assert_eq!(bytes.len(), 1024);
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
