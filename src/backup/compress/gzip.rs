use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Gzip settings. Gzip is what the shell `tar -z` side understands too.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GzipConfig {
    /// 0 stores, 9 is slowest and smallest
    #[validate(range(min = 0, max = 9))]
    pub level: Option<u32>,
}

impl<W: Write> CompressorBuilder<W> for GzipConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        tracing::debug!("Creating gzip compressor with level={}", level);
        Ok(GzEncoder::new(writer, Compression::new(level)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::finish::Finish;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_gzip_config_validation() {
        assert!(GzipConfig { level: Some(0) }.validate().is_ok());
        assert!(GzipConfig { level: Some(9) }.validate().is_ok());
        assert!(GzipConfig { level: Some(10) }.validate().is_err());
        assert!(GzipConfig::default().validate().is_ok());
    }

    #[test]
    fn test_levels_produce_readable_streams() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(50);
        for level in [0, 1, 9] {
            let mut compressor = GzipConfig { level: Some(level) }
                .build_compressor(Vec::new())
                .unwrap();
            compressor.write_all(&data).unwrap();
            let bytes = compressor.finish().unwrap();
            if level > 0 {
                assert!(bytes.len() < data.len());
            }
            let mut back = Vec::new();
            GzDecoder::new(bytes.as_slice())
                .read_to_end(&mut back)
                .unwrap();
            assert_eq!(back, data);
        }
    }
}
