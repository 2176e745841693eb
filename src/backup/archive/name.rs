use crate::backup::archive::ArchiveOptions;
use crate::backup::file_ext::FileExtProvider;
use std::fmt::{Display, Formatter};

pub static TAR_EXT: &str = "tar";
pub static TMP_EXT: &str = "tmp";
pub static PROPERTIES_SUFFIX: &str = "properties.json";

/// `<kind>.tar[.gz][.enc]`. The name alone says which layers to undo.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveName {
    pub kind: String,
    pub compressed: bool,
    pub encrypted: bool,
}

impl ArchiveName {
    pub fn for_options<S: Into<String>>(kind: S, options: &ArchiveOptions) -> Self {
        Self {
            kind: kind.into(),
            compressed: options.compressor.file_ext().is_some(),
            encrypted: options.encryptor.file_ext().is_some(),
        }
    }

    /// Inverse of `Display`; anything else in a backup directory yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (rest, encrypted) = match file_name.strip_suffix(".enc") {
            Some(rest) => (rest, true),
            None => (file_name, false),
        };
        let (rest, compressed) = match rest.strip_suffix(".gz") {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let kind = rest.strip_suffix(".tar")?;
        if kind.is_empty() || kind.contains('/') {
            return None;
        }
        Some(Self {
            kind: kind.to_string(),
            compressed,
            encrypted,
        })
    }

    pub fn tmp_file_name(&self) -> String {
        format!("{self}.{TMP_EXT}")
    }

    pub fn properties_file_name(&self) -> String {
        format!("{}.{PROPERTIES_SUFFIX}", self.kind)
    }
}

impl Display for ArchiveName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{TAR_EXT}", self.kind)?;
        if self.compressed {
            write!(f, ".gz")?;
        }
        if self.encrypted {
            write!(f, ".enc")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::CompressorConfig;
    use crate::backup::encrypt::tests::quick_aes;

    #[test]
    fn test_names_follow_layers() {
        let plain = ArchiveOptions::builder()
            .compressor(CompressorConfig::None)
            .build();
        assert_eq!(ArchiveName::for_options("data", &plain).to_string(), "data.tar");

        let gz = ArchiveOptions::builder().build();
        assert_eq!(ArchiveName::for_options("obb", &gz).to_string(), "obb.tar.gz");

        let enc = ArchiveOptions::builder().encryptor(quick_aes()).build();
        let name = ArchiveName::for_options("media", &enc);
        assert_eq!(name.to_string(), "media.tar.gz.enc");
        assert_eq!(name.tmp_file_name(), "media.tar.gz.enc.tmp");
        assert_eq!(name.properties_file_name(), "media.properties.json");
    }

    #[test]
    fn test_parse() {
        for name in ["data.tar", "data.tar.gz", "data.tar.enc", "device_protected_data.tar.gz.enc"] {
            assert_eq!(ArchiveName::parse(name).unwrap().to_string(), name);
        }
        assert_eq!(ArchiveName::parse("data.tar.gz.tmp"), None);
        assert_eq!(ArchiveName::parse("data.properties.json"), None);
        assert_eq!(ArchiveName::parse(".tar"), None);
        let parsed = ArchiveName::parse("external_data.tar.enc").unwrap();
        assert_eq!(parsed.kind, "external_data");
        assert!(!parsed.compressed);
        assert!(parsed.encrypted);
    }
}
