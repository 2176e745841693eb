//! One filesystem entry as captured by the walk and as carried in a tar header.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};
use tar::{EntryType, Header};

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;
pub const PERMISSION_BITS: u32 = 0o7777;

/// `stat` format for the walk: raw mode in hex, uid, gid, size, mtime, then
/// device major and minor in hex. The name follows separately, NUL terminated.
pub static STAT_FORMAT: &str = "%f %u %g %s %Y %t %T";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl EntryKind {
    fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(EntryKind::Regular),
            S_IFDIR => Some(EntryKind::Directory),
            S_IFLNK => Some(EntryKind::Symlink),
            S_IFIFO => Some(EntryKind::Fifo),
            S_IFCHR => Some(EntryKind::CharDevice),
            S_IFBLK => Some(EntryKind::BlockDevice),
            S_IFSOCK => Some(EntryKind::Socket),
            _ => None,
        }
    }

    pub fn tar_type(self) -> Option<EntryType> {
        match self {
            EntryKind::Regular => Some(EntryType::Regular),
            EntryKind::Directory => Some(EntryType::Directory),
            EntryKind::Symlink => Some(EntryType::Symlink),
            EntryKind::HardLink => Some(EntryType::Link),
            EntryKind::Fifo => Some(EntryType::Fifo),
            EntryKind::CharDevice => Some(EntryType::Char),
            EntryKind::BlockDevice => Some(EntryType::Block),
            EntryKind::Socket => None,
        }
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntryKind::Regular => "regular file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::HardLink => "hard link",
            EntryKind::Fifo => "fifo",
            EntryKind::CharDevice => "character device",
            EntryKind::BlockDevice => "block device",
            EntryKind::Socket => "socket",
        };
        write!(f, "{name}")
    }
}

/// `path` is relative to the archived directory. Only regular files carry a size.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub mtime: i64,
    pub size: u64,
    pub link_target: Option<PathBuf>,
    pub device: Option<(u32, u32)>,
}

impl FileEntry {
    /// Parses the [`STAT_FORMAT`] fields of `full_path`, an entry below `root`.
    pub fn parse_stat_record(fields: &str, full_path: &Path, root: &Path) -> Result<Self> {
        let malformed = || {
            Error::from(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected stat output {fields:?} for {full_path:?}"),
            ))
        };
        let mut fields = fields.split(' ');
        let mut next = || fields.next().ok_or_else(malformed);

        let raw_mode = u32::from_str_radix(next()?, 16).map_err(|_| malformed())?;
        let uid = next()?.parse::<u64>().map_err(|_| malformed())?;
        let gid = next()?.parse::<u64>().map_err(|_| malformed())?;
        let size = next()?.parse::<u64>().map_err(|_| malformed())?;
        let mtime = next()?.parse::<i64>().map_err(|_| malformed())?;
        let major = u32::from_str_radix(next()?, 16).map_err(|_| malformed())?;
        let minor = u32::from_str_radix(next()?, 16).map_err(|_| malformed())?;

        let relative = full_path
            .strip_prefix(root)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(malformed)?;

        let kind = EntryKind::from_mode(raw_mode).ok_or_else(malformed)?;
        Ok(Self {
            path: relative.to_path_buf(),
            kind,
            uid,
            gid,
            mode: raw_mode & PERMISSION_BITS,
            mtime,
            size: if kind == EntryKind::Regular { size } else { 0 },
            link_target: None,
            device: match kind {
                EntryKind::CharDevice | EntryKind::BlockDevice => Some((major, minor)),
                _ => None,
            },
        })
    }

    /// Header for this entry; path and link name are set when appending.
    pub fn tar_header(&self) -> Result<Header> {
        let entry_type = self.kind.tar_type().ok_or_else(|| Error::UnsupportedEntryType {
            path: self.path.clone(),
            kind: self.kind.to_string(),
        })?;
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(self.mode);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header.set_mtime(self.mtime.max(0) as u64);
        header.set_size(self.size);
        if let Some((major, minor)) = self.device {
            header.set_device_major(major)?;
            header.set_device_minor(minor)?;
        }
        Ok(header)
    }

    /// Reads an entry back from a tar member; `None` for the archive root and
    /// for metadata members such as pax headers.
    pub fn from_tar_entry<R: std::io::Read>(entry: &tar::Entry<R>) -> Result<Option<Self>> {
        let header = entry.header();
        let kind = match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Fifo => EntryKind::Fifo,
            EntryType::Char => EntryKind::CharDevice,
            EntryType::Block => EntryKind::BlockDevice,
            EntryType::Link => EntryKind::HardLink,
            EntryType::XHeader
            | EntryType::XGlobalHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink => return Ok(None),
            other => {
                return Err(Error::UnsupportedEntryType {
                    path: entry.path().map(|p| p.into_owned()).unwrap_or_default(),
                    kind: format!("{other:?}"),
                })
            }
        };

        let raw_path = entry.path().map_err(|e| Error::archive_corrupt(e.to_string()))?;
        let Some(path) = normalize_member_path(&raw_path)? else {
            return Ok(None);
        };

        let link_target = match header.entry_type() {
            EntryType::Symlink | EntryType::Link => Some(
                entry
                    .link_name()
                    .map_err(|e| Error::archive_corrupt(e.to_string()))?
                    .ok_or_else(|| Error::archive_corrupt(format!("{path:?} has no link target")))?
                    .into_owned(),
            ),
            _ => None,
        };

        let device = match kind {
            EntryKind::CharDevice | EntryKind::BlockDevice => Some((
                header.device_major()?.unwrap_or(0),
                header.device_minor()?.unwrap_or(0),
            )),
            _ => None,
        };

        Ok(Some(Self {
            path,
            kind,
            uid: header.uid()?,
            gid: header.gid()?,
            mode: header.mode()? & PERMISSION_BITS,
            mtime: header.mtime()? as i64,
            size: if kind == EntryKind::Regular { entry.size() } else { 0 },
            link_target,
            device,
        }))
    }
}

/// Strips `./`, drops the root itself, and rejects members that would land
/// outside the destination.
pub fn normalize_member_path(path: &Path) -> Result<Option<PathBuf>> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::archive_corrupt(format!(
                    "member {path:?} escapes the destination"
                )))
            }
        }
    }
    Ok((!normalized.as_os_str().is_empty()).then_some(normalized))
}
