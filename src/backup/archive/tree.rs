//! Privileged listing and clearing of directory trees.
//!
//! Names travel as NUL terminated raw bytes, so any name the filesystem
//! accepts survives the round trip through the shell.

use crate::backup::archive::entry::{EntryKind, FileEntry, STAT_FORMAT};
use crate::backup::archive::exclude::ExcludeMatcher;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFnName;
use crate::backup::shell::{quote, script, CommandLine, RawShellResult, ShellHandler};
use function_name::named;
use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Commands per generated script.
const SCRIPT_BATCH: usize = 64;

/// Runs `lines` as `set -e` scripts of at most [`SCRIPT_BATCH`] commands.
pub(crate) fn run_script(shell: &ShellHandler, lines: &[CommandLine]) -> Result<()> {
    for chunk in lines.chunks(SCRIPT_BATCH) {
        shell.run_checked(script("set -e", chunk))?;
    }
    Ok(())
}

fn is_dir(shell: &ShellHandler, path: &Path) -> Result<bool> {
    Ok(shell
        .run(CommandLine::new("[ -d").path(path).arg("]"))?
        .is_success())
}

/// `find` exits non-zero when entries vanish under it, which live data does.
fn check_listing(listing: &RawShellResult, root: &Path) -> Result<()> {
    if listing.is_success() {
        return Ok(());
    }
    let vanished = !listing.err().is_empty()
        && listing
            .err()
            .iter()
            .all(|l| l.contains("No such file or directory"));
    if !vanished {
        return Err(Error::shell_command_failed(
            "find",
            listing.exit_code(),
            listing.err().clone(),
        ));
    }
    tracing::warn!("Entries vanished while listing {:?}", root);
    Ok(())
}

/// Splits `fields\nname\0` records as printed by the walk.
fn stat_records(out: &[u8]) -> Result<Vec<(&str, &OsStr)>> {
    let malformed = || {
        Error::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "truncated stat record",
        ))
    };
    let mut records = Vec::new();
    let mut rest = out;
    while !rest.is_empty() {
        let newline = rest.iter().position(|&b| b == b'\n').ok_or_else(malformed)?;
        let fields = std::str::from_utf8(&rest[..newline]).map_err(|_| malformed())?;
        let after = &rest[newline + 1..];
        let nul = after.iter().position(|&b| b == 0).ok_or_else(malformed)?;
        records.push((fields, OsStr::from_bytes(&after[..nul])));
        rest = &after[nul + 1..];
    }
    Ok(records)
}

fn nul_separated(out: &[u8]) -> impl Iterator<Item = &Path> {
    out.split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| Path::new(OsStr::from_bytes(name)))
}

/// Every entry below `source` except excluded ones and sockets, sorted by path
/// so parents come before children.
#[named]
pub fn walk(shell: &ShellHandler, source: &Path, exclude: &ExcludeMatcher) -> Result<Vec<FileEntry>> {
    if !is_dir(shell, source)? {
        return Err(Error::NotFound(format!("{source:?} is not a directory")));
    }

    let listing = shell.run_raw(
        CommandLine::new(shell.tool("find")?)
            .path(source)
            .arg("-mindepth 1 -exec")
            .arg(shell.tool("stat")?)
            .arg("-c")
            .arg(quote(STAT_FORMAT))
            .arg("{} \\; -print0"),
    )?;
    check_listing(&listing, source).add_fn_name(function_path!())?;

    let mut entries = Vec::new();
    for (fields, name) in stat_records(listing.out())? {
        let mut entry = FileEntry::parse_stat_record(fields, Path::new(name), source)?;
        if exclude.is_excluded(&entry.path) {
            tracing::trace!("Excluded {:?}", entry.path);
            continue;
        }
        match entry.kind {
            EntryKind::Socket => {
                tracing::warn!(
                    "{}",
                    Error::UnsupportedEntryType {
                        path: entry.path.clone(),
                        kind: entry.kind.to_string(),
                    }
                );
                continue;
            }
            EntryKind::Symlink => {
                entry.link_target = Some(read_link(shell, &source.join(&entry.path))?);
            }
            _ => {}
        }
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!("Walked {} entries below {:?}", entries.len(), source);
    Ok(entries)
}

/// The target exactly as stored, without following it.
pub fn read_link(shell: &ShellHandler, path: &Path) -> Result<PathBuf> {
    let command = CommandLine::new(shell.tool("readlink")?).path(path);
    let res = shell.run_raw(&command)?;
    if !res.is_success() {
        return Err(Error::shell_command_failed(
            command.as_os_str().to_string_lossy(),
            res.exit_code(),
            res.err().clone(),
        ));
    }
    let mut target = res.out().clone();
    if target.last() == Some(&b'\n') {
        target.pop();
    }
    Ok(PathBuf::from(OsString::from_vec(target)))
}

/// Paths below `root`, relative to it, of everything `find` matches with `predicate`.
fn find_relative(shell: &ShellHandler, root: &Path, predicate: &str) -> Result<Vec<PathBuf>> {
    let listing = shell.run_raw(
        CommandLine::new(shell.tool("find")?)
            .path(root)
            .arg("-mindepth 1")
            .arg(predicate)
            .arg("-print0"),
    )?;
    check_listing(&listing, root)?;
    let mut found = nul_separated(listing.out())
        .filter_map(|p| p.strip_prefix(root).ok().map(Path::to_path_buf))
        .filter(|p| !p.as_os_str().is_empty())
        .collect::<Vec<_>>();
    found.sort();
    Ok(found)
}

/// Symlinks currently below `root`, relative to it.
pub fn symlinks(shell: &ShellHandler, root: &Path) -> Result<BTreeSet<PathBuf>> {
    if !is_dir(shell, root)? {
        return Ok(BTreeSet::new());
    }
    Ok(find_relative(shell, root, "-type l")?.into_iter().collect())
}

/// Empties `destination` except for excluded entries and the directories
/// holding them. A missing destination is left alone.
#[named]
pub fn clear_destination(
    shell: &ShellHandler,
    destination: &Path,
    exclude: &ExcludeMatcher,
) -> Result<()> {
    if !is_dir(shell, destination)? {
        return Ok(());
    }
    let existing = find_relative(shell, destination, "").add_fn_name(function_path!())?;
    let holders = existing
        .iter()
        .filter(|p| exclude.is_excluded(p))
        .flat_map(|p| p.ancestors().skip(1))
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect::<BTreeSet<_>>();

    let rm = shell.tool("rm")?;
    let mut removed = BTreeSet::new();
    let mut lines = Vec::new();
    for relative in existing {
        if exclude.is_excluded(&relative)
            || holders.contains(&relative)
            || relative.ancestors().skip(1).any(|a| removed.contains(a))
        {
            continue;
        }
        lines.push(
            CommandLine::new(&rm)
                .arg("-rf")
                .path(destination.join(&relative)),
        );
        removed.insert(relative);
    }
    run_script(shell, &lines).add_fn_name(function_path!())?;
    tracing::debug!("Cleared {} entries from {:?}", removed.len(), destination);
    Ok(())
}
