use crate::backup::archive::frame::{drain, open_archive, write_archive};
use crate::backup::archive::name::ArchiveName;
use crate::backup::archive::{
    ArchiveEngine, ArchiveOptions, ArchiveStrategy, ArchiveTarget, BackupOutcome, RestoreOutcome,
};
use crate::backup::cancel::{CancelToken, CancellableReader};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFnName;
use crate::backup::archive::exclude::ExcludeMatcher;
use crate::backup::archive::tree::clear_destination;
use crate::backup::shell::{quote, CommandLine, ShellHandler};
use crate::backup::storage::StorageLocation;
use function_name::named;
use itertools::Itertools;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// What `tar -x` prints when its input is not a valid tar stream.
const CORRUPT_TAR_MARKERS: [&str; 4] = [
    "Unexpected EOF",
    "does not look like a tar archive",
    "Skipping to next header",
    "Damaged tar archive",
];

/// Delegates walking and extraction to the `tar` of the privileged shell.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    shell: Arc<ShellHandler>,
    storage: Arc<dyn StorageLocation>,
}

impl CommandEngine {
    pub fn new(shell: Arc<ShellHandler>, storage: Arc<dyn StorageLocation>) -> Self {
        Self { shell, storage }
    }

    fn create_command(&self, source: &Path, options: &ArchiveOptions) -> Result<CommandLine> {
        let excludes = options
            .exclude
            .iter()
            .map(|glob| format!("--exclude={}", quote(format!("./{}", glob.pattern()))))
            .join(" ");
        Ok(CommandLine::new(self.shell.tool("tar")?)
            .arg("-c -p -f - -C")
            .path(source)
            .arg("--numeric-owner")
            .arg(excludes)
            .arg("."))
    }

    fn extract_command(&self, destination: &Path) -> Result<CommandLine> {
        Ok(CommandLine::new(self.shell.tool("tar")?)
            .arg("-x -p -f - -C")
            .path(destination)
            .arg("--numeric-owner"))
    }
}

/// `tar -c` noticing a file change mid-read fails the archive as changed data.
fn classify_create_error(error: Error, source: &Path) -> Error {
    let changed = match error.root() {
        Error::ShellCommandFailed { stderr, .. } => stderr
            .iter()
            .any(|line| line.contains("changed as we read it") || line.contains("shrank by")),
        _ => false,
    };
    if changed {
        Error::DataChanged {
            path: source.to_path_buf(),
        }
    } else {
        error
    }
}

/// A failing `tar -x` that complains about its input got a broken archive.
fn classify_extract_error(error: Error) -> Error {
    let corrupt = match error.root() {
        Error::ShellCommandFailed { stderr, .. } => stderr
            .iter()
            .any(|line| CORRUPT_TAR_MARKERS.iter().any(|m| line.contains(m))),
        _ => false,
    };
    if corrupt {
        Error::archive_corrupt(error.to_string())
    } else {
        error
    }
}

impl ArchiveEngine for CommandEngine {
    fn strategy(&self) -> ArchiveStrategy {
        ArchiveStrategy::Command
    }

    #[named]
    fn backup(
        &self,
        target: &ArchiveTarget,
        source: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<BackupOutcome> {
        if !self
            .shell
            .run(CommandLine::new("[ -d").path(source).arg("]"))?
            .is_success()
        {
            return Err(Error::NotFound(format!("{source:?} is not a directory")))
                .add_fn_name(function_path!());
        }
        let command = self.create_command(source, options)?;

        write_archive(
            self.storage.as_ref(),
            target,
            options,
            ArchiveStrategy::Command,
            cancel,
            |sink| {
                let reader = self.shell.spawn_reader(&command)?;
                let mut reader = CancellableReader::new(reader, cancel);
                let copied = io::copy(&mut reader, sink);
                let reader = reader.into_inner();
                match copied {
                    Ok(bytes) => {
                        reader
                            .finish()
                            .map_err(|e| classify_create_error(e, source))?;
                        tracing::debug!("Copied {} archive bytes from {:?}", bytes, source);
                        Ok(None)
                    }
                    Err(e) => {
                        cancel.check()?;
                        reader
                            .finish()
                            .map_err(|e| classify_create_error(e, source))?;
                        Err(e.into())
                    }
                }
            },
        )
        .add_fn_name(function_path!())
    }

    #[named]
    fn restore(
        &self,
        target: &ArchiveTarget,
        archive: &ArchiveName,
        destination: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreOutcome> {
        // opening reads and authenticates the first chunk, so a wrong key fails here
        let (mut source, probe) = open_archive(self.storage.as_ref(), target, archive, options)?;
        let exclude = ExcludeMatcher::build(&options.exclude)?;
        clear_destination(&self.shell, destination, &exclude).add_fn_name(function_path!())?;
        self.shell
            .run_checked(CommandLine::new(self.shell.tool("mkdir")?).arg("-p").path(destination))?;

        let mut writer = self.shell.spawn_writer(&self.extract_command(destination)?)?;
        let copied = io::copy(&mut CancellableReader::new(&mut source, cancel), &mut writer);
        if let Err(e) = copied {
            cancel.check()?;
            if probe.tripped() {
                return Err(Error::archive_corrupt(e.to_string())).add_fn_name(function_path!());
            }
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(Error::from(e)).add_fn_name(function_path!());
            }
            // tar may stop reading once it saw the end-of-archive blocks
            tracing::debug!("tar closed its input early: {}", e);
        }
        writer
            .finish()
            .map_err(classify_extract_error)
            .add_fn_name(function_path!())?;
        drain(&mut source)?;

        tracing::info!("Extracted {} into {:?}", archive, destination);
        Ok(RestoreOutcome::default())
    }
}
