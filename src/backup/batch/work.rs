//! Backup and restore of one package as a batch item.

use crate::backup::archive::{locate_archive, ArchiveEngine, ArchiveOptions, ArchiveTarget, Engine};
use crate::backup::batch::WorkItem;
use crate::backup::cancel::CancelToken;
use crate::backup::catalog::{DataKind, PackageInfo};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFnName, AddMsg};
use crate::backup::retention::{instance_name, parse_instance_name, prune_instances};
use crate::backup::shell::{CommandLine, ShellHandler};
use crate::backup::storage::StorageLocation;
use chrono::Local;
use derive_more::Display;
use function_name::named;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum WorkMode {
    #[display("backup")]
    Backup,
    /// The newest instance when none is named
    #[display("restore")]
    Restore { instance: Option<String> },
}

/// Builds the items a batch runs.
pub trait WorkFactory: Send + Sync {
    fn create(&self, package: &PackageInfo, kinds: &BTreeSet<DataKind>, mode: WorkMode) -> Box<dyn WorkItem>;
}

/// Everything package work shares within one process.
pub struct WorkContext {
    pub shell: Arc<ShellHandler>,
    pub storage: Arc<dyn StorageLocation>,
    pub engine: Engine,
    pub options: ArchiveOptions,
    pub backup_revisions: usize,
}

pub struct PackageWork {
    package: PackageInfo,
    kinds: BTreeSet<DataKind>,
    mode: WorkMode,
    context: Arc<WorkContext>,
}

impl PackageWork {
    /// Data directories of the requested kinds, in kind order.
    fn sources(&self) -> impl Iterator<Item = (DataKind, &PathBuf)> + '_ {
        self.package
            .data_paths
            .iter()
            .filter(|(kind, _)| self.kinds.contains(kind))
            .map(|(kind, path)| (*kind, path))
    }

    fn dir_exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .context
            .shell
            .run(CommandLine::new("[ -d").path(path).arg("]"))?
            .is_success())
    }

    #[named]
    fn backup(&self, cancel: &CancelToken) -> Result<()> {
        let instance = PathBuf::from(&self.package.name).join(instance_name(&Local::now()));
        let res = self.backup_into(&instance, cancel);
        if res.is_err() {
            if let Err(e) = self.context.storage.delete(&instance) {
                tracing::warn!("Cannot remove incomplete backup {}: {}", instance.display(), e);
            }
            return res.add_fn_name(function_path!());
        }

        prune_instances(
            self.context.storage.as_ref(),
            &self.package.name,
            self.context.backup_revisions,
        )?;
        Ok(())
    }

    fn backup_into(&self, instance: &Path, cancel: &CancelToken) -> Result<()> {
        let mut errors = Vec::new();
        let mut archived = 0;
        for (kind, source) in self.sources() {
            cancel.check()?;
            if !self.dir_exists(source)? {
                tracing::debug!("{}: no {} at {}", self.package.name, kind, source.display());
                continue;
            }
            let target = ArchiveTarget::new(&self.package.name, kind.to_string(), instance);
            match self
                .context
                .engine
                .backup(&target, source, &self.context.options, cancel)
            {
                Ok(outcome) => {
                    archived += 1;
                    tracing::info!(
                        "{}: archived {} to {}",
                        self.package.name,
                        kind,
                        outcome.path.display()
                    );
                }
                Err(e) if e.is_cancelled() || e.is_fatal() => return Err(e),
                Err(e) => errors.push(e.add_msg(format!("Cannot back up {kind}"))),
            }
        }
        if errors.is_empty() && archived == 0 {
            return Err(Error::NotFound(format!(
                "no data of {} to back up",
                self.package.name
            )));
        }
        convert_error_vec(errors)
    }

    fn latest_instance(&self) -> Result<String> {
        self.context
            .storage
            .list(Path::new(&self.package.name))?
            .into_iter()
            .filter_map(|name| parse_instance_name(&name).map(|time| (time, name)))
            .max()
            .map(|(_, name)| name)
            .ok_or_else(|| Error::NotFound(format!("no backup of {}", self.package.name)))
    }

    #[named]
    fn restore(&self, instance: Option<&str>, cancel: &CancelToken) -> Result<()> {
        let instance = match instance {
            Some(instance) => instance.to_string(),
            None => self.latest_instance()?,
        };
        let root = PathBuf::from(&self.package.name).join(&instance);
        tracing::info!("{}: restoring {}", self.package.name, root.display());

        let mut errors = Vec::new();
        let mut restored = 0;
        for (kind, destination) in self.sources() {
            cancel.check()?;
            let target = ArchiveTarget::new(&self.package.name, kind.to_string(), &root);
            let Some(archive) = locate_archive(self.context.storage.as_ref(), &target)? else {
                tracing::debug!("{}: {} has no {} archive", self.package.name, instance, kind);
                continue;
            };
            match self.context.engine.restore(
                &target,
                &archive,
                destination,
                &self.context.options,
                cancel,
            ) {
                Ok(outcome) => {
                    restored += 1;
                    for skipped in &outcome.skipped {
                        tracing::warn!("{}: skipped {}", self.package.name, skipped.display());
                    }
                }
                Err(e) if e.is_cancelled() || e.is_fatal() => return Err(e),
                Err(e) => errors.push(e.add_msg(format!("Cannot restore {kind}"))),
            }
        }
        if errors.is_empty() && restored == 0 {
            return Err(Error::NotFound(format!(
                "{} has no archive to restore",
                root.display()
            )));
        }
        convert_error_vec(errors).add_fn_name(function_path!())
    }
}

impl WorkItem for PackageWork {
    fn id(&self) -> String {
        format!("{}:{}", self.package.name, self.mode)
    }

    fn label(&self) -> String {
        self.package.display_label().to_string()
    }

    fn run(&self, cancel: &CancelToken) -> Result<()> {
        match &self.mode {
            WorkMode::Backup => self.backup(cancel),
            WorkMode::Restore { instance } => self.restore(instance.as_deref(), cancel),
        }
    }
}

pub struct PackageWorkFactory {
    context: Arc<WorkContext>,
}

impl PackageWorkFactory {
    pub fn new(context: WorkContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}

impl WorkFactory for PackageWorkFactory {
    fn create(&self, package: &PackageInfo, kinds: &BTreeSet<DataKind>, mode: WorkMode) -> Box<dyn WorkItem> {
        Box::new(PackageWork {
            package: package.clone(),
            kinds: kinds.clone(),
            mode,
            context: self.context.clone(),
        })
    }
}
