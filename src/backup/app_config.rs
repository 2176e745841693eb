//! The YAML configuration file, and the process it describes.

use crate::backup::archive::exclude::{default_excludes, ExcludeGlob};
use crate::backup::archive::{ArchiveOptions, ArchiveStrategy};
use crate::backup::batch::work::{PackageWorkFactory, WorkContext, WorkFactory, WorkMode};
use crate::backup::batch::{BatchOrchestrator, BatchResult};
use crate::backup::catalog::{DataKind, PackageCatalog, PackageInfo, StaticCatalog};
use crate::backup::compress::CompressorConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::logs::LogStore;
use crate::backup::notifications::NotificationConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::AddMsg;
use crate::backup::schedule::alarm::{AlarmConfig, TimerAlarmRegistry};
use crate::backup::schedule::scheduler::Scheduler;
use crate::backup::schedule::service::ScheduleService;
use crate::backup::schedule::store::{ScheduleStore, SqliteScheduleStore};
use crate::backup::schedule::Schedule;
use crate::backup::shell::{ShellConfig, ShellHandler};
use crate::backup::storage::{StorageConfig, StorageLocation};
use crate::backup::validate::validate_sql_file;
use chrono::Utc;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub strategy: ArchiveStrategy,
    #[serde(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    /// Globs relative to each data directory
    #[serde(default = "default_excludes")]
    pub exclude: Vec<ExcludeGlob>,
    /// Backup instances kept per package
    #[serde(default = "default_backup_revisions")]
    #[validate(range(min = 1))]
    pub backup_revisions: usize,
}

fn default_backup_revisions() -> usize {
    3
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            strategy: ArchiveStrategy::default(),
            compressor: CompressorConfig::default(),
            exclude: default_excludes(),
            backup_revisions: default_backup_revisions(),
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub shell: ShellConfig,
    #[validate(nested)]
    pub storage: StorageConfig,
    #[validate(custom(function = validate_sql_file))]
    pub schedules_db: PathBuf,
    #[serde(default)]
    #[validate(nested)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    #[validate(nested)]
    pub encryption: EncryptorConfig,
    #[serde(default)]
    #[validate(nested)]
    pub alarms: AlarmConfig,
    #[serde(default = "default_max_log_count")]
    #[validate(range(min = 1))]
    pub max_log_count: usize,
    /// Concurrent work items, one per CPU when unset
    #[validate(range(min = 1))]
    pub workers: Option<usize>,
    #[serde(with = "humantime_serde", default = "default_cancel_grace")]
    pub cancel_grace: Duration,
    #[serde(default)]
    #[validate(nested)]
    pub packages: Vec<PackageInfo>,
    /// Created in the schedule database unless one of the same name exists
    #[serde(default)]
    #[validate(nested)]
    pub schedules: Vec<Schedule>,
    #[validate(nested)]
    pub notification: Option<NotificationConfig>,
}

fn default_max_log_count() -> usize {
    20
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(30)
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, AppConfig>(f).map_err(Error::from))
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions::builder()
            .compressor(self.archive.compressor.clone())
            .encryptor(self.encryption.clone())
            .exclude(self.archive.exclude.clone())
            .build()
    }

    /// Wires up every collaborator. Alarms that go off are sent on `fired`.
    pub fn build(&self, fired: Sender<i64>) -> Result<App> {
        let shell = Arc::new(ShellHandler::new(self.shell.clone()));
        let storage = self.storage.build(shell.clone());
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers.unwrap_or(0))
            .thread_name(|i| format!("worker-{i}"))
            .build()?;
        let orchestrator = Arc::new(BatchOrchestrator::new(Arc::new(pool)));
        let catalog = Arc::new(StaticCatalog::from(self.packages.clone()));
        let factory = Arc::new(PackageWorkFactory::new(WorkContext {
            shell: shell.clone(),
            storage: storage.clone(),
            engine: self.archive.strategy.engine(shell.clone(), storage.clone()),
            options: self.archive_options(),
            backup_revisions: self.archive.backup_revisions,
        }));

        let store = Arc::new(
            SqliteScheduleStore::open(&self.schedules_db)
                .add_msg(format!("Cannot open {:?}", self.schedules_db))?,
        );
        seed_schedules(store.as_ref(), &self.schedules, Utc::now().timestamp_millis())?;
        let alarms = Arc::new(TimerAlarmRegistry::new(&self.alarms, fired)?);
        let service = ScheduleService::builder()
            .scheduler(Scheduler::new(store, alarms, self.alarms.clone()))
            .catalog(catalog.clone())
            .orchestrator(orchestrator.clone())
            .factory(factory.clone())
            .logs(LogStore::new(storage.clone(), self.max_log_count))
            .maybe_notification(self.notification.clone())
            .cancel_grace(self.cancel_grace)
            .build();

        Ok(App {
            shell,
            storage,
            catalog,
            orchestrator,
            factory,
            service: Arc::new(service),
        })
    }
}

/// Saves each configured schedule whose name the store does not know yet.
/// Returns the ids of the new ones.
fn seed_schedules(store: &dyn ScheduleStore, schedules: &[Schedule], now: i64) -> Result<Vec<i64>> {
    let known = store
        .all()?
        .into_iter()
        .map(|s| s.name)
        .collect::<BTreeSet<_>>();
    let mut created = Vec::new();
    for schedule in schedules.iter().filter(|s| !known.contains(&s.name)) {
        let id = store.save(&Schedule {
            id: 0,
            time_placed: if schedule.time_placed == 0 {
                now
            } else {
                schedule.time_placed
            },
            ..schedule.clone()
        })?;
        tracing::info!("Created schedule {} ({})", id, schedule.name);
        created.push(id);
    }
    Ok(created)
}

pub struct App {
    pub shell: Arc<ShellHandler>,
    pub storage: Arc<dyn StorageLocation>,
    pub catalog: Arc<StaticCatalog>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub factory: Arc<PackageWorkFactory>,
    pub service: Arc<ScheduleService>,
}

impl App {
    /// Runs one batch over the named packages and waits for it. Unknown
    /// package names fail the call before anything runs.
    pub fn run_packages(
        &self,
        batch_name: &str,
        packages: &[String],
        kinds: &BTreeSet<DataKind>,
        mode: WorkMode,
    ) -> Result<BatchResult> {
        let mut found = Vec::new();
        let mut unknown = Vec::new();
        for name in packages {
            match self.catalog.package(name) {
                Some(package) => found.push(package),
                None => unknown.push(Error::NotFound(format!("package {name}"))),
            }
        }
        convert_error_vec(unknown)?;

        let batch = self.orchestrator.begin_batch(batch_name);
        for package in &found {
            self.orchestrator
                .enqueue(&batch, self.factory.create(package, kinds, mode.clone()))?;
        }
        self.orchestrator.start(&batch);
        Ok(batch.wait())
    }
}
