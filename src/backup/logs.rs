use crate::backup::batch::{BatchResult, BatchStatus, ItemResult};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::retention;
use crate::backup::storage::StorageLocation;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOG_DIR: &str = "logs";
const LOG_SUFFIX: &str = ".log.json";
const LOG_TIME_FORMAT: &str = "%Y-%m-%dT%Hh%Mm%S%.3fs";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub batch_name: String,
    pub status: BatchStatus,
    pub error_report: String,
    pub items: Vec<ItemResult>,
}

impl LogRecord {
    pub fn new(result: &BatchResult, time: DateTime<Utc>) -> Self {
        Self {
            time,
            batch_name: result.batch_name.clone(),
            status: result.status(),
            error_report: result.error_report(),
            items: result.per_item.values().cloned().collect(),
        }
    }
}

fn parse_log_name(name: &str) -> Option<NaiveDateTime> {
    let stamp = name.strip_suffix(LOG_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, LOG_TIME_FORMAT).ok()
}

/// Batch reports as JSON files under `logs/`, the newest `max_log_count` kept.
#[derive(Debug, Clone)]
pub struct LogStore {
    storage: Arc<dyn StorageLocation>,
    max_log_count: usize,
}

impl LogStore {
    pub fn new(storage: Arc<dyn StorageLocation>, max_log_count: usize) -> Self {
        Self {
            storage,
            max_log_count,
        }
    }

    /// Writes `record` then prunes old ones. Returns the path in storage.
    pub fn write(&self, record: &LogRecord) -> Result<PathBuf> {
        let path = Path::new(LOG_DIR).join(format!(
            "{}{}",
            record.time.format(LOG_TIME_FORMAT),
            LOG_SUFFIX
        ));
        let mut writer = self.storage.create_file(&path)?;
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer.commit().add_msg(format!("Cannot write log {}", path.display()))?;
        tracing::info!("Wrote log {}", path.display());

        retention::prune(
            self.storage.as_ref(),
            Path::new(LOG_DIR),
            self.max_log_count,
            parse_log_name,
        )?;
        Ok(path)
    }

    /// Stored records, oldest first.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.storage
            .list(Path::new(LOG_DIR))?
            .into_iter()
            .filter(|name| parse_log_name(name).is_some())
            .map(|name| -> Result<LogRecord> {
                let mut text = String::new();
                self.storage
                    .open_file(&Path::new(LOG_DIR).join(&name))?
                    .read_to_string(&mut text)?;
                Ok(serde_json::from_str(&text)?)
            })
            .collect()
    }
}
