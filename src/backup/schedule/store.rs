use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::schedule::Schedule;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub trait ScheduleStore: Send + Sync {
    fn get(&self, id: i64) -> Result<Option<Schedule>>;

    /// Every schedule, ordered by id.
    fn all(&self) -> Result<Vec<Schedule>>;

    /// Inserts a schedule with id 0 under a fresh id, replaces any other.
    /// Returns the stored id.
    fn save(&self, schedule: &Schedule) -> Result<i64>;

    /// Persists the anchor and the computed run time only.
    fn update_times(&self, id: i64, time_placed: i64, time_to_run: i64) -> Result<()>;

    fn delete(&self, id: i64) -> Result<()>;
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS schedule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    enabled INTEGER NOT NULL,
    name TEXT NOT NULL,
    time_hour INTEGER NOT NULL,
    time_minute INTEGER NOT NULL,
    interval_days INTEGER NOT NULL,
    time_placed INTEGER NOT NULL,
    time_to_run INTEGER NOT NULL,
    package_filter TEXT NOT NULL,
    special_filter TEXT NOT NULL,
    kinds TEXT NOT NULL,
    custom_list TEXT NOT NULL,
    block_list TEXT NOT NULL
)";

const COLUMNS: &str = "id, enabled, name, time_hour, time_minute, interval_days, time_placed, \
    time_to_run, package_filter, special_filter, kinds, custom_list, block_list";

#[derive(Debug)]
pub struct SqliteScheduleStore {
    conn: Mutex<Connection>,
}

impl SqliteScheduleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(CREATE_TABLE, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn from_row(row: &Row) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        enabled: row.get(1)?,
        name: row.get(2)?,
        time_hour: row.get(3)?,
        time_minute: row.get(4)?,
        interval: row.get(5)?,
        time_placed: row.get(6)?,
        time_to_run: row.get(7)?,
        filter: json_column(row, 8)?,
        special_filter: json_column(row, 9)?,
        kinds: json_column(row, 10)?,
        custom_list: json_column(row, 11)?,
        block_list: json_column(row, 12)?,
    })
}

impl ScheduleStore for SqliteScheduleStore {
    fn get(&self, id: i64) -> Result<Option<Schedule>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM schedule WHERE id = ?1"),
                [id],
                from_row,
            )
            .optional()?)
    }

    fn all(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM schedule ORDER BY id"))?;
        let schedules = stmt
            .query_map([], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    fn save(&self, schedule: &Schedule) -> Result<i64> {
        let conn = self.conn();
        let id = (schedule.id != 0).then_some(schedule.id);
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO schedule ({COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                id,
                schedule.enabled,
                schedule.name,
                schedule.time_hour,
                schedule.time_minute,
                schedule.interval,
                schedule.time_placed,
                schedule.time_to_run,
                serde_json::to_string(&schedule.filter)?,
                serde_json::to_string(&schedule.special_filter)?,
                serde_json::to_string(&schedule.kinds)?,
                serde_json::to_string(&schedule.custom_list)?,
                serde_json::to_string(&schedule.block_list)?,
            ],
        )?;
        let id = id.unwrap_or_else(|| conn.last_insert_rowid());
        tracing::debug!("Saved schedule {} ({})", id, schedule.name);
        Ok(id)
    }

    fn update_times(&self, id: i64, time_placed: i64, time_to_run: i64) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE schedule SET time_placed = ?2, time_to_run = ?3 WHERE id = ?1",
            params![id, time_placed, time_to_run],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM schedule WHERE id = ?1", [id])?;
        Ok(())
    }
}
