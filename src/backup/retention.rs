//! Keep-newest housekeeping for timestamped entries of a storage directory:
//! backup instances per package, and log records.

use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::storage::StorageLocation;
use chrono::{DateTime, NaiveDateTime, TimeZone};
use itertools::Itertools;
use std::cmp::Reverse;
use std::fmt::Display;
use std::path::Path;

/// Name of one backup instance directory.
pub const INSTANCE_FORMAT: &str = "%Y-%m-%dT%Hh%Mm%Ss";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemWithDateTime<T> {
    pub item: T,
    pub date_time: NaiveDateTime,
}

pub fn instance_name<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format(INSTANCE_FORMAT).to_string()
}

pub fn parse_instance_name(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, INSTANCE_FORMAT).ok()
}

/// Everything but the newest `keep` items, newest first.
pub fn get_delete<T, I>(items: I, keep: usize) -> Vec<T>
where
    I: IntoIterator<Item = ItemWithDateTime<T>>,
{
    items
        .into_iter()
        .sorted_by_key(|i| Reverse(i.date_time))
        .skip(keep)
        .map(|i| i.item)
        .collect()
}

/// Deletes the entries of `dir` whose name `parse` dates, except the newest
/// `keep`. Names `parse` rejects are never touched. Returns what was deleted.
pub fn prune<F>(storage: &dyn StorageLocation, dir: &Path, keep: usize, parse: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<NaiveDateTime>,
{
    let dated = storage.list(dir)?.into_iter().filter_map(|name| {
        parse(&name).map(|date_time| ItemWithDateTime {
            item: name,
            date_time,
        })
    });
    let expired = get_delete(dated, keep);
    for name in &expired {
        storage
            .delete(&dir.join(name))
            .add_msg(format!("Cannot prune {name} from {}", dir.display()))?;
        tracing::info!("Pruned {}/{}", dir.display(), name);
    }
    Ok(expired)
}

/// Keeps the newest `revisions` backup instances of one package.
pub fn prune_instances(storage: &dyn StorageLocation, package: &str, revisions: usize) -> Result<Vec<String>> {
    prune(storage, Path::new(package), revisions, parse_instance_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::storage::path::PathStorage;
    use chrono::{NaiveDate, Utc};
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_instance_name_format() {
        let time = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(instance_name(&time), "2024-03-09T07h05m01s");
        assert_eq!(parse_instance_name("2024-03-09T07h05m01s"), Some(time.naive_utc()));
        assert_eq!(parse_instance_name("2024-03-09T07h05m01s.tmp"), None);
        assert_eq!(parse_instance_name("notes"), None);
    }

    #[test]
    fn test_get_delete_keeps_newest() {
        let items = [(1, 3), (3, 1), (2, 0), (2, 5)]
            .into_iter()
            .map(|(day, hour)| ItemWithDateTime {
                item: format!("{day}-{hour}"),
                date_time: at(day, hour),
            });
        assert_eq!(get_delete(items.clone(), 2), vec!["2-0", "1-3"]);
        assert!(get_delete(items.clone(), 4).is_empty());
        assert_eq!(get_delete(items, 0).len(), 4);
    }

    #[test]
    fn test_prune_instances_leaves_foreign_names() {
        let dir = TempDir::new().unwrap();
        let storage = PathStorage::new(dir.path());
        for name in [
            "2024-01-01T00h00m00s",
            "2024-01-02T00h00m00s",
            "2024-01-03T00h00m00s",
            "notes",
        ] {
            std::fs::create_dir_all(dir.path().join("org.example").join(name)).unwrap();
        }
        let pruned = prune_instances(&storage, "org.example", 2).unwrap();
        assert_eq!(pruned, vec!["2024-01-01T00h00m00s"]);
        assert_eq!(
            storage.list(Path::new("org.example")).unwrap(),
            vec!["2024-01-02T00h00m00s", "2024-01-03T00h00m00s", "notes"]
        );
        assert!(prune_instances(&storage, "missing", 1).unwrap().is_empty());
    }
}
