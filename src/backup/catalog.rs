//! Installed packages and where their data lives.

use crate::backup::validate::validate_valid_archive_base_name;
use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::result;
use validator::{Validate, ValidationError};

/// One data directory of a package; also the base name of its archive.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    #[display("data")]
    Data,
    #[display("device_protected_data")]
    DeviceProtectedData,
    #[display("external_data")]
    ExternalData,
    #[display("obb")]
    Obb,
    #[display("media")]
    Media,
}

impl DataKind {
    pub const ALL: [DataKind; 5] = [
        DataKind::Data,
        DataKind::DeviceProtectedData,
        DataKind::ExternalData,
        DataKind::Obb,
        DataKind::Media,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.to_string() == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct PackageInfo {
    #[validate(custom(function = validate_valid_archive_base_name))]
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub label: Option<String>,
    #[serde(default = "default_installed")]
    #[builder(default = true)]
    pub installed: bool,
    #[serde(default)]
    #[builder(default)]
    pub system: bool,
    #[serde(default)]
    #[builder(default)]
    pub launchable: bool,
    #[serde(default)]
    #[validate(custom(function = validate_data_paths))]
    #[builder(default)]
    pub data_paths: BTreeMap<DataKind, PathBuf>,
}

fn default_installed() -> bool {
    true
}

fn validate_data_paths(paths: &BTreeMap<DataKind, PathBuf>) -> result::Result<(), ValidationError> {
    match paths.iter().find(|(_, p)| !p.is_absolute()) {
        Some((kind, path)) => Err(ValidationError::new("InvalidDataPath")
            .with_message(format!("{kind} path {path:?} is not absolute").into())),
        None => Ok(()),
    }
}

impl PackageInfo {
    /// Label shown to users, the package name when none is known.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

pub trait PackageCatalog: Send + Sync {
    fn package(&self, name: &str) -> Option<PackageInfo>;

    /// Every known package, sorted by name.
    fn packages(&self) -> Vec<PackageInfo>;
}

/// Catalog fixed at start-up, usually from the configuration file.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    packages: BTreeMap<String, PackageInfo>,
}

impl From<Vec<PackageInfo>> for StaticCatalog {
    fn from(packages: Vec<PackageInfo>) -> Self {
        Self {
            packages: packages.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }
}

impl PackageCatalog for StaticCatalog {
    fn package(&self, name: &str) -> Option<PackageInfo> {
        self.packages.get(name).cloned()
    }

    fn packages(&self) -> Vec<PackageInfo> {
        self.packages.values().cloned().collect()
    }
}
