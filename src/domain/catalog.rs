//! The set of libraries, packages and comparison presets tracked for an org.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::Date;

use super::error::DomainError;
use super::types::{Bin, TimeRange, iso_date};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// First day of download history. Falls back to the catalog default.
    #[serde(default, with = "iso_date::option")]
    pub created: Option<Date>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    /// GitHub repository as `owner/name`.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
}

impl Library {
    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(|package| package.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub title: String,
    pub packages: Vec<String>,
    #[serde(default = "default_preset_range")]
    pub range: String,
    #[serde(default)]
    pub bin: Bin,
}

fn default_preset_range() -> String {
    "1y".to_string()
}

impl Preset {
    pub fn time_range(&self) -> Result<TimeRange, DomainError> {
        self.range.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub org: String,
    #[serde(with = "iso_date")]
    pub default_history_start: Date,
    #[serde(default)]
    pub libraries: Vec<Library>,
    /// Packages published by the org that belong to no library.
    #[serde(default)]
    pub legacy_packages: Vec<PackageSpec>,
    #[serde(default)]
    pub presets: Vec<Preset>,
}

impl Catalog {
    pub fn library(&self, id: &str) -> Option<&Library> {
        self.libraries.iter().find(|library| library.id == id)
    }

    pub fn library_of(&self, package: &str) -> Option<&Library> {
        self.libraries
            .iter()
            .find(|library| library.package_names().any(|name| name == package))
    }

    pub fn preset(&self, id: &str) -> Option<&Preset> {
        self.presets.iter().find(|preset| preset.id == id)
    }

    /// Library packages followed by legacy packages, in catalog order.
    pub fn all_packages(&self) -> Vec<&PackageSpec> {
        self.libraries
            .iter()
            .flat_map(|library| library.packages.iter())
            .chain(self.legacy_packages.iter())
            .collect()
    }

    pub fn find_package(&self, name: &str) -> Option<&PackageSpec> {
        self.all_packages()
            .into_iter()
            .find(|package| package.name == name)
    }

    /// History start for `name`, including packages outside the catalog.
    pub fn package_start(&self, name: &str) -> Date {
        self.find_package(name)
            .and_then(|package| package.created)
            .unwrap_or(self.default_history_start)
    }

    pub fn repositories(&self) -> impl Iterator<Item = (&Library, &str)> {
        self.libraries.iter().filter_map(|library| {
            library
                .repository
                .as_deref()
                .map(|repository| (library, repository))
        })
    }

    pub fn is_legacy(&self, package: &str) -> bool {
        self.legacy_packages.iter().any(|spec| spec.name == package)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.org.trim().is_empty() {
            return Err(DomainError::catalog("org must not be empty"));
        }

        let mut library_ids = HashSet::new();
        for library in &self.libraries {
            if library.id.trim().is_empty() {
                return Err(DomainError::catalog("library id must not be empty"));
            }
            if !library_ids.insert(library.id.as_str()) {
                return Err(DomainError::catalog(format!(
                    "duplicate library `{}`",
                    library.id
                )));
            }
            if let Some(repository) = &library.repository
                && !is_repository_slug(repository)
            {
                return Err(DomainError::catalog(format!(
                    "library `{}` has malformed repository `{repository}`",
                    library.id
                )));
            }
        }

        let mut packages = HashSet::new();
        for package in self.all_packages() {
            if package.name.trim().is_empty() {
                return Err(DomainError::catalog("package name must not be empty"));
            }
            if !packages.insert(package.name.as_str()) {
                return Err(DomainError::catalog(format!(
                    "package `{}` is registered more than once",
                    package.name
                )));
            }
        }

        let mut preset_ids = HashSet::new();
        for preset in &self.presets {
            if !preset_ids.insert(preset.id.as_str()) {
                return Err(DomainError::catalog(format!(
                    "duplicate preset `{}`",
                    preset.id
                )));
            }
            if preset.packages.is_empty() {
                return Err(DomainError::catalog(format!(
                    "preset `{}` lists no packages",
                    preset.id
                )));
            }
            preset.time_range().map_err(|err| {
                DomainError::catalog(format!("preset `{}`: {err}", preset.id))
            })?;
        }

        Ok(())
    }
}

fn is_repository_slug(value: &str) -> bool {
    match value.split_once('/') {
        Some((owner, name)) => !owner.is_empty() && !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    fn package(name: &str, created: Option<Date>) -> PackageSpec {
        PackageSpec {
            name: name.to_string(),
            created,
        }
    }

    fn sample() -> Catalog {
        Catalog {
            org: "tanstack".into(),
            default_history_start: date!(2020 - 01 - 01),
            libraries: vec![Library {
                id: "query".into(),
                name: "TanStack Query".into(),
                repository: Some("TanStack/query".into()),
                packages: vec![
                    package("@tanstack/react-query", Some(date!(2019 - 10 - 25))),
                    package("@tanstack/query-core", None),
                ],
            }],
            legacy_packages: vec![package("react-query", None)],
            presets: vec![Preset {
                id: "query".into(),
                title: "Query adapters".into(),
                packages: vec!["@tanstack/react-query".into()],
                range: "1y".into(),
                bin: Bin::Weekly,
            }],
        }
    }

    #[test]
    fn package_start_prefers_created_date() {
        let catalog = sample();
        assert_eq!(
            catalog.package_start("@tanstack/react-query"),
            date!(2019 - 10 - 25)
        );
        assert_eq!(catalog.package_start("@tanstack/query-core"), date!(2020 - 01 - 01));
        assert_eq!(catalog.package_start("not-listed"), date!(2020 - 01 - 01));
    }

    #[test]
    fn all_packages_includes_legacy() {
        let catalog = sample();
        let names: Vec<_> = catalog.all_packages().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["@tanstack/react-query", "@tanstack/query-core", "react-query"]
        );
        assert!(catalog.is_legacy("react-query"));
        assert_eq!(
            catalog.library_of("@tanstack/query-core").map(|l| l.id.as_str()),
            Some("query")
        );
    }

    #[test]
    fn validate_accepts_sample() {
        sample().validate().expect("valid catalog");
    }

    #[test]
    fn validate_rejects_duplicate_packages() {
        let mut catalog = sample();
        catalog
            .legacy_packages
            .push(package("@tanstack/query-core", None));
        assert!(matches!(catalog.validate(), Err(DomainError::Catalog { .. })));
    }

    #[test]
    fn validate_rejects_bad_repository_and_preset() {
        let mut catalog = sample();
        catalog.libraries[0].repository = Some("query".into());
        assert!(catalog.validate().is_err());

        let mut catalog = sample();
        catalog.presets[0].range = "forever".into();
        assert!(catalog.validate().is_err());
    }
}
