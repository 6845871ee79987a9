//! Loads the library catalog from TOML.

use std::path::Path;

use tracing::info;

use crate::domain::catalog::Catalog;

use super::error::InfraError;

pub fn load_catalog(path: &Path) -> Result<Catalog, InfraError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| InfraError::catalog(path, format!("failed to read: {err}")))?;
    let catalog = parse_catalog(path, &raw)?;

    info!(
        target = "libstats::catalog",
        path = %path.display(),
        org = %catalog.org,
        libraries = catalog.libraries.len(),
        packages = catalog.all_packages().len(),
        presets = catalog.presets.len(),
        "Catalog loaded"
    );
    Ok(catalog)
}

pub fn parse_catalog(path: &Path, raw: &str) -> Result<Catalog, InfraError> {
    let catalog: Catalog = toml::from_str(raw)
        .map_err(|err| InfraError::catalog(path, format!("failed to parse: {err}")))?;
    catalog
        .validate()
        .map_err(|source| InfraError::InvalidCatalog {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use time::macros::date;

    use super::*;

    const SAMPLE: &str = r#"
org = "tanstack"
default_history_start = "2019-10-25"
legacy_packages = [{ name = "react-query" }]

[[libraries]]
id = "query"
name = "TanStack Query"
repository = "TanStack/query"
packages = [
    { name = "@tanstack/react-query", created = "2019-10-25" },
    { name = "@tanstack/query-core" },
]

[[presets]]
id = "adapters"
title = "Adapters"
packages = ["@tanstack/react-query"]
bin = "weekly"
"#;

    #[test]
    fn loads_catalog_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");

        let catalog = load_catalog(file.path()).expect("catalog");
        assert_eq!(catalog.org, "tanstack");
        assert_eq!(catalog.libraries[0].packages.len(), 2);
        assert_eq!(catalog.legacy_packages[0].name, "react-query");
        assert_eq!(
            catalog.package_start("@tanstack/query-core"),
            date!(2019 - 10 - 25)
        );
        assert_eq!(catalog.presets[0].range, "1y");
    }

    #[test]
    fn bundled_catalog_is_valid() {
        let raw = include_str!("../../config/catalog.toml");
        let catalog = parse_catalog(Path::new("config/catalog.toml"), raw).expect("valid");
        assert!(!catalog.libraries.is_empty());
    }

    #[test]
    fn rejects_invalid_catalog() {
        let raw = SAMPLE.replace("TanStack/query", "not-a-slug");
        let err = parse_catalog(Path::new("catalog.toml"), &raw).expect_err("invalid");
        assert!(matches!(err, InfraError::InvalidCatalog { .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_catalog(Path::new("/definitely/not/here.toml")).expect_err("missing");
        assert!(matches!(err, InfraError::Catalog { .. }));
    }
}
