// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Checks that a local manifest still matches what is on disk.

use std::path::Path;

use super::types::Manifest;

/// Outcome of an integrity check.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// The input manifest minus every record whose file is missing.
    /// `None` when there was no manifest to check.
    pub manifest: Option<Manifest>,
    /// True only if a manifest was given and every listed file exists.
    pub intact: bool,
    /// Paths listed in the manifest but absent from disk.
    pub missing: Vec<String>,
}

/// Verify every asset of `manifest` exists under `cache_dir`.
///
/// Missing entries are dropped from the returned manifest so a later diff
/// treats them as new. Present entries are returned untouched.
pub fn check_integrity(manifest: Option<Manifest>, cache_dir: &Path) -> IntegrityReport {
    let Some(manifest) = manifest else {
        return IntegrityReport::default();
    };

    let mut missing = Vec::new();
    let mut present = Vec::with_capacity(manifest.assets.len());
    for record in manifest.assets {
        if record.cache_path(cache_dir).is_file() {
            present.push(record);
        } else {
            tracing::debug!(path = %record.path, "Cached file missing");
            missing.push(record.path);
        }
    }

    if !missing.is_empty() {
        tracing::info!(
            missing = missing.len(),
            present = present.len(),
            "Local cache is incomplete; missing assets will be downloaded again"
        );
    }

    IntegrityReport {
        manifest: Some(Manifest {
            meta: manifest.meta,
            assets: present,
        }),
        intact: missing.is_empty(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::AssetRecord;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_no_manifest_is_not_intact() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let report = check_integrity(None, dir.path());
        assert!(report.manifest.is_none());
        assert!(!report.intact);
    }

    #[test]
    fn test_all_present_is_intact() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        touch(dir.path(), "art/a.png");
        touch(dir.path(), "ui/b.png");
        let manifest = Manifest::new(
            "m",
            vec![
                AssetRecord::new("a", "art/a.png", "h1"),
                AssetRecord::new("b", "ui/b.png", "h2"),
            ],
        );

        let report = check_integrity(Some(manifest.clone()), dir.path());
        assert!(report.intact);
        assert_eq!(report.manifest, Some(manifest));
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_missing_files_are_trimmed() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        touch(dir.path(), "art/a.png");
        let manifest = Manifest::new(
            "m",
            vec![
                AssetRecord::new("a", "art/a.png", "h1"),
                AssetRecord::new("b", "art/b.png", "h2"),
            ],
        );

        let report = check_integrity(Some(manifest), dir.path());
        assert!(!report.intact);
        assert_eq!(report.missing, vec!["art/b.png".to_string()]);
        let trimmed = report.manifest.unwrap();
        assert_eq!(trimmed.assets, vec![AssetRecord::new("a", "art/a.png", "h1")]);
        assert_eq!(trimmed.meta_hash(), "m");
    }

    #[test]
    fn test_directory_in_place_of_file_counts_as_missing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(dir.path().join("art/a.png")).unwrap();
        let manifest = Manifest::new("m", vec![AssetRecord::new("a", "art/a.png", "h1")]);

        let report = check_integrity(Some(manifest), dir.path());
        assert!(!report.intact);
    }

    #[test]
    fn test_empty_manifest_is_intact() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let report = check_integrity(Some(Manifest::default()), dir.path());
        assert!(report.intact);
    }
}
