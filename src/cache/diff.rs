// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Partitions a server manifest against the local one.
//!
//! Records are matched by normalised `path` only. Two records with the same
//! `name` but different paths are unrelated assets.

use std::collections::HashMap;

use super::types::{normalize_asset_path, AssetRecord, Manifest};

/// The four disjoint work sets of a sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    /// On the server, not in the local manifest.
    pub new: Vec<AssetRecord>,
    /// On both sides with a different hash. Holds the server record.
    pub changed: Vec<AssetRecord>,
    /// On both sides with the same hash. Holds the server record so renamed
    /// assets pick up their new name.
    pub unchanged: Vec<AssetRecord>,
    /// In the local manifest, gone from the server.
    pub orphaned: Vec<AssetRecord>,
}

impl ManifestDiff {
    /// Compare `local` (already integrity-trimmed) with `server`.
    ///
    /// With no local manifest everything on the server is new.
    pub fn compute(local: Option<&Manifest>, server: &Manifest) -> Self {
        let Some(local) = local else {
            return Self {
                new: server.assets.clone(),
                ..Self::default()
            };
        };

        let local_by_path: HashMap<String, &AssetRecord> = local
            .assets
            .iter()
            .map(|r| (normalize_asset_path(&r.path), r))
            .collect();
        let server_by_path: HashMap<String, &AssetRecord> = server
            .assets
            .iter()
            .map(|r| (normalize_asset_path(&r.path), r))
            .collect();

        let mut diff = Self::default();
        for record in &server.assets {
            match local_by_path.get(&normalize_asset_path(&record.path)) {
                None => diff.new.push(record.clone()),
                Some(existing) if existing.hash != record.hash => diff.changed.push(record.clone()),
                Some(_) => diff.unchanged.push(record.clone()),
            }
        }
        diff.orphaned = local
            .assets
            .iter()
            .filter(|r| !server_by_path.contains_key(&normalize_asset_path(&r.path)))
            .cloned()
            .collect();
        diff
    }

    /// New and changed records; both need a fresh fetch.
    pub fn downloads(&self) -> impl Iterator<Item = &AssetRecord> {
        self.new.iter().chain(self.changed.iter())
    }

    pub fn download_count(&self) -> usize {
        self.new.len() + self.changed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn rec(path: &str, hash: &str) -> AssetRecord {
        AssetRecord::new(path, path, hash)
    }

    fn paths(records: &[AssetRecord]) -> Vec<&str> {
        records.iter().map(|r| r.path.as_str()).collect()
    }

    #[test]
    fn test_new_asset_on_server() {
        let local = Manifest::new("l", vec![AssetRecord::new("a", "art/a.png", "h1")]);
        let server = Manifest::new(
            "s",
            vec![
                AssetRecord::new("a", "art/a.png", "h1"),
                AssetRecord::new("b", "art/b.png", "h2"),
            ],
        );

        let diff = ManifestDiff::compute(Some(&local), &server);
        assert_eq!(paths(&diff.new), vec!["art/b.png"]);
        assert!(diff.changed.is_empty());
        assert!(diff.orphaned.is_empty());
        assert_eq!(paths(&diff.unchanged), vec!["art/a.png"]);
    }

    #[test]
    fn test_hash_change_is_redownloaded() {
        let local = Manifest::new("l", vec![rec("x", "h1")]);
        let server = Manifest::new("s", vec![rec("x", "h2")]);

        let diff = ManifestDiff::compute(Some(&local), &server);
        assert_eq!(paths(&diff.changed), vec!["x"]);
        assert_eq!(diff.changed[0].hash, "h2");
        assert!(diff.unchanged.is_empty());
        assert!(diff.new.is_empty());
        assert_eq!(paths(&diff.downloads().cloned().collect::<Vec<_>>()), vec!["x"]);
    }

    #[test]
    fn test_orphans_are_local_only() {
        let local = Manifest::new("l", vec![rec("keep", "1"), rec("gone", "2")]);
        let server = Manifest::new("s", vec![rec("keep", "1")]);

        let diff = ManifestDiff::compute(Some(&local), &server);
        assert_eq!(paths(&diff.orphaned), vec!["gone"]);
        assert_eq!(paths(&diff.unchanged), vec!["keep"]);
        assert_eq!(diff.download_count(), 0);
    }

    #[test]
    fn test_aliased_path_is_the_same_asset() {
        let local = Manifest::new("l", vec![AssetRecord::new("a", "./art/a.png", "h1")]);
        let server = Manifest::new("s", vec![AssetRecord::new("a", "art/a.png", "h1")]);

        let diff = ManifestDiff::compute(Some(&local), &server);
        assert!(diff.orphaned.is_empty());
        assert!(diff.new.is_empty());
        assert_eq!(paths(&diff.unchanged), vec!["art/a.png"]);
    }

    #[test]
    fn test_no_local_manifest_downloads_everything() {
        let server = Manifest::new("s", vec![rec("a", "1"), rec("b", "2")]);
        let diff = ManifestDiff::compute(None, &server);
        assert_eq!(paths(&diff.new), vec!["a", "b"]);
        assert!(diff.changed.is_empty());
        assert!(diff.unchanged.is_empty());
        assert!(diff.orphaned.is_empty());
    }

    #[test]
    fn test_name_collisions_do_not_match() {
        let local = Manifest::new("l", vec![AssetRecord::new("icon", "ui/a.png", "1")]);
        let server = Manifest::new("s", vec![AssetRecord::new("icon", "ui/b.png", "1")]);

        let diff = ManifestDiff::compute(Some(&local), &server);
        assert_eq!(paths(&diff.new), vec!["ui/b.png"]);
        assert_eq!(paths(&diff.orphaned), vec!["ui/a.png"]);
    }

    #[test]
    fn test_partitions_are_disjoint_and_cover_both_sides() {
        let cases = vec![
            (vec![], vec![rec("a", "1")]),
            (vec![rec("a", "1")], vec![]),
            (vec![rec("a", "1"), rec("b", "2")], vec![rec("a", "1"), rec("b", "3"), rec("c", "4")]),
            (vec![rec("a", "1"), rec("d", "9")], vec![rec("b", "1"), rec("a", "2")]),
            (vec![rec("a", "1"), rec("b", "1"), rec("c", "1")], vec![rec("c", "1"), rec("b", "1")]),
        ];

        for (local_records, server_records) in cases {
            let local = Manifest::new("l", local_records);
            let server = Manifest::new("s", server_records);
            let diff = ManifestDiff::compute(Some(&local), &server);

            let sets = [&diff.new, &diff.changed, &diff.unchanged, &diff.orphaned];
            let mut union = HashSet::new();
            let mut total = 0;
            for set in sets {
                for record in set.iter() {
                    union.insert(record.path.clone());
                    total += 1;
                }
            }
            assert_eq!(union.len(), total, "partitions overlap for {:?}", diff);

            let expected: HashSet<String> = local
                .assets
                .iter()
                .chain(server.assets.iter())
                .map(|r| r.path.clone())
                .collect();
            assert_eq!(union, expected);
        }
    }

    #[test]
    fn test_identical_manifests_only_load() {
        let manifest = Manifest::new("m", vec![rec("a", "1"), rec("b", "2")]);
        let diff = ManifestDiff::compute(Some(&manifest), &manifest);
        assert_eq!(diff.download_count(), 0);
        assert!(diff.orphaned.is_empty());
        assert_eq!(diff.unchanged.len(), 2);
    }
}
