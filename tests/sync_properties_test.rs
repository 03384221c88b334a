mod common;

use common::FakeRemote;
use findbetter_lib::engine::keystore::Token;
use findbetter_lib::engine::manifest::{default_manifest, ManifestEntry};
use findbetter_lib::engine::sync::{EntryOutcome, FileSync};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const PATHS: &[&str] = &[
    "app.py",
    "requirements.txt",
    "config/settings.py",
    "services/auth_service.py",
    "ui/components/charts.py",
    "ui/pages/about.py",
];

fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    PATHS
        .iter()
        .filter_map(|p| fs::read(root.join(p)).ok().map(|bytes| (p.to_string(), bytes)))
        .collect()
}

fn manifest() -> Vec<ManifestEntry> {
    PATHS
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let entry = ManifestEntry::mirror(p);
            if i < 2 { entry.required() } else { entry }
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_sync_twice_equals_sync_once(
        remote_files in proptest::collection::btree_map(
            proptest::sample::select(PATHS),
            "[ -~]{0,64}",
            0..PATHS.len()
        ),
        stale in proptest::collection::btree_map(
            proptest::sample::select(PATHS),
            "[a-z]{1,16}",
            0..3
        ),
    ) {
        let dir = tempfile::tempdir().unwrap();
        for (path, contents) in &stale {
            let dest = dir.path().join(path);
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, contents).unwrap();
        }

        let remote = remote_files
            .iter()
            .fold(FakeRemote::new("t"), |r, (path, contents)| r.with_file(path, contents));
        let sync = FileSync::new(&remote, dir.path());
        let token = Token::new("t");

        let first = sync.sync(&manifest(), &token);
        let after_first = snapshot(dir.path());
        let second = sync.sync(&manifest(), &token);
        let after_second = snapshot(dir.path());

        prop_assert_eq!(&after_first, &after_second);
        prop_assert_eq!(first.is_successful(), second.is_successful());

        // Every remote file is mirrored byte for byte, stale copies included
        for (path, contents) in &remote_files {
            prop_assert_eq!(after_second.get(*path).map(|b| b.as_slice()), Some(contents.as_bytes()));
        }
        // Files absent remotely keep whatever was there before
        for (path, contents) in &stale {
            if !remote_files.contains_key(path) {
                prop_assert_eq!(after_second.get(*path).map(|b| b.as_slice()), Some(contents.as_bytes()));
            }
        }
    }
}

#[test]
fn test_unauthorized_is_never_reported_as_not_found() {
    let dir = tempfile::tempdir().unwrap();
    // Only app.py exists remotely, everything else would be a 404
    let remote = FakeRemote::new("good").with_file("app.py", "x");

    let report = FileSync::new(&remote, dir.path()).sync(&default_manifest(), &Token::new("bad"));

    assert!(report.auth_failed());
    assert!(report
        .entries
        .iter()
        .all(|r| r.outcome == EntryOutcome::Unauthorized));
    assert!(!dir.path().join("app.py").exists());
}

#[test]
fn test_blank_token_is_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new("good").with_file("app.py", "x");

    let report = FileSync::new(&remote, dir.path())
        .sync(&[ManifestEntry::mirror("app.py").required()], &Token::new("   "));

    assert_eq!(report.entries[0].outcome, EntryOutcome::Unauthorized);
}

#[test]
fn test_optional_404_with_required_files_present() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new("t")
        .with_file("app.py", "app")
        .with_file("requirements.txt", "streamlit");

    let report = FileSync::new(&remote, dir.path()).sync(&default_manifest(), &Token::new("t"));

    assert!(report.is_successful());
    assert_eq!(report.written(), 2);
    assert_eq!(report.warnings().len(), default_manifest().len() - 2);
    assert!(report
        .warnings()
        .iter()
        .all(|r| r.outcome == EntryOutcome::NotFound));
}
