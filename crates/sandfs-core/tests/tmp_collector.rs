// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Temp-file allocation and the two reclamation paths: the age-based sweep
//! and the cross-session mark list.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sandfs_core::{FsConfig, MarkStore, MemStorage, MemoryMarkStore, SandFs};

fn fs_with_marks(marks: Arc<MemoryMarkStore>) -> SandFs {
    SandFs::new(FsConfig::default(), Arc::new(MemStorage::new()), marks)
}

#[tokio::test]
async fn test_tmpfile_name_and_location() {
    let fs = SandFs::in_memory();
    let tmp = fs.tmpfile().unwrap();
    assert!(tmp.path().starts_with("/.sandfs-tmp/"));

    let (token, epoch) = tmp.name().split_once('-').unwrap();
    assert!(!token.is_empty() && token.chars().all(|c| c.is_ascii_digit()));
    assert!(epoch.parse::<u64>().unwrap() > 0);

    // each call allocates a distinct path
    assert_ne!(fs.tmpfile().unwrap().path(), tmp.path());
}

#[tokio::test]
async fn test_sweep_reclaims_expired_and_unparseable() {
    let fs = SandFs::in_memory();
    // ancient creation epoch: far beyond the retention window
    fs.write("/.sandfs-tmp/12345-1000", "old").await.unwrap();
    // a name without the epoch suffix is reclaimed unconditionally
    fs.write("/.sandfs-tmp/not-a-tmp-name", "junk").await.unwrap();
    // a fresh file stays
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
    let fresh = format!("/.sandfs-tmp/777-{now}");
    fs.write(&fresh, "new").await.unwrap();

    fs.sweep_expired().await;

    assert!(!fs.exists("/.sandfs-tmp/12345-1000").await.unwrap());
    assert!(!fs.exists("/.sandfs-tmp/not-a-tmp-name").await.unwrap());
    assert!(fs.exists(&fresh).await.unwrap());
}

#[tokio::test]
async fn test_sweep_skips_files_in_writing() {
    let fs = SandFs::in_memory();
    fs.write("/.sandfs-tmp/1-2", "held").await.unwrap();
    let file = fs.file("/.sandfs-tmp/1-2").unwrap();
    let mut writer = file.create_writer().await.unwrap();

    // the sweep cannot open a second writer, so the entry survives
    fs.sweep_expired().await;
    assert!(file.exists().await.unwrap());

    writer.close().await.unwrap();
    fs.sweep_expired().await;
    assert!(!file.exists().await.unwrap());
}

#[tokio::test]
async fn test_prune_marked_excises_removed_names() {
    let marks = Arc::new(MemoryMarkStore::with_value("111-1,,222-2,ghost-name"));
    let fs = fs_with_marks(marks.clone());
    fs.write("/.sandfs-tmp/111-1", "a").await.unwrap();
    fs.write("/.sandfs-tmp/222-2", "b").await.unwrap();

    fs.prune_marked().await;

    assert!(!fs.exists("/.sandfs-tmp/111-1").await.unwrap());
    assert!(!fs.exists("/.sandfs-tmp/222-2").await.unwrap());
    // every name was removed and excised; duplicate commas collapse
    assert_eq!(marks.get().unwrap().as_deref(), Some(","));
}

#[tokio::test]
async fn test_prune_keeps_unremovable_names() {
    let marks = Arc::new(MemoryMarkStore::with_value("held-1"));
    let fs = fs_with_marks(marks.clone());
    fs.write("/.sandfs-tmp/held-1", "x").await.unwrap();
    let mut writer = fs.file("/.sandfs-tmp/held-1").unwrap().create_writer().await.unwrap();

    fs.prune_marked().await;
    // removal failed, so the name stays on the list for a later session
    assert_eq!(marks.get().unwrap().as_deref(), Some("held-1"));

    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_session_marking_appends_and_drains() {
    let marks = Arc::new(MemoryMarkStore::new());
    let fs = fs_with_marks(marks.clone());
    let a = fs.tmpfile().unwrap();
    let b = fs.tmpfile().unwrap();

    fs.mark_session_tmpfiles();
    let stored = marks.get().unwrap().unwrap();
    assert!(stored.contains(a.name()));
    assert!(stored.contains(b.name()));

    // the session list was drained, marking again adds nothing
    fs.mark_session_tmpfiles();
    assert_eq!(marks.get().unwrap().unwrap(), stored);
}

#[tokio::test]
async fn test_drop_marks_leftover_session_files() {
    let marks = Arc::new(MemoryMarkStore::new());
    let name;
    {
        let fs = fs_with_marks(marks.clone());
        let tmp = fs.tmpfile().unwrap();
        name = tmp.name().to_string();
    }
    // the context's teardown marked the unswept temp file
    assert!(marks.get().unwrap().unwrap_or_default().contains(&name));
}
