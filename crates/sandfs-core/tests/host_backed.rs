// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The same API surface against the host-filesystem backend and the
//! file-persisted mark store.

use std::sync::Arc;

use sandfs_core::{FileMarkStore, FsConfig, HostStorage, SandFs};

fn host_fs(dir: &std::path::Path) -> SandFs {
    SandFs::new(
        FsConfig::default(),
        Arc::new(HostStorage::new(dir.join("root")).unwrap()),
        Arc::new(FileMarkStore::in_dir(dir)),
    )
}

#[tokio::test]
async fn test_host_backed_roundtrip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fs = host_fs(tmp.path());

    fs.write("/notes/a.txt", "persisted").await?;
    assert_eq!(fs.file("/notes/a.txt")?.text().await?, "persisted");

    // the bytes really land under the host root
    let on_disk = std::fs::read_to_string(tmp.path().join("root/notes/a.txt"))?;
    assert_eq!(on_disk, "persisted");

    fs.dir("/notes")?.remove().await?;
    assert!(!tmp.path().join("root/notes").exists());
    Ok(())
}

#[tokio::test]
async fn test_host_backed_copy_and_listing() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = host_fs(tmp.path());

    fs.write("/src/one.txt", "1").await.unwrap();
    fs.write("/src/deep/two.txt", "2").await.unwrap();
    fs.dir("/dst").unwrap().create().await.unwrap();

    let copied = fs.dir("/src").unwrap().copy_to(&fs.dir("/dst").unwrap()).await.unwrap();
    assert_eq!(copied.path(), "/dst/src");
    assert_eq!(fs.file("/dst/src/deep/two.txt").unwrap().text().await.unwrap(), "2");

    let children = fs.dir("/src").unwrap().children().await.unwrap();
    assert_eq!(children.len(), 2);
}

#[tokio::test]
async fn test_host_backed_mark_list_survives_contexts() {
    let tmp = tempfile::tempdir().unwrap();
    let name;
    {
        let fs = host_fs(tmp.path());
        let file = fs.tmpfile().unwrap();
        name = file.name().to_string();
        // leave the session unswept; teardown marks it durably
    }

    // a second context over the same host directory prunes the mark list
    let fs = host_fs(tmp.path());
    fs.prune_marked().await;
    let marks = std::fs::read_to_string(tmp.path().join("SANDFS_EXPIRES_TMP_FILES")).unwrap();
    assert!(!marks.contains(&name));
}
