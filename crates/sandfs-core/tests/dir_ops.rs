// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory tree operations: creation, enumeration, recursive remove, and
//! the merge-vs-nest copy asymmetry.

use sandfs_core::{EntryKind, FsError, SandFs};

async fn seed_tree(fs: &SandFs) {
    fs.write("/tree/a.txt", "A").await.unwrap();
    fs.write("/tree/sub/b.txt", "B").await.unwrap();
}

#[tokio::test]
async fn test_create_exists_children() {
    let fs = SandFs::in_memory();
    let dir = fs.dir("/deep/nested/dir").unwrap();
    assert!(!dir.exists().await.unwrap());

    dir.create().await.unwrap();
    assert!(dir.exists().await.unwrap());
    dir.create().await.unwrap(); // idempotent
    assert!(fs.dir("/deep").unwrap().exists().await.unwrap());

    fs.write("/deep/nested/dir/f.txt", "x").await.unwrap();
    fs.dir("/deep/nested/dir/sub").unwrap().create().await.unwrap();

    let mut children: Vec<(String, EntryKind)> = dir
        .children()
        .await
        .unwrap()
        .iter()
        .map(|child| (child.name().to_string(), child.kind()))
        .collect();
    children.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        children,
        vec![
            ("f.txt".to_string(), EntryKind::File),
            ("sub".to_string(), EntryKind::Dir),
        ]
    );

    // a missing directory enumerates as empty
    assert!(fs.dir("/absent").unwrap().children().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_copy_into_missing_dest_is_rename_like() {
    let fs = SandFs::in_memory();
    seed_tree(&fs).await;

    let copied = fs.dir("/tree").unwrap().copy_to(&fs.dir("/clone").unwrap()).await.unwrap();
    assert_eq!(copied.path(), "/clone");
    assert_eq!(fs.file("/clone/a.txt").unwrap().text().await.unwrap(), "A");
    assert_eq!(fs.file("/clone/sub/b.txt").unwrap().text().await.unwrap(), "B");

    // the source is untouched by a copy
    assert!(fs.exists("/tree/a.txt").await.unwrap());
}

#[tokio::test]
async fn test_copy_into_existing_dest_nests() {
    let fs = SandFs::in_memory();
    seed_tree(&fs).await;
    fs.dir("/target").unwrap().create().await.unwrap();

    let copied = fs.dir("/tree").unwrap().copy_to(&fs.dir("/target").unwrap()).await.unwrap();
    assert_eq!(copied.path(), "/target/tree");
    assert_eq!(fs.file("/target/tree/a.txt").unwrap().text().await.unwrap(), "A");
    assert_eq!(
        fs.file("/target/tree/sub/b.txt").unwrap().text().await.unwrap(),
        "B"
    );
}

#[tokio::test]
async fn test_copy_missing_source_fails() {
    let fs = SandFs::in_memory();
    let err = fs
        .dir("/ghost")
        .unwrap()
        .copy_to(&fs.dir("/wherever").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::SourceNotFound(_)));
}

#[tokio::test]
async fn test_move_removes_source() {
    let fs = SandFs::in_memory();
    seed_tree(&fs).await;

    let moved = fs.dir("/tree").unwrap().move_to(&fs.dir("/moved").unwrap()).await.unwrap();
    assert_eq!(moved.path(), "/moved");
    assert_eq!(fs.file("/moved/sub/b.txt").unwrap().text().await.unwrap(), "B");
    assert!(!fs.dir("/tree").unwrap().exists().await.unwrap());
}

#[tokio::test]
async fn test_remove_continues_past_busy_children() {
    // surface the per-child warnings this test is expected to produce
    let _ = tracing_subscriber::fmt().with_env_filter("sandfs_core=warn").try_init();

    let fs = SandFs::in_memory();
    fs.write("/d/busy.txt", "held").await.unwrap();
    fs.write("/d/loose.txt", "x").await.unwrap();

    let busy = fs.file("/d/busy.txt").unwrap();
    let mut reader = busy.create_reader().await.unwrap();

    // remove never aborts: the held file is skipped, its sibling goes
    fs.dir("/d").unwrap().remove().await.unwrap();
    assert!(busy.exists().await.unwrap());
    assert!(!fs.exists("/d/loose.txt").await.unwrap());

    reader.close().await.unwrap();
    fs.dir("/d").unwrap().remove().await.unwrap();
    assert!(!fs.exists("/d/").await.unwrap());
}

#[tokio::test]
#[ignore = "documented hazard: moving a directory into its own subtree descends into directories it creates and does not terminate"]
async fn test_move_into_own_subtree_hazard() {
    let fs = SandFs::in_memory();
    fs.write("/a/f.txt", "x").await.unwrap();
    fs.dir("/a/sub").unwrap().create().await.unwrap();
    let _ = fs.dir("/a").unwrap().move_to(&fs.dir("/a/sub").unwrap()).await;
}
