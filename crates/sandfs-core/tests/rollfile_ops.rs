// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Rolling-file behavior: the fixed 30/70 compaction policy, tracked size,
//! and lifecycle of the always-open reader/writer pair.

use sandfs_core::{FsError, SandFs};

#[tokio::test]
async fn test_append_and_compact_match_model() {
    let fs = SandFs::in_memory();
    let max = 100u64;
    let mut roll = fs.rollfile("/logs/app.log", max).await.unwrap();

    // mirror of the compaction rule: once the size reaches the cap, drop
    // the oldest round(30%) and keep the rest
    let mut model = String::new();
    for i in 0..20 {
        let chunk = if i < 14 { "1111111111" } else { "2222222222" };
        roll.append(chunk).await.unwrap();
        model.push_str(chunk);
        if model.len() >= max as usize {
            let cut = (model.len() as f64 * 0.3).round() as usize;
            model = model[cut..].to_string();
        }
        assert_eq!(roll.get_size(), model.len() as u64);
    }

    assert_eq!(roll.text().await.unwrap(), model);
    assert!(roll.get_size() <= max);
    // the newest appends always survive compaction
    assert!(model.ends_with("2222222222"));
}

#[tokio::test]
async fn test_rollfile_holds_the_writer() {
    let fs = SandFs::in_memory();
    let roll = fs.rollfile("/l", 10).await.unwrap();
    assert!(matches!(
        fs.file("/l").unwrap().create_writer().await,
        Err(FsError::WriterConflict)
    ));
    roll.remove().await.unwrap();
}

#[tokio::test]
async fn test_rollfile_remove_releases_everything() {
    let fs = SandFs::in_memory();
    let mut roll = fs.rollfile("/r.log", 50).await.unwrap();
    roll.append("hello").await.unwrap();
    assert_eq!(roll.get_size(), 5);
    roll.remove().await.unwrap();

    assert!(!fs.exists("/r.log").await.unwrap());
    // the path is free for a fresh writer afterwards
    let file = fs.file("/r.log").unwrap();
    let mut writer = file.create_writer().await.unwrap();
    writer.close().await.unwrap();
}
