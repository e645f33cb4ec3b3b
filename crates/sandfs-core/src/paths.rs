// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logical path utilities
//!
//! SandFS paths are `/`-rooted strings independent of any physical layout;
//! they are not host filesystem paths. Everything here is a pure function.

use crate::error::{FsError, FsResult};

/// A path split into its parent and final component. The root `/` has no
/// parent and an empty name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPath {
    pub parent: Option<String>,
    pub name: String,
}

/// Normalize a logical path: force a leading `/`, collapse repeated
/// separators, drop any trailing separator.
pub fn normalize(path: &str) -> String {
    let mut out = String::from("/");
    out.push_str(
        &path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/"),
    );
    out
}

/// Split a normalized path into `(parent, name)`.
pub fn parse_path(path: &str) -> FsResult<ParsedPath> {
    let path = normalize(path);
    if path == "/" {
        return Ok(ParsedPath {
            parent: None,
            name: String::new(),
        });
    }

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return Err(FsError::IllegalPath(path));
    }

    let name = parts[parts.len() - 1].to_string();
    let parent = format!("/{}", parts[..parts.len() - 1].join("/"));

    Ok(ParsedPath {
        parent: Some(parent),
        name,
    })
}

/// Join a child name onto a base path.
pub fn join_path(base: &str, name: &str) -> String {
    normalize(&format!("{base}/{name}"))
}

/// The sequence of storage lookups for a normalized path, root first.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
