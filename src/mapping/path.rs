//! Absolute path helpers.
//!
//! Paths are `/`-separated, absolute, NFC-normalized, with no trailing slash
//! (except the root itself) and no `.`/`..` components.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

pub const ROOT: &str = "/";

/// Longest accepted single component, in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
    #[error("Path must be absolute: {0:?}")]
    NotAbsolute(String),
}

/// Normalize a single directory entry name to NFC form.
///
/// Clients may send names in either NFC or NFD form; normalizing on both
/// storage and lookup keeps accented names from splitting into two entries.
pub fn normalize_name(name: &str) -> Result<String, PathError> {
    let normalized: String = name.nfc().collect();
    if normalized.is_empty()
        || normalized == "."
        || normalized == ".."
        || normalized.contains('/')
        || normalized.contains('\0')
        || normalized.len() > MAX_NAME_LEN
    {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(normalized)
}

/// Normalize a full absolute path, collapsing repeated separators.
pub fn normalize_path(path: &str) -> Result<String, PathError> {
    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_string()));
    }
    let mut out = String::with_capacity(path.len());
    for component in path.split('/').filter(|c| !c.is_empty()) {
        out.push('/');
        out.push_str(&normalize_name(component)?);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Join an already-normalized directory path and an already-normalized name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent directory of `path`; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final component of `path`; empty for the root.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Every proper ancestor directory of `path`, root first.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(dir) = current {
        out.push(dir);
        current = parent(dir);
    }
    out.reverse();
    out
}

/// True when `path` lies strictly below directory `dir`.
pub fn is_descendant(path: &str, dir: &str) -> bool {
    if dir == ROOT {
        return path != ROOT;
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// First component of `descendant` below `dir`.
pub fn child_name<'a>(dir: &str, descendant: &'a str) -> Option<&'a str> {
    if !is_descendant(descendant, dir) {
        return None;
    }
    let rest = if dir == ROOT {
        &descendant[1..]
    } else {
        &descendant[dir.len() + 1..]
    };
    rest.split('/').next()
}

/// Re-root `path` from under `old_dir` to under `new_dir`.
pub fn rebase(path: &str, old_dir: &str, new_dir: &str) -> String {
    if path == old_dir {
        return new_dir.to_string();
    }
    let rest = &path[old_dir.len()..];
    if new_dir == ROOT {
        rest.to_string()
    } else {
        format!("{}{}", new_dir, rest)
    }
}
