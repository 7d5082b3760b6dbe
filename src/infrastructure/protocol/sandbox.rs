use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::code;

fn traversal(detail: impl Into<String>) -> AppError {
    AppError::new(code::PATH_TRAVERSAL, "path escapes share root").with_detail(detail.into())
}

/// Lexically squash a protocol-relative path: `\` becomes `/`, leading
/// separators and `.` segments drop, `..` pops. A pop past the top is a
/// guaranteed escape and fails immediately.
fn normalize_relative(raw: &str) -> AppResult<PathBuf> {
    let clean = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in clean.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(traversal(raw.to_string()));
                }
            }
            other => {
                #[cfg(windows)]
                if other.contains(':') {
                    return Err(traversal(raw.to_string()));
                }
                parts.push(other);
            }
        }
    }
    Ok(parts.iter().collect())
}

#[cfg(not(windows))]
fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(windows)]
fn is_within(path: &Path, root: &Path) -> bool {
    let lower = |p: &Path| {
        p.components()
            .map(|c| c.as_os_str().to_string_lossy().to_ascii_lowercase())
            .collect::<Vec<_>>()
    };
    let path = lower(path);
    let root = lower(root);
    path.len() >= root.len() && path[..root.len()] == root[..]
}

/// Resolve a protocol-relative path beneath a share root.
///
/// The root must exist and be a directory. The result is canonical for the
/// part of the path that exists on disk; a nonexistent tail is appended to
/// its canonical deepest existing ancestor. Symlinks that resolve outside
/// the root are rejected. Called on every filesystem touch, not just the
/// first request of a session.
pub fn resolve_under_root(root: &Path, relative: &str) -> AppResult<PathBuf> {
    let canon_root = fs::canonicalize(root)
        .map_err(|error| traversal(format!("{}: {error}", root.display())))?;
    if !canon_root.is_dir() {
        return Err(traversal(format!("{} is not a directory", root.display())));
    }

    let normalized = normalize_relative(relative)?;
    if normalized.as_os_str().is_empty() {
        return Ok(canon_root);
    }

    let joined = canon_root.join(&normalized);
    match fs::canonicalize(&joined) {
        Ok(canon) => {
            if is_within(&canon, &canon_root) {
                Ok(canon)
            } else {
                Err(traversal(relative.to_string()))
            }
        }
        Err(_) => {
            // Nonexistent tail (upload destinations): canonicalize the
            // deepest existing ancestor and re-append the remainder.
            let mut ancestor = joined.as_path();
            let mut stripped = Vec::new();
            loop {
                match fs::canonicalize(ancestor) {
                    Ok(canon_ancestor) => {
                        if !is_within(&canon_ancestor, &canon_root) {
                            return Err(traversal(relative.to_string()));
                        }
                        let mut resolved = canon_ancestor;
                        for part in stripped.iter().rev() {
                            resolved.push(part);
                        }
                        return Ok(resolved);
                    }
                    Err(_) => {
                        let Some(name) = ancestor.file_name() else {
                            return Err(traversal(relative.to_string()));
                        };
                        stripped.push(name.to_os_string());
                        let Some(parent) = ancestor.parent() else {
                            return Err(traversal(relative.to_string()));
                        };
                        ancestor = parent;
                    }
                }
            }
        }
    }
}
