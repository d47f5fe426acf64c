//! Remote path handling. Remote paths are POSIX-like and always absolute
//! once resolved.

use crate::interface::DispatchError;

/// Collapses `.`, `..` and repeated separators. `..` never climbs above `/`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolves `path` against `cwd` when it is relative.
pub fn resolve(cwd: &str, path: &str) -> Result<String, DispatchError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(DispatchError::InvalidArgument("empty remote path".into()));
    }
    if path.starts_with('/') {
        Ok(normalize(path))
    } else {
        Ok(normalize(&format!("{cwd}/{path}")))
    }
}

/// Rejects names that cannot be a single path component.
pub fn check_name(name: &str) -> Result<&str, DispatchError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." || trimmed.contains('/') {
        return Err(DispatchError::InvalidArgument(format!(
            "{name:?} is not a valid entry name"
        )));
    }
    Ok(trimmed)
}

/// Splits a normalized path into its parent and last component; `None`
/// for the root.
pub fn split_parent(path: &str) -> Option<(String, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Some((parent.to_string(), name))
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Non-empty components of a normalized path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
