//! Lexical path discipline for logical stage paths
//!
//! Stage paths are `/`-separated UTF-8 strings, manipulated purely
//! lexically; the analysis core never touches the real file system
//! through them.

/// Lexically normalize a path: collapse `.` and empty components and
/// resolve `..` against preceding components. Leading `..` components
/// that cannot be resolved are kept. The empty path normalizes to `.`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(&p) if p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join two relative path fragments, tolerating an empty base (module
/// paths use the empty string for the repository root).
pub fn join(base: &str, rest: &str) -> String {
    if base.is_empty() || base == "." {
        normalize(rest)
    } else {
        normalize(&format!("{}/{}", base, rest))
    }
}

/// A path is non-upwards if it is relative and its normal form stays
/// within the directory it is interpreted against.
pub fn is_non_upwards(path: &str) -> bool {
    if path.starts_with('/') {
        return false;
    }
    let mut depth: i64 = 0;
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

/// Final path component of the normalized path.
pub fn basename(path: &str) -> String {
    let normal = normalize(path);
    match normal.rsplit('/').next() {
        Some(base) => base.to_string(),
        None => normal,
    }
}

/// Replace the extension of the final component by `ending` (which by
/// convention includes its leading dot). A component without a dot gets
/// the ending appended.
pub fn change_ending(path: &str, ending: &str) -> String {
    let normal = normalize(path);
    let (dir, base) = match normal.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, normal.as_str()),
    };
    let stem = match base.rsplit_once('.') {
        // a leading dot is part of the name, not an extension marker
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    match dir {
        Some(dir) => format!("{}/{}{}", dir, stem, ending),
        None => format!("{}{}", stem, ending),
    }
}

/// Lexical relative path from `base` to `path` (both interpreted as
/// relative paths). Mirrors `lexically_relative`: shared prefix is
/// dropped, remaining base components become `..`.
pub fn relative_to(path: &str, base: &str) -> String {
    let path_norm = normalize(path);
    let base_norm = normalize(base);
    if base_norm == "." {
        return path_norm;
    }
    let path_parts: Vec<&str> = path_norm.split('/').filter(|c| *c != ".").collect();
    let base_parts: Vec<&str> = base_norm.split('/').filter(|c| *c != ".").collect();
    let mut common = 0;
    while common < path_parts.len()
        && common < base_parts.len()
        && path_parts[common] == base_parts[common]
    {
        common += 1;
    }
    let mut parts: Vec<&str> = Vec::new();
    for _ in common..base_parts.len() {
        parts.push("..");
    }
    parts.extend(&path_parts[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
