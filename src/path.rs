//! Location matching and on-disk path resolution (spec §4.4 / §3 "Location
//! rule"): longest matching path prefix with boundary rules, then
//! alias/root substitution, normalization, and directory-index probing.

use std::path::{Path, PathBuf};

use crate::config::LocationRule;

/// Picks the longest-prefix-matching location, honoring the boundary rule:
/// the character right after the prefix must be end-of-string, `/`, `?`, or
/// the prefix itself must already end in `/`.
pub fn match_location<'a>(locations: &'a [LocationRule], path: &str) -> Option<&'a LocationRule> {
    locations
        .iter()
        .filter(|loc| path_matches_prefix(path, &loc.prefix))
        .max_by_key(|loc| loc.prefix.len())
}

fn path_matches_prefix(path: &str, prefix: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    if prefix.ends_with('/') {
        return true;
    }
    match path.as_bytes().get(prefix.len()) {
        None => true,
        Some(b'/') | Some(b'?') => true,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    EscapesRoot,
}

#[derive(Debug)]
pub struct Resolved {
    pub path: PathBuf,
    pub is_directory: bool,
}

/// Implements §4.4's four steps. `url_path` has already had the query
/// string stripped and been percent-decoded by the caller.
pub fn resolve(url_path: &str, location: &LocationRule) -> Result<Resolved, ResolveError> {
    let relative = url_path.strip_prefix(&location.prefix).unwrap_or(url_path);
    let relative = relative.trim_start_matches('/');

    let base = if let Some(alias) = &location.alias {
        PathBuf::from(alias)
    } else {
        PathBuf::from(location.root.as_deref().unwrap_or("."))
    };

    let mut candidate = base.join(relative);
    normalize_within_root(&base, &mut candidate)?;

    let is_directory = candidate.is_dir() || url_path.ends_with('/');

    if is_directory {
        if let Some(index_files) = &location.index {
            for name in index_files {
                let probe = candidate.join(name);
                if probe.is_file() {
                    return Ok(Resolved { path: probe, is_directory: false });
                }
            }
        }
        return Ok(Resolved { path: candidate, is_directory: true });
    }

    Ok(Resolved { path: candidate, is_directory: false })
}

/// Rejects any resolved path that would escape `root` via `..` segments,
/// without requiring the path to exist on disk yet.
fn normalize_within_root(root: &Path, candidate: &mut PathBuf) -> Result<(), ResolveError> {
    let mut stack: Vec<std::ffi::OsString> = Vec::new();
    for component in candidate.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                if stack.is_empty() {
                    return Err(ResolveError::EscapesRoot);
                }
                stack.pop();
            }
            CurDir => {}
            Normal(seg) => stack.push(seg.to_os_string()),
            RootDir | Prefix(_) => stack.push(component.as_os_str().to_os_string()),
        }
    }
    let mut normalized = PathBuf::new();
    for seg in &stack {
        normalized.push(seg);
    }
    if !normalized.starts_with(root) && root != Path::new(".") {
        return Err(ResolveError::EscapesRoot);
    }
    *candidate = normalized;
    Ok(())
}

/// §4.7 startup step 1: walk the resolved path prefix component by
/// component, returning the first suffix that exists as a regular file (the
/// script) and the remainder as `PATH_INFO`. Probes `index` files when a
/// directory is reached along the way.
pub fn locate_cgi_script(resolved: &Path, index: Option<&[String]>) -> Option<(PathBuf, String)> {
    if resolved.is_file() {
        return Some((resolved.to_path_buf(), String::new()));
    }
    let components: Vec<std::path::Component> = resolved.components().collect();
    let mut base = PathBuf::new();
    for (i, comp) in components.iter().enumerate() {
        base.push(comp);
        if base.is_file() {
            let remainder: PathBuf = components[i + 1..].iter().collect();
            return Some((base, path_info_string(&remainder)));
        }
    }
    if resolved.is_dir() {
        if let Some(files) = index {
            for name in files {
                let probe = resolved.join(name);
                if probe.is_file() {
                    return Some((probe, String::new()));
                }
            }
        }
    }
    None
}

fn path_info_string(remainder: &Path) -> String {
    if remainder.as_os_str().is_empty() {
        String::new()
    } else {
        format!("/{}", remainder.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(prefix: &str) -> LocationRule {
        LocationRule {
            prefix: prefix.to_string(),
            ..LocationRule::default()
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let locs = vec![loc("/"), loc("/api"), loc("/api/v2")];
        let matched = match_location(&locs, "/api/v2/users").unwrap();
        assert_eq!(matched.prefix, "/api/v2");
    }

    #[test]
    fn boundary_rule_rejects_partial_segment_match() {
        let locs = vec![loc("/api")];
        assert!(match_location(&locs, "/apikey").is_none());
        assert!(match_location(&locs, "/api/key").is_some());
        assert!(match_location(&locs, "/api").is_some());
        assert!(match_location(&locs, "/api?x=1").is_some());
    }

    #[test]
    fn prefix_ending_in_slash_matches_anything_under_it() {
        let locs = vec![loc("/static/")];
        assert!(match_location(&locs, "/static/foo.css").is_some());
    }

    #[test]
    fn dotdot_escaping_root_is_rejected() {
        let l = LocationRule {
            prefix: "/".to_string(),
            root: Some("/srv/www".to_string()),
            ..LocationRule::default()
        };
        let err = resolve("/../../etc/passwd", &l).unwrap_err();
        assert_eq!(err, ResolveError::EscapesRoot);
    }
}
