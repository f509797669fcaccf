//! Path security: every user-supplied path is scoped to its module root.
//!
//! Resolution is two-staged. The input is first normalized lexically (separators, `.`,
//! forbidden components and encodings), then the deepest existing ancestor of the target is
//! canonicalized and must remain under the canonical module root, which catches symlink
//! escapes.

use crate::error::{SandboxError, SandboxResult};
use std::path::{Component, Path, PathBuf};

/// Longest accepted user or project id, in bytes.
pub const MAX_SEGMENT_LEN: usize = 128;

/// Percent-encoded separators, dots and NUL. Matched case-insensitively.
const ENCODED_PATTERNS: [&str; 4] = ["%2f", "%5c", "%2e", "%00"];

fn traversal(input: &str, reason: &str) -> SandboxError {
    SandboxError::PathTraversal(format!("{input:?}: {reason}"))
}

/// Lexically normalizes a user path into a relative path with only normal components.
///
/// Rejects empty input, NUL and control characters, percent-encoded separators and dots,
/// absolute and home-relative paths, drive prefixes, any `..` component, and paths that
/// normalize to the root itself.
pub fn sanitize_relative(input: &str) -> SandboxResult<PathBuf> {
    if input.trim().is_empty() {
        return Err(traversal(input, "path is required"));
    }
    if input.chars().any(|c| c.is_control()) {
        return Err(traversal(input, "control characters are forbidden"));
    }
    let lowered = input.to_ascii_lowercase();
    if ENCODED_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Err(traversal(input, "percent-encoded separators are forbidden"));
    }

    let raw = input.trim().replace('\\', "/");
    if raw.starts_with('/') || raw.starts_with('~') {
        return Err(traversal(input, "absolute paths are forbidden"));
    }
    // `C:/x` after separator normalization; not an absolute path on unix, still rejected.
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(traversal(input, "drive prefixes are forbidden"));
    }

    let mut out = PathBuf::new();
    for c in Path::new(&raw).components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(traversal(input, "path traversal is forbidden"));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(traversal(input, "path resolves to the module root"));
    }
    Ok(out)
}

/// Canonicalizes the deepest existing ancestor of `path` and re-appends the rest.
///
/// A dangling symlink anywhere on the way is an error: following it later could land
/// anywhere.
fn canonicalize_existing_prefix(path: &Path) -> SandboxResult<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match std::fs::symlink_metadata(&existing) {
            Ok(_) => break,
            Err(_) => {
                let name = existing.file_name().map(|n| n.to_os_string()).ok_or_else(|| {
                    SandboxError::PathTraversal(format!("{}: no existing ancestor", path.display()))
                })?;
                rest.push(name);
                if !existing.pop() {
                    return Err(SandboxError::PathTraversal(format!(
                        "{}: no existing ancestor",
                        path.display()
                    )));
                }
            }
        }
    }
    let mut canon = existing.canonicalize().map_err(|e| {
        SandboxError::PathTraversal(format!("{}: cannot resolve: {e}", existing.display()))
    })?;
    for seg in rest.into_iter().rev() {
        canon.push(seg);
    }
    Ok(canon)
}

/// Resolves `user_path` under `module_root`. The result is absolute, lies strictly below
/// the canonical module root, and has every existing component's symlinks resolved.
pub fn resolve(module_root: &Path, user_path: &str) -> SandboxResult<PathBuf> {
    let rel = sanitize_relative(user_path)?;
    let root_canon = canonicalize_existing_prefix(module_root)?;
    let target_canon = canonicalize_existing_prefix(&root_canon.join(&rel))?;

    if !target_canon.starts_with(&root_canon) || target_canon == root_canon {
        tracing::warn!(
            target: "devlabo::security",
            path = %user_path,
            root = %module_root.display(),
            "path escapes module root"
        );
        return Err(traversal(user_path, "path is outside the module root"));
    }
    Ok(target_canon)
}

/// Validates a single path segment used as a user or project id.
pub fn validate_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("must not be empty");
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err("too long");
    }
    if segment == "." || segment == ".." || segment.contains("..") {
        return Err("must not contain '..'");
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err("must not contain separators");
    }
    if segment.chars().any(|c| c.is_control()) {
        return Err("must not contain control characters");
    }
    if segment.starts_with('~') || segment.contains('%') {
        return Err("must not contain '~' prefix or percent escapes");
    }
    Ok(())
}

/// `/`-joined form of a relative path, used for storage keys and API responses.
pub fn to_slash(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(seg) => Some(seg.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("frontend");
        std::fs::create_dir_all(&root).unwrap();
        (dir, root)
    }

    #[test]
    fn accepts_nested_relative_paths() {
        let (_dir, root) = module_root();
        let p = resolve(&root, "src/App.jsx").unwrap();
        assert!(p.ends_with("frontend/src/App.jsx"));
        let p = resolve(&root, "./index.html").unwrap();
        assert!(p.ends_with("frontend/index.html"));
        let p = resolve(&root, "src\\components\\Nav.jsx").unwrap();
        assert!(p.ends_with("frontend/src/components/Nav.jsx"));
    }

    #[test]
    fn rejects_traversal_forms() {
        let (_dir, root) = module_root();
        for bad in [
            "../x",
            "../../etc/passwd",
            "a/../../b",
            "/etc/passwd",
            "C:\\windows\\system32",
            "~/secrets",
            "a\0b",
            "..%2fetc",
            "%2E%2E/x",
            "a%5cb",
            "a%00",
            "",
            "   ",
            ".",
            "./",
            "a/..",
        ] {
            let err = resolve(&root, bad).unwrap_err();
            assert!(matches!(err, SandboxError::PathTraversal(_)), "accepted {bad:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let (dir, root) = module_root();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();
        assert!(matches!(
            resolve(&root, "link/secret.txt"),
            Err(SandboxError::PathTraversal(_))
        ));

        std::fs::write(outside.join("f"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.join("f"), root.join("file_link")).unwrap();
        assert!(resolve(&root, "file_link").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_dangling_symlink() {
        let (dir, root) = module_root();
        std::os::unix::fs::symlink(dir.path().join("nowhere"), root.join("dangling")).unwrap();
        assert!(resolve(&root, "dangling").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_is_allowed() {
        let (_dir, root) = module_root();
        std::fs::create_dir_all(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
        let p = resolve(&root, "alias/file.txt").unwrap();
        assert!(p.ends_with("frontend/real/file.txt"));
    }

    #[test]
    fn segments() {
        assert!(validate_segment("alice").is_ok());
        assert!(validate_segment("proj-1_x").is_ok());
        assert!(validate_segment("..").is_err());
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment(&"x".repeat(129)).is_err());
    }

    #[test]
    fn slash_form() {
        assert_eq!(to_slash(Path::new("src/components/Nav.jsx")), "src/components/Nav.jsx");
    }
}
