//! Remote path construction.
//!
//! VFS paths arrive absolute (`/dir/file`); the mount URL may carry a base
//! directory. Remote commands take the base-joined form. The URL side of the
//! mount spec may contain percent-escapes, which are decoded once at parse
//! time; the FTP control channel itself carries raw path bytes.

use percent_encoding::percent_decode_str;

/// Decode percent-escapes in a mount-URL component.
///
/// Invalid UTF-8 after decoding falls back to the original string: a mangled
/// base directory is more useful in error messages than a lossy replacement.
pub fn decode_url_component(component: &str) -> String {
    match percent_decode_str(component).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => component.to_string(),
    }
}

/// Join a VFS path onto the mount's remote base directory.
pub fn join_remote(base_dir: &str, vfs_path: &str) -> String {
    let base = base_dir.trim_end_matches('/');
    let rel = vfs_path.trim_start_matches('/');
    if rel.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{base}/{rel}")
    }
}

/// Split a VFS path into its parent directory and final component.
pub fn split_parent(vfs_path: &str) -> (&str, &str) {
    let trimmed = vfs_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("/", trimmed),
    }
}

/// Join a parent VFS path and a child name.
pub fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_escapes() {
        assert_eq!(decode_url_component("pub%20files"), "pub files");
        assert_eq!(decode_url_component("a%23b%25c"), "a#b%c");
        assert_eq!(decode_url_component("plain"), "plain");
    }

    #[test]
    fn decodes_utf8_escapes() {
        assert_eq!(decode_url_component("%C3%A9t%C3%A9"), "été");
    }

    #[test]
    fn invalid_utf8_is_left_alone() {
        assert_eq!(decode_url_component("%FF%FE"), "%FF%FE");
    }

    #[test]
    fn joins_onto_base() {
        assert_eq!(join_remote("/pub", "/a/b"), "/pub/a/b");
        assert_eq!(join_remote("/pub/", "/a"), "/pub/a");
        assert_eq!(join_remote("", "/a"), "/a");
        assert_eq!(join_remote("", "/"), "/");
        assert_eq!(join_remote("/pub", "/"), "/pub");
    }

    #[test]
    fn splits_parent_and_name() {
        assert_eq!(split_parent("/a/b/c"), ("/a/b", "c"));
        assert_eq!(split_parent("/file"), ("/", "file"));
        assert_eq!(split_parent("/a/dir/"), ("/a", "dir"));
    }

    #[test]
    fn joins_child() {
        assert_eq!(join_child("/", "x"), "/x");
        assert_eq!(join_child("/a/b", "x"), "/a/b/x");
    }
}
