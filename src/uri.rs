// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Conversions between `file://` URIs and filesystem paths.
//!
//! The LSP wire format speaks URIs while the sketch mapper and the
//! preprocessor speak paths. Tracked documents are keyed by lexically
//! normalised paths so that differently-spelled URIs for the same file
//! collapse to one entry.

use anyhow::{Result, anyhow};
use lsp_types::Uri;
use std::path::{Component, Path, PathBuf};

/// Builds a `file://` URI from an absolute path.
///
/// # Errors
///
/// Returns an error if the path produces an unparsable URI (e.g. it
/// contains characters that are not valid in a URI).
pub fn path_to_uri(path: &Path) -> Result<Uri> {
    format!("file://{}", path.display())
        .parse()
        .map_err(|e| anyhow!("invalid path {}: {e:?}", path.display()))
}

/// Extracts the filesystem path from a `file://` URI.
///
/// Percent-escapes are decoded; non-file schemes are returned verbatim as
/// a path so callers can still log something meaningful.
pub fn uri_to_path(uri: &Uri) -> PathBuf {
    let s = uri.as_str();
    let raw = s.strip_prefix("file://").unwrap_or(s);
    PathBuf::from(percent_decode(raw))
}

/// Lexically normalises a path: resolves `.` and `..` components without
/// touching the filesystem (the build directory may not exist yet).
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Returns the lowercase extension of the URI's path, if any.
pub fn uri_extension(uri: &Uri) -> Option<String> {
    uri_to_path(uri)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// True if the URI points at an `.ino` sketch fragment.
pub fn is_ino(uri: &Uri) -> bool {
    uri_extension(uri).as_deref() == Some("ino")
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len()
            && let Some(hex) = input.get(i + 1..i + 3)
            && let Ok(b) = u8::from_str_radix(hex, 16)
        {
            out.push(b);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trip() -> Result<()> {
        let uri = path_to_uri(Path::new("/home/user/Blink/Blink.ino"))?;
        assert_eq!(uri.as_str(), "file:///home/user/Blink/Blink.ino");
        assert_eq!(
            uri_to_path(&uri),
            PathBuf::from("/home/user/Blink/Blink.ino")
        );
        Ok(())
    }

    #[test]
    fn decodes_percent_escapes() -> Result<()> {
        let uri: Uri = "file:///home/user/My%20Sketch/My%20Sketch.ino".parse()?;
        assert_eq!(
            uri_to_path(&uri),
            PathBuf::from("/home/user/My Sketch/My Sketch.ino")
        );
        Ok(())
    }

    #[test]
    fn extension_detection() -> Result<()> {
        let ino: Uri = "file:///tmp/s/Blink.ino".parse()?;
        let cpp: Uri = "file:///tmp/s/util.cpp".parse()?;
        assert!(is_ino(&ino));
        assert!(!is_ino(&cpp));
        assert_eq!(uri_extension(&cpp).as_deref(), Some("cpp"));
        Ok(())
    }

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(
            normalize(Path::new("/a/./b/../c/x.ino")),
            PathBuf::from("/a/c/x.ino")
        );
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }
}
