// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Scoped `.clang-format` setup for formatting requests.
//!
//! clangd resolves its formatting style from a `.clang-format` file found
//! next to the file named in the request. The build tree has none, so one
//! is written beside the target for the duration of the request and
//! removed once the response has been delivered, whatever the outcome.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The Arduino formatting style (LLVM-derived), used when neither the
/// sketch nor the user configuration provides one.
pub const DEFAULT_STYLE: &str = include_str!("default-clang-format.yaml");

/// Removes the scoped `.clang-format` on drop.
#[derive(Debug)]
pub struct StyleGuard {
    path: PathBuf,
}

impl Drop for StyleGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("removing {}: {e}", self.path.display());
        } else {
            debug!("removed scoped style file {}", self.path.display());
        }
    }
}

/// Picks the style content: a `.clang-format` in the sketch root wins,
/// then a user-configured file, then the baked-in default. Unreadable
/// custom files fall back to the next candidate with a log, matching the
/// permissive behaviour formatting has always had.
#[must_use]
pub fn style_content(sketch_root: &Path, user_conf: Option<&Path>) -> String {
    let sketch_conf = sketch_root.join(".clang-format");
    if sketch_conf.exists() {
        match std::fs::read_to_string(&sketch_conf) {
            Ok(content) => {
                debug!("using sketch formatter config {}", sketch_conf.display());
                return content;
            }
            Err(e) => warn!("reading {}: {e}", sketch_conf.display()),
        }
    }

    if let Some(conf) = user_conf {
        match std::fs::read_to_string(conf) {
            Ok(content) => {
                debug!("using user formatter config {}", conf.display());
                return content;
            }
            Err(e) => warn!("reading {}: {e}", conf.display()),
        }
    }

    DEFAULT_STYLE.to_string()
}

/// Writes a `.clang-format` next to the formatting target and returns the
/// guard that deletes it again.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn install(
    target: &Path,
    sketch_root: &Path,
    user_conf: Option<&Path>,
) -> Result<StyleGuard> {
    let dir = if target.is_dir() {
        target
    } else {
        target.parent().unwrap_or(target)
    };
    let path = dir.join(".clang-format");
    let content = style_content(sketch_root, user_conf);

    std::fs::write(&path, content)
        .with_context(|| format!("writing formatter config {}", path.display()))?;
    debug!("wrote scoped style file {}", path.display());

    Ok(StyleGuard { path })
}
