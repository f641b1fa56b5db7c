// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The shared state of the active sketch session.
//!
//! One `Workbench` sits behind a single reader/writer lock; the
//! write-versus-read classification of LSP methods (see the router) is the
//! only concurrency contract. Clangd readiness is signalled through a
//! `watch` channel so late arrivals can wait for startup to finish without
//! holding the lock.

use lsp_types::{DocumentSymbol, Uri};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::lsp::ClangdServer;
use crate::mapper::SketchMapper;
use crate::uri;

/// Startup state of the clangd backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Initialisation has not finished yet.
    Starting,
    /// clangd is initialised and accepting traffic.
    Ready,
    /// Startup failed; requests must be refused.
    Failed,
}

/// The board selected in the IDE, driving the preprocessor invocation.
#[derive(Debug, Clone, Default)]
pub struct BoardConfig {
    /// Human-readable board name (may be empty when none is selected).
    pub name: String,
    /// Fully qualified board name, e.g. `arduino:avr:uno`.
    pub fqbn: String,
}

/// A document the IDE has opened, mirrored from `didOpen`/`didChange`.
#[derive(Debug, Clone)]
pub struct TrackedDoc {
    /// The URI as the IDE spelled it.
    pub uri: Uri,
    /// The IDE's language id.
    pub language_id: String,
    /// Monotonic version from the IDE.
    pub version: i32,
    /// Full current text.
    pub text: String,
}

/// Shared state of the language server for the active sketch.
#[derive(Default)]
pub struct Workbench {
    /// The `initialize` params captured from the IDE, kept as raw JSON so
    /// non-standard fields survive the root rewrite and the forward.
    pub initialize_params: serde_json::Value,
    /// Directory of the user's sketch.
    pub sketch_root: PathBuf,
    /// Basename of the sketch directory.
    pub sketch_name: String,
    /// Preprocessor output root.
    pub build_path: PathBuf,
    /// `build_path/sketch`.
    pub build_sketch_root: PathBuf,
    /// `build_sketch_root/<sketch_name>.ino.cpp`.
    pub build_sketch_cpp: PathBuf,
    /// The source map and synthetic text; absent until the first
    /// preprocess finishes.
    pub mapper: Option<SketchMapper>,
    /// Open documents keyed by normalised path.
    pub docs: HashMap<PathBuf, TrackedDoc>,
    /// Number of currently-open `.ino` documents.
    pub sketch_tracked_files_count: i32,
    /// Last observed top-level function symbols of the synthetic unit, in
    /// synthetic-unit coordinates. Mutated only under the write lock.
    pub sketch_symbols: Vec<DocumentSymbol>,
    /// The clangd backend once started.
    pub clangd: Option<Arc<ClangdServer>>,
    /// The selected board.
    pub board: BoardConfig,
}

impl Workbench {
    /// Fresh state for one server session.
    #[must_use]
    pub fn new(board: BoardConfig) -> Self {
        Self {
            board,
            ..Self::default()
        }
    }

    /// True if the path is the synthetic translation unit.
    #[must_use]
    pub fn is_sketch_cpp(&self, path: &Path) -> bool {
        !self.build_sketch_cpp.as_os_str().is_empty()
            && uri::normalize(path) == self.build_sketch_cpp
    }

    /// The tracked document for a URI, if any.
    #[must_use]
    pub fn doc(&self, target: &Uri) -> Option<&TrackedDoc> {
        self.docs.get(&uri::normalize(&uri::uri_to_path(target)))
    }

    /// Resolves a sketch file path (as spelled in a `#line` directive)
    /// back to the URI the IDE opened it under. Untracked paths fall back
    /// to a synthesised `file://` URI so diagnostics for files the user
    /// has not opened are still addressable.
    #[must_use]
    pub fn ino_uri_for_path(&self, path: &Path) -> Option<Uri> {
        let normalized = uri::normalize(path);
        if let Some(doc) = self.docs.get(&normalized) {
            return Some(doc.uri.clone());
        }
        uri::path_to_uri(&normalized).ok()
    }
}
