// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! inols is a language server for Arduino sketches.
//!
//! Sketches are a dialect of C++: the Arduino preprocessor concatenates
//! a sketch's `.ino` files into one synthetic `.ino.cpp` with generated
//! prototypes and `#line` directives. inols presents a single virtual
//! language server to the editor by translating LSP traffic spoken in
//! `.ino` terms into traffic clangd understands over the synthetic unit,
//! and translating clangd's answers, diagnostics and edits back.

/// The translating bridge: router, lifecycle, diagnostics, progress.
pub mod bridge;
/// Configuration loading for the CLI and config files.
pub mod config;
/// Scoped `.clang-format` handling for formatting requests.
pub mod formatter;
/// LSP plumbing: frame codec, peers, the clangd child process.
pub mod lsp;
/// The `.ino` ↔ `.ino.cpp` source map.
pub mod mapper;
/// The Arduino preprocessor boundary.
pub mod preprocess;
/// Line-indexed text edits.
pub mod text;
/// `file://` URI ↔ path conversions.
pub mod uri;
/// Shared session state.
pub mod workbench;

pub use bridge::SketchBridge;
pub use config::Config;
pub use mapper::SketchMapper;
