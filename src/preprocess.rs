// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The Arduino preprocessor boundary.
//!
//! The sketch-to-C++ transform itself is an opaque `arduino-cli`
//! invocation; this module owns the command line, the stable per-sketch
//! build directory, the classification of failures into user-facing
//! messages, and the `compile_commands.json` rewrite that clangd needs
//! (canonical compiler paths, `.exe` included on Windows).

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::workbench::BoardConfig;

/// Outcome of a failed preprocessor run.
#[derive(Debug)]
pub struct PreprocessFailure {
    /// Message to surface via `window/showMessage`, when one is warranted.
    /// Absent for the no-board-selected case, which is routine at first
    /// startup and should not bother the user.
    pub user_message: Option<String>,
    /// Raw detail for the log.
    pub detail: String,
}

impl std::fmt::Display for PreprocessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl std::error::Error for PreprocessFailure {}

/// Returns the stable build directory for a sketch: the same sketch maps
/// to the same directory across runs, distinct sketches never collide.
#[must_use]
pub fn build_dir_for(sketch_root: &Path) -> PathBuf {
    std::env::temp_dir().join(format!(
        "inols-{}",
        fnv1a_hash(&sketch_root.to_string_lossy())
    ))
}

/// Runs the preprocessor for the sketch and returns the build path
/// containing `sketch/<name>.ino.cpp` and `compile_commands.json`.
///
/// # Errors
///
/// Returns [`PreprocessFailure`] (downcastable from `anyhow`) when the
/// command exits non-zero, with its stderr classified into a user-facing
/// message; other errors cover spawn and filesystem problems.
pub async fn generate_build_environment(
    cli_path: &Path,
    board: &BoardConfig,
    sketch_root: &Path,
) -> Result<PathBuf> {
    let build_path = build_dir_for(sketch_root);
    std::fs::create_dir_all(&build_path)
        .with_context(|| format!("creating build dir {}", build_path.display()))?;

    info!(
        "preprocessing {} (fqbn '{}') into {}",
        sketch_root.display(),
        board.fqbn,
        build_path.display()
    );

    let output = Command::new(cli_path)
        .arg("compile")
        .arg("--fqbn")
        .arg(&board.fqbn)
        .arg("--only-compilation-database")
        .arg("--build-path")
        .arg(&build_path)
        .arg(sketch_root)
        .output()
        .await
        .with_context(|| format!("running preprocessor {}", cli_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        warn!("preprocessor failed: {stderr}");
        return Err(classify_failure(&stderr, board).into());
    }

    Ok(build_path)
}

/// Maps a preprocessor stderr dump to the message shown to the user.
#[must_use]
pub fn classify_failure(stderr: &str, board: &BoardConfig) -> PreprocessFailure {
    static ERROR_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used, reason = "Pattern is a compile-time constant")]
        let pattern = Regex::new(r#"#error "(.*)""#).unwrap();
        pattern
    });
    static MISSING_HEADER: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used, reason = "Pattern is a compile-time constant")]
        let pattern = Regex::new(r"([\w.\-]+): No such file or directory").unwrap();
        pattern
    });

    let user_message = if let Some(captures) = ERROR_DIRECTIVE.captures(stderr) {
        Some(captures[1].to_string())
    } else if stderr.contains("platform not installed") || stderr.contains("no FQBN provided") {
        if board.name.is_empty() {
            // Routine before the user picks a board; stay quiet.
            None
        } else {
            Some(format!(
                "Editor support may be inaccurate because the core for the board `{}` \
                 is not installed. Use the Boards Manager to install it.",
                board.name
            ))
        }
    } else if let Some(captures) = MISSING_HEADER.captures(stderr) {
        Some(format!(
            "Editor support may be inaccurate because the header `{}` was not found. \
             If it is part of a library, use the Library Manager to install it.",
            &captures[1]
        ))
    } else {
        Some(format!("Could not start editor support.\n{stderr}"))
    };

    PreprocessFailure {
        user_message,
        detail: stderr.to_string(),
    }
}

/// One entry of `compile_commands.json`. Unknown members are dropped on
/// rewrite; clangd only reads these.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompileCommand {
    /// Working directory of the compilation.
    pub directory: String,
    /// Argv form of the command, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    /// Shell form of the command, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// The translation unit.
    pub file: String,
}

/// Canonicalises the compiler of every entry in `compile_commands.json`,
/// writes the file back, and returns the distinct compiler paths for
/// clangd's `-query-driver` arguments.
///
/// clangd insists on full compiler paths, including the `.exe` suffix on
/// Windows.
///
/// # Errors
///
/// Returns an error if the database is missing, unparsable, or contains
/// an entry with an empty argument list.
pub fn rewrite_compile_commands(build_path: &Path) -> Result<Vec<String>> {
    let db_path = build_path.join("compile_commands.json");
    let raw = std::fs::read_to_string(&db_path)
        .with_context(|| format!("reading {}", db_path.display()))?;
    let mut entries: Vec<CompileCommand> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", db_path.display()))?;

    let mut compilers = Vec::new();
    for entry in &mut entries {
        let arguments = entry
            .arguments
            .as_mut()
            .filter(|args| !args.is_empty())
            .ok_or_else(|| anyhow!("empty argument list in {}", db_path.display()))?;

        let compiler = canonical_compiler_path(&arguments[0]);
        arguments[0].clone_from(&compiler);
        if !compilers.contains(&compiler) {
            compilers.push(compiler);
        }
    }

    if compilers.is_empty() {
        return Err(anyhow!("no compiler found in {}", db_path.display()));
    }

    let rewritten = serde_json::to_string_pretty(&entries)?;
    std::fs::write(&db_path, rewritten)
        .with_context(|| format!("rewriting {}", db_path.display()))?;
    debug!("query drivers: {}", compilers.join(", "));

    Ok(compilers)
}

/// Resolves a compiler path to its canonical form, keeping the original
/// spelling when the file cannot be resolved (the database may reference
/// toolchains that are not installed yet).
fn canonical_compiler_path(compiler: &str) -> String {
    let mut path = std::fs::canonicalize(compiler)
        .map_or_else(|_| compiler.to_string(), |p| p.to_string_lossy().into_owned());
    if cfg!(windows) && !path.to_ascii_lowercase().ends_with(".exe") {
        path.push_str(".exe");
    }
    path
}

/// Deterministic FNV-1a 64-bit hash, as 16 hex characters. Only
/// determinism and low collision probability matter here; this names the
/// per-sketch build directory.
fn fnv1a_hash(input: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let mut hash: u64 = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}
