// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::workbench::BoardConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Path to the `arduino-cli` executable used as the sketch
    /// preprocessor (default: resolved from `PATH`).
    #[serde(default = "default_cli_path")]
    pub cli_path: PathBuf,

    /// Path to the clangd executable (default: resolved from `PATH`).
    #[serde(default = "default_clangd_path")]
    pub clangd_path: PathBuf,

    /// Fully qualified board name of the selected board.
    #[serde(default)]
    pub fqbn: String,

    /// Human-readable name of the selected board.
    #[serde(default)]
    pub board_name: String,

    /// A user-wide `.clang-format` to apply when the sketch has none.
    #[serde(default)]
    pub formatter_conf: Option<PathBuf>,

    /// Write the log to `inols.log` instead of stderr.
    #[serde(default)]
    pub log: bool,
}

fn default_cli_path() -> PathBuf {
    PathBuf::from("arduino-cli")
}

fn default_clangd_path() -> PathBuf {
    PathBuf::from("clangd")
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// Layering, weakest first: built-in defaults, the user config
    /// directory (`~/.config/inols/config.toml`), an explicit file, and
    /// `INOLS_*` environment variables. CLI flags override on top in
    /// `main`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source cannot be read or parsed.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("cli_path", "arduino-cli")?
            .set_default("clangd_path", "clangd")?;

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("inols").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("INOLS"));

        let config = builder.build().context("Failed to build configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// The board selection this server was started with.
    #[must_use]
    pub fn board(&self) -> BoardConfig {
        BoardConfig {
            name: self.board_name.clone(),
            fqbn: self.fqbn.clone(),
        }
    }
}
