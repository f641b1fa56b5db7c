// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! inols entry point: a language server for Arduino sketches, bridging
//! the editor (on stdio) and a clangd child process over the synthetic
//! `.ino.cpp` translation unit.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inols::lsp::LspPeer;
use inols::{Config, SketchBridge};

/// Command-line arguments. Flags override the layered configuration.
#[derive(Parser, Debug)]
#[command(name = "inols", version = env!("INOLS_VERSION"))]
#[command(about = "Arduino language server: bridges an IDE and clangd")]
struct Args {
    /// Path to the arduino-cli executable.
    #[arg(long)]
    cli_path: Option<PathBuf>,

    /// Path to the clangd executable.
    #[arg(long)]
    clangd_path: Option<PathBuf>,

    /// Fully qualified board name, e.g. arduino:avr:uno.
    #[arg(long)]
    fqbn: Option<String>,

    /// Human-readable name of the selected board.
    #[arg(long)]
    board_name: Option<String>,

    /// Path to a configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the log to inols.log instead of stderr.
    #[arg(long)]
    log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config)?;
    if let Some(cli_path) = args.cli_path {
        config.cli_path = cli_path;
    }
    if let Some(clangd_path) = args.clangd_path {
        config.clangd_path = clangd_path;
    }
    if let Some(fqbn) = args.fqbn {
        config.fqbn = fqbn;
    }
    if let Some(board_name) = args.board_name {
        config.board_name = board_name;
    }
    if args.log {
        config.log = true;
    }

    init_logging(config.log)?;
    info!(
        "inols {} starting (board '{}', fqbn '{}')",
        env!("INOLS_VERSION"),
        config.board_name,
        config.fqbn
    );

    // stdout carries LSP frames; the IDE is on the other end.
    let (ide, ide_rx) = LspPeer::spawn(
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
        "ide",
    );

    let bridge = SketchBridge::new(ide, config);
    bridge.run(ide_rx).await;
    Ok(())
}

/// Logging goes to stderr (or a file with `--log`); stdout is reserved
/// for the protocol.
fn init_logging(to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if to_file {
        let file = std::fs::File::create("inols.log")?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    }
    Ok(())
}
