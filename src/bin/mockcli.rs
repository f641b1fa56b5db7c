// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A miniature Arduino sketch preprocessor for integration testing.
//!
//! Accepts the same `compile` invocation the server issues to
//! `arduino-cli` and produces a deterministic build tree: a
//! `sketch/<name>.ino.cpp` concatenating every `.ino` file behind
//! `#line` directives, preceded by a prototype prelude, plus a
//! `compile_commands.json`.

#![allow(clippy::print_stderr, reason = "Test binary reports its own errors")]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "mockcli")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preprocess a sketch into a build tree.
    Compile {
        /// Fully qualified board name.
        #[arg(long, default_value = "")]
        fqbn: String,

        /// Only generate the compilation database (accepted, implied).
        #[arg(long)]
        only_compilation_database: bool,

        /// Output directory.
        #[arg(long)]
        build_path: PathBuf,

        /// The sketch directory.
        sketch: PathBuf,
    },
}

fn main() {
    let args = Args::parse();
    let Command::Compile {
        fqbn,
        build_path,
        sketch,
        ..
    } = args.command;

    if let Err(e) = compile(&fqbn, &build_path, &sketch) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn compile(fqbn: &str, build_path: &Path, sketch: &Path) -> Result<()> {
    if fqbn.is_empty() {
        bail!("no FQBN provided");
    }

    let sketch_name = sketch
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("sketch path has no basename")?;

    let mut ino_files: Vec<PathBuf> = std::fs::read_dir(sketch)
        .with_context(|| format!("reading sketch dir {}", sketch.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|e| e == "ino"))
        .collect();
    ino_files.sort();
    // The primary sketch file leads, the other tabs follow in order.
    let primary = format!("{sketch_name}.ino");
    ino_files.sort_by_key(|path| {
        path.file_name()
            .is_none_or(|name| name.to_string_lossy() != primary)
    });
    if ino_files.is_empty() {
        bail!("{}: no sketch files found", sketch.display());
    }

    let mut unit = String::from("#include <Arduino.h>\n");
    for prototype in collect_prototypes(&ino_files)? {
        unit.push_str(&prototype);
        unit.push('\n');
    }
    for path in &ino_files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        unit.push_str(&format!("#line 1 \"{}\"\n", path.display()));
        unit.push_str(&text);
        if !text.ends_with('\n') {
            unit.push('\n');
        }
    }

    let sketch_out = build_path.join("sketch");
    std::fs::create_dir_all(&sketch_out)
        .with_context(|| format!("creating {}", sketch_out.display()))?;
    let unit_path = sketch_out.join(format!("{sketch_name}.ino.cpp"));
    std::fs::write(&unit_path, unit).with_context(|| format!("writing {}", unit_path.display()))?;

    let database = serde_json::json!([{
        "directory": build_path.display().to_string(),
        "arguments": ["/usr/bin/cc", "-c", unit_path.display().to_string()],
        "file": unit_path.display().to_string()
    }]);
    std::fs::write(
        build_path.join("compile_commands.json"),
        serde_json::to_vec_pretty(&database)?,
    )?;

    Ok(())
}

/// One prototype per function definition found in the sketch files.
fn collect_prototypes(ino_files: &[PathBuf]) -> Result<Vec<String>> {
    let definition = Regex::new(r"^\s*([A-Za-z_][\w]*[\w\s\*&]*\([^;{}]*\))\s*\{")
        .context("prototype pattern")?;

    let mut prototypes = Vec::new();
    for path in ino_files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        for line in text.lines() {
            if let Some(captures) = definition.captures(line) {
                prototypes.push(format!("{};", captures[1].trim()));
            }
        }
    }
    Ok(prototypes)
}
