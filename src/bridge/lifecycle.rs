// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Workbench lifecycle: the initial preprocess + clangd bring-up, and
//! the debounced rebuild loop that re-runs the preprocessor after dirty
//! edits and resynchronises clangd with the regenerated unit.

use anyhow::{Context, Result, anyhow};
use lsp_types::MessageType;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::SketchBridge;
use crate::lsp::ClangdServer;
use crate::mapper::SketchMapper;
use crate::preprocess::{self, PreprocessFailure};
use crate::uri;
use crate::workbench::Readiness;

/// Debounce between a dirty edit and the rebuild it triggers; bursts of
/// edits collapse into one preprocessor run.
pub const REBUILD_DELAY: Duration = Duration::from_secs(1);

/// How often the rebuild loop checks the deadline.
const REBUILD_POLL: Duration = Duration::from_millis(100);

/// Permanent background task watching the rebuild deadline.
pub(crate) fn spawn_rebuild_loop(bridge: &Arc<SketchBridge>) {
    let bridge = bridge.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REBUILD_POLL).await;
            if bridge.take_due_rebuild() {
                if let Err(e) = rebuild(&bridge).await {
                    warn!("sketch rebuild failed: {e:#}");
                }
            }
        }
    });
}

/// The background half of `initialize`: preprocess the sketch, spawn
/// clangd, run its handshake, then broadcast readiness. Requests queued
/// behind the readiness gate start flowing on success and are refused on
/// failure.
pub(crate) async fn initialize(bridge: Arc<SketchBridge>) {
    info!("initialising workbench");
    match initialize_inner(&bridge).await {
        Ok(()) => {
            bridge.set_readiness(Readiness::Ready);
            info!("workbench initialised");
        }
        Err(e) => {
            error!("workbench initialisation failed: {e:#}");
            surface_preprocess_failure(&bridge, &e).await;
            bridge.set_readiness(Readiness::Failed);
        }
    }
}

async fn initialize_inner(bridge: &Arc<SketchBridge>) -> Result<()> {
    let mut wb = bridge.workbench.write().await;

    let build_path = preprocess::generate_build_environment(
        &bridge.config.cli_path,
        &wb.board,
        &wb.sketch_root,
    )
    .await?;
    wb.build_path.clone_from(&build_path);
    wb.build_sketch_root = build_path.join("sketch");
    wb.build_sketch_cpp = wb
        .build_sketch_root
        .join(format!("{}.ino.cpp", wb.sketch_name));

    let cpp_text = std::fs::read_to_string(&wb.build_sketch_cpp)
        .with_context(|| format!("reading generated unit {}", wb.build_sketch_cpp.display()))?;
    wb.mapper = Some(SketchMapper::parse(cpp_text, 1));

    // clangd must see the build tree as its workspace.
    let build_root_uri = uri::path_to_uri(&wb.build_sketch_root)?;
    wb.initialize_params["rootUri"] = Value::String(build_root_uri.as_str().to_string());
    wb.initialize_params["rootPath"] = Value::String(wb.build_sketch_root.display().to_string());

    let query_drivers = preprocess::rewrite_compile_commands(&wb.build_path)?;
    let (clangd, clangd_rx) =
        ClangdServer::spawn(&bridge.config.clangd_path, &wb.build_path, &query_drivers)?;
    let clangd = Arc::new(clangd);
    bridge.spawn_clangd_dispatch(clangd_rx);

    match clangd.initialize(&wb.initialize_params).await {
        Ok(_) => {}
        Err(e) => {
            // A blown startup deadline is the same fatal sync loss as one
            // at steady state.
            bridge.check_fatal(&e);
            return Err(anyhow!("initialising clangd: {e}"));
        }
    }

    wb.clangd = Some(clangd);
    Ok(())
}

/// Re-runs the preprocessor and swaps the source map while keeping the
/// clangd process alive: a single full-text `didChange` at the bumped
/// version brings it up to date.
pub(crate) async fn rebuild(bridge: &Arc<SketchBridge>) -> Result<()> {
    info!("rebuilding sketch environment");
    let mut wb = bridge.workbench.write().await;

    let result = preprocess::generate_build_environment(
        &bridge.config.cli_path,
        &wb.board,
        &wb.sketch_root,
    )
    .await;
    let build_path = match result {
        Ok(path) => path,
        Err(e) => {
            drop(wb);
            surface_preprocess_failure(bridge, &e).await;
            return Err(e);
        }
    };

    wb.build_path.clone_from(&build_path);
    wb.build_sketch_root = build_path.join("sketch");
    wb.build_sketch_cpp = wb
        .build_sketch_root
        .join(format!("{}.ino.cpp", wb.sketch_name));

    let cpp_text = std::fs::read_to_string(&wb.build_sketch_cpp)
        .with_context(|| format!("reading generated unit {}", wb.build_sketch_cpp.display()))?;
    let previous_version = wb.mapper.as_ref().map_or(0, |m| m.version());
    let mapper = SketchMapper::parse(cpp_text, previous_version + 1);

    let clangd = wb
        .clangd
        .clone()
        .ok_or_else(|| anyhow!("rebuild requested before clangd started"))?;
    let cpp_uri = uri::path_to_uri(&wb.build_sketch_cpp)?;
    if let Err(e) = clangd
        .full_sync(&cpp_uri, mapper.version(), mapper.cpp_text())
        .await
    {
        bridge.check_fatal(&e);
        return Err(anyhow!("resynchronising clangd: {e}"));
    }

    info!(
        "sketch environment rebuilt (synthetic unit at version {})",
        mapper.version()
    );
    wb.mapper = Some(mapper);
    Ok(())
}

/// Shows the classified preprocessor message in the editor, when the
/// failure warrants one.
async fn surface_preprocess_failure(bridge: &Arc<SketchBridge>, error: &anyhow::Error) {
    if let Some(failure) = error.downcast_ref::<PreprocessFailure>() {
        if let Some(message) = &failure.user_message {
            bridge
                .show_message(MessageType::ERROR, message.clone())
                .await;
        }
    }
}
