// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The clangd child process: spawning, the initialize handshake, and
//! resynchronisation of the synthetic translation unit.

use anyhow::{Context, Result};
use lsp_types::Uri;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::peer::{InboundMessage, LspPeer, PeerError};

/// Deadline for clangd's `initialize` reply. Exceeding it is treated as a
/// fatal loss of synchronisation by the lifecycle controller.
pub const CLANGD_INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// A running clangd instance wired up as an LSP peer.
pub struct ClangdServer {
    /// The JSON-RPC endpoint over the child's stdio.
    pub peer: Arc<LspPeer>,
    _child: Child,
}

impl ClangdServer {
    /// Spawns clangd against the given compilation database directory.
    /// One `-query-driver` argument is passed per distinct compiler so
    /// clangd trusts the cross-compilers named in `compile_commands.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started or its stdio
    /// pipes cannot be captured.
    pub fn spawn(
        clangd_path: &Path,
        compile_commands_dir: &Path,
        query_drivers: &[String],
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>)> {
        let mut command = Command::new(clangd_path);
        command
            .arg("-log=verbose")
            .arg(format!(
                "--compile-commands-dir={}",
                compile_commands_dir.display()
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for driver in query_drivers {
            command.arg(format!("-query-driver={driver}"));
        }

        info!(
            "spawning clangd: {} --compile-commands-dir={} ({} query drivers)",
            clangd_path.display(),
            compile_commands_dir.display(),
            query_drivers.len()
        );

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning clangd at {}", clangd_path.display()))?;

        let stdin = child.stdin.take().context("clangd stdin not captured")?;
        let stdout = child.stdout.take().context("clangd stdout not captured")?;
        let stderr = child.stderr.take().context("clangd stderr not captured")?;

        // clangd logs verbosely on stderr; keep it out of the LSP streams.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("clangd: {line}");
            }
        });

        let (peer, rx) = LspPeer::spawn(Box::new(stdout), Box::new(stdin), "clangd");

        Ok((Self { peer, _child: child }, rx))
    }

    /// Runs the `initialize`/`initialized` handshake with the short
    /// startup deadline.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Timeout`] if clangd does not answer within
    /// [`CLANGD_INIT_TIMEOUT`]; callers treat that as fatal.
    pub async fn initialize(
        &self,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, PeerError> {
        let result = self
            .peer
            .request("initialize", params, CLANGD_INIT_TIMEOUT)
            .await?;
        self.peer
            .notify("initialized", serde_json::json!({}))
            .await?;
        Ok(result)
    }

    /// Replaces clangd's view of the synthetic unit with a full-text
    /// `didChange` at the given version. Used after a rebuild, when the
    /// regenerated unit may differ arbitrarily from the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be sent.
    pub async fn full_sync(&self, uri: &Uri, version: i32, text: &str) -> Result<(), PeerError> {
        self.peer
            .notify(
                "textDocument/didChange",
                serde_json::json!({
                    "textDocument": { "uri": uri.as_str(), "version": version },
                    "contentChanges": [ { "text": text } ],
                }),
            )
            .await
    }

    /// True while the clangd connection is up.
    pub fn is_alive(&self) -> bool {
        self.peer.is_alive()
    }
}
