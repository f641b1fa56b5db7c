// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The translating bridge between the IDE and clangd.
//!
//! One [`SketchBridge`] mediates both peers. Inbound IDE notifications
//! are handled inline on the dispatch task, which keeps `didChange`
//! application strictly FIFO; inbound requests each run on their own
//! task. The clangd side mirrors that: diagnostics and progress are
//! handled inline, server-to-client requests are spawned.

/// Per-`.ino` diagnostics fan-out.
pub mod diagnostics;
/// Startup, rebuild scheduling, and fatal-exit policy.
pub mod lifecycle;
/// Token-keyed progress mirroring.
pub mod progress;
/// The IDE-side method table.
pub mod router;
/// Coordinate translation between sketch and synthetic unit.
pub mod transform;

use lsp_types::{MessageType, ProgressParams, PublishDiagnosticsParams, Uri};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::lsp::peer::REQUEST_TIMEOUT;
use crate::lsp::protocol::{INTERNAL_ERROR, RequestId, ResponseError};
use crate::lsp::{InboundMessage, LspPeer, PeerError};
use crate::uri;
use crate::workbench::{Readiness, Workbench};
use progress::ProgressProxy;

/// Failure of one routed IDE request.
#[derive(Debug)]
pub enum RouteError {
    /// A JSON-RPC error relayed verbatim (usually from clangd).
    Rpc(ResponseError),
    /// A bridge-side failure, reported as an internal error.
    Internal(String),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{} (code {})", e.message, e.code),
            Self::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for RouteError {}

impl From<PeerError> for RouteError {
    fn from(error: PeerError) -> Self {
        match error {
            PeerError::Rpc(e) => Self::Rpc(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for RouteError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

/// The language server: two peers, one workbench.
pub struct SketchBridge {
    /// The editor endpoint on the process stdio.
    pub(crate) ide: Arc<LspPeer>,
    pub(crate) workbench: Arc<RwLock<Workbench>>,
    pub(crate) config: Config,
    readiness_tx: watch::Sender<Readiness>,
    readiness_rx: watch::Receiver<Readiness>,
    /// Raised when the first `.ino` opens; the symbol table needs loading.
    symbols_load: AtomicBool,
    /// Raised by the diagnostics fan-out on undeclared-identifier codes.
    symbols_check: AtomicBool,
    rebuild_deadline: StdMutex<Option<Instant>>,
    /// `.ino` files that had diagnostics in the previous round.
    ino_docs_with_diagnostics: Mutex<HashSet<Uri>>,
    progress: Mutex<ProgressProxy>,
    /// Back-reference for handing clones of the bridge to spawned tasks.
    self_ref: Weak<SketchBridge>,
}

impl SketchBridge {
    /// Builds the bridge around the IDE peer.
    #[must_use]
    pub fn new(ide: Arc<LspPeer>, config: Config) -> Arc<Self> {
        let (readiness_tx, readiness_rx) = watch::channel(Readiness::Starting);
        let workbench = Workbench::new(config.board());
        Arc::new_cyclic(|self_ref| Self {
            ide,
            workbench: Arc::new(RwLock::new(workbench)),
            config,
            readiness_tx,
            readiness_rx,
            symbols_load: AtomicBool::new(false),
            symbols_check: AtomicBool::new(false),
            rebuild_deadline: StdMutex::new(None),
            ino_docs_with_diagnostics: Mutex::new(HashSet::new()),
            progress: Mutex::new(ProgressProxy::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// An owning handle to this bridge, for spawned tasks. `None` only
    /// during teardown.
    pub(crate) fn shared(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    /// Drives the IDE side until the editor closes its stream.
    pub async fn run(&self, mut ide_rx: mpsc::UnboundedReceiver<InboundMessage>) {
        if let Some(bridge) = self.shared() {
            lifecycle::spawn_rebuild_loop(&bridge);
        }

        while let Some(message) = ide_rx.recv().await {
            match message.id {
                Some(id) => {
                    let Some(bridge) = self.shared() else { break };
                    tokio::spawn(async move {
                        bridge
                            .handle_ide_request(id, message.method, message.params)
                            .await;
                    });
                }
                None => {
                    if let Err(e) = self
                        .handle_ide_notification(&message.method, message.params)
                        .await
                    {
                        // Notifications have no reply channel; failures are
                        // logged and the notification is dropped.
                        warn!("{}: notification dropped: {e}", message.method);
                    }
                }
            }
        }

        info!("IDE stream closed, shutting down");
    }

    async fn handle_ide_request(&self, id: RequestId, method: String, params: Value) {
        debug!("IDE --> {method} ({id})");
        let outcome = self.route_ide_request(&method, params).await;
        let write = match outcome {
            Ok(result) => self.ide.respond(id, result).await,
            Err(RouteError::Rpc(e)) => self.ide.respond_error(id, e.code, e.message).await,
            Err(RouteError::Internal(message)) => {
                self.ide.respond_error(id, INTERNAL_ERROR, message).await
            }
        };
        if let Err(e) = write {
            error!("{method}: failed to answer IDE: {e}");
        }
    }

    /// Blocks until the background initialisation settles.
    ///
    /// Unlike a condition variable this waits *before* the workbench lock
    /// is taken; callers re-check the clangd handle under the lock.
    pub(crate) async fn wait_for_clangd(&self) -> Result<(), RouteError> {
        let mut rx = self.readiness_rx.clone();
        let status = *rx
            .wait_for(|status| *status != Readiness::Starting)
            .await
            .map_err(|_| RouteError::Internal("server shutting down".to_string()))?;
        if status == Readiness::Failed {
            return Err(RouteError::Internal(
                "could not start clangd, aborted".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn set_readiness(&self, readiness: Readiness) {
        let _ = self.readiness_tx.send(readiness);
    }

    /// Debounces a rebuild: (re)arms the deadline.
    pub(crate) fn schedule_rebuild(&self) {
        let mut deadline = self
            .rebuild_deadline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *deadline = Some(Instant::now() + lifecycle::REBUILD_DELAY);
        debug!("rebuild scheduled");
    }

    /// Clears and reports an expired rebuild deadline.
    pub(crate) fn take_due_rebuild(&self) -> bool {
        let mut deadline = self
            .rebuild_deadline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if deadline.is_some_and(|at| at <= Instant::now()) {
            *deadline = None;
            return true;
        }
        false
    }

    pub(crate) async fn show_message(&self, typ: MessageType, message: impl Into<String>) {
        let params = lsp_types::ShowMessageParams {
            typ,
            message: message.into(),
        };
        if let Err(e) = self.ide.notify("window/showMessage", params).await {
            warn!("showMessage failed: {e}");
        }
    }

    /// Terminates the process on unrecoverable clangd errors: a blown
    /// deadline or clangd reporting a non-added document, both meaning
    /// clangd's view of the synthetic unit has come apart from ours. The
    /// editor is expected to restart the session.
    pub(crate) fn check_fatal(&self, error: &PeerError) {
        let fatal = match error {
            PeerError::Timeout { .. } => true,
            PeerError::Rpc(e) => {
                e.message.contains("non-added document") || e.message.contains("non-added file")
            }
            _ => false,
        };
        if fatal {
            error!("lost synchronisation with clangd: {error}");
            error!("please restart the language server");
            std::process::exit(1);
        }
    }

    /// Consumes the deferred symbol-table flags after a successful clangd
    /// round-trip.
    pub(crate) fn after_clangd_roundtrip(&self) {
        if self.symbols_load.swap(false, Ordering::SeqCst)
            && let Some(bridge) = self.shared()
        {
            debug!("queued document symbol refresh");
            tokio::spawn(async move { bridge.refresh_symbols(false).await });
        }
        if self.symbols_check.swap(false, Ordering::SeqCst)
            && let Some(bridge) = self.shared()
        {
            debug!("queued document symbol check");
            tokio::spawn(async move { bridge.refresh_symbols(true).await });
        }
    }

    pub(crate) fn raise_symbols_load(&self) {
        self.symbols_load.store(true, Ordering::SeqCst);
    }

    /// Re-queries the synthetic unit's symbols and stores the
    /// function-kind ones in synthetic coordinates, where the didChange
    /// dirty check needs them. With `check`, the new list is compared to
    /// the old by length and same-index name; a mismatch means the
    /// prototype set changed and the sketch must be rebuilt.
    async fn refresh_symbols(&self, check: bool) {
        let mut wb = self.workbench.write().await;
        let Some(clangd) = wb.clangd.clone() else {
            return;
        };
        let Ok(cpp_uri) = uri::path_to_uri(&wb.build_sketch_cpp) else {
            return;
        };

        let result = clangd
            .peer
            .request(
                "textDocument/documentSymbol",
                serde_json::json!({ "textDocument": { "uri": cpp_uri.as_str() } }),
                REQUEST_TIMEOUT,
            )
            .await;
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.check_fatal(&e);
                warn!("document symbol query failed: {e}");
                return;
            }
        };

        let symbols = match serde_json::from_value::<lsp_types::DocumentSymbolResponse>(value) {
            Ok(lsp_types::DocumentSymbolResponse::Nested(symbols)) => symbols,
            Ok(lsp_types::DocumentSymbolResponse::Flat(_)) => {
                warn!("document symbol query returned flat symbols; keeping previous table");
                return;
            }
            Err(e) => {
                warn!("invalid document symbol response: {e}");
                return;
            }
        };

        let old_names: Vec<String> = wb.sketch_symbols.iter().map(|s| s.name.clone()).collect();
        wb.sketch_symbols = symbols
            .into_iter()
            .filter(|s| s.kind == lsp_types::SymbolKind::FUNCTION)
            .collect();
        for symbol in &wb.sketch_symbols {
            debug!("  symbol: {}", symbol.name);
        }

        if check {
            let changed = old_names.len() != wb.sketch_symbols.len()
                || old_names
                    .iter()
                    .zip(wb.sketch_symbols.iter())
                    .any(|(old, new)| *old != new.name);
            if changed {
                info!("top-level functions changed, scheduling sketch rebuild");
                self.schedule_rebuild();
            }
        }
    }

    /// Starts the dispatch task for a freshly spawned clangd connection.
    pub(crate) fn spawn_clangd_dispatch(&self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        let Some(bridge) = self.shared() else { return };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message.id {
                    Some(id) => {
                        let bridge = bridge.clone();
                        tokio::spawn(async move {
                            bridge
                                .handle_clangd_request(id, message.method, message.params)
                                .await;
                        });
                    }
                    None => {
                        bridge
                            .handle_clangd_notification(&message.method, message.params)
                            .await;
                    }
                }
            }
            warn!("clangd stream closed");
        });
    }

    async fn handle_clangd_request(&self, id: RequestId, method: String, params: Value) {
        debug!("clangd --> {method} ({id})");
        let Some(clangd) = self.workbench.read().await.clangd.clone() else {
            return;
        };

        match method.as_str() {
            "window/workDoneProgress/create" => {
                let token = match serde_json::from_value::<lsp_types::WorkDoneProgressCreateParams>(
                    params.clone(),
                ) {
                    Ok(p) => p.token,
                    Err(e) => {
                        let _ = clangd
                            .peer
                            .respond_error(id, INTERNAL_ERROR, format!("bad progress create: {e}"))
                            .await;
                        return;
                    }
                };
                self.progress.lock().await.create(token);
                let _ = clangd.peer.respond(id, Value::Null).await;

                // Mirror the token registration so the IDE can render the
                // progress that follows.
                if let Some(bridge) = self.shared() {
                    tokio::spawn(async move {
                        if let Err(e) = bridge
                            .ide
                            .request("window/workDoneProgress/create", params, REQUEST_TIMEOUT)
                            .await
                        {
                            debug!("IDE declined progress create: {e}");
                        }
                    });
                }
            }

            "workspace/applyEdit" => {
                let translated = {
                    let wb = self.workbench.read().await;
                    match serde_json::from_value::<lsp_types::ApplyWorkspaceEditParams>(params) {
                        Ok(mut p) => {
                            p.edit = transform::cpp2ino_workspace_edit(&wb, p.edit);
                            p
                        }
                        Err(e) => {
                            let _ = clangd
                                .peer
                                .respond_error(id, INTERNAL_ERROR, format!("bad applyEdit: {e}"))
                                .await;
                            return;
                        }
                    }
                };
                let relayed = self
                    .ide
                    .request("workspace/applyEdit", translated, REQUEST_TIMEOUT)
                    .await;
                self.relay_response(&clangd.peer, id, relayed).await;
            }

            // Anything else (workspace/configuration and friends) passes
            // through to the IDE untouched.
            _ => {
                let relayed = self.ide.request(&method, params, REQUEST_TIMEOUT).await;
                self.relay_response(&clangd.peer, id, relayed).await;
            }
        }
    }

    async fn relay_response(
        &self,
        peer: &LspPeer,
        id: RequestId,
        relayed: Result<Value, PeerError>,
    ) {
        let write = match relayed {
            Ok(value) => peer.respond(id, value).await,
            Err(PeerError::Rpc(e)) => peer.respond_error(id, e.code, e.message).await,
            Err(other) => {
                peer.respond_error(id, INTERNAL_ERROR, other.to_string())
                    .await
            }
        };
        if let Err(e) = write {
            warn!("failed to relay response: {e}");
        }
    }

    async fn handle_clangd_notification(&self, method: &str, params: Value) {
        match method {
            "$/progress" => {
                let progress = match serde_json::from_value::<ProgressParams>(params) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("unsupported $/progress payload: {e}");
                        return;
                    }
                };
                self.progress.lock().await.update(&progress);
                if let Err(e) = self.ide.notify("$/progress", progress).await {
                    warn!("progress forward failed: {e}");
                }
            }

            "textDocument/publishDiagnostics" => {
                let diagnostics = match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("bad publishDiagnostics payload: {e}");
                        return;
                    }
                };
                self.publish_diagnostics(diagnostics).await;
            }

            _ => {
                debug!("clangd --> {method} (passthrough)");
                if let Err(e) = self.ide.notify(method, params).await {
                    warn!("{method}: forward to IDE failed: {e}");
                }
            }
        }
    }

    /// Fans diagnostics out per sketch file, then clears markers from
    /// every `.ino` that had diagnostics last round and not this one.
    /// Fresh batches always precede the stale-clear batches.
    async fn publish_diagnostics(&self, params: PublishDiagnosticsParams) {
        let out = {
            let wb = self.workbench.read().await;
            diagnostics::fan_out(&wb, params)
        };
        if out.check_symbols {
            self.symbols_check.store(true, Ordering::SeqCst);
        }

        let mut tracked = self.ino_docs_with_diagnostics.lock().await;
        let mut fresh: HashSet<Uri> = HashSet::new();

        for batch in &out.batches {
            if uri::is_ino(&batch.uri) && !batch.diagnostics.is_empty() {
                fresh.insert(batch.uri.clone());
            }
            debug!(
                "publishing {} diagnostics for {}",
                batch.diagnostics.len(),
                batch.uri.as_str()
            );
            if let Err(e) = self
                .ide
                .notify("textDocument/publishDiagnostics", batch)
                .await
            {
                warn!("publishDiagnostics forward failed: {e}");
            }
        }

        for stale in tracked.iter().filter(|uri| !fresh.contains(uri)) {
            debug!("clearing stale diagnostics for {}", stale.as_str());
            let clear = PublishDiagnosticsParams {
                uri: stale.clone(),
                diagnostics: Vec::new(),
                version: None,
            };
            if let Err(e) = self
                .ide
                .notify("textDocument/publishDiagnostics", clear)
                .await
            {
                warn!("stale diagnostics clear failed: {e}");
            }
        }

        *tracked = fresh;
    }
}
