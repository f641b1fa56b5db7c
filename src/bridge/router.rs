// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The IDE-side method table: lock classification, parameter translation,
//! forwarding, and response transformation.
//!
//! Write-locked methods: `initialize`, `textDocument/didOpen`,
//! `textDocument/didChange`, `textDocument/didClose`. Everything else
//! runs under the read lock. Every method except `initialize` and
//! `initialized` first waits for the clangd backend to settle.

use lsp_types::{
    CodeActionParams, CodeActionProviderCapability, CompletionOptions,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, DocumentOnTypeFormattingOptions, ExecuteCommandOptions,
    HoverProviderCapability, InitializeResult, OneOf, Position, Range, ServerCapabilities,
    ServerInfo, SignatureHelpOptions, TextDocumentContentChangeEvent, TextDocumentItem,
    TextDocumentSyncCapability, TextDocumentSyncKind, Uri, VersionedTextDocumentIdentifier,
    WorkDoneProgressOptions,
};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{RouteError, SketchBridge, lifecycle, transform};
use crate::formatter;
use crate::lsp::peer::REQUEST_TIMEOUT;
use crate::text;
use crate::uri;
use crate::workbench::Workbench;

/// Methods answered locally with a no-op instead of being forwarded.
/// The translation skeletons exist (URI rewriting, workspace-edit
/// conversion); enabling one of these means wiring them up here.
const SUPPRESSED_REQUESTS: [&str; 4] = [
    "textDocument/references",
    "textDocument/rename",
    "textDocument/onTypeFormatting",
    "workspace/executeCommand",
];

/// A request translated and ready for clangd.
struct Prepared {
    params: Value,
    /// Original IDE-side URI, when the method addresses a document.
    ino_uri: Option<Uri>,
    /// Rewritten clangd-side URI.
    cpp_uri: Option<Uri>,
    /// Keeps the scoped `.clang-format` alive until the response is out.
    _style: Option<formatter::StyleGuard>,
}

impl Prepared {
    fn passthrough(params: Value) -> Self {
        Self {
            params,
            ino_uri: None,
            cpp_uri: None,
            _style: None,
        }
    }
}

impl SketchBridge {
    pub(crate) async fn route_ide_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, RouteError> {
        if SUPPRESSED_REQUESTS.contains(&method) {
            debug!("{method} is not supported; answering null");
            return Ok(Value::Null);
        }

        match method {
            "initialize" => self.initialize_request(params).await,
            _ => self.forward_request(method, params).await,
        }
    }

    /// `initialize`: capture the params, answer the capability set
    /// immediately, and start the preprocess + clangd bring-up in the
    /// background. The ready broadcast unblocks every queued method.
    async fn initialize_request(&self, params: Value) -> Result<Value, RouteError> {
        {
            let mut wb = self.workbench.write().await;
            capture_initialize_params(&mut wb, params);
            info!(
                "initialize({}) — starting workbench for sketch '{}'",
                wb.sketch_root.display(),
                wb.sketch_name
            );
        }

        if let Some(bridge) = self.shared() {
            tokio::spawn(async move { lifecycle::initialize(bridge).await });
        }

        let result = InitializeResult {
            capabilities: server_capabilities(),
            server_info: Some(ServerInfo {
                name: "inols".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        };
        serde_json::to_value(result).map_err(|e| RouteError::Internal(e.to_string()))
    }

    /// Everything that needs clangd: wait for startup, translate under
    /// the read lock, forward, translate the response back.
    async fn forward_request(&self, method: &str, params: Value) -> Result<Value, RouteError> {
        self.wait_for_clangd().await?;

        let wb = self.workbench.read().await;
        let clangd = wb
            .clangd
            .clone()
            .ok_or_else(|| RouteError::Internal("could not start clangd, aborted".to_string()))?;

        let prepared = prepare_request(&wb, &self.config, method, params)?;
        debug!("IDE --> clangd: {method}");

        match clangd
            .peer
            .request(method, &prepared.params, REQUEST_TIMEOUT)
            .await
        {
            Ok(result) => {
                self.after_clangd_roundtrip();
                Ok(transform::transform_clangd_result(
                    &wb,
                    method,
                    prepared.ino_uri.as_ref(),
                    prepared.cpp_uri.as_ref(),
                    result,
                ))
            }
            Err(e) => {
                self.check_fatal(&e);
                Err(e.into())
            }
        }
    }

    pub(crate) async fn handle_ide_notification(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), RouteError> {
        match method {
            // Consumed: clangd gets its own `initialized` during startup.
            "initialized" => {
                debug!("initialized received; not propagated to clangd");
                Ok(())
            }
            "textDocument/didOpen" => self.did_open(params).await,
            "textDocument/didChange" => self.did_change(params).await,
            "textDocument/didClose" => self.did_close(params).await,
            "textDocument/didSave" => self.did_save(params).await,
            "workspace/didChangeWatchedFiles" => {
                debug!("{method} is not supported; dropped");
                Ok(())
            }
            _ => {
                self.wait_for_clangd().await?;
                let wb = self.workbench.read().await;
                let clangd = wb.clangd.clone().ok_or_else(|| {
                    RouteError::Internal("could not start clangd, aborted".to_string())
                })?;
                clangd.peer.notify(method, params).await?;
                self.after_clangd_roundtrip();
                Ok(())
            }
        }
    }

    /// Tracks the document. The first `.ino` to open surfaces the whole
    /// synthetic unit to clangd; later tabs open silently. Non-`.ino`
    /// files forward 1:1 with their URI rewritten into the build tree.
    async fn did_open(&self, params: Value) -> Result<(), RouteError> {
        let p: DidOpenTextDocumentParams = decode("textDocument/didOpen", params)?;
        self.wait_for_clangd().await?;

        let mut wb = self.workbench.write().await;
        let doc = p.text_document;
        let target = doc.uri.clone();
        let path = uri::normalize(&uri::uri_to_path(&target));
        debug!(
            "didOpen({}@{} as '{}')",
            target.as_str(),
            doc.version,
            doc.language_id
        );

        wb.docs.insert(
            path,
            crate::workbench::TrackedDoc {
                uri: target.clone(),
                language_id: doc.language_id.clone(),
                version: doc.version,
                text: doc.text.clone(),
            },
        );

        if uri::is_ino(&target) {
            wb.sketch_tracked_files_count += 1;
            debug!(
                "tracked .ino files: {}",
                wb.sketch_tracked_files_count
            );
            // clangd is told about the synthetic unit exactly once.
            if wb.sketch_tracked_files_count != 1 {
                debug!("didOpen not propagated to clangd");
                return Ok(());
            }
            self.raise_symbols_load();
        }

        let cpp_uri = transform::ino2cpp_uri(&wb, &target)?;
        let cpp_path = uri::normalize(&uri::uri_to_path(&cpp_uri));
        let item = if wb.is_sketch_cpp(&cpp_path) {
            let mapper = wb
                .mapper
                .as_ref()
                .ok_or_else(|| RouteError::Internal("no source map yet".to_string()))?;
            TextDocumentItem {
                uri: cpp_uri,
                language_id: "cpp".to_string(),
                version: mapper.version(),
                text: mapper.cpp_text().to_string(),
            }
        } else {
            TextDocumentItem {
                uri: cpp_uri,
                language_id: doc.language_id,
                version: doc.version,
                text: doc.text,
            }
        };

        let clangd = wb
            .clangd
            .clone()
            .ok_or_else(|| RouteError::Internal("could not start clangd, aborted".to_string()))?;
        debug!(
            "didOpen({}@{} as '{}') --> clangd",
            item.uri.as_str(),
            item.version,
            item.language_id
        );
        clangd
            .peer
            .notify(
                "textDocument/didOpen",
                DidOpenTextDocumentParams {
                    text_document: item,
                },
            )
            .await?;
        self.after_clangd_roundtrip();
        Ok(())
    }

    /// Applies the IDE edit to the tracked text; for `.ino` files every
    /// content change is re-expressed against the synthetic unit and the
    /// synthetic version is bumped exactly once. Edits that touch a
    /// known top-level function (or that the mapper flags as structural)
    /// schedule a rebuild.
    async fn did_change(&self, params: Value) -> Result<(), RouteError> {
        let p: DidChangeTextDocumentParams = decode("textDocument/didChange", params)?;
        self.wait_for_clangd().await?;

        let mut wb = self.workbench.write().await;
        let target = p.text_document.uri.clone();
        let path = uri::normalize(&uri::uri_to_path(&target));
        debug!("didChange({}@{})", target.as_str(), p.text_document.version);

        {
            let doc = wb
                .docs
                .get_mut(&path)
                .ok_or_else(|| untracked(&target))?;
            for change in &p.content_changes {
                text::apply_content_change(&mut doc.text, change);
            }
            doc.version = p.text_document.version;
        }

        if !uri::is_ino(&target) {
            let cpp_uri = transform::ino2cpp_uri(&wb, &target)?;
            let clangd = wb.clangd.clone().ok_or_else(|| untracked(&target))?;
            clangd
                .peer
                .notify(
                    "textDocument/didChange",
                    DidChangeTextDocumentParams {
                        text_document: VersionedTextDocumentIdentifier {
                            uri: cpp_uri,
                            version: p.text_document.version,
                        },
                        content_changes: p.content_changes,
                    },
                )
                .await?;
            self.after_clangd_roundtrip();
            return Ok(());
        }

        let symbol_ranges: Vec<Range> = wb.sketch_symbols.iter().map(|s| s.range).collect();
        let file_key = path.to_string_lossy().into_owned();
        let mut dirty = false;
        let mut cpp_changes: Vec<TextDocumentContentChangeEvent> =
            Vec::with_capacity(p.content_changes.len());

        {
            let mapper = wb
                .mapper
                .as_mut()
                .ok_or_else(|| untracked(&target))?;
            for change in &p.content_changes {
                let Some(ino_range) = change.range else {
                    return Err(RouteError::Internal(format!(
                        "full-text change on sketch file {} is not supported",
                        target.as_str()
                    )));
                };
                let cpp_range = mapper.ino_to_cpp_range(&file_key, ino_range).map_err(|e| {
                    RouteError::Internal(format!(
                        "invalid change range {}:{}: {e}",
                        target.as_str(),
                        ino_range.start.line
                    ))
                })?;

                // Edits crossing a known top-level function invalidate the
                // generated prototypes.
                if symbol_ranges
                    .iter()
                    .any(|symbol| ranges_overlap(*symbol, cpp_range))
                {
                    info!("dirty change: edit overlaps a top-level symbol");
                    dirty = true;
                }
                if mapper.apply_change(&file_key, cpp_range, &change.text) {
                    info!("dirty change: structural change detected by the mapper");
                    dirty = true;
                }

                cpp_changes.push(TextDocumentContentChangeEvent {
                    range: Some(cpp_range),
                    range_length: change.range_length,
                    text: change.text.clone(),
                });
            }
            mapper.bump_version();
        }

        if dirty {
            self.schedule_rebuild();
        }

        let version = wb.mapper.as_ref().map_or(0, |mapper| mapper.version());
        let cpp_uri = uri::path_to_uri(&wb.build_sketch_cpp)?;
        debug!(
            "didChange({}@{}) --> clangd ({} changes)",
            cpp_uri.as_str(),
            version,
            cpp_changes.len()
        );
        let clangd = wb.clangd.clone().ok_or_else(|| untracked(&target))?;
        clangd
            .peer
            .notify(
                "textDocument/didChange",
                DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri: cpp_uri,
                        version,
                    },
                    content_changes: cpp_changes,
                },
            )
            .await?;
        self.after_clangd_roundtrip();
        Ok(())
    }

    /// Untracks the document; the synthetic unit closes only when the
    /// last `.ino` tab goes away.
    async fn did_close(&self, params: Value) -> Result<(), RouteError> {
        let p: DidCloseTextDocumentParams = decode("textDocument/didClose", params)?;
        self.wait_for_clangd().await?;

        let mut wb = self.workbench.write().await;
        let target = p.text_document.uri;
        let path = uri::normalize(&uri::uri_to_path(&target));
        debug!("didClose({})", target.as_str());

        if wb.docs.remove(&path).is_none() {
            return Err(untracked(&target));
        }

        if uri::is_ino(&target) {
            wb.sketch_tracked_files_count -= 1;
            debug!("tracked .ino files: {}", wb.sketch_tracked_files_count);
            if wb.sketch_tracked_files_count != 0 {
                debug!("didClose not propagated to clangd");
                return Ok(());
            }
        }

        let cpp_uri = transform::ino2cpp_uri(&wb, &target)?;
        let clangd = wb.clangd.clone().ok_or_else(|| untracked(&target))?;
        debug!("didClose({}) --> clangd", cpp_uri.as_str());
        clangd
            .peer
            .notify(
                "textDocument/didClose",
                DidCloseTextDocumentParams {
                    text_document: lsp_types::TextDocumentIdentifier { uri: cpp_uri },
                },
            )
            .await?;
        self.after_clangd_roundtrip();
        Ok(())
    }

    /// Saves of the synthetic unit are suppressed (clangd never sees a
    /// file that exists only in the build tree change on disk); other
    /// files forward with their URI rewritten.
    async fn did_save(&self, params: Value) -> Result<(), RouteError> {
        let mut p: DidSaveTextDocumentParams = decode("textDocument/didSave", params)?;
        self.wait_for_clangd().await?;

        let wb = self.workbench.read().await;
        let cpp_uri = transform::ino2cpp_uri(&wb, &p.text_document.uri)?;
        let cpp_path = uri::normalize(&uri::uri_to_path(&cpp_uri));
        if wb.is_sketch_cpp(&cpp_path) {
            debug!("didSave of the synthetic unit suppressed");
            return Ok(());
        }

        p.text_document.uri = cpp_uri;
        let clangd = wb
            .clangd
            .clone()
            .ok_or_else(|| RouteError::Internal("could not start clangd, aborted".to_string()))?;
        clangd.peer.notify("textDocument/didSave", p).await?;
        self.after_clangd_roundtrip();
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, RouteError> {
    serde_json::from_value(params)
        .map_err(|e| RouteError::Internal(format!("invalid {method} params: {e}")))
}

fn untracked(target: &Uri) -> RouteError {
    RouteError::Internal(format!("Document is not available: {}", target.as_str()))
}

fn position_le(a: Position, b: Position) -> bool {
    a.line < b.line || (a.line == b.line && a.character <= b.character)
}

fn ranges_overlap(a: Range, b: Range) -> bool {
    position_le(a.start, b.end) && position_le(b.start, a.end)
}

/// Reads the sketch root out of the raw `initialize` params.
fn capture_initialize_params(wb: &mut Workbench, params: Value) {
    if let Some(root) = params
        .get("rootUri")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<Uri>().ok())
    {
        wb.sketch_root = uri::normalize(&uri::uri_to_path(&root));
    } else if let Some(root) = params.get("rootPath").and_then(Value::as_str) {
        wb.sketch_root = uri::normalize(&PathBuf::from(root));
    }
    wb.sketch_name = wb
        .sketch_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    wb.initialize_params = params;
}

/// Translates request params per method and returns the forwarding plan.
fn prepare_request(
    wb: &Workbench,
    config: &crate::config::Config,
    method: &str,
    params: Value,
) -> Result<Prepared, RouteError> {
    match method {
        "textDocument/completion"
        | "textDocument/hover"
        | "textDocument/signatureHelp"
        | "textDocument/definition"
        | "textDocument/typeDefinition"
        | "textDocument/implementation"
        | "textDocument/documentHighlight" => prepare_position_request(wb, method, params),

        "textDocument/documentSymbol" => prepare_document_request(wb, method, params),

        "textDocument/formatting" => {
            let mut prepared = prepare_document_request(wb, method, params)?;
            prepared._style = Some(install_style(wb, config, prepared.cpp_uri.as_ref())?);
            Ok(prepared)
        }

        "textDocument/rangeFormatting" => {
            let mut p = params;
            let target = param_uri(&p, method)?;
            let ino_range: Range = serde_json::from_value(p["range"].clone())
                .map_err(|e| RouteError::Internal(format!("invalid {method} range: {e}")))?;
            let (cpp_uri, cpp_range) = transform::ino2cpp_range(wb, &target, ino_range)?;
            p["textDocument"]["uri"] = Value::String(cpp_uri.as_str().to_string());
            p["range"] = serde_json::to_value(cpp_range)
                .map_err(|e| RouteError::Internal(e.to_string()))?;
            let style = install_style(wb, config, Some(&cpp_uri))?;
            Ok(Prepared {
                params: p,
                ino_uri: Some(target),
                cpp_uri: Some(cpp_uri),
                _style: Some(style),
            })
        }

        "textDocument/codeAction" => {
            let mut p: CodeActionParams = decode(method, params)?;
            let target = p.text_document.uri.clone();
            let cpp_uri = transform::ino2cpp_uri(wb, &target)?;
            let cpp_path = uri::normalize(&uri::uri_to_path(&cpp_uri));
            if wb.is_sketch_cpp(&cpp_path) {
                let (_, range) = transform::ino2cpp_range(wb, &target, p.range)?;
                p.range = range;
                for diagnostic in &mut p.context.diagnostics {
                    let (_, range) = transform::ino2cpp_range(wb, &target, diagnostic.range)?;
                    diagnostic.range = range;
                }
            }
            p.text_document.uri = cpp_uri.clone();
            Ok(Prepared {
                params: serde_json::to_value(p)
                    .map_err(|e| RouteError::Internal(e.to_string()))?,
                ino_uri: Some(target),
                cpp_uri: Some(cpp_uri),
                _style: None,
            })
        }

        // workspace/symbol and anything unrecognised forward untouched;
        // their results are still translated on the way back.
        _ => Ok(Prepared::passthrough(params)),
    }
}

/// Rewrites `textDocument.uri` and `position` for the position-addressed
/// methods, leaving every other parameter (contexts, options) untouched.
fn prepare_position_request(
    wb: &Workbench,
    method: &str,
    params: Value,
) -> Result<Prepared, RouteError> {
    let mut p = params;
    let target = param_uri(&p, method)?;
    let position: Position = serde_json::from_value(p["position"].clone())
        .map_err(|e| RouteError::Internal(format!("invalid {method} position: {e}")))?;

    let (cpp_uri, cpp_position) = transform::ino2cpp_position(wb, &target, position)?;
    debug!(
        "{method}({}:{}:{}) --> {}:{}:{}",
        target.as_str(),
        position.line,
        position.character,
        cpp_uri.as_str(),
        cpp_position.line,
        cpp_position.character
    );

    p["textDocument"]["uri"] = Value::String(cpp_uri.as_str().to_string());
    p["position"] =
        serde_json::to_value(cpp_position).map_err(|e| RouteError::Internal(e.to_string()))?;
    Ok(Prepared {
        params: p,
        ino_uri: Some(target),
        cpp_uri: Some(cpp_uri),
        _style: None,
    })
}

/// Rewrites only `textDocument.uri`.
fn prepare_document_request(
    wb: &Workbench,
    method: &str,
    params: Value,
) -> Result<Prepared, RouteError> {
    let mut p = params;
    let target = param_uri(&p, method)?;
    let cpp_uri = transform::ino2cpp_uri(wb, &target)?;
    p["textDocument"]["uri"] = Value::String(cpp_uri.as_str().to_string());
    Ok(Prepared {
        params: p,
        ino_uri: Some(target),
        cpp_uri: Some(cpp_uri),
        _style: None,
    })
}

fn param_uri(params: &Value, method: &str) -> Result<Uri, RouteError> {
    params["textDocument"]["uri"]
        .as_str()
        .and_then(|raw| raw.parse::<Uri>().ok())
        .ok_or_else(|| RouteError::Internal(format!("missing document URI in {method}")))
}

fn install_style(
    wb: &Workbench,
    config: &crate::config::Config,
    cpp_uri: Option<&Uri>,
) -> Result<formatter::StyleGuard, RouteError> {
    let cpp_uri =
        cpp_uri.ok_or_else(|| RouteError::Internal("formatting without a target".to_string()))?;
    let target = uri::uri_to_path(cpp_uri);
    formatter::install(&target, &wb.sketch_root, config.formatter_conf.as_deref())
        .map_err(|e| RouteError::Internal(e.to_string()))
}

/// The capability set announced to the IDE. This is synthesized — it is
/// returned before clangd even exists — and deliberately narrower than
/// clangd's own: rename and references stay off until their translations
/// are enabled.
#[must_use]
pub fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Kind(
            TextDocumentSyncKind::INCREMENTAL,
        )),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        completion_provider: Some(CompletionOptions {
            trigger_characters: Some(vec![".".to_string(), ">".to_string(), ":".to_string()]),
            ..Default::default()
        }),
        signature_help_provider: Some(SignatureHelpOptions {
            trigger_characters: Some(vec!["(".to_string(), ",".to_string()]),
            retrigger_characters: None,
            work_done_progress_options: WorkDoneProgressOptions::default(),
        }),
        definition_provider: Some(OneOf::Left(true)),
        references_provider: Some(OneOf::Left(false)),
        document_highlight_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        workspace_symbol_provider: Some(OneOf::Left(true)),
        code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
        document_formatting_provider: Some(OneOf::Left(true)),
        document_range_formatting_provider: Some(OneOf::Left(true)),
        document_on_type_formatting_provider: Some(DocumentOnTypeFormattingOptions {
            first_trigger_character: "\n".to_string(),
            more_trigger_character: None,
        }),
        rename_provider: Some(OneOf::Left(false)),
        execute_command_provider: Some(ExecuteCommandOptions {
            commands: vec!["clangd.applyFix".to_string(), "clangd.applyTweak".to_string()],
            work_done_progress_options: WorkDoneProgressOptions::default(),
        }),
        ..Default::default()
    }
}
