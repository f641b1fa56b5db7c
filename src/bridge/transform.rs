// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Coordinate translation between the sketch and the synthetic unit.
//!
//! The forward direction (`ino2cpp_*`) rewrites request parameters on
//! their way to clangd; the inverse (`cpp2ino_*`) rewrites results,
//! diagnostics and edits on their way back. URI rules:
//!
//! - any `.ino` file maps to the synthetic `<sketch>.ino.cpp`;
//! - other files inside the sketch map 1:1 to their build-tree mirror;
//! - everything else passes through unchanged.

use anyhow::{Result, anyhow};
use lsp_types::{
    CodeAction, CodeActionOrCommand, Command, CompletionResponse, CompletionTextEdit,
    DocumentHighlight, DocumentSymbol, DocumentSymbolResponse, GotoDefinitionResponse, Hover,
    HoverContents, Location, MarkedString, Position, Range, TextEdit, Uri, WorkspaceEdit,
    WorkspaceSymbolResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::mapper::MapError;
use crate::uri;
use crate::workbench::Workbench;

/// Why a synthetic-side range could not be expressed in sketch terms.
#[derive(Debug)]
pub enum Cpp2InoError {
    /// The range sits on generated (prelude/prototype/directive) lines.
    Generated {
        /// The offending synthetic line.
        cpp_line: u32,
    },
    /// Any other translation failure.
    Failed(String),
}

impl std::fmt::Display for Cpp2InoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generated { cpp_line } => {
                write!(f, "synthetic line {cpp_line} has no sketch counterpart")
            }
            Self::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Cpp2InoError {}

fn unknown_uri(target: &Uri) -> anyhow::Error {
    anyhow!("Document is not available: {}", target.as_str())
}

fn sketch_file_key(path: &Path) -> String {
    uri::normalize(path).to_string_lossy().into_owned()
}

/// Rewrites a sketch-side URI to its synthetic-side counterpart.
///
/// # Errors
///
/// Returns an error when the build-tree mirror path cannot be expressed
/// as a URI.
pub fn ino2cpp_uri(wb: &Workbench, target: &Uri) -> Result<Uri> {
    let path = uri::normalize(&uri::uri_to_path(target));

    if path.extension().is_some_and(|e| e == "ino") {
        return uri::path_to_uri(&wb.build_sketch_cpp);
    }

    if !wb.sketch_root.as_os_str().is_empty() && path.starts_with(&wb.sketch_root) {
        let rel = path
            .strip_prefix(&wb.sketch_root)
            .map_err(|e| anyhow!("relativising {}: {e}", path.display()))?;
        return uri::path_to_uri(&wb.build_sketch_root.join(rel));
    }

    Ok(target.clone())
}

/// Rewrites a sketch-side position (URI + line) to synthetic coordinates.
///
/// # Errors
///
/// Fails when the line is not in the source map, which means the document
/// changed shape since the last preprocess.
pub fn ino2cpp_position(wb: &Workbench, target: &Uri, pos: Position) -> Result<(Uri, Position)> {
    let cpp_uri = ino2cpp_uri(wb, target)?;
    if !uri::is_ino(target) {
        return Ok((cpp_uri, pos));
    }

    let mapper = wb.mapper.as_ref().ok_or_else(|| unknown_uri(target))?;
    let file = sketch_file_key(&uri::uri_to_path(target));
    let line = mapper
        .ino_to_cpp_line(&file, pos.line)
        .ok_or_else(|| unknown_uri(target))?;
    Ok((
        cpp_uri,
        Position {
            line,
            character: pos.character,
        },
    ))
}

/// Rewrites a sketch-side range to synthetic coordinates.
///
/// # Errors
///
/// Fails when either endpoint has no mapping.
pub fn ino2cpp_range(wb: &Workbench, target: &Uri, range: Range) -> Result<(Uri, Range)> {
    let cpp_uri = ino2cpp_uri(wb, target)?;
    if !uri::is_ino(target) {
        return Ok((cpp_uri, range));
    }

    let mapper = wb.mapper.as_ref().ok_or_else(|| unknown_uri(target))?;
    let file = sketch_file_key(&uri::uri_to_path(target));
    let mapped = mapper
        .ino_to_cpp_range(&file, range)
        .map_err(|e| anyhow!("range {}:{}: {e}", target.as_str(), range.start.line))?;
    Ok((cpp_uri, mapped))
}

/// Maps a synthetic-side URI + range back into sketch terms. The
/// end-line adjustment of the mapper is treated as success.
///
/// # Errors
///
/// [`Cpp2InoError::Generated`] for results on generated lines;
/// [`Cpp2InoError::Failed`] for anything else.
pub fn cpp2ino_uri_range(
    wb: &Workbench,
    cpp_uri: &Uri,
    range: Range,
) -> Result<(Uri, Range), Cpp2InoError> {
    let path = uri::normalize(&uri::uri_to_path(cpp_uri));

    if wb.is_sketch_cpp(&path) {
        let mapper = wb
            .mapper
            .as_ref()
            .ok_or_else(|| Cpp2InoError::Failed("no source map yet".to_string()))?;
        let (file, ino_range) = match mapper.cpp_to_ino_range(range) {
            Ok(mapped) => mapped,
            Err(MapError::EndLineAdjusted { file, range }) => {
                debug!("range end adjusted while mapping back to {file}");
                (file, range)
            }
            Err(MapError::Preprocessed { cpp_line }) => {
                return Err(Cpp2InoError::Generated { cpp_line });
            }
            Err(e) => return Err(Cpp2InoError::Failed(e.to_string())),
        };
        let ino_uri = wb
            .ino_uri_for_path(Path::new(&file))
            .ok_or_else(|| Cpp2InoError::Failed(format!("no URI for {file}")))?;
        return Ok((ino_uri, ino_range));
    }

    if !wb.build_sketch_root.as_os_str().is_empty() && path.starts_with(&wb.build_sketch_root) {
        let rel = path
            .strip_prefix(&wb.build_sketch_root)
            .map_err(|e| Cpp2InoError::Failed(e.to_string()))?;
        let ino_uri = uri::path_to_uri(&wb.sketch_root.join(rel))
            .map_err(|e| Cpp2InoError::Failed(e.to_string()))?;
        return Ok((ino_uri, range));
    }

    Ok((cpp_uri.clone(), range))
}

/// Maps a clangd `Location` into sketch terms.
///
/// # Errors
///
/// Same failure modes as [`cpp2ino_uri_range`].
pub fn cpp2ino_location(wb: &Workbench, location: Location) -> Result<Location, Cpp2InoError> {
    let (uri, range) = cpp2ino_uri_range(wb, &location.uri, location.range)?;
    Ok(Location { uri, range })
}

/// Splits synthetic-unit text edits into per-sketch-file batches. Edits
/// that cannot be mapped (generated lines, cross-file spans) are dropped
/// with a log.
pub fn cpp2ino_text_edits(
    wb: &Workbench,
    cpp_uri: &Uri,
    edits: Vec<TextEdit>,
) -> Vec<(Uri, Vec<TextEdit>)> {
    let mut batches: Vec<(Uri, Vec<TextEdit>)> = Vec::new();
    for edit in edits {
        match cpp2ino_uri_range(wb, cpp_uri, edit.range) {
            Ok((target, range)) => {
                let index = match batches.iter().position(|(uri, _)| *uri == target) {
                    Some(index) => index,
                    None => {
                        batches.push((target, Vec::new()));
                        batches.len() - 1
                    }
                };
                batches[index].1.push(TextEdit {
                    range,
                    new_text: edit.new_text,
                });
            }
            Err(e) => warn!("dropping unmappable text edit: {e}"),
        }
    }
    batches
}

/// Translates a `WorkspaceEdit` coming from clangd. Entries for files
/// other than the synthetic unit pass through; synthetic-unit edits are
/// split per `.ino` file, dropping those that span multiple files.
pub fn cpp2ino_workspace_edit(wb: &Workbench, mut edit: WorkspaceEdit) -> WorkspaceEdit {
    if let Some(changes) = edit.changes.take() {
        let mut translated: HashMap<Uri, Vec<TextEdit>> = HashMap::new();
        for (edit_uri, edits) in changes {
            let path = uri::normalize(&uri::uri_to_path(&edit_uri));
            if !wb.is_sketch_cpp(&path) {
                translated.entry(edit_uri).or_default().extend(edits);
                continue;
            }
            for one in edits {
                match cpp2ino_uri_range(wb, &edit_uri, one.range) {
                    Ok((target, range)) => translated.entry(target).or_default().push(TextEdit {
                        range,
                        new_text: one.new_text,
                    }),
                    Err(e) => warn!("dropping workspace edit on synthetic unit: {e}"),
                }
            }
        }
        edit.changes = Some(translated);
    }
    edit
}

/// Arguments of clangd's `applyTweak` command.
#[derive(Debug, Serialize, Deserialize)]
struct TweakArgs {
    #[serde(rename = "tweakID")]
    tweak_id: String,
    file: Uri,
    selection: Range,
}

/// Rewrites a clangd `Command`. Only `clangd.applyTweak` carries
/// positions: its `ExtractVariable` argument names a file and selection
/// that must be pulled back into sketch coordinates when they point at
/// the synthetic unit.
pub fn cpp2ino_command(wb: &Workbench, mut command: Command) -> Command {
    if command.command != "clangd.applyTweak" {
        return command;
    }
    let Some(arguments) = command.arguments.as_mut() else {
        return command;
    };
    for argument in arguments.iter_mut() {
        let Ok(mut tweak) = serde_json::from_value::<TweakArgs>(argument.clone()) else {
            continue;
        };
        if tweak.tweak_id != "ExtractVariable" {
            continue;
        }
        match cpp2ino_uri_range(wb, &tweak.file, tweak.selection) {
            Ok((target, selection)) => {
                debug!("converted applyTweak ExtractVariable selection");
                tweak.file = target;
                tweak.selection = selection;
                if let Ok(rewritten) = serde_json::to_value(&tweak) {
                    *argument = rewritten;
                }
            }
            Err(e) => warn!("leaving applyTweak argument untranslated: {e}"),
        }
    }
    command
}

/// Rewrites a `CodeAction`: its workspace edit, its nested command, and
/// (for `.ino` requests) its diagnostic ranges.
pub fn cpp2ino_code_action(wb: &Workbench, mut action: CodeAction, ino_uri: &Uri) -> CodeAction {
    if let Some(edit) = action.edit.take() {
        action.edit = Some(cpp2ino_workspace_edit(wb, edit));
    }
    if let Some(command) = action.command.take() {
        action.command = Some(cpp2ino_command(wb, command));
    }
    if uri::is_ino(ino_uri)
        && let Some(diagnostics) = action.diagnostics.as_mut()
        && let Some(mapper) = wb.mapper.as_ref()
    {
        for diagnostic in diagnostics.iter_mut() {
            match mapper.cpp_to_ino_range(diagnostic.range) {
                Ok((_, range)) | Err(MapError::EndLineAdjusted { range, .. }) => {
                    diagnostic.range = range;
                }
                Err(e) => warn!("code action diagnostic range untranslated: {e}"),
            }
        }
    }
    action
}

/// Filters and translates symbols of the synthetic unit down to the
/// requested `.ino` file: generated symbols are dropped, symbols whose
/// range and selection range land in different files are dropped, and
/// symbols belonging to other tabs are dropped. Children recurse.
pub fn cpp2ino_document_symbols(
    wb: &Workbench,
    symbols: Vec<DocumentSymbol>,
    requested: &Uri,
) -> Vec<DocumentSymbol> {
    if !uri::is_ino(requested) || symbols.is_empty() {
        return symbols;
    }
    let Some(mapper) = wb.mapper.as_ref() else {
        return symbols;
    };
    let requested_file = sketch_file_key(&uri::uri_to_path(requested));

    symbols
        .into_iter()
        .filter_map(|mut symbol| {
            if mapper.is_preprocessed(symbol.range.start.line) {
                return None;
            }

            let (range_file, range) = ok_or_adjusted(mapper.cpp_to_ino_range(symbol.range))?;
            let (selection_file, selection_range) =
                ok_or_adjusted(mapper.cpp_to_ino_range(symbol.selection_range))?;

            if range_file != selection_file {
                warn!(
                    "symbol '{}' range and selection map to different files ({range_file} vs {selection_file})",
                    symbol.name
                );
                return None;
            }
            if sketch_file_key(Path::new(&range_file)) != requested_file {
                return None;
            }

            symbol.range = range;
            symbol.selection_range = selection_range;
            symbol.children = symbol
                .children
                .take()
                .map(|children| cpp2ino_document_symbols(wb, children, requested));
            Some(symbol)
        })
        .collect()
}

fn ok_or_adjusted(result: Result<(String, Range), MapError>) -> Option<(String, Range)> {
    match result {
        Ok(mapped) => Some(mapped),
        Err(MapError::EndLineAdjusted { file, range }) => Some((file, range)),
        Err(_) => None,
    }
}

/// Filters completion items (identifiers reserved for the preprocessor
/// machinery start with `_`) and maps text-edit ranges back when the
/// request originated from a `.ino` file.
pub fn cpp2ino_completions(
    wb: &Workbench,
    mut response: CompletionResponse,
    map_ranges: bool,
) -> CompletionResponse {
    let items = match &mut response {
        CompletionResponse::Array(items) => items,
        CompletionResponse::List(list) => &mut list.items,
    };

    items.retain(|item| {
        !item
            .insert_text
            .as_deref()
            .is_some_and(|text| text.starts_with('_'))
    });

    if map_ranges && let Some(mapper) = wb.mapper.as_ref() {
        for item in items.iter_mut() {
            if let Some(text_edit) = item.text_edit.as_mut() {
                match text_edit {
                    CompletionTextEdit::Edit(edit) => {
                        if let Some((_, range)) = ok_or_adjusted(mapper.cpp_to_ino_range(edit.range))
                        {
                            edit.range = range;
                        }
                    }
                    CompletionTextEdit::InsertAndReplace(edit) => {
                        if let Some((_, insert)) =
                            ok_or_adjusted(mapper.cpp_to_ino_range(edit.insert))
                        {
                            edit.insert = insert;
                        }
                        if let Some((_, replace)) =
                            ok_or_adjusted(mapper.cpp_to_ino_range(edit.replace))
                        {
                            edit.replace = replace;
                        }
                    }
                }
            }
        }
    }
    response
}

/// Transforms a clangd result back into IDE terms for the given method.
/// Results that cannot be decoded or mapped degrade to `null` with a log,
/// never to a malformed reply.
pub fn transform_clangd_result(
    wb: &Workbench,
    method: &str,
    ino_uri: Option<&Uri>,
    cpp_uri: Option<&Uri>,
    result: Value,
) -> Value {
    if result.is_null() {
        return result;
    }
    // True when the request was posed against an `.ino` file, i.e. the
    // result speaks synthetic-unit coordinates that must be pulled back.
    let from_sketch = ino_uri.is_some_and(uri::is_ino);

    match method {
        "textDocument/hover" => match serde_json::from_value::<Hover>(result.clone()) {
            Ok(mut hover) => {
                if hover_is_empty(&hover.contents) {
                    return Value::Null;
                }
                if from_sketch && let Some(range) = hover.range.take() {
                    if let Some(mapper) = wb.mapper.as_ref() {
                        hover.range = ok_or_adjusted(mapper.cpp_to_ino_range(range))
                            .map(|(_, mapped)| mapped);
                    }
                }
                to_value_or_null(&hover)
            }
            Err(e) => passthrough(method, &e, result),
        },

        "textDocument/completion" => {
            match serde_json::from_value::<CompletionResponse>(result.clone()) {
                Ok(response) => to_value_or_null(&cpp2ino_completions(wb, response, from_sketch)),
                Err(e) => passthrough(method, &e, result),
            }
        }

        "textDocument/documentSymbol" => {
            match serde_json::from_value::<DocumentSymbolResponse>(result.clone()) {
                Ok(DocumentSymbolResponse::Nested(symbols)) => {
                    let requested = ino_uri.or(cpp_uri);
                    match requested {
                        Some(target) => {
                            to_value_or_null(&cpp2ino_document_symbols(wb, symbols, target))
                        }
                        None => to_value_or_null(&symbols),
                    }
                }
                Ok(DocumentSymbolResponse::Flat(_)) => {
                    // Flat symbol lists are still delivered untranslated.
                    warn!("documentSymbol returned SymbolInformation; passing through");
                    result
                }
                Err(e) => passthrough(method, &e, result),
            }
        }

        "textDocument/codeAction" => {
            match serde_json::from_value::<Vec<CodeActionOrCommand>>(result.clone()) {
                Ok(actions) => {
                    let target = ino_uri.cloned().unwrap_or_else(placeholder_uri);
                    let translated: Vec<CodeActionOrCommand> = actions
                        .into_iter()
                        .map(|item| match item {
                            CodeActionOrCommand::Command(command) => {
                                CodeActionOrCommand::Command(cpp2ino_command(wb, command))
                            }
                            CodeActionOrCommand::CodeAction(action) => {
                                CodeActionOrCommand::CodeAction(cpp2ino_code_action(
                                    wb, action, &target,
                                ))
                            }
                        })
                        .collect();
                    to_value_or_null(&translated)
                }
                Err(e) => passthrough(method, &e, result),
            }
        }

        "textDocument/formatting" | "textDocument/rangeFormatting" => {
            match serde_json::from_value::<Vec<TextEdit>>(result.clone()) {
                Ok(edits) => {
                    let Some(cpp) = cpp_uri else {
                        return result;
                    };
                    let batches = cpp2ino_text_edits(wb, cpp, edits);
                    let own: Vec<TextEdit> = ino_uri
                        .and_then(|target| {
                            batches
                                .into_iter()
                                .find(|(uri, _)| uri == target)
                                .map(|(_, edits)| edits)
                        })
                        .unwrap_or_default();
                    to_value_or_null(&own)
                }
                Err(e) => passthrough(method, &e, result),
            }
        }

        "textDocument/definition"
        | "textDocument/typeDefinition"
        | "textDocument/implementation" => {
            match serde_json::from_value::<GotoDefinitionResponse>(result.clone()) {
                Ok(GotoDefinitionResponse::Scalar(location)) => {
                    match cpp2ino_location(wb, location) {
                        Ok(mapped) => to_value_or_null(&mapped),
                        Err(e) => {
                            warn!("{method}: dropping unmappable location: {e}");
                            Value::Null
                        }
                    }
                }
                Ok(GotoDefinitionResponse::Array(locations)) => {
                    match map_locations(wb, locations) {
                        Some(mapped) => to_value_or_null(&mapped),
                        None => Value::Null,
                    }
                }
                Ok(GotoDefinitionResponse::Link(_)) => {
                    warn!("{method}: location links pass through untranslated");
                    result
                }
                Err(e) => passthrough(method, &e, result),
            }
        }

        "textDocument/documentHighlight" => {
            match serde_json::from_value::<Vec<DocumentHighlight>>(result.clone()) {
                Ok(highlights) => {
                    let Some(cpp) = cpp_uri else {
                        return result;
                    };
                    let mut mapped = Vec::with_capacity(highlights.len());
                    for highlight in highlights {
                        match cpp2ino_uri_range(wb, cpp, highlight.range) {
                            Ok((_, range)) => mapped.push(DocumentHighlight {
                                range,
                                kind: highlight.kind,
                            }),
                            Err(e) => {
                                warn!("documentHighlight: dropping result: {e}");
                                return Value::Null;
                            }
                        }
                    }
                    to_value_or_null(&mapped)
                }
                Err(e) => passthrough(method, &e, result),
            }
        }

        "workspace/symbol" => {
            match serde_json::from_value::<WorkspaceSymbolResponse>(result.clone()) {
                Ok(WorkspaceSymbolResponse::Flat(symbols)) => {
                    let mut mapped = Vec::with_capacity(symbols.len());
                    for mut symbol in symbols {
                        match cpp2ino_location(wb, symbol.location.clone()) {
                            Ok(location) => {
                                symbol.location = location;
                                mapped.push(symbol);
                            }
                            Err(e) => {
                                warn!("workspace/symbol: dropping result: {e}");
                                return Value::Null;
                            }
                        }
                    }
                    to_value_or_null(&mapped)
                }
                Ok(WorkspaceSymbolResponse::Nested(_)) => {
                    warn!("workspace/symbol nested response passes through untranslated");
                    result
                }
                Err(e) => passthrough(method, &e, result),
            }
        }

        _ => result,
    }
}

fn map_locations(wb: &Workbench, locations: Vec<Location>) -> Option<Vec<Location>> {
    let mut mapped = Vec::with_capacity(locations.len());
    for location in locations {
        match cpp2ino_location(wb, location) {
            Ok(translated) => mapped.push(translated),
            Err(e) => {
                warn!("dropping unmappable location: {e}");
                return None;
            }
        }
    }
    Some(mapped)
}

fn hover_is_empty(contents: &HoverContents) -> bool {
    match contents {
        HoverContents::Markup(markup) => markup.value.is_empty(),
        HoverContents::Scalar(MarkedString::String(text)) => text.is_empty(),
        HoverContents::Scalar(MarkedString::LanguageString(ls)) => ls.value.is_empty(),
        HoverContents::Array(items) => items.is_empty(),
    }
}

fn to_value_or_null<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn passthrough(method: &str, error: &dyn std::fmt::Display, result: Value) -> Value {
    warn!("{method}: undecodable result passes through: {error}");
    result
}

fn placeholder_uri() -> Uri {
    #[allow(clippy::unwrap_used, reason = "Constant URI always parses")]
    let root = "file:///".parse().unwrap();
    root
}
