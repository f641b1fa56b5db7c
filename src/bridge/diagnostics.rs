// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Splits clangd diagnostics on the synthetic unit into per-`.ino`
//! batches.
//!
//! Diagnostics arrive keyed by the synthetic `.ino.cpp` and may span
//! several sketch tabs; each one is re-bucketed under the sketch file its
//! range maps to. Diagnostics on generated lines have no home in the
//! sketch and are dropped. The caller publishes the batches and then
//! clears stale markers from files that had diagnostics last round but
//! not this one.

use lsp_types::{NumberOrString, PublishDiagnosticsParams, Range};
use tracing::{debug, warn};

use super::transform::{self, Cpp2InoError};
use crate::uri;
use crate::workbench::Workbench;

/// Diagnostic codes that hint at a missing generated prototype: the user
/// likely introduced a new function, so the cached symbol table should be
/// re-checked against clangd.
const SYMBOL_CHECK_CODES: [&str; 2] = ["undeclared_var_use", "undeclared_var_use_suggest"];

/// The translated form of one clangd `publishDiagnostics` notification.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Per-sketch-file batches, in first-appearance order.
    pub batches: Vec<PublishDiagnosticsParams>,
    /// True when a diagnostic suggests the symbol table may be stale.
    pub check_symbols: bool,
}

/// Buckets a clangd diagnostics notification by sketch file.
pub fn fan_out(wb: &Workbench, params: PublishDiagnosticsParams) -> FanOut {
    let mut out = FanOut::default();
    let source_path = uri::normalize(&uri::uri_to_path(&params.uri));

    if params.diagnostics.is_empty() {
        // An empty set on the synthetic unit clears nothing directly; the
        // stale-diagnostics tail handles every previously-marked file.
        if wb.is_sketch_cpp(&source_path) {
            return out;
        }
        // For any other file, forward one empty batch so the IDE drops
        // its markers.
        match transform::cpp2ino_uri_range(wb, &params.uri, Range::default()) {
            Ok((target, _)) => out.batches.push(PublishDiagnosticsParams {
                uri: target,
                diagnostics: Vec::new(),
                version: None,
            }),
            Err(e) => warn!("cannot clear diagnostics for {}: {e}", params.uri.as_str()),
        }
        return out;
    }

    for diagnostic in params.diagnostics {
        let (target, range) =
            match transform::cpp2ino_uri_range(wb, &params.uri, diagnostic.range) {
                Ok(mapped) => mapped,
                Err(Cpp2InoError::Generated { cpp_line }) => {
                    debug!("dropping diagnostic on generated line {cpp_line}");
                    continue;
                }
                Err(e) => {
                    warn!("dropping untranslatable diagnostic: {e}");
                    continue;
                }
            };

        if uri::is_ino(&target) && code_requests_symbol_check(diagnostic.code.as_ref()) {
            out.check_symbols = true;
        }

        let mut translated = diagnostic;
        translated.range = range;

        let index = match out.batches.iter().position(|batch| batch.uri == target) {
            Some(index) => index,
            None => {
                out.batches.push(PublishDiagnosticsParams {
                    uri: target,
                    diagnostics: Vec::new(),
                    version: None,
                });
                out.batches.len() - 1
            }
        };
        out.batches[index].diagnostics.push(translated);
    }

    out
}

fn code_requests_symbol_check(code: Option<&NumberOrString>) -> bool {
    match code {
        Some(NumberOrString::String(code)) => SYMBOL_CHECK_CODES.contains(&code.as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::SketchMapper;
    use crate::workbench::{BoardConfig, TrackedDoc};
    use lsp_types::{Diagnostic, DiagnosticSeverity, Position, Uri};
    use std::path::PathBuf;

    const UNIT: &str = "void setup();\n\
                        void loop();\n\
                        #line 1 \"/sketch/Blink.ino\"\n\
                        void setup() {\n\
                        }\n\
                        #line 1 \"/sketch/Tab2.ino\"\n\
                        int helper() {\n\
                        }\n";

    fn test_workbench() -> Workbench {
        let mut wb = Workbench::new(BoardConfig::default());
        wb.sketch_root = PathBuf::from("/sketch");
        wb.build_sketch_root = PathBuf::from("/build/sketch");
        wb.build_sketch_cpp = PathBuf::from("/build/sketch/Blink.ino.cpp");
        wb.mapper = Some(SketchMapper::parse(UNIT, 1));
        for name in ["Blink.ino", "Tab2.ino"] {
            let path = PathBuf::from("/sketch").join(name);
            wb.docs.insert(
                path.clone(),
                TrackedDoc {
                    uri: crate::uri::path_to_uri(&path).expect("uri"),
                    language_id: "ino".to_string(),
                    version: 1,
                    text: String::new(),
                },
            );
        }
        wb
    }

    fn cpp_uri() -> Uri {
        "file:///build/sketch/Blink.ino.cpp".parse().expect("uri")
    }

    fn diag(line: u32, code: Option<&str>) -> Diagnostic {
        Diagnostic {
            range: lsp_types::Range {
                start: Position { line, character: 0 },
                end: Position { line, character: 4 },
            },
            severity: Some(DiagnosticSeverity::ERROR),
            code: code.map(|c| NumberOrString::String(c.to_string())),
            message: "problem".to_string(),
            ..Default::default()
        }
    }

    fn params(uri: Uri, diagnostics: Vec<Diagnostic>) -> PublishDiagnosticsParams {
        PublishDiagnosticsParams {
            uri,
            diagnostics,
            version: None,
        }
    }

    #[test]
    fn buckets_by_sketch_file() {
        let wb = test_workbench();
        // Line 3 belongs to Blink, line 6 to Tab2.
        let out = fan_out(&wb, params(cpp_uri(), vec![diag(3, None), diag(6, None)]));

        assert_eq!(out.batches.len(), 2);
        assert_eq!(out.batches[0].uri.as_str(), "file:///sketch/Blink.ino");
        assert_eq!(out.batches[0].diagnostics.len(), 1);
        assert_eq!(out.batches[0].diagnostics[0].range.start.line, 0);
        assert_eq!(out.batches[1].uri.as_str(), "file:///sketch/Tab2.ino");
        assert_eq!(out.batches[1].diagnostics[0].range.start.line, 0);
        assert!(!out.check_symbols);
    }

    #[test]
    fn same_file_diagnostics_share_a_batch() {
        let wb = test_workbench();
        let out = fan_out(&wb, params(cpp_uri(), vec![diag(3, None), diag(4, None)]));

        assert_eq!(out.batches.len(), 1);
        assert_eq!(out.batches[0].diagnostics.len(), 2);
    }

    #[test]
    fn generated_line_diagnostics_are_dropped() {
        let wb = test_workbench();
        let out = fan_out(&wb, params(cpp_uri(), vec![diag(0, None), diag(3, None)]));

        assert_eq!(out.batches.len(), 1);
        assert_eq!(out.batches[0].uri.as_str(), "file:///sketch/Blink.ino");
    }

    #[test]
    fn undeclared_var_use_raises_symbol_check() {
        let wb = test_workbench();
        let out = fan_out(
            &wb,
            params(cpp_uri(), vec![diag(3, Some("undeclared_var_use"))]),
        );
        assert!(out.check_symbols);

        let out = fan_out(
            &wb,
            params(cpp_uri(), vec![diag(3, Some("undeclared_var_use_suggest"))]),
        );
        assert!(out.check_symbols);

        let out = fan_out(&wb, params(cpp_uri(), vec![diag(3, Some("other_code"))]));
        assert!(!out.check_symbols);
    }

    #[test]
    fn empty_on_synthetic_unit_yields_no_batches() {
        let wb = test_workbench();
        let out = fan_out(&wb, params(cpp_uri(), Vec::new()));
        assert!(out.batches.is_empty());
    }

    #[test]
    fn empty_on_mirror_file_clears_that_file() {
        let wb = test_workbench();
        let mirror: Uri = "file:///build/sketch/util.cpp".parse().expect("uri");
        let out = fan_out(&wb, params(mirror, Vec::new()));

        assert_eq!(out.batches.len(), 1);
        assert_eq!(out.batches[0].uri.as_str(), "file:///sketch/util.cpp");
        assert!(out.batches[0].diagnostics.is_empty());
    }
}
