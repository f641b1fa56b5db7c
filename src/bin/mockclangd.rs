// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock clangd for integration testing.
//!
//! Speaks Content-Length framed JSON-RPC over stdin/stdout. Every
//! inbound message can be recorded to a file for assertions, and canned
//! diagnostics can be published in response to `didOpen`.
//!
//! The server under test spawns clangd with a fixed command line
//! (`-log=verbose`, `--compile-commands-dir=…`, `-query-driver=…`), so
//! this double ignores its argv and is configured through environment
//! variables instead, which the test harness sets on the server process
//! and the child inherits:
//!
//! - `MOCKCLANGD_RECORD`: append every inbound message as a JSON line.
//! - `MOCKCLANGD_DIAGNOSE_LINES`: comma-separated lines; publish one
//!   diagnostic per line on any opened document.
//! - `MOCKCLANGD_DIAGNOSE_LINES_ON_CHANGE`: same, but published on every
//!   `didChange` instead — a second, different diagnostics round for
//!   exercising stale-marker clearing.
//! - `MOCKCLANGD_DIAGNOSTIC_CODE`: code for canned diagnostics.
//! - `MOCKCLANGD_DELAY_MS` / `MOCKCLANGD_DELAY_ON`: sleep before
//!   responding, optionally limited to the named methods.
//! - `MOCKCLANGD_FAIL_ON` / `MOCKCLANGD_HANG_ON`: per-method failure
//!   and no-response lists.
//!
//! No tokio — a single reader thread is all a test double needs.

#![allow(clippy::print_stderr, reason = "Test binary reports its own errors")]

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};

#[derive(Debug, Default)]
struct MockConfig {
    record: Option<PathBuf>,
    diagnose_lines: Vec<u32>,
    diagnose_lines_on_change: Vec<u32>,
    diagnostic_code: String,
    delay_ms: u64,
    delay_on: Vec<String>,
    fail_on: Vec<String>,
    hang_on: Vec<String>,
}

impl MockConfig {
    fn from_env() -> Self {
        let list = |name: &str| -> Vec<String> {
            std::env::var(name)
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        Self {
            record: std::env::var("MOCKCLANGD_RECORD").ok().map(PathBuf::from),
            diagnose_lines: list("MOCKCLANGD_DIAGNOSE_LINES")
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            diagnose_lines_on_change: list("MOCKCLANGD_DIAGNOSE_LINES_ON_CHANGE")
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            diagnostic_code: std::env::var("MOCKCLANGD_DIAGNOSTIC_CODE")
                .unwrap_or_else(|_| "mock_diag".to_string()),
            delay_ms: std::env::var("MOCKCLANGD_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            delay_on: list("MOCKCLANGD_DELAY_ON"),
            fail_on: list("MOCKCLANGD_FAIL_ON"),
            hang_on: list("MOCKCLANGD_HANG_ON"),
        }
    }
}

struct MockClangd {
    config: MockConfig,
    documents: HashMap<String, i64>,
}

fn main() {
    let mut server = MockClangd {
        config: MockConfig::from_env(),
        documents: HashMap::new(),
    };
    server.run();
}

impl MockClangd {
    fn run(&mut self) {
        let mut stdin = std::io::stdin();
        let mut buffer: Vec<u8> = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            match stdin.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);
                let Ok(value) = serde_json::from_str::<Value>(&message) else {
                    continue;
                };
                self.record(&value);
                self.handle_message(&value);
            }
        }
    }

    fn record(&self, message: &Value) {
        let Some(path) = &self.config.record else {
            return;
        };
        let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
            eprintln!("mockclangd: cannot open record file {}", path.display());
            return;
        };
        let _ = writeln!(file, "{message}");
        let _ = file.flush();
    }

    fn handle_message(&mut self, message: &Value) {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return; // a response to one of our own requests; ignored
        };
        let method = method.to_string();

        match message.get("id") {
            Some(id) => self.handle_request(&method, id.clone()),
            None => self.handle_notification(&method, &message["params"]),
        }
    }

    fn handle_request(&mut self, method: &str, id: Value) {
        if self.config.hang_on.iter().any(|m| m == method) {
            return;
        }
        let delayed =
            self.config.delay_on.is_empty() || self.config.delay_on.iter().any(|m| m == method);
        if self.config.delay_ms > 0 && delayed {
            std::thread::sleep(Duration::from_millis(self.config.delay_ms));
        }
        if self.config.fail_on.iter().any(|m| m == method) {
            send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32603,
                    "message": format!("mockclangd: configured to fail on {method}")
                }
            }));
            return;
        }

        let result = match method {
            "initialize" => json!({
                "capabilities": {
                    "textDocumentSync": 2,
                    "hoverProvider": true,
                    "completionProvider": { "triggerCharacters": [".", ">", ":"] },
                    "definitionProvider": true,
                    "documentSymbolProvider": true,
                    "documentFormattingProvider": true,
                    "documentRangeFormattingProvider": true
                },
                "serverInfo": { "name": "mockclangd" }
            }),
            "textDocument/completion" => json!({ "isIncomplete": false, "items": [] }),
            "textDocument/documentSymbol" => json!([]),
            "textDocument/formatting" | "textDocument/rangeFormatting" => json!([]),
            _ => Value::Null,
        };

        send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "textDocument/didOpen" => {
                let uri = params["textDocument"]["uri"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let version = params["textDocument"]["version"].as_i64().unwrap_or(0);
                self.documents.insert(uri.clone(), version);
                self.publish_canned_diagnostics(&uri, &self.config.diagnose_lines);
            }
            "textDocument/didChange" => {
                let uri = params["textDocument"]["uri"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let version = params["textDocument"]["version"].as_i64().unwrap_or(0);
                self.documents.insert(uri.clone(), version);
                self.publish_canned_diagnostics(&uri, &self.config.diagnose_lines_on_change);
            }
            "textDocument/didClose" => {
                if let Some(uri) = params["textDocument"]["uri"].as_str() {
                    self.documents.remove(uri);
                }
            }
            "exit" => std::process::exit(0),
            _ => {}
        }
    }

    fn publish_canned_diagnostics(&self, uri: &str, lines: &[u32]) {
        if lines.is_empty() {
            return;
        }
        let diagnostics: Vec<Value> = lines
            .iter()
            .map(|line| {
                json!({
                    "range": {
                        "start": { "line": line, "character": 0 },
                        "end": { "line": line, "character": 5 }
                    },
                    "severity": 1,
                    "code": self.config.diagnostic_code,
                    "message": "canned diagnostic"
                })
            })
            .collect();

        send(&json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": uri, "diagnostics": diagnostics }
        }));
    }
}

fn send(message: &Value) {
    let body = message.to_string();
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "Content-Length: {}\r\n\r\n{}", body.len(), body);
    let _ = stdout.flush();
}

/// Returns the next complete framed message and the bytes it consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let headers_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let headers = std::str::from_utf8(&buffer[..headers_end]).ok()?;
    let content_length: usize = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())?
    })?;

    let total = headers_end + content_length;
    if buffer.len() < total {
        return None;
    }
    let body = String::from_utf8(buffer[headers_end..total].to_vec()).ok()?;
    Some((body, total))
}
