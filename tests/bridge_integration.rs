#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests for the sketch bridge.
//!
//! Each test spawns the real `inols` binary and speaks framed LSP on its
//! stdio. The preprocessor is `mockcli` (a miniature sketch
//! preprocessor) and clangd is `mockclangd`, which records every message
//! it receives to a file so the tests can assert on what crossed the
//! clangd boundary.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to a running `inols` process.
struct Server {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buffer: Vec<u8>,
    next_id: i64,
}

impl Server {
    /// Spawns `inols` against the mock preprocessor and mock clangd.
    /// `env` is forwarded so `mockclangd` (a grandchild) sees it.
    fn spawn(record: &Path, env: &[(&str, &str)]) -> Result<Self> {
        let mut command = Command::new(env!("CARGO_BIN_EXE_inols"));
        command
            .arg("--cli-path")
            .arg(env!("CARGO_BIN_EXE_mockcli"))
            .arg("--clangd-path")
            .arg(env!("CARGO_BIN_EXE_mockclangd"))
            .arg("--fqbn")
            .arg("arduino:avr:uno")
            .arg("--board-name")
            .arg("Arduino Uno")
            .env("MOCKCLANGD_RECORD", record)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (name, value) in env {
            command.env(name, value);
        }

        let mut child = command.spawn().context("spawning inols")?;
        let stdin = child.stdin.take().context("inols stdin")?;
        let stdout = child.stdout.take().context("inols stdout")?;
        Ok(Self {
            _child: child,
            stdin,
            stdout,
            buffer: Vec::new(),
            next_id: 1,
        })
    }

    async fn send(&mut self, message: &Value) -> Result<()> {
        let body = message.to_string();
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        self.stdin.write_all(frame.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        self.send(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    /// Sends a request and waits for its response, buffering any
    /// unrelated traffic that arrives first.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))
        .await?;
        // Responses carry our id and no method; a server-originated
        // request could reuse the same number.
        self.recv_until(|message| {
            message.get("method").is_none() && message.get("id").and_then(Value::as_i64) == Some(id)
        })
        .await
    }

    /// Reads the next framed message within the receive timeout.
    async fn recv(&mut self) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if let Some((body, consumed)) = parse_frame(&self.buffer) {
                self.buffer.drain(..consumed);
                return serde_json::from_str(&body).context("parsing frame body");
            }

            let mut temp = [0u8; 4096];
            let read = tokio::time::timeout_at(deadline, self.stdout.read(&mut temp))
                .await
                .context("timed out waiting for a message")??;
            if read == 0 {
                bail!("inols closed its stdout");
            }
            self.buffer.extend_from_slice(&temp[..read]);
        }
    }

    /// Reads messages until one matches, discarding the rest.
    async fn recv_until<F: Fn(&Value) -> bool>(&mut self, matches: F) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                bail!("no matching message before timeout");
            }
            let message = self.recv().await?;
            if matches(&message) {
                return Ok(message);
            }
        }
    }

    /// Runs the `initialize`/`initialized` handshake and returns the
    /// announced capabilities.
    async fn initialize(&mut self, sketch: &Path) -> Result<Value> {
        let response = self
            .request(
                "initialize",
                json!({
                    "processId": null,
                    "rootUri": format!("file://{}", sketch.display()),
                    "capabilities": {}
                }),
            )
            .await?;
        self.notify("initialized", json!({})).await?;
        Ok(response["result"]["capabilities"].clone())
    }

    async fn open_ino(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": format!("file://{}", path.display()),
                    "languageId": "ino",
                    "version": 1,
                    "text": text
                }
            }),
        )
        .await
    }
}

/// Returns the next complete framed message and the bytes it consumed.
fn parse_frame(buffer: &[u8]) -> Option<(String, usize)> {
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

/// Creates a two-tab sketch and returns its directory.
fn make_sketch(parent: &Path) -> Result<PathBuf> {
    let sketch = parent.join("Blink");
    std::fs::create_dir_all(&sketch)?;
    std::fs::write(
        sketch.join("Blink.ino"),
        "void setup() {\n  pinMode(13, OUTPUT);\n}\nvoid loop() {\n  digitalWrite(13, HIGH);\n}\n",
    )?;
    std::fs::write(sketch.join("Tab2.ino"), "int helper() {\n  return 42;\n}\n")?;
    Ok(sketch)
}

/// Parses the record file `mockclangd` writes: one JSON value per line.
fn read_record(path: &Path) -> Vec<Value> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Polls the record file until the predicate holds.
async fn wait_record<F: Fn(&[Value]) -> bool>(path: &Path, ready: F) -> Result<Vec<Value>> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let messages = read_record(path);
        if ready(&messages) {
            return Ok(messages);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("record file never satisfied the predicate; got {messages:#?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn entries_with_method<'a>(messages: &'a [Value], method: &str) -> Vec<&'a Value> {
    messages
        .iter()
        .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
        .collect()
}

/// The synthetic unit generated by `mockcli` for the sketch.
fn generated_unit(sketch: &Path) -> Result<String> {
    let unit = inols::preprocess::build_dir_for(sketch)
        .join("sketch")
        .join("Blink.ino.cpp");
    std::fs::read_to_string(&unit).with_context(|| format!("reading {}", unit.display()))
}

#[tokio::test]
async fn initialize_answers_capabilities_before_clangd_exists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    let mut server = Server::spawn(&record, &[])?;
    let capabilities = server.initialize(&sketch).await?;

    assert_eq!(capabilities["textDocumentSync"], 2);
    assert_eq!(capabilities["hoverProvider"], true);
    assert_eq!(capabilities["renameProvider"], false);
    assert_eq!(capabilities["referencesProvider"], false);
    assert_eq!(
        capabilities["completionProvider"]["triggerCharacters"],
        json!([".", ">", ":"])
    );
    assert_eq!(
        capabilities["executeCommandProvider"]["commands"],
        json!(["clangd.applyFix", "clangd.applyTweak"])
    );
    Ok(())
}

#[tokio::test]
async fn first_ino_open_surfaces_the_synthetic_unit_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    let mut server = Server::spawn(&record, &[])?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;

    let messages = wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didOpen").is_empty()
    })
    .await?;
    let opens = entries_with_method(&messages, "textDocument/didOpen");
    assert_eq!(opens.len(), 1);

    let doc = &opens[0]["params"]["textDocument"];
    let uri = doc["uri"].as_str().context("didOpen uri")?;
    assert!(uri.ends_with("Blink.ino.cpp"), "got {uri}");
    assert_eq!(doc["languageId"], "cpp");
    assert_eq!(doc["version"], 1);
    let text = doc["text"].as_str().context("didOpen text")?;
    assert!(text.contains("#line 1"));
    assert!(text.contains("pinMode(13, OUTPUT);"));
    assert!(text.contains("return 42;"));
    Ok(())
}

#[tokio::test]
async fn second_ino_open_is_not_propagated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    let mut server = Server::spawn(&record, &[])?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;
    server.open_ino(&sketch.join("Tab2.ino")).await?;

    wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didOpen").is_empty()
    })
    .await?;
    // Give a second didOpen every chance to show up before asserting.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let messages = read_record(&record);
    assert_eq!(entries_with_method(&messages, "textDocument/didOpen").len(), 1);
    Ok(())
}

#[tokio::test]
async fn completion_position_is_translated_to_the_synthetic_unit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    let mut server = Server::spawn(&record, &[])?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;
    wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didOpen").is_empty()
    })
    .await?;

    // `digitalWrite` sits on line 4 of Blink.ino; find where the
    // preprocessor put it in the synthetic unit.
    let unit = generated_unit(&sketch)?;
    let cpp_line = unit
        .lines()
        .position(|line| line.contains("digitalWrite"))
        .context("digitalWrite not in generated unit")? as u32;

    let response = server
        .request(
            "textDocument/completion",
            json!({
                "textDocument": { "uri": format!("file://{}/Blink.ino", sketch.display()) },
                "position": { "line": 4, "character": 2 }
            }),
        )
        .await?;
    assert_eq!(response["result"]["items"], json!([]));

    let messages = read_record(&record);
    let completions = entries_with_method(&messages, "textDocument/completion");
    assert_eq!(completions.len(), 1);
    let params = &completions[0]["params"];
    let uri = params["textDocument"]["uri"].as_str().context("uri")?;
    assert!(uri.ends_with("Blink.ino.cpp"), "got {uri}");
    assert_eq!(params["position"]["line"], cpp_line);
    assert_eq!(params["position"]["character"], 2);
    Ok(())
}

#[tokio::test]
async fn diagnostics_fan_out_to_their_sketch_tabs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    // mockcli's layout is deterministic: prelude (include + 3
    // prototypes), then Blink behind its directive, then Tab2. Line 6 is
    // `pinMode…` (Blink line 1), line 13 is `return 42;` (Tab2 line 1).
    let mut server = Server::spawn(&record, &[("MOCKCLANGD_DIAGNOSE_LINES", "6,13")])?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;

    // Guard the hard-coded lines against mockcli drift.
    wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didOpen").is_empty()
    })
    .await?;
    let unit = generated_unit(&sketch)?;
    let lines: Vec<&str> = unit.lines().collect();
    assert!(lines[6].contains("pinMode"), "unit layout drifted: {unit}");
    assert!(lines[13].contains("return 42"), "unit layout drifted: {unit}");

    let blink = server
        .recv_until(|m| {
            m["method"] == "textDocument/publishDiagnostics"
                && m["params"]["uri"]
                    .as_str()
                    .is_some_and(|u| u.ends_with("Blink.ino"))
        })
        .await?;
    assert_eq!(blink["params"]["diagnostics"][0]["range"]["start"]["line"], 1);

    let tab2 = server
        .recv_until(|m| {
            m["method"] == "textDocument/publishDiagnostics"
                && m["params"]["uri"]
                    .as_str()
                    .is_some_and(|u| u.ends_with("Tab2.ino"))
        })
        .await?;
    assert_eq!(tab2["params"]["diagnostics"][0]["range"]["start"]["line"], 1);
    Ok(())
}

#[tokio::test]
async fn stale_diagnostics_are_cleared_on_the_next_round() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    // Round one (on didOpen) marks both tabs: line 6 maps to Blink,
    // line 13 to Tab2. Round two (on didChange) marks only Blink, so
    // Tab2 must be cleared with one empty batch.
    let mut server = Server::spawn(
        &record,
        &[
            ("MOCKCLANGD_DIAGNOSE_LINES", "6,13"),
            ("MOCKCLANGD_DIAGNOSE_LINES_ON_CHANGE", "6"),
        ],
    )?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;

    let is_publish_for = |m: &Value, suffix: &str| {
        m["method"] == "textDocument/publishDiagnostics"
            && m["params"]["uri"]
                .as_str()
                .is_some_and(|u| u.ends_with(suffix))
    };

    // Round one: both tabs get markers (this also consumes the round-one
    // Blink batch, which precedes Tab2's).
    let round_one = server
        .recv_until(|m| is_publish_for(m, "Tab2.ino"))
        .await?;
    assert!(
        !round_one["params"]["diagnostics"]
            .as_array()
            .context("diagnostics array")?
            .is_empty(),
        "round one should mark Tab2"
    );

    // A one-character edit triggers mockclangd's second round.
    server
        .notify(
            "textDocument/didChange",
            json!({
                "textDocument": {
                    "uri": format!("file://{}/Blink.ino", sketch.display()),
                    "version": 2
                },
                "contentChanges": [{
                    "range": {
                        "start": { "line": 1, "character": 2 },
                        "end": { "line": 1, "character": 2 }
                    },
                    "text": "x"
                }]
            }),
        )
        .await?;

    // Fresh batches come first: Blink keeps its marker.
    let round_two = server
        .recv_until(|m| is_publish_for(m, "Blink.ino"))
        .await?;
    assert!(
        !round_two["params"]["diagnostics"]
            .as_array()
            .context("diagnostics array")?
            .is_empty(),
        "round two should still mark Blink"
    );

    // Then the stale clear: Tab2 had markers last round and none this
    // round, so it receives exactly an empty batch.
    let cleared = server
        .recv_until(|m| is_publish_for(m, "Tab2.ino"))
        .await?;
    assert_eq!(cleared["params"]["diagnostics"], json!([]));
    Ok(())
}

#[tokio::test]
async fn synthetic_unit_closes_only_with_the_last_tab() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    let mut server = Server::spawn(&record, &[])?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;
    server.open_ino(&sketch.join("Tab2.ino")).await?;
    wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didOpen").is_empty()
    })
    .await?;

    let close = |path: PathBuf| {
        json!({
            "textDocument": { "uri": format!("file://{}", path.display()) }
        })
    };
    server
        .notify("textDocument/didClose", close(sketch.join("Blink.ino")))
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        entries_with_method(&read_record(&record), "textDocument/didClose").is_empty(),
        "first close must not reach clangd"
    );

    server
        .notify("textDocument/didClose", close(sketch.join("Tab2.ino")))
        .await?;
    let messages = wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didClose").is_empty()
    })
    .await?;
    let closes = entries_with_method(&messages, "textDocument/didClose");
    assert_eq!(closes.len(), 1);
    let uri = closes[0]["params"]["textDocument"]["uri"]
        .as_str()
        .context("didClose uri")?;
    assert!(uri.ends_with("Blink.ino.cpp"), "got {uri}");
    Ok(())
}

#[tokio::test]
async fn formatting_scopes_a_clang_format_beside_the_target() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    // A file outside the sketch: its URI passes through untouched.
    let outside = dir.path().join("lib");
    std::fs::create_dir_all(&outside)?;
    let target = outside.join("unit.cpp");
    std::fs::write(&target, "int main() { return 0; }\n")?;
    let style = outside.join(".clang-format");

    let mut server = Server::spawn(
        &record,
        &[
            ("MOCKCLANGD_DELAY_MS", "1500"),
            ("MOCKCLANGD_DELAY_ON", "textDocument/formatting"),
        ],
    )?;
    server.initialize(&sketch).await?;
    server.open_ino(&sketch.join("Blink.ino")).await?;
    wait_record(&record, |m| {
        !entries_with_method(m, "textDocument/didOpen").is_empty()
    })
    .await?;

    // Issue the request by hand so the scoped style file can be observed
    // while mockclangd is still sitting on the response.
    server
        .send(&json!({
            "jsonrpc": "2.0",
            "id": 900,
            "method": "textDocument/formatting",
            "params": {
                "textDocument": { "uri": format!("file://{}", target.display()) },
                "options": { "tabSize": 2, "insertSpaces": true }
            }
        }))
        .await?;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        style.exists(),
        "scoped .clang-format should exist while the request is in flight"
    );

    let response = server
        .recv_until(|m| {
            m.get("method").is_none() && m.get("id").and_then(Value::as_i64) == Some(900)
        })
        .await?;
    assert!(response.get("error").is_none(), "got {response}");

    // The guard runs as the response goes out; give it a moment.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while style.exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("scoped .clang-format was not cleaned up"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

#[tokio::test]
async fn suppressed_methods_answer_null() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sketch = make_sketch(dir.path())?;
    let record = dir.path().join("record.jsonl");

    let mut server = Server::spawn(&record, &[])?;
    server.initialize(&sketch).await?;

    let response = server
        .request(
            "textDocument/rename",
            json!({
                "textDocument": { "uri": format!("file://{}/Blink.ino", sketch.display()) },
                "position": { "line": 0, "character": 0 },
                "newName": "renamed"
            }),
        )
        .await?;
    assert!(response["result"].is_null());
    assert!(response.get("error").is_none());

    // Nothing crossed the clangd boundary for it.
    let messages = read_record(&record);
    assert!(entries_with_method(&messages, "textDocument/rename").is_empty());
    Ok(())
}
