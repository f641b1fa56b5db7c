// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The bidirectional source map between `.ino` sketch files and the
//! preprocessed `.ino.cpp` translation unit.
//!
//! The synthetic unit is a sequence of line runs delimited by
//! `#line N "file"` directives, preceded by a prelude of generated
//! prototypes that belongs to no source file. The mapper stores the
//! inverse direction densely (one entry per synthetic line) and derives
//! the forward direction from it, so the two can never disagree.
//!
//! Incremental edits splice the stored synthetic text and shift the
//! affected region of the map; re-parsing the spliced text from scratch
//! must always yield the same map, and the unit tests hold the mapper to
//! that.

use lsp_types::{Position, Range};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::warn;

use crate::text;

static LINE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    // Matches `#line 12 "/path/file.ino"` and the bare `#line 12` form.
    #[allow(clippy::unwrap_used, reason = "Pattern is a compile-time constant")]
    let directive = Regex::new(r#"^\s*#line\s+(\d+)(?:\s+"([^"]*)")?\s*$"#).unwrap();
    directive
});

/// Where one synthetic-unit line comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineOrigin {
    /// Generated prelude, prototypes, or a `#line` directive itself.
    Preprocessed,
    /// A line copied verbatim from a sketch file.
    Source {
        /// Sketch file path as written in the directive.
        file: String,
        /// Zero-based line within that file.
        line: u32,
    },
}

/// Failure modes of a range translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The requested line is not part of the map (e.g. the document was
    /// opened or grew after the last preprocess).
    NotFound {
        /// Human-readable location description.
        location: String,
    },
    /// The synthetic line is generated (prelude/prototype/directive) and
    /// has no sketch counterpart.
    Preprocessed {
        /// The synthetic line number.
        cpp_line: u32,
    },
    /// The range endpoints land in different sketch files.
    CrossFile {
        /// File of the start endpoint.
        start_file: String,
        /// File of the end endpoint, when known.
        end_file: String,
    },
    /// The range ended exactly at a line break that only exists in the
    /// synthetic unit; the carried result has the end pulled back to the
    /// start file. Callers treat this as success.
    EndLineAdjusted {
        /// File both endpoints were resolved to.
        file: String,
        /// The adjusted sketch-side range.
        range: Range,
    },
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { location } => write!(f, "no mapping for {location}"),
            Self::Preprocessed { cpp_line } => {
                write!(f, "line {cpp_line} is preprocessor-generated")
            }
            Self::CrossFile {
                start_file,
                end_file,
            } => write!(f, "range spans {start_file} and {end_file}"),
            Self::EndLineAdjusted { file, range } => write!(
                f,
                "range end adjusted to {file}:{}:{}",
                range.end.line, range.end.character
            ),
        }
    }
}

impl std::error::Error for MapError {}

/// The source map plus the authoritative copy of the synthetic text.
#[derive(Debug, Clone)]
pub struct SketchMapper {
    cpp_text: String,
    version: i32,
    to_ino: Vec<LineOrigin>,
    to_cpp: HashMap<(String, u32), u32>,
}

impl SketchMapper {
    /// Builds the map by scanning the synthetic unit once.
    pub fn parse(cpp_text: impl Into<String>, version: i32) -> Self {
        let cpp_text = cpp_text.into();
        let to_ino = index_lines(&cpp_text);
        let to_cpp = forward_from_inverse(&to_ino);
        Self {
            cpp_text,
            version,
            to_ino,
            to_cpp,
        }
    }

    /// The current synthetic-unit text.
    pub fn cpp_text(&self) -> &str {
        &self.cpp_text
    }

    /// The synthetic-unit version.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Increments the synthetic-unit version by one. Called once per
    /// inbound `.ino` `didChange`, however many content changes it holds.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Forward line lookup.
    pub fn ino_to_cpp_line(&self, file: &str, line: u32) -> Option<u32> {
        self.to_cpp.get(&(file.to_string(), line)).copied()
    }

    /// Inverse line lookup. `None` for generated or out-of-range lines.
    pub fn cpp_to_ino_line(&self, cpp_line: u32) -> Option<(&str, u32)> {
        match self.to_ino.get(cpp_line as usize) {
            Some(LineOrigin::Source { file, line }) => Some((file.as_str(), *line)),
            _ => None,
        }
    }

    /// True iff the synthetic line is generated (prelude, prototype, or a
    /// `#line` directive).
    pub fn is_preprocessed(&self, cpp_line: u32) -> bool {
        matches!(
            self.to_ino.get(cpp_line as usize),
            Some(LineOrigin::Preprocessed)
        )
    }

    /// Maps a sketch-side range into the synthetic unit. Characters pass
    /// through untouched; only lines move. An end position one past the
    /// last mapped line at character 0 (an end-of-file range) is carried
    /// over to one past the file's synthetic run.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotFound`] when either endpoint has no mapping.
    pub fn ino_to_cpp_range(&self, file: &str, range: Range) -> Result<Range, MapError> {
        let start_line =
            self.ino_to_cpp_line(file, range.start.line)
                .ok_or_else(|| MapError::NotFound {
                    location: format!("{file}:{}", range.start.line),
                })?;

        let end_line = match self.ino_to_cpp_line(file, range.end.line) {
            Some(line) => line,
            None if range.end.character == 0 && range.end.line > 0 => self
                .ino_to_cpp_line(file, range.end.line - 1)
                .map(|line| line + 1)
                .ok_or_else(|| MapError::NotFound {
                    location: format!("{file}:{}", range.end.line),
                })?,
            None => {
                return Err(MapError::NotFound {
                    location: format!("{file}:{}", range.end.line),
                });
            }
        };

        Ok(Range {
            start: Position {
                line: start_line,
                character: range.start.character,
            },
            end: Position {
                line: end_line,
                character: range.end.character,
            },
        })
    }

    /// Maps a synthetic-unit range back to a sketch file. Both endpoints
    /// must resolve to the same file; a range ending at character 0 of a
    /// line belonging to the next section is pulled back with
    /// [`MapError::EndLineAdjusted`], which callers treat as success.
    ///
    /// # Errors
    ///
    /// [`MapError::Preprocessed`] when the start is a generated line,
    /// [`MapError::NotFound`] when it is out of range, and
    /// [`MapError::CrossFile`] when the endpoints resolve to different
    /// sketch files.
    pub fn cpp_to_ino_range(&self, range: Range) -> Result<(String, Range), MapError> {
        let (start_file, start_line) = match self.to_ino.get(range.start.line as usize) {
            Some(LineOrigin::Source { file, line }) => (file.clone(), *line),
            Some(LineOrigin::Preprocessed) => {
                return Err(MapError::Preprocessed {
                    cpp_line: range.start.line,
                });
            }
            None => {
                return Err(MapError::NotFound {
                    location: format!("cpp:{}", range.start.line),
                });
            }
        };

        let start = Position {
            line: start_line,
            character: range.start.character,
        };

        if range.end.line == range.start.line {
            return Ok((
                start_file,
                Range {
                    start,
                    end: Position {
                        line: start_line,
                        character: range.end.character,
                    },
                },
            ));
        }

        if let Some((end_file, end_line)) = self.cpp_to_ino_line(range.end.line)
            && end_file == start_file
        {
            return Ok((
                start_file,
                Range {
                    start,
                    end: Position {
                        line: end_line,
                        character: range.end.character,
                    },
                },
            ));
        }

        // The end may sit exactly on a line break that only exists in the
        // synthetic unit (a directive or the next file's first line).
        if range.end.character == 0 && range.end.line > range.start.line {
            if let Some((prev_file, prev_line)) = self.cpp_to_ino_line(range.end.line - 1)
                && prev_file == start_file
            {
                return Err(MapError::EndLineAdjusted {
                    file: start_file,
                    range: Range {
                        start,
                        end: Position {
                            line: prev_line + 1,
                            character: 0,
                        },
                    },
                });
            }
        }

        let end_file = self
            .cpp_to_ino_line(range.end.line)
            .map_or_else(|| "<generated>".to_string(), |(f, _)| f.to_string());
        Err(MapError::CrossFile {
            start_file,
            end_file,
        })
    }

    /// Applies one translated content change to the synthetic text and
    /// updates both map directions in place. `cpp_range` must come from
    /// [`Self::ino_to_cpp_range`] for the same edit, so both endpoints lie
    /// in `file`'s run. Returns `true` when the edit is structurally dirty
    /// (it introduced a `#line` directive the incremental walk cannot
    /// absorb), in which case the caller should schedule a rebuild.
    pub fn apply_change(&mut self, file: &str, cpp_range: Range, new_text: &str) -> bool {
        let removed = cpp_range.end.line.saturating_sub(cpp_range.start.line) as usize;
        let added = new_text.bytes().filter(|b| *b == b'\n').count();

        text::splice(&mut self.cpp_text, cpp_range, new_text);

        let start_idx = cpp_range.start.line as usize;
        let anchor = match self.to_ino.get(start_idx) {
            Some(LineOrigin::Source { file: f, line }) if f == file => *line,
            other => {
                // The anchor line is not where the forward map said it
                // would be; the map has drifted. Reindex from the text and
                // force a rebuild.
                warn!("source map drift at cpp line {start_idx} ({other:?}); reindexing");
                self.reindex();
                return true;
            }
        };

        let delta = added as i64 - removed as i64;
        if delta != 0 {
            let old = std::mem::take(&mut self.to_ino);
            let mut rebuilt = Vec::with_capacity((old.len() as i64 + delta) as usize);

            rebuilt.extend_from_slice(&old[..=start_idx.min(old.len() - 1)]);
            for i in 1..=added {
                rebuilt.push(LineOrigin::Source {
                    file: file.to_string(),
                    line: anchor + i as u32,
                });
            }
            let tail_from = (cpp_range.end.line as usize + 1).min(old.len());
            for origin in &old[tail_from..] {
                rebuilt.push(match origin {
                    LineOrigin::Source { file: f, line } if f == file => LineOrigin::Source {
                        file: f.clone(),
                        line: (*line as i64 + delta) as u32,
                    },
                    other => other.clone(),
                });
            }
            self.to_ino = rebuilt;
            self.to_cpp = forward_from_inverse(&self.to_ino);
        }

        new_text
            .lines()
            .any(|line| line.trim_start().starts_with("#line"))
    }

    /// Rebuilds both directions from the stored text.
    fn reindex(&mut self) {
        self.to_ino = index_lines(&self.cpp_text);
        self.to_cpp = forward_from_inverse(&self.to_ino);
    }
}

/// Scans the synthetic unit and attributes every line to its origin.
fn index_lines(cpp_text: &str) -> Vec<LineOrigin> {
    let mut origins = Vec::new();
    let mut current: Option<(String, u32)> = None;

    for raw_line in cpp_text.split('\n') {
        if let Some(captures) = LINE_DIRECTIVE.captures(raw_line) {
            let target: u32 = captures
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(1);
            let file = captures.get(2).map(|m| m.as_str().to_string()).or_else(|| {
                // Bare `#line N` continues the current file.
                current.as_ref().map(|(f, _)| f.clone())
            });
            // `#line N` says the *next* line is 1-based line N.
            current = file.map(|f| (f, target.saturating_sub(1)));
            origins.push(LineOrigin::Preprocessed);
        } else if let Some((file, line)) = current.as_mut() {
            origins.push(LineOrigin::Source {
                file: file.clone(),
                line: *line,
            });
            *line += 1;
        } else {
            origins.push(LineOrigin::Preprocessed);
        }
    }

    origins
}

/// Derives the forward map. When the preprocessor attributes the same
/// sketch line twice (prototype attribution plus the copied body), the
/// later occurrence wins, matching the scan order of a fresh parse.
fn forward_from_inverse(to_ino: &[LineOrigin]) -> HashMap<(String, u32), u32> {
    let mut to_cpp = HashMap::new();
    for (cpp_line, origin) in to_ino.iter().enumerate() {
        if let LineOrigin::Source { file, line } = origin {
            to_cpp.insert((file.clone(), *line), cpp_line as u32);
        }
    }
    to_cpp
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK: &str = "/sketch/Blink.ino";
    const TAB2: &str = "/sketch/Tab2.ino";

    fn sample_unit() -> String {
        [
            "#include <Arduino.h>",         // 0 prelude
            "void setup();",                // 1 prelude (prototype)
            "void loop();",                 // 2 prelude (prototype)
            "#line 1 \"/sketch/Blink.ino\"", // 3 directive
            "// the blink sketch",          // 4 = Blink:0
            "void setup() {",               // 5 = Blink:1
            "  pinMode(13, OUTPUT);",       // 6 = Blink:2
            "}",                            // 7 = Blink:3
            "void loop() {",                // 8 = Blink:4
            "}",                            // 9 = Blink:5
            "#line 1 \"/sketch/Tab2.ino\"",  // 10 directive
            "int helper() {",               // 11 = Tab2:0
            "  return 42;",                 // 12 = Tab2:1
            "}",                            // 13 = Tab2:2
            "",                             // 14 = Tab2:3 (trailing)
        ]
        .join("\n")
    }

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range {
            start: Position {
                line: sl,
                character: sc,
            },
            end: Position {
                line: el,
                character: ec,
            },
        }
    }

    fn assert_matches_reparse(mapper: &SketchMapper) {
        let fresh = SketchMapper::parse(mapper.cpp_text().to_string(), mapper.version());
        assert_eq!(
            mapper.to_ino, fresh.to_ino,
            "incremental inverse map diverged from reparse"
        );
        assert_eq!(
            mapper.to_cpp, fresh.to_cpp,
            "incremental forward map diverged from reparse"
        );
    }

    #[test]
    fn parse_attributes_runs_and_prelude() {
        let mapper = SketchMapper::parse(sample_unit(), 1);

        assert!(mapper.is_preprocessed(0));
        assert!(mapper.is_preprocessed(2));
        assert!(mapper.is_preprocessed(3));
        assert!(mapper.is_preprocessed(10));
        assert!(!mapper.is_preprocessed(4));

        assert_eq!(mapper.cpp_to_ino_line(4), Some((BLINK, 0)));
        assert_eq!(mapper.cpp_to_ino_line(9), Some((BLINK, 5)));
        assert_eq!(mapper.cpp_to_ino_line(11), Some((TAB2, 0)));
        assert_eq!(mapper.cpp_to_ino_line(13), Some((TAB2, 2)));
        assert_eq!(mapper.cpp_to_ino_line(3), None);

        assert_eq!(mapper.ino_to_cpp_line(BLINK, 0), Some(4));
        assert_eq!(mapper.ino_to_cpp_line(BLINK, 5), Some(9));
        assert_eq!(mapper.ino_to_cpp_line(TAB2, 1), Some(12));
        assert_eq!(mapper.ino_to_cpp_line(TAB2, 99), None);
        assert_eq!(mapper.ino_to_cpp_line("/sketch/Other.ino", 0), None);
    }

    #[test]
    fn parse_handles_bare_line_directive() {
        let unit = [
            "#line 1 \"/sketch/Blink.ino\"",
            "first",
            "#line 10",
            "tenth",
        ]
        .join("\n");
        let mapper = SketchMapper::parse(unit, 1);

        assert_eq!(mapper.cpp_to_ino_line(1), Some((BLINK, 0)));
        assert_eq!(mapper.cpp_to_ino_line(3), Some((BLINK, 9)));
        assert_eq!(mapper.ino_to_cpp_line(BLINK, 9), Some(3));
    }

    #[test]
    fn duplicate_attribution_later_wins() {
        // Prototype attributed to Blink:1 before the real copy of Blink:1.
        let unit = [
            "#line 2 \"/sketch/Blink.ino\"",
            "void setup();",
            "#line 1 \"/sketch/Blink.ino\"",
            "// line 0",
            "void setup() {}",
        ]
        .join("\n");
        let mapper = SketchMapper::parse(unit, 1);

        assert_eq!(mapper.ino_to_cpp_line(BLINK, 1), Some(4));
        assert_eq!(mapper.cpp_to_ino_line(1), Some((BLINK, 1)));
    }

    #[test]
    fn forward_range_translation() {
        let mapper = SketchMapper::parse(sample_unit(), 1);

        let mapped = mapper
            .ino_to_cpp_range(BLINK, range(1, 0, 3, 1))
            .expect("mapped");
        assert_eq!(mapped, range(5, 0, 7, 1));

        // End-of-file range: one past the last mapped line at character 0.
        let eof = mapper
            .ino_to_cpp_range(TAB2, range(0, 0, 4, 0))
            .expect("eof range");
        assert_eq!(eof, range(11, 0, 15, 0));

        assert!(matches!(
            mapper.ino_to_cpp_range(BLINK, range(0, 0, 40, 2)),
            Err(MapError::NotFound { .. })
        ));
    }

    #[test]
    fn inverse_range_translation() {
        let mapper = SketchMapper::parse(sample_unit(), 1);

        let (file, mapped) = mapper.cpp_to_ino_range(range(5, 2, 7, 1)).expect("mapped");
        assert_eq!(file, BLINK);
        assert_eq!(mapped, range(1, 2, 3, 1));

        assert!(matches!(
            mapper.cpp_to_ino_range(range(1, 0, 1, 5)),
            Err(MapError::Preprocessed { cpp_line: 1 })
        ));

        assert!(matches!(
            mapper.cpp_to_ino_range(range(5, 0, 12, 0)),
            Err(MapError::CrossFile { .. })
        ));
    }

    #[test]
    fn inverse_range_end_adjustment() {
        let mapper = SketchMapper::parse(sample_unit(), 1);

        // Ends at character 0 of the Tab2 directive line: the break only
        // exists in the synthetic unit, so the end is pulled back.
        match mapper.cpp_to_ino_range(range(8, 0, 10, 0)) {
            Err(MapError::EndLineAdjusted { file, range: r }) => {
                assert_eq!(file, BLINK);
                assert_eq!(r, range(4, 0, 6, 0));
            }
            other => panic!("expected adjustment, got {other:?}"),
        }
    }

    #[test]
    fn single_line_edit_keeps_map() {
        let mut mapper = SketchMapper::parse(sample_unit(), 1);
        let cpp_range = mapper
            .ino_to_cpp_range(BLINK, range(2, 10, 2, 12))
            .expect("mapped");

        let dirty = mapper.apply_change(BLINK, cpp_range, "LED_BUILTIN");
        assert!(!dirty);
        assert!(mapper.cpp_text().contains("pinMode(LED_BUILTIN, OUTPUT);"));
        assert_eq!(mapper.ino_to_cpp_line(TAB2, 0), Some(11));
        assert_matches_reparse(&mapper);
    }

    #[test]
    fn line_insertion_shifts_following_runs() {
        let mut mapper = SketchMapper::parse(sample_unit(), 1);
        // Insert a new line inside setup() at Blink:2.
        let cpp_range = mapper
            .ino_to_cpp_range(BLINK, range(2, 0, 2, 0))
            .expect("mapped");

        let dirty = mapper.apply_change(BLINK, cpp_range, "  delay(100);\n");
        assert!(!dirty);

        // The inserted line takes over Blink:2; following lines shift by
        // one in both coordinate systems.
        assert_eq!(mapper.cpp_to_ino_line(6), Some((BLINK, 2)));
        assert_eq!(mapper.ino_to_cpp_line(BLINK, 3), Some(7));
        assert_eq!(mapper.cpp_to_ino_line(7), Some((BLINK, 3)));
        assert_eq!(mapper.ino_to_cpp_line(BLINK, 6), Some(10));
        // Tab2 keeps its own numbering but shifts in the synthetic unit.
        assert_eq!(mapper.ino_to_cpp_line(TAB2, 0), Some(12));
        assert_eq!(mapper.cpp_to_ino_line(12), Some((TAB2, 0)));
        assert_matches_reparse(&mapper);
    }

    #[test]
    fn line_deletion_shifts_back() {
        let mut mapper = SketchMapper::parse(sample_unit(), 1);
        // Delete Blink line 2 entirely (through the line break).
        let cpp_range = mapper
            .ino_to_cpp_range(BLINK, range(2, 0, 3, 0))
            .expect("mapped");

        let dirty = mapper.apply_change(BLINK, cpp_range, "");
        assert!(!dirty);

        assert_eq!(mapper.ino_to_cpp_line(BLINK, 2), Some(6));
        assert_eq!(mapper.cpp_to_ino_line(6), Some((BLINK, 2)));
        assert_eq!(mapper.ino_to_cpp_line(TAB2, 0), Some(10));
        assert_matches_reparse(&mapper);
    }

    #[test]
    fn multi_edit_sequence_matches_reparse() {
        let mut mapper = SketchMapper::parse(sample_unit(), 1);

        let edits = [
            (range(0, 0, 0, 0), "// header\n"),
            (range(4, 2, 4, 2), "digitalWrite(13, HIGH);"),
            (range(1, 0, 2, 0), ""),
            (range(5, 0, 5, 0), "int x = 1;\nint y = 2;\n"),
        ];
        for (ino_range, new_text) in edits {
            let cpp_range = mapper
                .ino_to_cpp_range(BLINK, ino_range)
                .expect("edit range maps");
            mapper.apply_change(BLINK, cpp_range, new_text);
            assert_matches_reparse(&mapper);
        }
    }

    #[test]
    fn inserting_directive_reports_dirty() {
        let mut mapper = SketchMapper::parse(sample_unit(), 1);
        let cpp_range = mapper
            .ino_to_cpp_range(BLINK, range(2, 0, 2, 0))
            .expect("mapped");

        let dirty = mapper.apply_change(BLINK, cpp_range, "#line 99 \"ghost.ino\"\n");
        assert!(dirty);
    }

    #[test]
    fn version_bumps_once_per_did_change() {
        let mut mapper = SketchMapper::parse(sample_unit(), 1);
        assert_eq!(mapper.version(), 1);
        mapper.bump_version();
        mapper.bump_version();
        assert_eq!(mapper.version(), 3);
    }
}
