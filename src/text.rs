// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Line-indexed text manipulation for LSP range edits.
//!
//! Positions are interpreted per the LSP default: line/character with
//! characters counted in UTF-16 code units. Out-of-range positions are
//! clamped to the nearest valid location, as editors routinely send
//! end-of-document ranges one past the last line.

use lsp_types::{Position, Range, TextDocumentContentChangeEvent};

/// Byte offsets of the first character of each line.
fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            starts.push(i + 1);
        }
    }
    starts
}

/// Converts an LSP position to a byte offset, clamping to document bounds.
pub fn position_to_offset(text: &str, pos: Position) -> usize {
    let starts = line_starts(text);
    let line = pos.line as usize;
    if line >= starts.len() {
        return text.len();
    }
    let line_start = starts[line];
    let line_end = starts
        .get(line + 1)
        .map_or(text.len(), |next| next.saturating_sub(1));
    let mut units = 0u32;
    for (i, ch) in text[line_start..line_end].char_indices() {
        if units >= pos.character {
            return line_start + i;
        }
        units += ch.len_utf16() as u32;
    }
    line_end
}

/// Replaces the given range with new text.
pub fn splice(text: &mut String, range: Range, new_text: &str) {
    let start = position_to_offset(text, range.start);
    let end = position_to_offset(text, range.end).max(start);
    text.replace_range(start..end, new_text);
}

/// Applies one LSP content change: a ranged splice, or a full-text
/// replacement when no range is given.
pub fn apply_content_change(text: &mut String, change: &TextDocumentContentChangeEvent) {
    match change.range {
        Some(range) => splice(text, range, &change.text),
        None => *text = change.text.clone(),
    }
}

/// Number of lines in the text (a trailing newline opens a final empty line).
pub fn line_count(text: &str) -> u32 {
    line_starts(text).len() as u32
}

/// The text of one line, without its terminator.
pub fn line_text(text: &str, line: u32) -> Option<&str> {
    let starts = line_starts(text);
    let start = *starts.get(line as usize)?;
    let end = starts
        .get(line as usize + 1)
        .map_or(text.len(), |next| next - 1);
    Some(&text[start..end])
}

/// Length of one line in UTF-16 code units.
pub fn line_utf16_len(text: &str, line: u32) -> u32 {
    line_text(text, line).map_or(0, |l| l.encode_utf16().count() as u32)
}
