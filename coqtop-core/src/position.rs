//! Source positions and the text-buffer accessor.
//!
//! Positions are zero-based and count columns in characters. The verifier
//! counts columns (and error spans) in UTF-8 bytes, so the byte form lives in
//! its own type, [`WirePosition`], and the two only convert into each other
//! through [`Position::to_wire`] and [`WirePosition::to_position`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// A zero-based (line, column) location; the column counts characters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// A zero-based (line, column) location whose column counts UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WirePosition {
    pub line: usize,
    pub byte_column: usize,
}

impl Position {
    pub const ORIGIN: Position = Position { line: 0, column: 0 };

    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Re-encode the column in bytes using the text of the position's line.
    ///
    /// Columns past the end of the line keep their excess as single bytes.
    pub fn to_wire<T: TextSource + ?Sized>(&self, text: &T) -> WirePosition {
        let line = text.line(self.line).unwrap_or("");
        WirePosition {
            line: self.line,
            byte_column: char_to_byte_column(line, self.column),
        }
    }

    /// Walk `offset` bytes into `content`, which starts at `start`.
    ///
    /// Used to turn verifier byte offsets (relative to the sentence text) back
    /// into positions. Offsets inside a multi-byte character round down to the
    /// character start; offsets past the end clamp to the end of `content`.
    pub fn advance_bytes(start: Position, content: &str, offset: usize) -> Position {
        let mut pos = start;
        for (idx, ch) in content.char_indices() {
            if idx + ch.len_utf8() > offset {
                break;
            }
            if ch == '\n' {
                pos.line += 1;
                pos.column = 0;
            } else {
                pos.column += 1;
            }
        }
        pos
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column)
    }
}

impl WirePosition {
    pub fn new(line: usize, byte_column: usize) -> Self {
        Self { line, byte_column }
    }

    /// Re-encode the byte column in characters using the text of the line.
    pub fn to_position<T: TextSource + ?Sized>(&self, text: &T) -> Position {
        let line = text.line(self.line).unwrap_or("");
        Position {
            line: self.line,
            column: byte_to_char_column(line, self.byte_column),
        }
    }
}

/// Byte column of the `column`-th character of `line`.
pub fn char_to_byte_column(line: &str, column: usize) -> usize {
    let prefix: usize = line.chars().take(column).map(char::len_utf8).sum();
    let chars_in_prefix = line.chars().take(column).count();
    prefix + (column - chars_in_prefix)
}

/// Character column of byte column `byte_column` of `line`.
pub fn byte_to_char_column(line: &str, byte_column: usize) -> usize {
    if byte_column >= line.len() {
        return line.chars().count() + (byte_column - line.len());
    }
    line.char_indices()
        .take_while(|(idx, _)| *idx < byte_column)
        .count()
}

/// Read access to the proof script, one line at a time.
///
/// Lines never contain their terminating newline.
pub trait TextSource {
    /// Text of line `index`, or `None` past the end of the buffer.
    fn line(&self, index: usize) -> Option<&str>;

    /// Total number of lines.
    fn line_count(&self) -> usize;

    /// Text between two positions, lines joined with `\n`.
    fn slice(&self, start: Position, end: Position) -> String {
        let mut out = String::new();
        if end <= start {
            return out;
        }
        for index in start.line..=end.line {
            let Some(line) = self.line(index) else {
                break;
            };
            let from = if index == start.line { start.column } else { 0 };
            if index == end.line {
                out.extend(line.chars().skip(from).take(end.column.saturating_sub(from)));
            } else {
                out.extend(line.chars().skip(from));
                out.push('\n');
            }
        }
        out
    }
}

impl<S: AsRef<str>> TextSource for [S] {
    fn line(&self, index: usize) -> Option<&str> {
        self.get(index).map(AsRef::as_ref)
    }

    fn line_count(&self) -> usize {
        self.len()
    }
}

impl<S: AsRef<str>, const N: usize> TextSource for [S; N] {
    fn line(&self, index: usize) -> Option<&str> {
        self.get(index).map(AsRef::as_ref)
    }

    fn line_count(&self) -> usize {
        N
    }
}

impl<S: AsRef<str>> TextSource for Vec<S> {
    fn line(&self, index: usize) -> Option<&str> {
        self.get(index).map(AsRef::as_ref)
    }

    fn line_count(&self) -> usize {
        self.len()
    }
}

/// An owned line snapshot of a text buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextSnapshot {
    lines: Vec<String>,
}

impl TextSnapshot {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }
}

impl From<&str> for TextSnapshot {
    fn from(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }
}

impl TextSource for TextSnapshot {
    fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_conversion_ascii_is_identity() {
        let text = TextSnapshot::from("Lemma foo.");
        let pos = Position::new(0, 5);
        assert_eq!(pos.to_wire(&text), WirePosition::new(0, 5));
        assert_eq!(WirePosition::new(0, 5).to_position(&text), pos);
    }

    #[test]
    fn test_wire_conversion_multibyte() {
        // "∀" is 3 bytes, "α" is 2
        let text = TextSnapshot::from("∀ α, α = α.");
        let pos = Position::new(0, 3);
        let wire = pos.to_wire(&text);
        assert_eq!(wire.byte_column, 3 + 1 + 2);
        assert_eq!(wire.to_position(&text), pos);
    }

    #[test]
    fn test_wire_conversion_past_end_of_line() {
        let text = TextSnapshot::from("é");
        assert_eq!(char_to_byte_column("é", 3), 4);
        assert_eq!(Position::new(0, 3).to_wire(&text).to_position(&text).column, 3);
    }

    #[test]
    fn test_advance_bytes_across_lines() {
        let content = "Lemma ∀x.\n  bad";
        let start = Position::new(4, 2);
        // byte 0 is the start itself
        assert_eq!(Position::advance_bytes(start, content, 0), start);
        // "Lemma " is 6 bytes, "∀" 3 more
        assert_eq!(Position::advance_bytes(start, content, 9), Position::new(4, 9));
        // past the newline
        let newline_at = content.find('\n').unwrap_or(0);
        assert_eq!(
            Position::advance_bytes(start, content, newline_at + 3),
            Position::new(5, 2)
        );
    }

    #[test]
    fn test_slice_multiline() {
        let text = vec!["abc", "def", "ghi"];
        assert_eq!(text.slice(Position::new(0, 1), Position::new(2, 1)), "bc\ndef\ng");
        assert_eq!(text.slice(Position::new(1, 0), Position::new(1, 3)), "def");
        assert_eq!(text.slice(Position::new(1, 2), Position::new(1, 2)), "");
    }

    #[test]
    fn test_position_ordering() {
        assert!(Position::new(0, 10) < Position::new(1, 0));
        assert!(Position::new(2, 3) < Position::new(2, 4));
    }
}
