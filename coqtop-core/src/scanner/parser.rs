//! Recursive-descent sentence scanner.
//!
//! Grammar (whitespace is space, tab, carriage return and newline):
//!
//! ```text
//! unit     := WS (comment | bullet | command)
//! comment  := "(*" (comment | [^*] | "*" not followed by ")")* "*)"
//! bullet   := selector? WS "{" | "-"+ | "+"+ | "*"+ | "}"
//! selector := ([0-9]+ | "[" WS ident WS "]") WS ":"
//! command  := (comment | string | [^.] | "." not terminating)* "."
//! string   := "\"" [^"]* "\""
//! ```
//!
//! Every alternative that may fail half-way runs inside [`Cursor::attempt`],
//! which saves the cursor and restores it when the alternative returns `None`.

use crate::position::{Position, TextSource};

use super::types::{Unit, UnitKind};

/// Scan the next unit at or after `from`.
///
/// Returns `None` when only whitespace remains, or when the text ends before
/// the unit does (an unterminated command, string or comment).
pub fn scan_next<T: TextSource + ?Sized>(text: &T, from: Position) -> Option<Unit> {
    let mut cursor = Cursor::new(text, from);
    cursor.skip_blanks();
    cursor.peek()?;

    let start = cursor.position();
    let kind = cursor.unit_kind()?;
    let end = cursor.position();

    Some(Unit {
        start,
        end,
        content: text.slice(start, end),
        kind,
    })
}

/// Iterate over successive units starting at `from`.
pub fn scan_all<T: TextSource + ?Sized>(text: &T, from: Position) -> Units<'_, T> {
    Units { text, next: from }
}

/// Iterator returned by [`scan_all`].
pub struct Units<'a, T: TextSource + ?Sized> {
    text: &'a T,
    next: Position,
}

impl<T: TextSource + ?Sized> Iterator for Units<'_, T> {
    type Item = Unit;

    fn next(&mut self) -> Option<Unit> {
        let unit = scan_next(self.text, self.next)?;
        self.next = unit.end;
        Some(unit)
    }
}

fn is_blank(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic() || !c.is_ascii()
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c == '\''
}

/// A character cursor over a text source.
///
/// Each line is followed by a virtual `\n`, including the last one; past that
/// the cursor is exhausted.
struct Cursor<'a, T: TextSource + ?Sized> {
    text: &'a T,
    line: usize,
    column: usize,
    chars: Vec<char>,
}

#[derive(Clone, Copy)]
struct Mark {
    line: usize,
    column: usize,
}

impl<'a, T: TextSource + ?Sized> Cursor<'a, T> {
    fn new(text: &'a T, from: Position) -> Self {
        let mut cursor = Self {
            text,
            line: from.line,
            column: from.column,
            chars: Vec::new(),
        };
        cursor.load_line();
        cursor
    }

    fn load_line(&mut self) {
        self.chars = self
            .text
            .line(self.line)
            .map(|l| l.chars().collect())
            .unwrap_or_default();
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn mark(&self) -> Mark {
        Mark {
            line: self.line,
            column: self.column,
        }
    }

    fn reset(&mut self, mark: Mark) {
        let reload = mark.line != self.line;
        self.line = mark.line;
        self.column = mark.column;
        if reload {
            self.load_line();
        }
    }

    /// Run `parse`, restoring the cursor if it fails.
    fn attempt<R>(&mut self, parse: impl FnOnce(&mut Self) -> Option<R>) -> Option<R> {
        let mark = self.mark();
        let result = parse(self);
        if result.is_none() {
            self.reset(mark);
        }
        result
    }

    fn peek(&self) -> Option<char> {
        if self.line >= self.text.line_count() {
            return None;
        }
        Some(self.chars.get(self.column).copied().unwrap_or('\n'))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        if self.column < self.chars.len() {
            self.column += 1;
        } else {
            self.line += 1;
            self.column = 0;
            self.load_line();
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> Option<()> {
        (self.bump()? == expected).then_some(())
    }

    fn skip_blanks(&mut self) {
        while self.peek().is_some_and(is_blank) {
            self.bump();
        }
    }

    fn unit_kind(&mut self) -> Option<UnitKind> {
        if self.peek() == Some('(') && self.attempt(Self::comment).is_some() {
            return Some(UnitKind::Comment);
        }
        if self.attempt(Self::bullet).is_some() {
            return Some(UnitKind::Bullet);
        }
        self.command().map(|_| UnitKind::Command)
    }

    fn comment(&mut self) -> Option<()> {
        self.eat('(')?;
        self.eat('*')?;
        self.comment_body()
    }

    /// Consume up to and including the `*)` closing an already-open comment.
    fn comment_body(&mut self) -> Option<()> {
        let mut depth = 1usize;
        loop {
            match self.bump()? {
                '(' if self.peek() == Some('*') => {
                    self.bump();
                    depth += 1;
                }
                '*' if self.peek() == Some(')') => {
                    self.bump();
                    depth -= 1;
                    if depth == 0 {
                        return Some(());
                    }
                }
                _ => {}
            }
        }
    }

    fn bullet(&mut self) -> Option<()> {
        if self.attempt(Self::brace).is_some() {
            return Some(());
        }
        for symbol in ['-', '+', '*'] {
            let mut run = 0;
            while self.peek() == Some(symbol) {
                self.bump();
                run += 1;
            }
            if run > 0 {
                return Some(());
            }
        }
        self.eat('}')
    }

    fn brace(&mut self) -> Option<()> {
        // the selector is optional: a failed attempt leaves the cursor in place
        let _ = self.attempt(Self::goal_selector);
        self.skip_blanks();
        self.eat('{')
    }

    fn goal_selector(&mut self) -> Option<()> {
        if self.attempt(Self::digits).is_some() {
            self.skip_blanks();
            return self.eat(':');
        }
        self.eat('[')?;
        self.skip_blanks();
        self.ident()?;
        self.skip_blanks();
        self.eat(']')?;
        self.skip_blanks();
        self.eat(':')
    }

    fn digits(&mut self) -> Option<()> {
        let mut any = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            any = true;
        }
        any.then_some(())
    }

    fn ident(&mut self) -> Option<()> {
        if !self.bump().is_some_and(is_ident_start) {
            return None;
        }
        while self.peek().is_some_and(is_ident_part) {
            self.bump();
        }
        Some(())
    }

    fn command(&mut self) -> Option<()> {
        // the two characters consumed before the current one
        let mut prev: Option<char> = None;
        let mut prev2: Option<char> = None;
        loop {
            let c = self.bump()?;
            match c {
                '(' if self.peek() == Some('*') => {
                    self.bump();
                    self.comment_body()?;
                    prev2 = Some('*');
                    prev = Some(')');
                    continue;
                }
                '"' => {
                    while self.bump()? != '"' {}
                    prev2 = None;
                    prev = Some('"');
                    continue;
                }
                '.' if self.dot_terminates(prev, prev2) => return Some(()),
                _ => {}
            }
            prev2 = prev;
            prev = Some(c);
        }
    }

    /// Decide whether the dot just consumed ends the sentence.
    fn dot_terminates(&self, prev: Option<char>, prev2: Option<char>) -> bool {
        match self.peek() {
            Some(next) if !is_blank(next) => false,
            _ if prev == Some('.') => prev2 == Some('.'),
            _ => true,
        }
    }
}
