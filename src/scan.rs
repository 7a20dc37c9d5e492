// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! Byte-scan primitives shared by the line pump, the definition capture
//! scanner, and the structure compiler. Everything operates on `&[u8]` with
//! offset cursors; a NUL byte and the end of the buffer are equivalent,
//! matching the end-of-source convention of the pump.

use memchr::memchr3;

use crate::atom::DBlock;
use crate::diag::{Diagnostics, PreprocError};
use crate::syntax::Syntax;

/// Reads the byte at `i`, with everything past the end reading as NUL.
#[inline(always)]
pub(crate) fn byte_at(text: &[u8], i: usize) -> u8 {
    text.get(i).copied().unwrap_or(0)
}

/// The whitespace class used for directive boundaries and name parsing.
#[inline(always)]
pub(crate) fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Skips blanks (spaces and tabs, never line ends).
pub fn skip_blanks(text: &[u8], mut s: usize) -> usize {
    while matches!(byte_at(text, s), b' ' | b'\t') {
        s += 1;
    }
    s
}

/// Advances to the next line end (NUL, LF, or CR), bounded by `e`.
pub fn skip_eol(text: &[u8], s: usize, e: usize) -> usize {
    let e = e.min(text.len());
    if s >= e {
        return s;
    }
    match memchr3(0, b'\n', b'\r', &text[s..e]) {
        Some(i) => s + i,
        None => e,
    }
}

/// Decodes one escape sequence. `s` must point at the backslash. Returns the
/// position after the sequence and the decoded byte.
///
/// With escape processing disabled, the backslash is passed through
/// unchanged. An unknown escape reports error 35 and consumes only the
/// backslash.
pub fn escape(text: &[u8], s: usize, esc_sequences: bool, diag: &mut Diagnostics) -> (usize, u8) {
    assert_eq!(byte_at(text, s), b'\\', "escape called off a backslash");
    let s = s + 1;

    if !esc_sequences {
        return (s, b'\\');
    }

    match byte_at(text, s) {
        b'b' => (s + 1, 0x08),
        b'f' => (s + 1, 0x0c),
        b'n' => (s + 1, b'\n'),
        b'r' => (s + 1, b'\r'),
        b't' => (s + 1, b'\t'),
        b'\\' => (s + 1, b'\\'),
        b'"' => (s + 1, b'"'),
        b'\'' => (s + 1, b'\''),
        b'e' => (s + 1, 27),
        b'0'..=b'7' => {
            let mut code: u8 = 0;
            let mut s = s;
            while let d @ b'0'..=b'7' = byte_at(text, s) {
                code = code.wrapping_mul(8).wrapping_add(d - b'0');
                s += 1;
            }
            (s, code)
        }
        b'x' | b'X' => {
            let mut code: u8 = 0;
            let mut s = s + 1;
            loop {
                let d = match byte_at(text, s) {
                    d @ b'0'..=b'9' => d - b'0',
                    d @ b'a'..=b'f' => d - b'a' + 10,
                    d @ b'A'..=b'F' => d - b'A' + 10,
                    _ => break,
                };
                code = code.wrapping_mul(16).wrapping_add(d);
                s += 1;
            }
            (s, code)
        }
        c => {
            diag.report(PreprocError::IllegalEscape(c as char));
            (s, b'\\')
        }
    }
}

/// Parses a quoted, angle-bracketed (when the syntax allows it), or unquoted
/// name, returning an owned copy and advancing `*pos` past it and any
/// trailing blanks. Returns `None` when nothing was read.
pub fn parse_name(text: &[u8], pos: &mut usize, syntax: &dyn Syntax) -> Option<Vec<u8>> {
    let mut s = *pos;
    let name;
    match byte_at(text, s) {
        c @ (b'"' | b'\'') => {
            s += 1;
            let start = s;
            while s < text.len() && text[s] != 0 && text[s] != c {
                s += 1;
            }
            name = text[start..s].to_vec();
            if byte_at(text, s) != 0 {
                s = skip_blanks(text, s + 1);
            }
        }
        b'<' if syntax.angle_names() => {
            s += 1;
            let start = s;
            while s < text.len() && text[s] != 0 && text[s] != b'>' {
                s += 1;
            }
            name = text[start..s].to_vec();
            if byte_at(text, s) != 0 {
                s = skip_blanks(text, s + 1);
            }
        }
        _ => {
            let start = s;
            while s < text.len()
                && text[s] != 0
                && !is_space(text[s])
                && text[s] != b','
                && text[s] != syntax.comment_char()
            {
                s += 1;
            }
            if s == start {
                *pos = s;
                return None;
            }
            name = text[start..s].to_vec();
            s = skip_blanks(text, s);
        }
    }
    *pos = s;
    Some(name)
}

/// Returns the position after an identifier starting at `s`, or `None` when
/// `s` does not start one.
pub fn skip_identifier(text: &[u8], s: usize, syntax: &dyn Syntax) -> Option<usize> {
    if !syntax.is_id_start(byte_at(text, s)) {
        return None;
    }
    let mut e = s + 1;
    while syntax.is_id_char(byte_at(text, e)) {
        e += 1;
    }
    syntax.chk_id_end(text, s, e)
}

/// Like [`skip_identifier`], but returns an owned copy and advances `*pos`.
pub fn parse_identifier(text: &[u8], pos: &mut usize, syntax: &dyn Syntax) -> Option<Vec<u8>> {
    let end = skip_identifier(text, *pos, syntax)?;
    let name = text[*pos..end].to_vec();
    *pos = end;
    Some(name)
}

/// Skips a `delim`-quoted string at `s`, honoring backslash escapes and the
/// doubled-delimiter convention (`""""` reads as one `"`). A missing opening
/// or closing delimiter reports error 6. When `size` is given, it receives
/// the decoded byte count.
pub fn skip_string(
    text: &[u8],
    mut s: usize,
    delim: u8,
    esc_sequences: bool,
    diag: &mut Diagnostics,
    size: Option<&mut usize>,
) -> usize {
    let mut n = 0usize;

    if byte_at(text, s) != delim {
        diag.report(PreprocError::DelimiterExpected(delim as char));
    } else {
        s += 1;
    }

    loop {
        let c = byte_at(text, s);
        if c == 0 {
            break;
        }
        if c == b'\\' {
            let (next, _) = escape(text, s, esc_sequences, diag);
            s = next;
        } else {
            s += 1;
            if c == delim {
                if byte_at(text, s) == delim {
                    s += 1;
                } else {
                    break;
                }
            }
        }
        n += 1;
    }

    if s == 0 || byte_at(text, s - 1) != delim {
        diag.report(PreprocError::DelimiterExpected(delim as char));
    }
    if let Some(size) = size {
        *size = n;
    }
    s
}

/// Materializes a string literal into a data block, each decoded byte
/// widened to `width_bits / 8` bytes, most significant first.
///
/// A one-byte string returns `None` so the caller can treat a single
/// character literal as an expression instead.
pub fn parse_string(
    text: &[u8],
    pos: &mut usize,
    delim: u8,
    width_bits: u32,
    esc_sequences: bool,
    diag: &mut Diagnostics,
) -> Option<DBlock> {
    assert_eq!(width_bits % 8, 0, "string width must be whole bytes");
    let width = (width_bits / 8) as usize;
    let mut s = *pos;

    let mut size = 0usize;
    skip_string(text, s, delim, esc_sequences, diag, Some(&mut size));
    if size == 1 {
        return None;
    }

    let mut db = DBlock {
        data: Vec::with_capacity(size * width),
    };
    if byte_at(text, s) == delim {
        s += 1;
    }
    loop {
        let c0 = byte_at(text, s);
        if c0 == 0 {
            break;
        }
        let c;
        if c0 == b'\\' {
            let (next, decoded) = escape(text, s, esc_sequences, diag);
            s = next;
            c = decoded;
        } else {
            c = c0;
            s += 1;
            if c == delim {
                if byte_at(text, s) == delim {
                    s += 1;
                } else {
                    break;
                }
            }
        }
        db.push_scalar_be(width, c);
    }

    *pos = s;
    Some(db)
}

/// True when `[start, end)` is one parenthesized group: it opens with `(`,
/// the parentheses stay balanced with positive depth until the final `)`,
/// and only whitespace follows.
pub fn check_indir(text: &[u8], start: usize, end: usize) -> bool {
    let mut p = skip_blanks(text, start);
    if byte_at(text, p) != b'(' {
        return false;
    }
    p += 1;

    let mut depth = 1i32;
    while depth > 0 && p < end {
        match byte_at(text, p) {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        p += 1;
    }
    if p < end {
        p = skip_blanks(text, p);
    }
    depth == 0 && p >= end
}

/// A directive name list, as handed over by the syntax module when it opens
/// a capture (e.g. the names that may end a macro body).
#[derive(Clone, Debug)]
pub struct DirList {
    entries: Vec<Box<[u8]>>,
    minlen: usize,
}

impl DirList {
    /// Builds a list from directive names. Panics on an empty list; a
    /// capture without possible end directives could never terminate.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let entries: Vec<Box<[u8]>> = names
            .into_iter()
            .map(|n| Box::<[u8]>::from(n.as_ref()))
            .collect();
        assert!(!entries.is_empty(), "empty directive list");
        let minlen = entries.iter().map(|e| e.len()).min().unwrap();
        DirList { entries, minlen }
    }

    /// The shortest entry length; scan positions closer than this to the end
    /// of the source cannot match.
    pub fn minlen(&self) -> usize {
        self.minlen
    }

    /// Matches an entry at `s` (bounded by `e`), case-insensitively and
    /// requiring a whitespace byte after the name. Returns the matched
    /// length.
    pub(crate) fn matches(&self, text: &[u8], s: usize, e: usize) -> Option<usize> {
        let maxlen = e.saturating_sub(s);
        for entry in &self.entries {
            let len = entry.len();
            if len <= maxlen
                && text[s..s + len].eq_ignore_ascii_case(entry)
                && is_space(byte_at(text, s + len))
            {
                return Some(len);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::StdSyntax;

    fn diag() -> Diagnostics {
        Diagnostics::new()
    }

    #[test]
    fn named_escapes_decode() {
        let mut d = diag();
        for (src, want) in [
            (&b"\\n"[..], b'\n'),
            (b"\\r", b'\r'),
            (b"\\t", b'\t'),
            (b"\\b", 0x08),
            (b"\\f", 0x0c),
            (b"\\\\", b'\\'),
            (b"\\\"", b'"'),
            (b"\\'", b'\''),
            (b"\\e", 27),
        ] {
            let (pos, code) = escape(src, 0, true, &mut d);
            assert_eq!(code, want, "escape {:?}", src);
            assert_eq!(pos, src.len(), "escape {:?}", src);
        }
        assert!(d.is_empty());
    }

    #[test]
    fn numeric_escapes_are_greedy() {
        let mut d = diag();
        assert_eq!(escape(b"\\101x", 0, true, &mut d), (4, b'A'));
        assert_eq!(escape(b"\\x41g", 0, true, &mut d), (4, b'A'));
        assert_eq!(escape(b"\\X0A", 0, true, &mut d), (4, b'\n'));
        assert!(d.is_empty());
    }

    #[test]
    fn unknown_escape_reports_35_and_consumes_backslash() {
        let mut d = diag();
        let (pos, _) = escape(b"\\q", 0, true, &mut d);
        assert_eq!(pos, 1);
        assert_eq!(d.codes().collect::<Vec<_>>(), [35]);
    }

    #[test]
    fn disabled_escapes_pass_through() {
        let mut d = diag();
        assert_eq!(escape(b"\\n", 0, false, &mut d), (1, b'\\'));
        assert!(d.is_empty());
    }

    #[test]
    fn parse_name_forms() {
        let syntax = StdSyntax;
        let mut pos = 0;
        assert_eq!(
            parse_name(b"\"hello world\" rest", &mut pos, &syntax),
            Some(b"hello world".to_vec()),
        );
        assert_eq!(pos, 14);

        let mut pos = 0;
        assert_eq!(
            parse_name(b"file.bin, next", &mut pos, &syntax),
            Some(b"file.bin".to_vec()),
        );
        assert_eq!(pos, 8);

        let mut pos = 0;
        assert_eq!(parse_name(b", next", &mut pos, &syntax), None);
        assert_eq!(pos, 0);
    }

    #[test]
    fn skip_string_counts_doubled_delimiters() {
        // """" reads as one quote character.
        let mut d = diag();
        let mut n = 0;
        let pos = skip_string(b"\"\"\"\"", 0, b'"', true, &mut d, Some(&mut n));
        assert_eq!(pos, 4);
        assert_eq!(n, 1);
        assert!(d.is_empty());
    }

    #[test]
    fn skip_string_missing_close_reports_6() {
        let mut d = diag();
        skip_string(b"\"abc", 0, b'"', true, &mut d, None);
        assert_eq!(d.codes().collect::<Vec<_>>(), [6]);
    }

    #[test]
    fn parse_string_round_trips_plain_bytes() {
        let mut d = diag();
        let mut pos = 0;
        let db = parse_string(b"\"abcd\"", &mut pos, b'"', 8, true, &mut d).unwrap();
        assert_eq!(db.data, b"abcd");
        assert_eq!(pos, 6);
        assert!(d.is_empty());
    }

    #[test]
    fn parse_string_single_char_defers_to_expressions() {
        let mut d = diag();
        let mut pos = 0;
        assert_eq!(parse_string(b"'x'", &mut pos, b'\'', 8, true, &mut d), None);
        assert_eq!(pos, 0);
    }

    #[test]
    fn parse_string_widens_big_endian() {
        let mut d = diag();
        let mut pos = 0;
        let db = parse_string(b"\"ab\"", &mut pos, b'"', 16, true, &mut d).unwrap();
        assert_eq!(db.data, b"\0a\0b");
    }

    #[test]
    fn check_indir_accepts_one_group_only() {
        assert!(check_indir(b"(a0)", 0, 4));
        assert!(check_indir(b"  ((a)+(b))  ", 0, 13));
        assert!(!check_indir(b"(a)(b)", 0, 6));
        assert!(!check_indir(b"(a)+2", 0, 5));
        assert!(!check_indir(b"x(a)", 0, 4));
        assert!(!check_indir(b"(a", 0, 2));
    }

    #[test]
    fn dirlist_requires_following_whitespace() {
        let list = DirList::new(["endm", "endmacro"]);
        assert_eq!(list.minlen(), 4);
        let text = b" endm\n endmx\n endmacro\n";
        assert_eq!(list.matches(text, 1, text.len()), Some(4));
        assert_eq!(list.matches(text, 7, text.len()), None);
        assert_eq!(list.matches(text, 14, text.len()), Some(8));
    }

    #[test]
    fn identifiers_honor_syntax_predicates() {
        let syntax = StdSyntax;
        let mut pos = 0;
        assert_eq!(
            parse_identifier(b"loop_1: rest", &mut pos, &syntax),
            Some(b"loop_1".to_vec()),
        );
        assert_eq!(pos, 6);
        assert_eq!(skip_identifier(b"1abc", 0, &syntax), None);
    }
}
