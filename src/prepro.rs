// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! The preprocessor state and its line pump.
//!
//! [`Preprocessor::read_next_line`] is the single entry point that drives
//! everything: it pops exhausted frames, replays repeat bodies, runs the
//! end-directive scan while a definition is being captured, and otherwise
//! materializes one line with macro-parameter substitution.

use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use bstr::BString;
use tracing::debug;

use crate::diag::{Diagnostics, PreprocError};
use crate::expr::{number_expr, BinOp, Expr};
use crate::macros::Macro;
use crate::scan::{self, byte_at, DirList};
use crate::source::{Source, SourceText, Span};
use crate::structure::Structure;
use crate::symbol::{SymbolTable, CARGSYM, REPTNSYM};
use crate::syntax::Syntax;
use crate::{atom::Atom, IDSTACKSIZE, MAXLINELENGTH, MAXLISTSRC};

/// Process-wide tuning knobs, set once by the syntax module.
#[derive(Clone, Debug)]
pub struct Options {
    /// Decode backslash escape sequences in strings.
    pub esc_sequences: bool,
    /// Case-insensitive macro names, lowercased on registration.
    pub nocase_macros: bool,
    /// Case-insensitive structure names, lowercased on registration.
    pub nocase_structure: bool,
    /// Number of addressable macro parameters: 10 limits substitution to
    /// `\0`..`\9`, up to 36 adds `\a`..`\z`.
    pub maxmacparams: usize,
    /// Enable `\name` substitution against the macro's named arguments.
    /// Disables `\a`..`\z`.
    pub namedmacparams: bool,
    /// Record each expanded line for the listing.
    pub listing: bool,
    /// Search path for binary includes.
    pub include_paths: Vec<std::path::PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            esc_sequences: true,
            nocase_macros: false,
            nocase_structure: false,
            maxmacparams: 10,
            namedmacparams: false,
            listing: false,
            include_paths: Vec::new(),
        }
    }
}

/// One recorded listing line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    pub source: String,
    pub line: u32,
    /// The first [`MAXLISTSRC`] bytes of the expanded line.
    pub text: BString,
}

/// The preprocessor: source stack, definition tables, capture state, and
/// everything the expansion forms touch.
pub struct Preprocessor {
    pub(crate) options: Options,
    pub(crate) syntax: Box<dyn Syntax>,
    pub(crate) stack: Vec<Source>,
    pub(crate) macros: HashMap<BString, Rc<Macro>>,
    pub(crate) structs: HashMap<BString, Rc<Structure>>,
    /// A macro whose body is being captured.
    pub(crate) cur_macro: Option<Macro>,
    /// A structure whose body is being captured.
    pub(crate) cur_struct: Option<Structure>,
    /// Directives that end the active capture; `Some` puts the pump into
    /// capture mode.
    pub(crate) enddir: Option<DirList>,
    /// Directives that open a nested repeat while one is being captured.
    pub(crate) reptdir: Option<DirList>,
    pub(crate) rept_cnt: i64,
    pub(crate) rept_start: usize,
    id_stack: [u64; IDSTACKSIZE],
    id_sp: usize,
    pub(crate) next_id: u64,
    /// The shared constant-1 expression `CARG` is reset to on macro entry.
    pub(crate) carg1: Expr,
    pub(crate) symbols: SymbolTable,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) atoms: Vec<Atom>,
    pub(crate) listing: Vec<Listing>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Preprocessor::new(Options::default(), Box::new(crate::syntax::StdSyntax))
    }
}

impl Preprocessor {
    pub fn new(options: Options, syntax: Box<dyn Syntax>) -> Self {
        Preprocessor {
            options,
            syntax,
            stack: Vec::new(),
            macros: HashMap::new(),
            structs: HashMap::new(),
            cur_macro: None,
            cur_struct: None,
            enddir: None,
            reptdir: None,
            rept_cnt: -1,
            rept_start: 0,
            id_stack: [0; IDSTACKSIZE],
            id_sp: 0,
            next_id: 0,
            carg1: number_expr(1),
            symbols: SymbolTable::new(),
            diagnostics: Diagnostics::new(),
            atoms: Vec::new(),
            listing: Vec::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn syntax(&self) -> &dyn Syntax {
        self.syntax.as_ref()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Atoms emitted by structure instantiation and binary includes, in
    /// emission order.
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn listing(&self) -> &[Listing] {
        &self.listing
    }

    /// The innermost active source frame.
    pub fn current_source(&self) -> Option<&Source> {
        self.stack.last()
    }

    /// Number of stacked source frames.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Current depth of the `\@` unique-id stack.
    pub fn id_stack_depth(&self) -> usize {
        self.id_sp
    }

    pub(crate) fn cur(&self) -> &Source {
        self.stack.last().expect("no current source")
    }

    pub(crate) fn cur_mut(&mut self) -> &mut Source {
        self.stack.last_mut().expect("no current source")
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Pushes a top-level source buffer. The first pushed buffer is the
    /// root; popping it ends the assembly.
    pub fn push_source(&mut self, name: &str, text: impl Into<Vec<u8>>) {
        let buf: Vec<u8> = text.into();
        let len = buf.len();
        let text: SourceText = Rc::from(buf);
        let id = self.alloc_id();
        debug!(source = name, size = len, "source pushed");
        self.stack
            .push(Source::new(name.to_owned(), text, Span::from(0..len), id));
    }

    /// Opens a repeat capture: the pump scans for a directive from
    /// `enddirs`, counting nested openers from `reptdirs`, and replays the
    /// captured body `rcnt` times. `rcnt == 0` drops the body.
    ///
    /// # Panics
    ///
    /// Panics when a capture is already active, a macro is open, or no
    /// source has been pushed; those are caller bugs.
    pub fn new_repeat(&mut self, rcnt: i64, reptdirs: DirList, enddirs: DirList) {
        assert!(
            self.cur_macro.is_none() && !self.stack.is_empty() && self.enddir.is_none(),
            "repeat opened inside an active capture",
        );
        self.rept_start = self.cur().srcptr;
        self.rept_cnt = rcnt;
        self.enddir = Some(enddirs);
        self.reptdir = Some(reptdirs);
    }

    /// Pushes the frame that replays a captured repeat body. Runs after the
    /// current line was materialized, so the body starts on the next pump.
    fn start_repeat(&mut self, rept_end: usize) {
        self.reptdir = None;
        assert!(
            self.rept_cnt >= 0 && !self.stack.is_empty(),
            "repeat capture state corrupt",
        );
        let cnt = self.rept_cnt;
        if cnt == 0 {
            debug!("repeat with count 0 dropped");
            return;
        }
        let id = self.alloc_id();
        let cur = self.cur();
        let name = format!("REPEAT:{}:line {}", cur.name, cur.line);
        let mut src = Source::new(
            name,
            cur.text.clone(),
            Span {
                start: self.rept_start,
                end: rept_end,
            },
            id,
        );
        src.repeat = cnt;
        src.reptn = 1;
        if cur.num_params >= 0 {
            // A repetition inside a macro still sees its parameters.
            src.num_params = cur.num_params;
            src.params = cur.params.clone();
            src.param_names = cur.param_names.clone();
        }
        debug!(frame = %src.name, count = cnt, "repeat started");
        self.stack.push(src);
        self.symbols.set_internal_abs(REPTNSYM, 1);
    }

    /// Reads the next expanded line, or `None` at the end of the root
    /// source.
    pub fn read_next_line(&mut self) -> Option<&[u8]> {
        // Pop exhausted frames, replaying repeat bodies on the way.
        loop {
            let cur = self.stack.last()?;
            if cur.srcptr < cur.span.end && byte_at(&cur.text, cur.srcptr) != 0 {
                break;
            }
            let single = self.stack.len() == 1;
            let cur = self.stack.last_mut().unwrap();
            cur.repeat -= 1;
            if cur.repeat > 0 {
                cur.srcptr = cur.span.start;
                cur.line = 0;
                cur.reptn += 1;
                let n = cur.reptn;
                self.symbols.set_internal_abs(REPTNSYM, n);
                continue;
            }
            if single {
                // End of assembly; the root frame stays for inspection.
                cur.linebuf = Vec::new();
                return None;
            }
            let popped = self.stack.pop().unwrap();
            debug!(frame = %popped.name, "frame popped");
            let parent = self.stack.last().unwrap();
            let restored = parent.cargexp.clone();
            let reptn = parent.reptn;
            if let Some(e) = restored {
                *self.symbols.internal_abs(CARGSYM) = e;
            }
            self.symbols.set_internal_abs(REPTNSYM, reptn);
        }

        let mut frame = self.stack.pop().unwrap();
        frame.line += 1;
        self.diagnostics.set_location(&frame.name, frame.line);

        let text = frame.text.clone();
        let srcend = frame.span.end;
        let mut s = frame.srcptr;
        let nparam = frame.num_params;
        let mut rept_end = None;

        let capture_minlen = self.enddir.as_ref().map(DirList::minlen);
        if let Some(minlen) = capture_minlen {
            if srcend - s > minlen {
                rept_end = self.scan_enddir(&mut frame, &mut s);
            }
        }

        let mut out = mem::take(&mut frame.linebuf);
        out.clear();
        let mut len = (MAXLINELENGTH - 1) as isize;

        while s < srcend {
            let c = text[s];
            if c == 0 || c == b'\n' {
                break;
            }
            if nparam >= 0 && c == b'\\' {
                let mut nc: isize = -1;
                match byte_at(&text, s + 1) {
                    b'\\' => {
                        let needed: isize = if self.options.esc_sequences { 2 } else { 1 };
                        if len >= needed {
                            // Keep the pair intact so the escape pass
                            // downstream still sees `\\`.
                            out.push(b'\\');
                            if self.options.esc_sequences {
                                out.push(b'\\');
                            }
                            nc = needed;
                            s += 2;
                        }
                    }
                    b'@' => {
                        // `\@`: a unique "_nnnnnn" id per expansion frame,
                        // with stack modifiers for matching labels across
                        // nested expansions.
                        if len >= 7 {
                            let mut unique_id = frame.id;
                            out.push(b'_');
                            len -= 1;
                            s += 2;
                            match byte_at(&text, s) {
                                b'!' => {
                                    if self.id_sp >= IDSTACKSIZE {
                                        self.diagnostics.report(PreprocError::IdStackOverflow);
                                    } else {
                                        self.id_stack[self.id_sp] = unique_id;
                                        self.id_sp += 1;
                                    }
                                    s += 1;
                                }
                                b'?' => {
                                    if self.id_sp >= IDSTACKSIZE {
                                        self.diagnostics.report(PreprocError::IdStackOverflow);
                                    } else if self.id_sp == 0 {
                                        self.diagnostics
                                            .report(PreprocError::IdInsertOnEmptyStack);
                                    } else {
                                        self.id_stack[self.id_sp] = self.id_stack[self.id_sp - 1];
                                        self.id_stack[self.id_sp - 1] = unique_id;
                                        self.id_sp += 1;
                                    }
                                    s += 1;
                                }
                                b'@' => {
                                    if self.id_sp == 0 {
                                        self.diagnostics.report(PreprocError::IdPullWithoutPush);
                                    } else {
                                        self.id_sp -= 1;
                                        unique_id = self.id_stack[self.id_sp];
                                    }
                                    s += 1;
                                }
                                _ => {}
                            }
                            let digits = format!("{unique_id:06}");
                            out.extend_from_slice(digits.as_bytes());
                            nc = digits.len() as isize;
                        }
                    }
                    b'#' => {
                        if len >= 2 {
                            let digits = frame.num_params.to_string();
                            out.extend_from_slice(digits.as_bytes());
                            nc = digits.len() as isize;
                            s += 2;
                        }
                    }
                    b'?' if byte_at(&text, s + 2).is_ascii_digit() => {
                        if len >= 3 {
                            let n = (byte_at(&text, s + 2) - b'0') as usize;
                            let digits = frame.param_len(n).to_string();
                            out.extend_from_slice(digits.as_bytes());
                            nc = digits.len() as isize;
                            s += 3;
                        }
                    }
                    b'.' => {
                        nc = self.copy_macro_carg(&frame, 0, &mut out, len);
                        s += 2;
                    }
                    b'+' => {
                        nc = self.copy_macro_carg(&frame, 1, &mut out, len);
                        s += 2;
                    }
                    b'-' => {
                        nc = self.copy_macro_carg(&frame, -1, &mut out, len);
                        s += 2;
                    }
                    d if d.is_ascii_digit() => {
                        nc = self.copy_macro_param(&frame, (d - b'0') as i64, &mut out, len);
                        s += 2;
                    }
                    c1 if self.options.namedmacparams && self.syntax.is_id_start(c1) => {
                        if let Some((idx, id_len)) = self.find_param_name(&frame, &text, s + 1) {
                            s += id_len + 1;
                            nc = self.copy_macro_param(&frame, idx, &mut out, len);
                        }
                    }
                    c1 if self.options.maxmacparams > 10
                        && !self.options.namedmacparams
                        && c1.to_ascii_lowercase() >= b'a'
                        && (c1.to_ascii_lowercase() as usize)
                            < b'a' as usize + self.options.maxmacparams - 10 =>
                    {
                        let n = (c1.to_ascii_lowercase() - b'a') as i64 + 10;
                        nc = self.copy_macro_param(&frame, n, &mut out, len);
                        s += 2;
                    }
                    b'(' if byte_at(&text, s + 2) == b')' => {
                        // `\()` expands to nothing; it ends a named
                        // parameter that runs into identifier characters.
                        nc = 0;
                        s += 3;
                    }
                    _ => {}
                }
                if nc >= 0 {
                    len -= nc;
                    continue;
                }
            } else if c == b'\r' {
                if (s > 0 && text[s - 1] == b'\n') || (s + 1 < srcend && text[s + 1] == b'\n') {
                    // CR next to LF belongs to the same line end.
                    s += 1;
                    continue;
                } else {
                    s += 1;
                    break;
                }
            }
            if len > 0 {
                out.push(text[s]);
                len -= 1;
            }
            s += 1;
        }

        if s < srcend && byte_at(&text, s) == b'\n' {
            s += 1;
        }
        frame.srcptr = s;

        if self.options.listing {
            let mut recorded = out.clone();
            recorded.truncate(MAXLISTSRC);
            self.listing.push(Listing {
                source: frame.name.clone(),
                line: frame.line,
                text: recorded.into(),
            });
        }

        frame.linebuf = out;
        self.stack.push(frame);
        let emitted = self.stack.len() - 1;
        if let Some(end) = rept_end {
            self.start_repeat(end);
        }
        Some(&self.stack[emitted].linebuf)
    }

    /// The capture scan: walk forward looking for an end directive instead
    /// of emitting lines. Returns the body end when a repeat capture
    /// terminated; macro and structure captures are committed in place.
    fn scan_enddir(&mut self, frame: &mut Source, s: &mut usize) -> Option<usize> {
        let text = frame.text.clone();
        let srcend = frame.span.end;
        let minlen = self.enddir.as_ref().unwrap().minlen();
        let comment_char = self.syntax.comment_char();
        let mut rept_end = None;
        let mut rept_nest = 1i64;
        let mut p = *s;

        if frame.num_params >= 0 && self.cur_macro.is_some() {
            self.diagnostics
                .report(PreprocError::MacroInMacro(frame.name.clone()));
        }

        while p + minlen <= srcend {
            if let Some(len) = self
                .enddir
                .as_ref()
                .and_then(|list| list.matches(&text, p, srcend))
            {
                if self.cur_macro.is_some() {
                    self.add_macro(frame.srcptr);
                    p += len;
                    self.enddir = None;
                    break;
                } else if self.cur_struct.is_some() {
                    self.add_structure(frame.srcptr);
                    p += len;
                    self.enddir = None;
                    break;
                } else {
                    rept_nest -= 1;
                    if rept_nest == 0 {
                        rept_end = Some(p);
                        p += len;
                        self.enddir = None;
                        break;
                    }
                }
            } else if self.cur_macro.is_none() && self.cur_struct.is_none() {
                if let Some(len) = self
                    .reptdir
                    .as_ref()
                    .and_then(|list| list.matches(&text, p, srcend))
                {
                    p += len;
                    rept_nest += 1;
                }
            }

            let c = byte_at(&text, p);
            if c == b'"' || c == b'\'' {
                // Strings are opaque to the scan but never cross lines.
                p += 1;
                while p + minlen <= srcend {
                    let b = byte_at(&text, p);
                    if b == c || b == b'\n' || b == b'\r' {
                        break;
                    }
                    if b == b'\\' {
                        p += 1;
                    }
                    p += 1;
                }
            }
            if byte_at(&text, p) == comment_char {
                p = scan::skip_eol(&text, p, srcend);
            }
            if byte_at(&text, p) == b'\n' {
                frame.srcptr = p + 1;
                frame.line += 1;
            } else if byte_at(&text, p) == b'\r'
                && (p == 0 || byte_at(&text, p - 1) != b'\n')
                && (p + 1 >= srcend || byte_at(&text, p + 1) != b'\n')
            {
                frame.srcptr = p + 1;
                frame.line += 1;
            }
            p += 1;
        }

        if self.enddir.is_some() {
            self.diagnostics.set_location(&frame.name, frame.line);
            let error = if let Some(m) = &self.cur_macro {
                PreprocError::MissingEndm(m.name.clone())
            } else if self.cur_struct.is_some() {
                PreprocError::MissingEndstruct
            } else {
                PreprocError::MissingEndr
            };
            self.diagnostics.report(error);
        }

        // The rest of the directive's line reads as a comment.
        *s = scan::skip_eol(&text, p, srcend);
        rept_end
    }

    /// Appends macro parameter `n` to the line, clamped to the remaining
    /// buffer space. Out-of-range indices copy nothing.
    pub(crate) fn copy_macro_param(
        &self,
        frame: &Source,
        n: i64,
        out: &mut Vec<u8>,
        len: isize,
    ) -> isize {
        if n < 0
            || n > frame.num_params as i64
            || n >= self.options.maxmacparams as i64
            || n >= frame.params.len() as i64
        {
            return 0;
        }
        match &frame.params[n as usize] {
            Some(p) => {
                let bytes = p.bytes();
                let take = bytes.len().min(len.max(0) as usize);
                out.extend_from_slice(&bytes[..take]);
                take as isize
            }
            None => 0,
        }
    }

    /// Appends the parameter selected by `CARG`, then steps `CARG` by
    /// `inc`. A non-numeric `CARG` reports error 30 and copies nothing.
    fn copy_macro_carg(&mut self, frame: &Source, inc: i32, out: &mut Vec<u8>, len: isize) -> isize {
        let carg = self.symbols.internal_abs(CARGSYM);
        carg.simplify();
        let n = match carg.as_num() {
            Some(n) => n,
            None => {
                self.diagnostics.report(PreprocError::NotConstant);
                return 0;
            }
        };
        let nc = self.copy_macro_param(frame, n, out, len);

        if inc != 0 {
            let op = if inc > 0 { BinOp::Add } else { BinOp::Sub };
            let old = self.symbols.internal_abs(CARGSYM).clone();
            let mut stepped = Expr::Binary(op, Box::new(old), Box::new(number_expr(1)));
            stepped.simplify();
            *self.symbols.internal_abs(CARGSYM) = stepped;
        }
        nc
    }

    /// Resolves `\name` against the macro's named arguments. Matching is
    /// case-sensitive. Returns the 1-based parameter index and the name
    /// length.
    fn find_param_name(&self, frame: &Source, text: &[u8], s: usize) -> Option<(i64, usize)> {
        let end = scan::skip_identifier(text, s, self.syntax.as_ref())?;
        let names = frame.param_names.as_ref()?;
        let word = &text[s..end];
        let idx = names.iter().position(|n| n.as_slice() == word)?;
        Some((idx as i64 + 1, end - s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::DirList;

    fn endm() -> DirList {
        DirList::new(["endm"])
    }

    fn next(p: &mut Preprocessor) -> Option<Vec<u8>> {
        p.read_next_line().map(|l| l.to_vec())
    }

    #[test]
    fn plain_lines_pass_through() {
        let mut p = Preprocessor::default();
        p.push_source("t", " move.w d0,d1\n rts\n");
        assert_eq!(next(&mut p).unwrap(), b" move.w d0,d1");
        assert_eq!(next(&mut p).unwrap(), b" rts");
        assert_eq!(next(&mut p), None);
        assert_eq!(next(&mut p), None);
        assert_eq!(p.depth(), 1);
        assert!(p.diagnostics().is_empty());
    }

    #[test]
    fn all_line_ending_styles_count_once() {
        let mut p = Preprocessor::default();
        p.push_source("t", "a\r\nb\n\rc\rd\n");
        for want in [&b"a"[..], b"b", b"c", b"d"] {
            assert_eq!(next(&mut p).unwrap(), want);
        }
        assert_eq!(p.current_source().unwrap().line(), 4);
        assert_eq!(next(&mut p), None);
    }

    #[test]
    fn overlong_lines_are_truncated() {
        let mut p = Preprocessor::default();
        let mut text = vec![b'x'; MAXLINELENGTH + 1000];
        text.push(b'\n');
        text.extend_from_slice(b"next\n");
        p.push_source("t", text);
        let line = next(&mut p).unwrap();
        assert_eq!(line.len(), MAXLINELENGTH - 1);
        assert_eq!(next(&mut p).unwrap(), b"next");
    }

    #[test]
    fn unique_id_stack_forms() {
        let mut p = Preprocessor::default();
        p.push_source("t", " m macro\n\\@!:\n\\@?:\n\\@@:\n endm\n m\n");
        assert_eq!(next(&mut p).unwrap(), b" m macro");
        p.new_macro(b"m", endm(), None);
        assert_eq!(next(&mut p).unwrap(), b"");
        assert_eq!(next(&mut p).unwrap(), b" m");
        p.next_id = 42;
        assert!(p.execute_macro(b"m", &[], b"", 0));
        assert_eq!(next(&mut p).unwrap(), b"_000042:");
        assert_eq!(next(&mut p).unwrap(), b"_000042:");
        assert_eq!(next(&mut p).unwrap(), b"_000042:");
        // `\@!` pushed, `\@?` inserted below the top, `\@@` pulled one.
        assert_eq!(p.id_stack_depth(), 1);
        assert!(p.diagnostics().is_empty());
    }

    #[test]
    fn unique_id_is_seven_bytes() {
        let mut p = Preprocessor::default();
        p.push_source("t", " m macro\n\\@\n endm\n m\n");
        next(&mut p);
        p.new_macro(b"m", endm(), None);
        next(&mut p);
        next(&mut p);
        assert!(p.execute_macro(b"m", &[], b"", 0));
        let line = next(&mut p).unwrap();
        assert_eq!(line.len(), 7);
        assert!(line.starts_with(b"_"));
        assert!(line[1..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn id_pull_on_empty_stack_reports_40() {
        let mut p = Preprocessor::default();
        p.push_source("t", " m macro\n\\@@\n endm\n m\n");
        next(&mut p);
        p.new_macro(b"m", endm(), None);
        next(&mut p);
        next(&mut p);
        assert!(p.execute_macro(b"m", &[], b"", 0));
        next(&mut p);
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [40]);
    }

    #[test]
    fn repeat_replays_with_parameter_and_reptn() {
        let mut p = Preprocessor::default();
        p.push_source("t", " m macro\n rept 3\n .byte \\1\n endr\n endm\n m 5\n");
        assert_eq!(next(&mut p).unwrap(), b" m macro");
        p.new_macro(b"m", endm(), None);
        assert_eq!(next(&mut p).unwrap(), b"");
        assert_eq!(next(&mut p).unwrap(), b" m 5");
        assert!(p.execute_macro(b"m", &[], b"5", 0));
        assert_eq!(next(&mut p).unwrap(), b" rept 3");
        p.new_repeat(3, DirList::new(["rept"]), DirList::new(["endr"]));
        assert_eq!(next(&mut p).unwrap(), b"");

        let mut bodies = Vec::new();
        let mut reptn = Vec::new();
        while let Some(line) = next(&mut p) {
            if !line.iter().all(|&b| b == b' ' || b == b'\t') && !line.is_empty() {
                bodies.push(line);
                reptn.push(p.symbols().value_of(b"REPTN").unwrap());
            }
        }
        assert_eq!(bodies, [&b" .byte 5"[..], b" .byte 5", b" .byte 5"]);
        assert_eq!(reptn, [1, 2, 3]);
        assert_eq!(p.depth(), 1);
        assert!(p.diagnostics().is_empty());
    }

    #[test]
    fn repeat_count_zero_drops_the_body() {
        let mut p = Preprocessor::default();
        p.push_source("t", " rept 0\n .byte 1\n endr\n done\n");
        assert_eq!(next(&mut p).unwrap(), b" rept 0");
        p.new_repeat(0, DirList::new(["rept"]), DirList::new(["endr"]));
        assert_eq!(next(&mut p).unwrap(), b"");
        assert_eq!(next(&mut p).unwrap(), b" done");
        assert_eq!(next(&mut p), None);
    }

    #[test]
    fn nested_repeats_capture_to_the_matching_end() {
        let mut p = Preprocessor::default();
        p.push_source(
            "t",
            " rept 2\n rept 2\n .byte 1\n endr\n endr\n done\n",
        );
        assert_eq!(next(&mut p).unwrap(), b" rept 2");
        p.new_repeat(2, DirList::new(["rept"]), DirList::new(["endr"]));
        assert_eq!(next(&mut p).unwrap(), b"");
        // The outer body replays twice and still contains the inner block.
        let mut inner_seen = 0;
        let mut byte_lines = 0;
        loop {
            let Some(line) = next(&mut p) else { break };
            if line.ends_with(b"rept 2") {
                inner_seen += 1;
                p.new_repeat(2, DirList::new(["rept"]), DirList::new(["endr"]));
            } else if line.ends_with(b".byte 1") {
                byte_lines += 1;
            } else if line.ends_with(b"done") {
                break;
            }
        }
        assert_eq!(inner_seen, 2);
        assert_eq!(byte_lines, 4);
        assert!(p.diagnostics().is_empty());
    }

    #[test]
    fn missing_endr_reports_32() {
        let mut p = Preprocessor::default();
        p.push_source("t", " rept 2\n .byte 1\n");
        assert_eq!(next(&mut p).unwrap(), b" rept 2");
        p.new_repeat(2, DirList::new(["rept"]), DirList::new(["endr"]));
        while next(&mut p).is_some() {}
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [32]);
    }

    #[test]
    fn listing_records_expanded_lines() {
        let mut p = Preprocessor::new(
            Options {
                listing: true,
                ..Options::default()
            },
            Box::new(crate::syntax::StdSyntax),
        );
        p.push_source("t", "one\ntwo\n");
        next(&mut p);
        next(&mut p);
        assert_eq!(p.listing().len(), 2);
        assert_eq!(p.listing()[0].text, "one");
        assert_eq!(p.listing()[1].line, 2);
    }

    #[test]
    fn empty_source_ends_immediately() {
        let mut p = Preprocessor::default();
        p.push_source("t", "");
        assert_eq!(next(&mut p), None);
    }
}
