// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! Macro registration and invocation.
//!
//! A macro body is kept as raw text and re-scanned on every expansion;
//! pre-parsing would break the per-expansion forms (`\@`, `\+`, `\-`).
//! Parameters are captured as slices: the operand tail of an invocation is
//! materialized once into a buffer owned by the new frame, and every
//! parameter is a span into it.

use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;

use bstr::{BStr, BString, ByteSlice};
use tracing::debug;

use crate::diag::PreprocError;
use crate::prepro::Preprocessor;
use crate::scan::{self, byte_at, is_space, DirList};
use crate::source::{ParamSlice, Source, SourceText, Span};
use crate::symbol::CARGSYM;
use crate::MAXMACPARAMS;

/// A registered macro. Immutable once its body has been captured.
pub struct Macro {
    pub(crate) name: BString,
    /// The buffer the macro was defined in; the body is `span` within it.
    pub(crate) text: SourceText,
    pub(crate) span: Span,
    /// Named-argument list, shared with every expansion frame.
    pub(crate) argnames: Option<Rc<Vec<Vec<u8>>>>,
}

impl Macro {
    pub fn name(&self) -> &BStr {
        self.name.as_bstr()
    }

    /// The raw body text.
    pub fn body(&self) -> &[u8] {
        self.span.slice(&self.text)
    }

    pub fn argnames(&self) -> &[Vec<u8>] {
        self.argnames.as_ref().map_or(&[], |n| n.as_slice())
    }
}

impl Debug for Macro {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macro")
            .field("name", &self.name)
            .field("body", &self.body().as_bstr())
            .finish()
    }
}

impl Preprocessor {
    /// Opens a macro capture: the pump scans for a directive from `enddirs`
    /// and registers everything before it as the body of `name`. When the
    /// syntax module passes the remainder of the definition line in `args`,
    /// it is parsed as a comma-separated named-argument list (each name
    /// optionally prefixed with `\`).
    ///
    /// # Panics
    ///
    /// Panics when a capture is already active or no source has been
    /// pushed; those are caller bugs.
    pub fn new_macro(&mut self, name: &[u8], enddirs: DirList, args: Option<&[u8]>) {
        assert!(
            self.cur_macro.is_none() && !self.stack.is_empty() && self.enddir.is_none(),
            "macro opened inside an active capture",
        );
        let mut mac_name = BString::from(name);
        if self.options.nocase_macros {
            mac_name.make_ascii_lowercase();
        }
        let cur = self.cur();
        let mut m = Macro {
            name: mac_name,
            text: cur.text.clone(),
            span: Span {
                start: cur.srcptr,
                end: cur.srcptr,
            },
            argnames: None,
        };
        self.enddir = Some(enddirs);
        self.rept_cnt = -1;

        if let Some(args) = args {
            let mut names: Vec<Vec<u8>> = Vec::new();
            let mut p = scan::skip_blanks(args, 0);
            while byte_at(args, p) != 0 {
                if args[p] == b'\\' {
                    p += 1;
                }
                match scan::skip_identifier(args, p, self.syntax.as_ref()) {
                    Some(end) if end > p => {
                        self.named_macro_arg(&mut names, &args[p..end]);
                        p = end;
                    }
                    _ => {
                        self.diagnostics.report(PreprocError::IllegalMacroArg);
                        break;
                    }
                }
                p = scan::skip_blanks(args, p);
                if byte_at(args, p) == b',' {
                    p = scan::skip_blanks(args, p + 1);
                }
            }
            if !names.is_empty() {
                m.argnames = Some(Rc::new(names));
            }
        }
        self.cur_macro = Some(m);
    }

    /// Appends one named argument, reporting when the parameter array is
    /// already full.
    fn named_macro_arg(&mut self, names: &mut Vec<Vec<u8>>, name: &[u8]) {
        if names.len() + 1 >= MAXMACPARAMS {
            self.diagnostics
                .report(PreprocError::TooManyMacArgs(MAXMACPARAMS - 1));
        }
        names.push(name.to_vec());
    }

    /// Commits the macro being captured, with its body ending at `end`.
    pub(crate) fn add_macro(&mut self, end: usize) {
        let mut m = self.cur_macro.take().expect("no open macro definition");
        m.span.end = end;
        debug!(name = %m.name, size = m.span.len(), "macro defined");
        self.macros.insert(m.name.clone(), Rc::new(m));
    }

    /// Looks up a registered macro.
    pub fn find_macro(&self, name: &[u8]) -> Option<&Macro> {
        if self.options.nocase_macros {
            let key = name.to_ascii_lowercase();
            self.macros.get(BStr::new(&key)).map(Rc::as_ref)
        } else {
            self.macros.get(BStr::new(name)).map(Rc::as_ref)
        }
    }

    /// Expands a macro invocation: reads the arguments from the operand
    /// tail `ops`, pushes the expansion frame, and resets `CARG`. Returns
    /// `false` without side effects when `name` is not a macro.
    ///
    /// `quals` carries the instruction qualifiers of the invocation; the
    /// first becomes parameter `\0` (falling back to the syntax module's
    /// default). `cond_level` is kept on the frame for the caller and
    /// handed back by [`Preprocessor::leave_macro`].
    pub fn execute_macro(
        &mut self,
        name: &[u8],
        quals: &[&[u8]],
        ops: &[u8],
        cond_level: i32,
    ) -> bool {
        let m = if self.options.nocase_macros {
            let key = name.to_ascii_lowercase();
            match self.macros.get(BStr::new(&key)) {
                Some(m) => m.clone(),
                None => return false,
            }
        } else {
            match self.macros.get(BStr::new(name)) {
                Some(m) => m.clone(),
                None => return false,
            }
        };

        let id = self.alloc_id();
        let mut src = Source::new(m.name.to_string(), m.text.clone(), m.span, id);

        // The first qualifier becomes argument \0.
        if let Some(q) = quals.first() {
            src.params[0] = Some(ParamSlice::owned(q));
        } else if let Some(dq) = self.syntax.default_qualifiers() {
            src.params[0] = Some(ParamSlice::owned(dq));
        }

        // Read the arguments from the operand field. The tail is copied
        // once; parameters become spans into the copy, and the `>>`
        // collapse inside <...> rewrites the copy in place.
        let mut buf: Vec<u8> = ops.to_vec();
        let mut spans: Vec<(usize, Span)> = Vec::new();
        let comment_char = self.syntax.comment_char();
        let mut n = 0usize;
        let mut s = scan::skip_blanks(&buf, 0);
        loop {
            let c = byte_at(&buf, s);
            if c == 0 || c == comment_char || n >= self.options.maxmacparams {
                break;
            }
            n += 1;

            let span;
            if c == b'"' || c == b'\'' {
                // Quoted argument; the delimiters stay part of the slice.
                let start = s;
                s += 1;
                loop {
                    let b = byte_at(&buf, s);
                    if b == 0 {
                        break;
                    }
                    if b == b'\\' && byte_at(&buf, s + 1) != 0 {
                        let (next, _) =
                            scan::escape(&buf, s, self.options.esc_sequences, &mut self.diagnostics);
                        s = next;
                    } else {
                        s += 1;
                        if b == c {
                            if byte_at(&buf, s) == c {
                                s += 1;
                            } else {
                                break;
                            }
                        }
                    }
                }
                span = Span { start, end: s };
            } else if c == b'<' {
                // Angle-bracketed argument; ">>" collapses to ">" and the
                // first unpaired ">" ends it.
                s += 1;
                let start = s;
                loop {
                    let b = byte_at(&buf, s);
                    if b == 0 {
                        break;
                    }
                    if b == b'>' {
                        if byte_at(&buf, s + 1) == b'>' {
                            buf.remove(s);
                        } else {
                            break;
                        }
                    }
                    s += 1;
                }
                span = Span { start, end: s };
                if byte_at(&buf, s) == b'>' {
                    s += 1;
                }
            } else {
                let start = s;
                s = self.syntax.skip_operand(&buf, s);
                let mut end = s;
                while end > start && is_space(buf[end - 1]) {
                    end -= 1;
                }
                span = Span { start, end };
            }
            if n < MAXMACPARAMS {
                spans.push((n, span));
            }

            s = scan::skip_blanks(&buf, s);
            if byte_at(&buf, s) != b',' {
                break;
            }
            s = scan::skip_blanks(&buf, s + 1);
        }

        // Reset CARG to select the first parameter, remembering the
        // invoking frame's expression for restoration on pop.
        let prev = self.symbols.internal_abs(CARGSYM).clone();
        self.cur_mut().cargexp = Some(prev);
        *self.symbols.internal_abs(CARGSYM) = self.carg1.clone();

        if n >= self.options.maxmacparams {
            self.diagnostics
                .report(PreprocError::TooManyMacArgs(self.options.maxmacparams - 1));
            n = self.options.maxmacparams - 1;
        }

        let argtext: SourceText = Rc::from(buf);
        for (i, span) in spans {
            src.params[i] = Some(ParamSlice {
                text: argtext.clone(),
                span,
            });
        }
        src.num_params = n as i32;
        src.param_names = m.argnames.clone();
        src.cond_level = cond_level;
        debug!(name = %m.name, args = n, "macro expansion pushed");
        self.stack.push(src);
        true
    }

    /// Leaves the macro currently expanding by skipping to the end of its
    /// body, returning the conditional-assembly level saved at invocation.
    /// Reports error 36 when the current frame is not a macro expansion.
    pub fn leave_macro(&mut self) -> Option<i32> {
        let cur = self.cur_mut();
        if cur.num_params >= 0 {
            cur.srcptr = cur.span.end;
            Some(cur.cond_level)
        } else {
            self.diagnostics.report(PreprocError::NoMacroToExit);
            None
        }
    }
}
