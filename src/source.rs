// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! Source frames: one active input context each, stacked by the pump.
//!
//! All text is shared through [`SourceText`], a reference-counted byte
//! buffer. Frames, macro bodies, and macro parameters hold `(SourceText,
//! Span)` pairs instead of slices, so a parameter can alias the buffer it
//! was written in without pinning lifetimes across the stack; the refcount
//! keeps the backing buffer alive for as long as anything points into it.

use std::fmt::{self, Debug, Formatter};
use std::ops::Range;
use std::rc::Rc;

use bstr::ByteSlice;

use crate::expr::Expr;
use crate::{MAXLINELENGTH, MAXMACPARAMS};

/// A shared, immutable source buffer.
pub type SourceText = Rc<[u8]>;

/// A range of bytes within a [`SourceText`].
///
/// Used instead of direct slices so positions can be carried across frames
/// while other parts of the preprocessor hold the same buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        !(self.start < self.end)
    }

    #[inline(always)]
    pub fn slice<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.start..self.end]
    }
}

impl From<Range<usize>> for Span {
    #[inline(always)]
    fn from(range: Range<usize>) -> Self {
        Span {
            start: range.start,
            end: range.end,
        }
    }
}

impl From<Span> for Range<usize> {
    #[inline(always)]
    fn from(span: Span) -> Self {
        span.start..span.end
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// One macro parameter: a view into the buffer it was captured from.
#[derive(Clone)]
pub struct ParamSlice {
    pub text: SourceText,
    pub span: Span,
}

impl ParamSlice {
    pub fn bytes(&self) -> &[u8] {
        self.span.slice(&self.text)
    }

    pub fn len(&self) -> usize {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    /// Copies `bytes` into a buffer of its own.
    pub(crate) fn owned(bytes: &[u8]) -> ParamSlice {
        ParamSlice {
            text: Rc::from(bytes),
            span: Span::from(0..bytes.len()),
        }
    }
}

impl Debug for ParamSlice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ParamSlice")
            .field(&self.bytes().as_bstr())
            .finish()
    }
}

/// One active input context: a top-level buffer, a macro expansion, or a
/// repeat block.
pub struct Source {
    pub(crate) name: String,
    pub(crate) text: SourceText,
    /// The body this frame replays, as a range of `text`.
    pub(crate) span: Span,
    /// Read position, `span.start <= srcptr <= span.end`.
    pub(crate) srcptr: usize,
    /// 1-based line counter, reset to 0 on push and on repeat restart.
    pub(crate) line: u32,
    /// Buffer of the line most recently materialized from this frame.
    /// Dropped the moment the frame is popped.
    pub(crate) linebuf: Vec<u8>,
    /// Unique id, expanded by `\@`.
    pub(crate) id: u64,
    /// Remaining replays of the body; 1 means run once.
    pub(crate) repeat: i64,
    /// Current repeat iteration, published through `REPTN` (1-based).
    pub(crate) reptn: i64,
    /// The parent's `CARG` expression, saved while a macro invoked from
    /// this frame runs and restored when control returns here.
    pub(crate) cargexp: Option<Expr>,
    /// Number of macro parameters; -1 when this frame is not a macro
    /// expansion.
    pub(crate) num_params: i32,
    pub(crate) params: Vec<Option<ParamSlice>>,
    /// Named-argument list of the macro being expanded, shared with it.
    pub(crate) param_names: Option<Rc<Vec<Vec<u8>>>>,
    /// Conditional-assembly nesting at invocation, kept for the caller.
    pub(crate) cond_level: i32,
}

impl Source {
    pub(crate) fn new(name: String, text: SourceText, span: Span, id: u64) -> Source {
        debug_assert!(span.end <= text.len(), "span outside the backing buffer");
        Source {
            name,
            text,
            span,
            srcptr: span.start,
            line: 0,
            linebuf: Vec::with_capacity(MAXLINELENGTH),
            id,
            repeat: 1,
            reptn: 0,
            cargexp: None,
            num_params: -1,
            params: vec![None; MAXMACPARAMS],
            param_names: None,
            cond_level: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current 1-based line number.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Whether this frame expands a macro (directly or via an inherited
    /// repeat block).
    pub fn is_macro_expansion(&self) -> bool {
        self.num_params >= 0
    }

    /// Length of parameter `n` in bytes; 0 when it was never set.
    pub(crate) fn param_len(&self, n: usize) -> usize {
        self.params
            .get(n)
            .and_then(|p| p.as_ref())
            .map_or(0, ParamSlice::len)
    }
}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("span", &self.span)
            .field("srcptr", &self.srcptr)
            .field("line", &self.line)
            .field("id", &self.id)
            .field("repeat", &self.repeat)
            .field("num_params", &self.num_params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_defaults() {
        let text: SourceText = Rc::from(&b"line\n"[..]);
        let src = Source::new("t".to_owned(), text, Span::from(0..5), 7);
        assert_eq!(src.line(), 0);
        assert_eq!(src.repeat, 1);
        assert_eq!(src.reptn, 0);
        assert!(!src.is_macro_expansion());
        assert_eq!(src.param_len(3), 0);
    }

    #[test]
    fn param_slices_alias_their_buffer() {
        let text: SourceText = Rc::from(&b"r0,r1"[..]);
        let p = ParamSlice {
            text: text.clone(),
            span: Span::from(3..5),
        };
        assert_eq!(p.bytes(), b"r1");
        assert_eq!(p.len(), 2);
    }
}
