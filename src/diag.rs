// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

use bstr::BString;
use thiserror::Error;

/// A recoverable preprocessing error.
///
/// Each variant maps to the stable numeric code the assembler front end has
/// always printed, available through [`PreprocError::code`]. Recoverable
/// errors never stop the pump; broken internal preconditions panic instead.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PreprocError {
    /// A string or argument delimiter is missing.
    #[error("{0} expected")]
    DelimiterExpected(char),
    /// A binary include could not be opened or read.
    #[error("cannot open \"{0}\"")]
    CannotOpenFile(String),
    /// A structure field record does not start with an identifier.
    #[error("identifier expected")]
    IdentifierExpected,
    /// A structure field value did not parse as an operand.
    #[error("bad operand")]
    BadOperand,
    /// A structure field names a type the syntax module does not define.
    #[error("unknown type \"{0}\"")]
    UnknownType(BString),
    #[error("missing ENDM directive in macro \"{0}\"")]
    MissingEndm(BString),
    #[error("duplicate field \"{0}\" in structure \"{1}\"")]
    DuplicateField(BString, BString),
    /// A macro definition was captured while expanding another macro.
    #[error("macro definition inside macro \"{0}\"")]
    MacroInMacro(String),
    #[error("maximum number of {0} macro arguments exceeded")]
    TooManyMacArgs(usize),
    /// `CARG` must simplify to a number before `\.`, `\+` or `\-` can use it.
    #[error("expression must be a constant")]
    NotConstant,
    #[error("missing ENDR directive")]
    MissingEndr,
    #[error("illegal escape sequence \\{0}")]
    IllegalEscape(char),
    #[error("no current macro to exit")]
    NoMacroToExit,
    #[error("id stack overflow")]
    IdStackOverflow,
    #[error("id pull without matching push")]
    IdPullWithoutPush,
    #[error("illegal macro argument")]
    IllegalMacroArg,
    #[error("id insert on empty stack")]
    IdInsertOnEmptyStack,
    #[error("bad file-offset argument")]
    BadFileOffset,
    #[error("missing ENDSTRUCT directive")]
    MissingEndstruct,
    /// An array field was declared without an element count.
    #[error("array field \"{0}\" needs an element count")]
    MissingArraySize(BString),
    #[error("expected a string")]
    StringExpected,
    #[error("size mismatch")]
    SizeMismatch,
}

impl PreprocError {
    /// The numeric code this error is reported under.
    pub fn code(&self) -> u32 {
        match self {
            PreprocError::DelimiterExpected(_) => 6,
            PreprocError::IdentifierExpected => 10,
            PreprocError::CannotOpenFile(_) => 12,
            PreprocError::BadOperand | PreprocError::UnknownType(_) => 24,
            PreprocError::MissingEndm(_) | PreprocError::DuplicateField(..) => 25,
            PreprocError::MacroInMacro(_) => 26,
            PreprocError::TooManyMacArgs(_) => 27,
            PreprocError::NotConstant => 30,
            PreprocError::MissingEndr => 32,
            PreprocError::IllegalEscape(_) => 35,
            PreprocError::NoMacroToExit => 36,
            PreprocError::IdStackOverflow => 39,
            PreprocError::IdPullWithoutPush => 40,
            PreprocError::IllegalMacroArg => 42,
            PreprocError::IdInsertOnEmptyStack => 45,
            PreprocError::BadFileOffset => 46,
            PreprocError::MissingEndstruct => 48,
            PreprocError::MissingArraySize(_) => 49,
            PreprocError::StringExpected => 50,
            PreprocError::SizeMismatch => 51,
        }
    }
}

/// One reported error and the source position it was detected at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub error: PreprocError,
    /// Name of the source frame that was current at the time.
    pub source: String,
    /// 1-based line within that frame; 0 when no line was being read yet.
    pub line: u32,
}

/// Collects recoverable errors so the pump can keep running after one.
#[derive(Debug, Default)]
pub struct Diagnostics {
    source: String,
    line: u32,
    reported: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    /// Records where subsequently reported errors are attributed.
    pub(crate) fn set_location(&mut self, source: &str, line: u32) {
        if self.source != source {
            self.source = source.to_owned();
        }
        self.line = line;
    }

    pub(crate) fn report(&mut self, error: PreprocError) {
        tracing::debug!(code = error.code(), %error, source = %self.source, line = self.line);
        self.reported.push(Diagnostic {
            error,
            source: self.source.clone(),
            line: self.line,
        });
    }

    /// All diagnostics reported so far, in order of detection.
    pub fn reported(&self) -> &[Diagnostic] {
        &self.reported
    }

    /// The numeric codes reported so far, in order of detection.
    pub fn codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.reported.iter().map(|d| d.error.code())
    }

    pub fn is_empty(&self) -> bool {
        self.reported.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reported.len()
    }

    /// Removes and returns everything reported so far.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PreprocError::DelimiterExpected('"').code(), 6);
        assert_eq!(PreprocError::MissingEndm("m".into()).code(), 25);
        assert_eq!(PreprocError::DuplicateField("a".into(), "s".into()).code(), 25);
        assert_eq!(PreprocError::MissingEndr.code(), 32);
        assert_eq!(PreprocError::MissingEndstruct.code(), 48);
        assert_eq!(PreprocError::SizeMismatch.code(), 51);
    }

    #[test]
    fn reports_carry_location() {
        let mut diag = Diagnostics::new();
        diag.set_location("a.s", 3);
        diag.report(PreprocError::NoMacroToExit);
        assert_eq!(
            diag.reported(),
            [Diagnostic {
                error: PreprocError::NoMacroToExit,
                source: "a.s".to_owned(),
                line: 3,
            }],
        );
    }
}
