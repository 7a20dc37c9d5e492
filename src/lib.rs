// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! Assembler source preprocessor: expands macro invocations, repeat blocks,
//! and structure definitions into a stream of logical lines.
//!
//! The entry point is [`Preprocessor`]. Push a source buffer with
//! [`Preprocessor::push_source`], then pump [`Preprocessor::read_next_line`]
//! until it returns `None`. Directive recognition is the caller's job (the
//! syntax module): between lines it drives definition capture and expansion
//! through [`Preprocessor::new_macro`], [`Preprocessor::new_structure`],
//! [`Preprocessor::new_repeat`], [`Preprocessor::execute_macro`], and
//! [`Preprocessor::execute_struct`].
//!
//! Recoverable errors are collected in [`Diagnostics`] rather than aborting
//! the pump, so a single pass surfaces as many errors as possible.

pub mod atom;
pub mod diag;
pub mod expr;
pub mod scan;
pub mod source;
pub mod symbol;
pub mod syntax;

mod binfile;
mod macros;
mod prepro;
mod structure;

pub use diag::{Diagnostic, Diagnostics, PreprocError};
pub use macros::Macro;
pub use prepro::{Listing, Options, Preprocessor};
pub use scan::DirList;
pub use structure::{FieldDefault, StructField, Structure};
pub use syntax::{StdSyntax, Syntax, TypeLen};

/// Capacity of a materialized line buffer; expanded lines are truncated to
/// one byte less.
pub const MAXLINELENGTH: usize = 4096;
/// Size of the per-expansion parameter array (`\0`..`\9`, optionally up to
/// `\a`..`\z`).
pub const MAXMACPARAMS: usize = 36;
/// Depth of the unique-id stack driven by the `\@!`/`\@?`/`\@@` forms.
pub const IDSTACKSIZE: usize = 100;
/// Bytes of each expanded line recorded in the listing.
pub const MAXLISTSRC: usize = 120;

// `\0`..`\9` plus `\a`..`\z` is all the parameter syntax can address.
static_assertions::const_assert!(MAXMACPARAMS <= 36);
static_assertions::const_assert!(MAXLISTSRC <= MAXLINELENGTH);
