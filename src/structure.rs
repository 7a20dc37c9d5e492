// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! Structure capture, compilation, and instantiation.
//!
//! A structure body is captured like a macro body, then compiled eagerly
//! into an ordered field list: `id type [= default]` or
//! `id type[N] [= element, element, ...]` per line. Registration defines
//! the structure name as its byte size and one offset label per field.

use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;

use bstr::{BStr, BString, ByteSlice};
use tracing::debug;

use crate::atom::{Atom, DBlock};
use crate::diag::PreprocError;
use crate::expr::{self, number_expr};
use crate::prepro::Preprocessor;
use crate::scan::{self, byte_at, DirList};
use crate::source::{SourceText, Span};
use crate::symbol::make_local_label;

/// One declared slot of a structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructField {
    pub name: BString,
    /// Size in bits, always a multiple of 8.
    pub bitsize: u32,
    pub content: FieldDefault,
}

/// A field's default value, doubling as the array marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldDefault {
    Value(i64),
    Array(Vec<u8>),
}

impl StructField {
    pub fn is_array(&self) -> bool {
        matches!(self.content, FieldDefault::Array(_))
    }
}

/// A registered structure. Immutable once compiled.
pub struct Structure {
    pub(crate) name: BString,
    pub(crate) text: SourceText,
    pub(crate) span: Span,
    pub(crate) fields: Vec<StructField>,
    /// Total size in bits.
    pub(crate) length: u32,
}

impl Structure {
    pub fn name(&self) -> &BStr {
        self.name.as_bstr()
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    /// Total size in bytes.
    pub fn byte_length(&self) -> u32 {
        self.length / 8
    }
}

impl Debug for Structure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Structure")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("length", &self.length)
            .finish()
    }
}

impl Preprocessor {
    /// Opens a structure capture ending at a directive from `enddirs`.
    ///
    /// # Panics
    ///
    /// Panics when a macro definition is open, a capture is already
    /// active, or no source has been pushed; those are caller bugs.
    pub fn new_structure(&mut self, name: &[u8], enddirs: DirList, args: Option<&[u8]>) {
        assert!(
            self.cur_macro.is_none(),
            "structure opened inside a macro definition",
        );
        assert!(
            self.cur_struct.is_none() && !self.stack.is_empty() && self.enddir.is_none(),
            "structure opened inside an active capture",
        );
        let mut st_name = BString::from(name);
        if self.options.nocase_structure {
            st_name.make_ascii_lowercase();
        }
        let cur = self.cur();
        let st = Structure {
            name: st_name,
            text: cur.text.clone(),
            span: Span {
                start: cur.srcptr,
                end: cur.srcptr,
            },
            fields: Vec::new(),
            length: 0,
        };
        self.enddir = Some(enddirs);
        self.rept_cnt = -1;
        // TODO: interpret structure definition arguments; they are
        // accepted and discarded for now.
        let _ = args;
        self.cur_struct = Some(st);
    }

    /// The bit size the syntax module assigns to a field type name: `None`
    /// for an unknown type, 0 for a count-sized array type.
    fn bitsize_of_type(&self, name: &[u8]) -> Option<i64> {
        self.syntax
            .structure_types()
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .map(|t| t.bitlen as i64)
    }

    /// Commits the structure being captured: compiles the body ending at
    /// `end` into fields and defines the size and offset symbols. On a
    /// field error the structure is registered with the fields compiled so
    /// far and no symbols are defined.
    pub(crate) fn add_structure(&mut self, end: usize) {
        let mut st = self.cur_struct.take().expect("no open structure definition");
        st.span.end = end;
        let text = st.text.clone();
        let mut inner = st.span.start;
        let mut failed = false;

        while inner < end {
            if scan::is_space(byte_at(&text, inner)) {
                self.diagnostics.report(PreprocError::IdentifierExpected);
                failed = true;
                break;
            }
            let id = match scan::parse_identifier(&text, &mut inner, self.syntax.as_ref()) {
                Some(id) => BString::from(id),
                None => {
                    self.diagnostics.report(PreprocError::IdentifierExpected);
                    failed = true;
                    break;
                }
            };
            if st.fields.iter().any(|f| f.name.eq_ignore_ascii_case(&id)) {
                self.diagnostics
                    .report(PreprocError::DuplicateField(id, st.name.clone()));
                failed = true;
                break;
            }

            inner = scan::skip_blanks(&text, inner);
            let type_name = match scan::parse_identifier(&text, &mut inner, self.syntax.as_ref()) {
                Some(t) => BString::from(t),
                None => {
                    self.diagnostics
                        .report(PreprocError::UnknownType(BString::from("")));
                    failed = true;
                    break;
                }
            };
            let mut bitsize = match self.bitsize_of_type(&type_name) {
                Some(b) => b,
                None => {
                    self.diagnostics.report(PreprocError::UnknownType(type_name));
                    failed = true;
                    break;
                }
            };

            let mut defscnt = 0i64;
            let mut array_content: Option<Vec<u8>> = None;
            if bitsize == 0 {
                // Sized by an explicit element count.
                inner = scan::skip_blanks(&text, inner);
                if byte_at(&text, inner) == b'[' {
                    inner += 1;
                }
                if matches!(byte_at(&text, inner), b'\r' | b'\n' | 0) {
                    self.diagnostics
                        .report(PreprocError::MissingArraySize(type_name));
                    failed = true;
                    break;
                }
                let backup = inner;
                defscnt =
                    expr::parse_constexpr(&text, &mut inner, &self.symbols, &mut self.diagnostics);
                inner = scan::skip_eol(&text, backup, inner);
                if byte_at(&text, inner) == b']' {
                    inner += 1;
                }
                defscnt = defscnt.max(0);
                bitsize = 8 * defscnt;
                array_content = Some(vec![0u8; defscnt as usize]);
            }

            st.length += bitsize as u32;

            // Optional default value after an optional '='.
            inner = scan::skip_blanks(&text, inner);
            if byte_at(&text, inner) == b'=' {
                inner = scan::skip_blanks(&text, inner + 1);
            }
            let mut defval = 0i64;
            if !matches!(byte_at(&text, inner), b'\r' | b'\n' | 0) {
                match &mut array_content {
                    None => {
                        let backup = inner;
                        defval = expr::parse_constexpr(
                            &text,
                            &mut inner,
                            &self.symbols,
                            &mut self.diagnostics,
                        );
                        inner = scan::skip_eol(&text, backup, inner);
                        while matches!(byte_at(&text, inner), b'\r' | b'\n') {
                            inner += 1;
                        }
                    }
                    Some(content) => {
                        // Comma-separated strings and byte constants, up to
                        // the declared element count.
                        let mut filled = 0usize;
                        while filled < defscnt as usize {
                            let c = byte_at(&text, inner);
                            if matches!(c, b'\r' | b'\n' | 0) {
                                break;
                            }
                            if c == b'\'' || c == b'"' {
                                match scan::parse_string(
                                    &text,
                                    &mut inner,
                                    c,
                                    8,
                                    self.options.esc_sequences,
                                    &mut self.diagnostics,
                                ) {
                                    Some(db) => {
                                        if filled + db.size() > defscnt as usize {
                                            self.diagnostics.report(PreprocError::SizeMismatch);
                                            failed = true;
                                            break;
                                        }
                                        content[filled..filled + db.size()]
                                            .copy_from_slice(&db.data);
                                        filled += db.size();
                                    }
                                    None => {
                                        self.diagnostics.report(PreprocError::StringExpected);
                                        failed = true;
                                        break;
                                    }
                                }
                            } else {
                                let byte = expr::parse_constexpr(
                                    &text,
                                    &mut inner,
                                    &self.symbols,
                                    &mut self.diagnostics,
                                );
                                if !(0..=255).contains(&byte) {
                                    self.diagnostics.report(PreprocError::SizeMismatch);
                                    failed = true;
                                    break;
                                }
                                content[filled] = byte as u8;
                                filled += 1;
                            }
                            inner = scan::skip_blanks(&text, inner);
                            if byte_at(&text, inner) == b',' {
                                inner = scan::skip_blanks(&text, inner + 1);
                            } else {
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                        while matches!(byte_at(&text, inner), b'\r' | b'\n') {
                            inner += 1;
                        }
                    }
                }
            } else {
                // No default: step over the line end.
                if byte_at(&text, inner) == b'\r' && byte_at(&text, inner + 1) == b'\n' {
                    inner += 1;
                }
                inner += 1;
            }

            st.fields.push(StructField {
                name: id,
                bitsize: bitsize as u32,
                content: match array_content {
                    Some(content) => FieldDefault::Array(content),
                    None => FieldDefault::Value(defval),
                },
            });
        }

        debug!(name = %st.name, fields = st.fields.len(), "structure defined");

        if !failed {
            // The structure name is its size in bytes; each field gets an
            // offset label "<structname>.<fieldname>".
            self.symbols
                .new_abs(st.name.clone(), number_expr((st.length / 8) as i64));
            let mut base = 0i64;
            for field in &st.fields {
                let mut local = BString::from(".");
                local.extend_from_slice(&field.name);
                let full = make_local_label(&st.name, &local);
                self.symbols.new_abs(full, number_expr(base));
                base += (field.bitsize / 8) as i64;
            }
        }

        self.structs.insert(st.name.clone(), Rc::new(st));
    }

    /// Looks up a registered structure.
    pub fn find_struct(&self, name: &[u8]) -> Option<&Structure> {
        if self.options.nocase_structure {
            let key = name.to_ascii_lowercase();
            self.structs.get(BStr::new(&key)).map(Rc::as_ref)
        } else {
            self.structs.get(BStr::new(name)).map(Rc::as_ref)
        }
    }

    /// Instantiates a structure: one atom per field, each consuming one
    /// comma-separated value from the operand tail `ops` and falling back
    /// to the field default. Returns `false` only when `name` is not a
    /// structure; field errors are reported and abandon the remainder.
    pub fn execute_struct(&mut self, name: &[u8], ops: &[u8]) -> bool {
        let st = if self.options.nocase_structure {
            let key = name.to_ascii_lowercase();
            match self.structs.get(BStr::new(&key)) {
                Some(st) => st.clone(),
                None => return false,
            }
        } else {
            match self.structs.get(BStr::new(name)) {
                Some(st) => st.clone(),
                None => return false,
            }
        };

        let mut s = scan::skip_blanks(ops, 0);
        for field in &st.fields {
            let atom;
            match &field.content {
                FieldDefault::Value(defval) => {
                    if matches!(byte_at(ops, s), 0 | b',') {
                        // No more values, or an empty one: use the default.
                        atom = Atom::Space {
                            count: number_expr(1),
                            element_size: field.bitsize / 8,
                            fill: number_expr(*defval),
                        };
                    } else {
                        let start = s;
                        s = self.syntax.skip_operand(ops, s);
                        let mut pos = start;
                        match expr::parse_expr(&ops[..s], &mut pos) {
                            Some(value) => {
                                atom = Atom::DataDef {
                                    bitsize: field.bitsize,
                                    value,
                                };
                            }
                            None => {
                                self.diagnostics.report(PreprocError::BadOperand);
                                return true;
                            }
                        }
                    }
                }
                FieldDefault::Array(default) => {
                    let size = (field.bitsize / 8) as usize;
                    if matches!(byte_at(ops, s), 0 | b',') {
                        atom = Atom::Data(DBlock {
                            data: default.clone(),
                        });
                    } else {
                        s = scan::skip_blanks(ops, s);
                        let c = byte_at(ops, s);
                        if c != b'"' && c != b'\'' {
                            self.diagnostics.report(PreprocError::StringExpected);
                            return true;
                        }
                        let mut db = match scan::parse_string(
                            ops,
                            &mut s,
                            c,
                            8,
                            self.options.esc_sequences,
                            &mut self.diagnostics,
                        ) {
                            Some(db) => db,
                            None => {
                                self.diagnostics.report(PreprocError::SizeMismatch);
                                return true;
                            }
                        };
                        // Further elements may extend the value up to the
                        // field size.
                        while db.size() < size {
                            s = scan::skip_blanks(ops, s);
                            if byte_at(ops, s) != b',' {
                                break;
                            }
                            s = scan::skip_blanks(ops, s + 1);
                            let c = byte_at(ops, s);
                            if c == b'"' || c == b'\'' {
                                match scan::parse_string(
                                    ops,
                                    &mut s,
                                    c,
                                    8,
                                    self.options.esc_sequences,
                                    &mut self.diagnostics,
                                ) {
                                    Some(more) => db.data.extend_from_slice(&more.data),
                                    None => {
                                        self.diagnostics.report(PreprocError::StringExpected);
                                        return true;
                                    }
                                }
                            } else if matches!(c, 0 | b'\r' | b'\n') {
                                break;
                            } else {
                                let byte = expr::parse_constexpr(
                                    ops,
                                    &mut s,
                                    &self.symbols,
                                    &mut self.diagnostics,
                                );
                                if !(0..=255).contains(&byte) {
                                    self.diagnostics.report(PreprocError::SizeMismatch);
                                    return true;
                                }
                                db.data.push(byte as u8);
                            }
                        }
                        if db.size() != size {
                            self.diagnostics.report(PreprocError::SizeMismatch);
                            return true;
                        }
                        atom = Atom::Data(db);
                    }
                }
            }
            self.atoms.push(atom);

            s = scan::skip_blanks(ops, s);
            if byte_at(ops, s) == b',' {
                s = scan::skip_blanks(ops, s + 1);
            }
            // TODO: flag values left over after the last field instead of
            // ignoring them.
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::prepro::Preprocessor;

    fn ends() -> DirList {
        DirList::new(["ends"])
    }

    fn next(p: &mut Preprocessor) -> Option<Vec<u8>> {
        p.read_next_line().map(|l| l.to_vec())
    }

    /// Runs the pump over `src` until the structure on its first line has
    /// been captured and compiled.
    fn compile(src: &str) -> Preprocessor {
        let mut p = Preprocessor::default();
        p.push_source("t", src);
        let first = next(&mut p).unwrap();
        let name = first.trim().split(|&b| b == b' ').next().unwrap().to_vec();
        p.new_structure(&name, ends(), None);
        next(&mut p).unwrap();
        p
    }

    #[test]
    fn compiles_fields_and_defines_offsets() {
        let mut p = compile("s struct\na w = 7\nb b[3] = \"ab\",0\n ends\n");
        let st = p.find_struct(b"s").unwrap();
        assert_eq!(st.byte_length(), 5);
        assert_eq!(st.fields().len(), 2);
        assert_eq!(st.fields()[0].bitsize, 16);
        assert_eq!(st.fields()[0].content, FieldDefault::Value(7));
        assert_eq!(st.fields()[1].bitsize, 24);
        assert_eq!(
            st.fields()[1].content,
            FieldDefault::Array(vec![b'a', b'b', 0]),
        );
        assert_eq!(p.symbols().value_of(b"s"), Some(5));
        assert_eq!(p.symbols().value_of(b"s.a"), Some(0));
        assert_eq!(p.symbols().value_of(b"s.b"), Some(2));
        assert!(p.diagnostics().is_empty());

        assert!(p.execute_struct(b"s", b"9, \"xy\",0"));
        assert_eq!(
            p.atoms(),
            [
                Atom::DataDef {
                    bitsize: 16,
                    value: Expr::Num(9),
                },
                Atom::Data(DBlock {
                    data: vec![b'x', b'y', 0],
                }),
            ],
        );
        assert!(p.diagnostics().is_empty());
    }

    #[test]
    fn missing_values_fall_back_to_defaults() {
        let mut p = compile("s struct\na w = 7\nb b[3] = \"ab\",0\n ends\n");
        assert!(p.execute_struct(b"s", b""));
        assert_eq!(
            p.atoms(),
            [
                Atom::Space {
                    count: Expr::Num(1),
                    element_size: 2,
                    fill: Expr::Num(7),
                },
                Atom::Data(DBlock {
                    data: vec![b'a', b'b', 0],
                }),
            ],
        );
    }

    #[test]
    fn scalar_without_default_is_zero() {
        let p = compile("s struct\na w\nb l\n ends\n");
        let st = p.find_struct(b"s").unwrap();
        assert_eq!(st.byte_length(), 6);
        assert_eq!(st.fields()[0].content, FieldDefault::Value(0));
        assert_eq!(p.symbols().value_of(b"s.b"), Some(2));
    }

    #[test]
    fn unknown_struct_is_a_clean_miss() {
        let mut p = Preprocessor::default();
        p.push_source("t", "x\n");
        next(&mut p).unwrap();
        assert!(!p.execute_struct(b"nope", b""));
        assert!(p.atoms().is_empty());
    }

    #[test]
    fn duplicate_field_reports_25() {
        let p = compile("s struct\na w\nA w\n ends\n");
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [25]);
        // Registered, but without symbols.
        assert!(p.find_struct(b"s").is_some());
        assert_eq!(p.symbols().value_of(b"s"), None);
    }

    #[test]
    fn unknown_type_reports_24() {
        let p = compile("s struct\na quux\n ends\n");
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [24]);
    }

    #[test]
    fn leading_whitespace_reports_10() {
        let p = compile("s struct\n a w\n ends\n");
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [10]);
    }

    #[test]
    fn array_without_count_reports_49() {
        let p = compile("s struct\na b\n ends\n");
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [49]);
    }

    #[test]
    fn array_default_overflow_reports_51() {
        let p = compile("s struct\na b[2] = \"abc\"\n ends\n");
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [51]);
    }

    #[test]
    fn array_value_of_wrong_size_reports_51() {
        let mut p = compile("s struct\na b[3] = \"ab\",0\n ends\n");
        assert!(p.execute_struct(b"s", b"\"wrong\""));
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [51]);
        assert!(p.atoms().is_empty());
    }

    #[test]
    fn array_value_must_be_a_string() {
        let mut p = compile("s struct\na b[3] = \"ab\",0\n ends\n");
        assert!(p.execute_struct(b"s", b"123"));
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [50]);
    }

    #[test]
    fn excess_values_are_silently_ignored() {
        let mut p = compile("s struct\na w\n ends\n");
        assert!(p.execute_struct(b"s", b"1, 2, 3"));
        assert_eq!(p.atoms().len(), 1);
        assert!(p.diagnostics().is_empty());
    }

    #[test]
    fn missing_endstruct_reports_48() {
        let mut p = Preprocessor::default();
        p.push_source("t", "s struct\na w\nb w\n");
        next(&mut p).unwrap();
        p.new_structure(b"s", ends(), None);
        while next(&mut p).is_some() {}
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [48]);
    }
}
