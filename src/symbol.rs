// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! The slice of the symbol table the preprocessor needs: absolute symbols
//! for structure sizes and field offsets, plus the internal `CARG` and
//! `REPTN` symbols published during macro and repeat expansion.

use std::collections::HashMap;

use bstr::{BStr, BString};

use crate::expr::{Expr, number_expr};

/// Name of the internal symbol selecting the current macro parameter for the
/// `\.`/`\+`/`\-` forms.
pub const CARGSYM: &str = "CARG";
/// Name of the internal symbol publishing the current repeat iteration.
pub const REPTNSYM: &str = "REPTN";

#[derive(Debug, Default)]
pub struct SymbolTable {
    map: HashMap<BString, Expr>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Defines (or redefines) an absolute symbol.
    pub fn new_abs(&mut self, name: impl Into<BString>, value: Expr) {
        self.map.insert(name.into(), value);
    }

    /// The expression slot of an internal symbol, created as 0 on first use.
    pub fn internal_abs(&mut self, name: &str) -> &mut Expr {
        self.map
            .entry(BString::from(name))
            .or_insert_with(|| number_expr(0))
    }

    /// Sets an internal symbol to a numeric value.
    pub fn set_internal_abs(&mut self, name: &str, value: i64) {
        *self.internal_abs(name) = number_expr(value);
    }

    pub fn get(&self, name: &[u8]) -> Option<&Expr> {
        self.map.get(BStr::new(name))
    }

    /// The numeric value of a symbol, when it evaluates to one.
    pub fn value_of(&self, name: &[u8]) -> Option<i64> {
        self.get(name)?.eval(self)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Builds the label a structure field offset is defined under. The local
/// part carries its `.` separator already.
pub fn make_local_label(scope: &[u8], local: &[u8]) -> BString {
    let mut name = BString::from(scope);
    name.extend_from_slice(local);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_symbols_spring_into_existence() {
        let mut t = SymbolTable::new();
        assert_eq!(t.internal_abs(CARGSYM).as_num(), Some(0));
        t.set_internal_abs(CARGSYM, 3);
        assert_eq!(t.value_of(b"CARG"), Some(3));
    }

    #[test]
    fn local_label_concatenates() {
        assert_eq!(make_local_label(b"point", b".x"), "point.x");
    }
}
