// Copyright (C) Thalia Archibald. All rights reserved.
//
// This file is part of asm-preproc, distributed under the GPL 2.0 with a
// linking exception. For the full terms, see the included COPYING file.

//! Binary file inclusion: locate a file, slice it by skip/keep, and attach
//! the bytes as a data atom.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::debug;

use crate::atom::{Atom, DBlock};
use crate::diag::PreprocError;
use crate::prepro::Preprocessor;

impl Preprocessor {
    /// Opens `name` directly or through the configured include paths.
    fn locate_file(&self, name: &str) -> Option<File> {
        if let Ok(f) = File::open(name) {
            return Some(f);
        }
        for dir in &self.options.include_paths {
            let mut path = PathBuf::from(dir);
            path.push(name);
            if let Ok(f) = File::open(&path) {
                return Some(f);
            }
        }
        None
    }

    /// Reads `[nbskip, nbskip + nbkeep)` of a binary file into a data atom.
    /// A `nbkeep` of 0, or one reaching past the end, keeps everything
    /// after the skipped prefix. A skip outside the file reports error 46;
    /// empty files are silently ignored.
    pub fn include_binary_file(&mut self, name: &str, nbskip: i64, nbkeep: u64) {
        let Some(mut f) = self.locate_file(name) else {
            self.diagnostics
                .report(PreprocError::CannotOpenFile(name.to_owned()));
            return;
        };
        let size = match f.metadata() {
            Ok(m) => m.len() as i64,
            Err(_) => {
                self.diagnostics
                    .report(PreprocError::CannotOpenFile(name.to_owned()));
                return;
            }
        };
        if size == 0 {
            return;
        }
        if nbskip < 0 || nbskip > size {
            self.diagnostics.report(PreprocError::BadFileOffset);
            return;
        }

        let avail = (size - nbskip) as u64;
        let keep = if nbkeep == 0 || nbkeep > avail {
            avail
        } else {
            nbkeep
        };
        let mut db = DBlock {
            data: vec![0u8; keep as usize],
        };
        let read = (|| {
            if nbskip > 0 {
                f.seek(SeekFrom::Start(nbskip as u64))?;
            }
            f.read_exact(&mut db.data)
        })();
        if read.is_err() {
            self.diagnostics
                .report(PreprocError::CannotOpenFile(name.to_owned()));
            return;
        }
        debug!(file = name, bytes = db.size(), "binary file included");
        self.atoms.push(Atom::Data(db));
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::prepro::{Options, Preprocessor};
    use crate::syntax::StdSyntax;

    fn write_temp(name: &str, data: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("asm-preproc-{}-{name}", std::process::id()));
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn includes_whole_file() {
        let path = write_temp("whole.bin", b"\x01\x02\x03\x04");
        let mut p = Preprocessor::default();
        p.include_binary_file(path.to_str().unwrap(), 0, 0);
        assert_eq!(
            p.atoms(),
            [Atom::Data(DBlock {
                data: vec![1, 2, 3, 4],
            })],
        );
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn skip_and_keep_select_a_slice() {
        let path = write_temp("slice.bin", b"abcdef");
        let mut p = Preprocessor::default();
        p.include_binary_file(path.to_str().unwrap(), 2, 3);
        // keep reaching past the end clamps to what is left
        p.include_binary_file(path.to_str().unwrap(), 4, 100);
        assert_eq!(
            p.atoms(),
            [
                Atom::Data(DBlock {
                    data: b"cde".to_vec(),
                }),
                Atom::Data(DBlock {
                    data: b"ef".to_vec(),
                }),
            ],
        );
        assert!(p.diagnostics().is_empty());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn bad_offset_reports_46() {
        let path = write_temp("offset.bin", b"abc");
        let mut p = Preprocessor::default();
        p.include_binary_file(path.to_str().unwrap(), 7, 0);
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [46]);
        assert!(p.atoms().is_empty());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn empty_file_is_ignored() {
        let path = write_temp("empty.bin", b"");
        let mut p = Preprocessor::default();
        p.include_binary_file(path.to_str().unwrap(), 0, 0);
        assert!(p.atoms().is_empty());
        assert!(p.diagnostics().is_empty());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_reports_12() {
        let mut p = Preprocessor::default();
        p.include_binary_file("definitely/not/here.bin", 0, 0);
        assert_eq!(p.diagnostics().codes().collect::<Vec<_>>(), [12]);
    }

    #[test]
    fn include_paths_are_searched() {
        let path = write_temp("searched.bin", b"xy");
        let dir = path.parent().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_str().unwrap().to_owned();
        let mut p = Preprocessor::new(
            Options {
                include_paths: vec![dir],
                ..Options::default()
            },
            Box::new(StdSyntax),
        );
        p.include_binary_file(&name, 0, 0);
        assert_eq!(
            p.atoms(),
            [Atom::Data(DBlock {
                data: b"xy".to_vec(),
            })],
        );
        std::fs::remove_file(path).unwrap();
    }
}
