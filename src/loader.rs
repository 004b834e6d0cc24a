//! Reading LS-8 programs written as one binary literal per line.
//!
//! ```text
//! # print8.ls8
//! 10000010 # LDI R0,8
//! 00000000
//! 00001000
//! ```

use std::fs;
use std::path::Path;

use crate::error::LoadError;

pub fn parse_program(source: &str) -> Result<Vec<u8>, LoadError> {
    let mut program = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let text = match line.split_once('#') {
            Some((code, _comment)) => code,
            None => line,
        }
        .trim();
        if text.is_empty() {
            continue;
        }

        let byte = u8::from_str_radix(text, 2).map_err(|_| LoadError::InvalidLine {
            line: index + 1,
            text: text.to_string(),
        })?;
        program.push(byte);
    }

    Ok(program)
}

pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<u8>, LoadError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let program = parse_program(&source)?;
    tracing::debug!(path = %path.display(), bytes = program.len(), "parsed program");
    Ok(program)
}
