//! Instruction and trace file helpers

use crate::error::{Result, RuntimeError};
use std::fmt::Write as _;
use std::path::Path;

/// Read a binary instruction file of little-endian 32-bit words.
pub fn load_instr_binary(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path.as_ref())?;
    if bytes.len() % 4 != 0 {
        return Err(RuntimeError::decode(
            bytes.len() / 4,
            format!("{} is {} bytes, not a whole number of words", path.as_ref().display(), bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

/// Read a text instruction file, one hexadecimal word per line.
///
/// Blank lines and lines starting with `#` are skipped; an optional `0x`
/// prefix is accepted.
pub fn load_instr_sequence(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let text = std::fs::read_to_string(path)?;
    let mut words = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let digits = line.trim_start_matches("0x").trim_start_matches("0X");
        let word = u32::from_str_radix(digits, 16)
            .map_err(|e| RuntimeError::decode(words.len(), format!("line {}: '{line}': {e}", line_no + 1)))?;
        words.push(word);
    }
    Ok(words)
}

/// Load instructions, choosing the text reader for `.txt` files.
pub fn load_instructions(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => load_instr_sequence(path),
        _ => load_instr_binary(path),
    }
}

/// Write words as a little-endian binary instruction file.
pub fn write_instr_binary(words: &[u32], path: impl AsRef<Path>) -> Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Dump a trace region as one zero-padded hex word per line.
///
/// A trailing partial word is dropped.
pub fn write_trace(trace: &[u8], path: impl AsRef<Path>) -> Result<()> {
    let mut out = String::with_capacity(trace.len() / 4 * 9);
    for w in trace.chunks_exact(4) {
        let word = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{word:08x}");
    }
    std::fs::write(path, out)?;
    Ok(())
}
