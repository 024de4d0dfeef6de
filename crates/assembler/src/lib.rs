//! Token assembler for Edison robot images
//!
//! Takes an assembler listing (generated by the compiler or written by
//! hand), lays out variables, resolves jumps and produces the loadable
//! byte image: header + token stream, optionally wrapped in the two-byte
//! version preamble and encoded as a WAV.

pub mod asm;
pub mod audio;
pub mod lexer;
pub mod tokens;

pub use asm::Assembler;
pub use audio::AudioOutput;
pub use tokens::{DownloadType, TokenAnalyser, TokenStream};

use edc_core::diag::{self, DiagSink, Kind};
use edc_core::program::StageError;
use std::path::Path;

/// A finished assembly: the image is `header ++ tokens ++ padding`.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub bytes: Vec<u8>,
    pub download_type: DownloadType,
    pub version: (u8, u8),
}

impl Assembled {
    /// The 2-byte version preamble prepended to every downloaded artifact.
    pub fn preamble(&self) -> [u8; 2] {
        let version_byte = (self.version.0 << 4) | self.version.1;
        [version_byte, 255 - version_byte]
    }

    /// Preamble plus image, ready to download.
    pub fn download_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len() + 2);
        out.extend_from_slice(&self.preamble());
        out.extend_from_slice(&self.bytes);
        out
    }
}

/// Assemble in-memory listing lines (the compiler's path into the
/// assembler).
pub fn assemble_lines(
    lines: &[String],
    base_dir: &Path,
    debug: bool,
    diag: &mut DiagSink,
) -> Result<Assembled, StageError> {
    diag.top(Kind::AsmStart, &[]);
    diag.set_error_context(2, &format!("Assembling {} lines", lines.len()));

    let mut assembler = Assembler::with_base_dir(base_dir);
    for line in lines {
        assembler.assemble_line(line, diag)?;
    }
    finish_assembly(assembler, debug, diag)
}

/// Assemble a listing file; `INSERT TOKENS` directives are expanded by a
/// line preprocessor before anything is lexed.
pub fn assemble_file(path: &Path, debug: bool, diag: &mut DiagSink) -> Result<Assembled, StageError> {
    diag.top(Kind::AsmStart, &[]);
    diag.set_error_context(2, &format!("reading token file: {}", path.display()));

    let mut lines = Vec::new();
    collect_lines(path, &mut lines, 0, diag)?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut assembler = Assembler::with_base_dir(base_dir);
    for line in &lines {
        assembler.assemble_line(line, diag)?;
    }
    finish_assembly(assembler, debug, diag)
}

fn collect_lines(
    path: &Path,
    out: &mut Vec<String>,
    depth: usize,
    diag: &mut DiagSink,
) -> Result<(), StageError> {
    if depth > 16 {
        return Err(tokens::asm_error(diag, 76, "INSERT TOKENS nesting too deep"));
    }
    let body = std::fs::read_to_string(path).map_err(|_| {
        diag.error(Kind::FileOpenError, &[&path.display()]);
        StageError::Assemble
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    for line in body.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() >= 3 && words[0] == "INSERT" && words[1].eq_ignore_ascii_case("tokens") {
            let inserted = dir.join(words[2].trim_matches(','));
            collect_lines(&inserted, out, depth + 1, diag)?;
        } else {
            out.push(line.to_string());
        }
    }
    Ok(())
}

fn finish_assembly(
    mut assembler: Assembler,
    debug: bool,
    diag: &mut DiagSink,
) -> Result<Assembled, StageError> {
    let stream = std::mem::replace(&mut assembler.stream, TokenStream::new());
    let mut analysis = TokenAnalyser::new(stream);

    analysis.map_all_variables(diag)?;

    if debug && !diag.was_error_raised() {
        assembler.lexer.dump_reg_help();
        dump_variable_map(&analysis);
    }

    analysis.fixup_jumps(diag)?;

    if debug && !diag.was_error_raised() {
        analysis.stream.dump_tokens();
    }

    let (download_type, version, header, added_bytes) = analysis.create_header(diag)?;

    let mut bytes = header;
    for t in &mut analysis.stream.tokens {
        bytes.extend_from_slice(t.bits());
    }
    bytes.extend(std::iter::repeat(0xff).take(added_bytes));

    if diag.dump_mask() & diag::dump::BINARY != 0 {
        println!("final image ({} bytes):", bytes.len());
        for chunk in bytes.chunks(16) {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            println!("{}", hex.join(" "));
        }
    }

    Ok(Assembled {
        bytes,
        download_type,
        version,
    })
}

fn dump_variable_map(analysis: &TokenAnalyser) {
    println!("\nDumping variable maps:\n");
    for space in 0..2 {
        println!("Space: {}", tokens::SPACE_NAMES[space]);
        for (name, (start, length)) in &analysis.name_space_map[space] {
            if *length == 1 {
                println!("{:>10} at {}", name, start);
            } else {
                println!("{:>10} at {}-{}", name, start, start + length - 1);
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edc_core::diag::Level;
    use std::io::Write;

    fn diag() -> DiagSink {
        let mut d = DiagSink::new();
        d.set_max_level(Level::Error);
        d
    }

    fn lines(src: &[&str]) -> Vec<String> {
        src.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn minimal_program_image() {
        let mut d = diag();
        let asm = assemble_lines(
            &lines(&["VERSION 6, 0", "BEGIN MAIN", "stop", "END MAIN", "FINISH"]),
            Path::new("."),
            false,
            &mut d,
        )
        .unwrap();

        assert_eq!(asm.download_type, DownloadType::Program);
        assert_eq!(asm.version, (6, 0));
        // header: len(2) crc(2) bmax wmax main(2) end-marker(2), then stop
        assert_eq!(asm.bytes.len(), 11);
        assert_eq!(asm.bytes[4], 0); // no byte vars
        assert_eq!(asm.bytes[5], 0); // no word vars
        // main offset: full header is 10 bytes
        assert_eq!(&asm.bytes[6..8], &[0, 10]);
        assert_eq!(asm.bytes[10], 0xff);
        // length covers everything after len+crc
        assert_eq!(&asm.bytes[0..2], &[0, 7]);
        // crc over bytes 4..
        let crc = tokens::calculate_crc(&asm.bytes[4..]);
        assert_eq!(&asm.bytes[2..4], &[(crc >> 8) as u8, (crc & 0xff) as u8]);
        assert_eq!(asm.preamble(), [0x60, 0x9f]);
    }

    #[test]
    fn event_sections_land_in_header() {
        let mut d = diag();
        let asm = assemble_lines(
            &lines(&[
                "VERSION 6, 0",
                "DEVICE beeper, 6, SOUNDER1",
                "BEGIN MAIN",
                "stop",
                "END MAIN",
                "BEGIN EVENT %SOUNDER1:status, 4, 4",
                "stop",
                "END EVENT",
                "FINISH",
            ]),
            Path::new("."),
            false,
            &mut d,
        )
        .unwrap();

        // header: 8 fixed + one 5-byte event entry + 2 terminator
        let header_len = 15;
        assert_eq!(&asm.bytes[6..8], &[0, header_len]); // main at header end
        // event entry: offset points past main's single stop token
        assert_eq!(&asm.bytes[8..10], &[0, header_len + 1]);
        assert_eq!(&asm.bytes[10..13], &[0x60, 4, 4]);
        assert_eq!(&asm.bytes[13..15], &[0, 0]);
    }

    #[test]
    fn assembly_is_deterministic() {
        let src = lines(&[
            "VERSION 6, 0",
            "BEGIN MAIN",
            "DATW a, *, 3",
            "DATW b, *, 1",
            "movw $1 %_cpu:acc",
            "movw %_cpu:acc @b",
            "stop",
            "END MAIN",
            "FINISH",
        ]);
        let mut d1 = diag();
        let mut d2 = diag();
        let one = assemble_lines(&src, Path::new("."), false, &mut d1).unwrap();
        let two = assemble_lines(&src, Path::new("."), false, &mut d2).unwrap();
        assert_eq!(one.bytes, two.bytes);
    }

    #[test]
    fn insert_tokens_preprocessor_expands() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner.asm");
        let outer = dir.path().join("outer.asm");
        std::fs::File::create(&inner)
            .unwrap()
            .write_all(b"stop\n")
            .unwrap();
        std::fs::File::create(&outer)
            .unwrap()
            .write_all(b"VERSION 6, 0\nBEGIN MAIN\nINSERT TOKENS inner.asm\nEND MAIN\nFINISH\n")
            .unwrap();

        let mut d = diag();
        let asm = assemble_file(&outer, false, &mut d).unwrap();
        assert_eq!(asm.bytes[10], 0xff); // the inserted stop token
    }

    #[test]
    fn bad_crc_length_padding_applies() {
        // Fill main with enough 1-byte stop tokens that the CRC span
        // (6 header bytes + tokens) lands exactly on 254.
        let mut src = vec!["VERSION 6, 0".to_string(), "BEGIN MAIN".to_string()];
        for _ in 0..248 {
            src.push("stop".to_string());
        }
        src.push("END MAIN".to_string());
        src.push("FINISH".to_string());

        let mut d = diag();
        let asm = assemble_lines(&src, Path::new("."), false, &mut d).unwrap();
        // length field includes the pad byte
        assert_eq!(&asm.bytes[0..2], &[0, 255]);
        assert_eq!(*asm.bytes.last().unwrap(), 0xff);
        let crc = tokens::calculate_crc(&asm.bytes[4..]);
        assert_eq!(&asm.bytes[2..4], &[(crc >> 8) as u8, (crc & 0xff) as u8]);
    }
}
