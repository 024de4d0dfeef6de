//! Ed.Py compiler library
//!
//! Sequences the full pipeline: parse source (plus the embedded Ed
//! library) into three-address IR, optimise and validate it, lower it to an
//! assembler listing, and hand that to the token assembler for the final
//! byte image. Each stage reports through the shared diagnostic sink and
//! fails the pipeline by returning a stage marker.

pub mod codegen;
pub mod optimiser;
pub mod parser;
pub mod stdlib_embed;

pub use edc_asm::{Assembled, DownloadType};
pub use edc_core::diag::{DiagSink, Kind, Level, SinkKind};
pub use edc_core::program::{Program, StageError};

use std::path::Path;

/// Everything a compilation produces.
pub struct CompileArtifacts {
    pub listing: Vec<String>,
    pub assembled: Assembled,
}

impl CompileArtifacts {
    /// The image with its 2-byte version preamble, as downloaded.
    pub fn download_bytes(&self) -> Vec<u8> {
        self.assembled.download_bytes()
    }
}

/// Compile source text through to an assembler listing.
pub fn compile_to_listing(
    source: &str,
    filename: &str,
    optimise_listing: bool,
    diag: &mut DiagSink,
) -> Result<Vec<String>, StageError> {
    let mut program = Program::new();
    parser::parse_string(source, filename, &mut program, diag)?;
    optimiser::optimise(&mut program, diag)?;
    codegen::compile(&program, optimise_listing, diag)
}

/// Compile source text all the way to a token image.
pub fn compile_source(
    source: &str,
    filename: &str,
    optimise_listing: bool,
    diag: &mut DiagSink,
) -> Result<CompileArtifacts, StageError> {
    let listing = compile_to_listing(source, filename, optimise_listing, diag)?;
    let assembled = edc_asm::assemble_lines(&listing, Path::new("."), false, diag)?;
    Ok(CompileArtifacts { listing, assembled })
}

/// Compile a source file (the `compile` front-end path).
pub fn compile_file(
    path: &Path,
    optimise_listing: bool,
    diag: &mut DiagSink,
) -> Result<CompileArtifacts, StageError> {
    let source = std::fs::read_to_string(path).map_err(|_| {
        diag.error(Kind::FileOpenError, &[&path.display()]);
        StageError::Parse
    })?;
    compile_source(&source, &path.display().to_string(), optimise_listing, diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edc_asm::tokens::calculate_crc;

    const PREAMBLE: &str = "import Ed\n\
                            Ed.EdisonVersion = Ed.V2\n\
                            Ed.DistanceUnits = Ed.CM\n\
                            Ed.Tempo = Ed.TEMPO_MEDIUM\n";

    fn quiet_diag() -> DiagSink {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Test);
        d.set_max_level(Level::Error);
        d
    }

    fn compile_ok(src: &str) -> CompileArtifacts {
        let mut d = quiet_diag();
        compile_source(src, "test.py", true, &mut d).expect("compilation should succeed")
    }

    fn compile_fail(src: &str) -> u32 {
        let mut d = quiet_diag();
        assert!(compile_source(src, "test.py", true, &mut d).is_err());
        d.test_lines()
            .last()
            .unwrap()
            .split(',')
            .nth(1)
            .unwrap()
            .parse()
            .unwrap()
    }

    /// Split the image into (header, body) using the recorded event count.
    fn header_len(bytes: &[u8]) -> usize {
        // fixed 8 bytes, then 5 per event entry, then the 2-byte terminator
        let mut at = 8;
        while !(bytes[at] == 0 && bytes[at + 1] == 0) {
            at += 5;
        }
        at + 2
    }

    #[test]
    fn s1_empty_main_image() {
        let art = compile_ok(&format!("{}pass\n", PREAMBLE));
        let bytes = &art.assembled.bytes;

        // event table is empty
        assert_eq!(header_len(bytes), 10);
        // main offset points at the first token after the header
        let main_offset = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
        assert_eq!(main_offset, 10);

        // body: three DAT tokens for the program variables, the tempo
        // write, and the terminating stop
        let body = &bytes[10..];
        // DATW Ed.EdisonVersion 1 1 2 -> word-space DAT, 1 value, slot 1
        assert_eq!(&body[0..4], &[0x21, 0x01, 0x00, 0x02]);
        // DATW Ed.DistanceUnits 2 1 0
        assert_eq!(&body[4..8], &[0x21, 0x02, 0x00, 0x00]);
        // DATW Ed.Tempo 3 1 250
        assert_eq!(&body[8..12], &[0x21, 0x03, 0x00, 0xfa]);
        // movw $250 %68 (the initial tempo write)
        assert_eq!(&body[12..16], &[0x6c, 0x00, 0xfa, 0x68]);
        // the executable body of an empty main is a single stop
        assert_eq!(body[16], 0xff);
        assert_eq!(body.len(), 17);

        // word space holds _CALC plus the three program variables
        assert_eq!(bytes[4], 0); // byte space untouched
        assert_eq!(bytes[5], 4);
    }

    #[test]
    fn s2_register_write_token() {
        let art = compile_ok(&format!("{}Ed.LeftLed(Ed.ON)\n", PREAMBLE));
        let bytes = &art.assembled.bytes;
        // module 11 register 1 written from the accumulator
        let window = bytes.windows(2).any(|w| w == [0x32, 0xb1]);
        assert!(window, "expected a movb-to-%b1 token in the image");
    }

    #[test]
    fn s3_break_binds_to_while() {
        let src = format!(
            "{}i = 0\nwhile i < 5:\n    i = i + 1\n    if i == 3:\n        break\n",
            PREAMBLE
        );
        let art = compile_ok(&src);
        // the same program must keep assembling to the same bytes
        let again = compile_ok(&src);
        assert_eq!(art.assembled.bytes, again.assembled.bytes);
    }

    #[test]
    fn s4_type_change_diagnostic() {
        let kind = compile_fail(&format!("{}x = 1\nx = \"ab\"\n", PREAMBLE));
        assert_eq!(kind, Kind::OptVarTypeChanged as u32);
    }

    #[test]
    fn s5_tune_string_too_long() {
        let kind = compile_fail(&format!("{}t = Ed.TuneString(4, \"abcdef\")\n", PREAMBLE));
        assert_eq!(kind, Kind::OptEdListTooLong as u32);
    }

    #[test]
    fn s6_event_header_entry() {
        let src = format!(
            "{}def onClap():\n    Ed.LeftLed(1)\nEd.RegisterEventHandler(Ed.EVENT_CLAP_DETECTED, \"onClap\")\n",
            PREAMBLE
        );
        let art = compile_ok(&src);
        let bytes = &art.assembled.bytes;

        assert_eq!(header_len(bytes), 15);
        // one event entry: offset(2), modreg, mask, value
        let offset = u16::from_be_bytes([bytes[8], bytes[9]]) as usize;
        assert!(offset > 15 && offset < bytes.len());
        // sounder is module 6, clap is status bit 2
        assert_eq!(&bytes[10..13], &[0x60, 0x04, 0x04]);
        // the wrapper at that offset starts by clearing the status bit:
        // bitclr $2 %60
        assert_eq!(&bytes[offset..offset + 2], &[0x02, 0x60]);
    }

    #[test]
    fn deterministic_output() {
        let src = format!(
            "{}d = Ed.List(5)\nfor i in range(5):\n    d[i] = i * 2\nEd.PlayBeep()\n",
            PREAMBLE
        );
        let one = compile_ok(&src);
        let two = compile_ok(&src);
        assert_eq!(one.listing, two.listing);
        assert_eq!(one.assembled.bytes, two.assembled.bytes);
    }

    #[test]
    fn crc_matches_body() {
        let art = compile_ok(&format!("{}x = 3\nEd.PlayMyBeep(x)\n", PREAMBLE));
        let bytes = &art.assembled.bytes;
        let length = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let crc = u16::from_be_bytes([bytes[2], bytes[3]]);
        assert_eq!(length, bytes.len() - 4);
        assert_eq!(crc, calculate_crc(&bytes[4..]));
    }

    #[test]
    fn preamble_is_version_and_complement() {
        let art = compile_ok(&format!("{}pass\n", PREAMBLE));
        let download = art.download_bytes();
        assert_eq!(download[0], 0x60);
        assert_eq!(download[1], 0x9f);
        assert_eq!(&download[2..], &art.assembled.bytes[..]);
    }

    #[test]
    fn round_trip_listing_reassembles_identically() {
        let src = format!(
            "{}t = Ed.TuneString(4, \"abcz\")\nEd.PlayTune(t)\nwhile Ed.ReadMusicEnd() == 0:\n    pass\n",
            PREAMBLE
        );
        let art = compile_ok(&src);

        let mut d = quiet_diag();
        let re = edc_asm::assemble_lines(&art.listing, Path::new("."), false, &mut d)
            .expect("listing should reassemble");
        assert_eq!(re.bytes, art.assembled.bytes);
    }

    #[test]
    fn missing_import_fails() {
        let kind = compile_fail(
            "Ed.EdisonVersion = 2\nEd.DistanceUnits = 0\nEd.Tempo = 250\nEd.PlayBeep()\n",
        );
        assert_eq!(kind, Kind::OptMissingEdImport as u32);
    }

    #[test]
    fn classes_compile_end_to_end() {
        let src = format!(
            "{}class Counter:\n    def __init__(self):\n        self.count = 0\n    def bump(self):\n        self.count = self.count + 1\n        return self.count\nc = Counter()\nx = c.bump()\nEd.PlayMyBeep(x)\n",
            PREAMBLE
        );
        let art = compile_ok(&src);
        assert!(art.assembled.bytes.len() > 20);
        assert!(art.listing.iter().any(|l| l.contains("::_fun_Counter.bump")));
    }

    #[test]
    fn slice_write_and_read_compile() {
        let src = format!(
            "{}d = Ed.List(3, [5, 6, 7])\nx = 0\nfor v in d:\n    x = x + v\nEd.PlayMyBeep(x)\n",
            PREAMBLE
        );
        let art = compile_ok(&src);
        // list data token carries the three initial words; the data area
        // starts at word slot 4 (after _CALC and the program variables)
        let bytes = &art.assembled.bytes;
        let has_data = bytes
            .windows(8)
            .any(|w| w == [0x23, 0x04, 0x00, 0x05, 0x00, 0x06, 0x00, 0x07]);
        assert!(has_data, "expected the list initialiser DAT token");
    }

    #[test]
    fn check_only_diagnostics_flow_to_test_sink() {
        let mut d = quiet_diag();
        let _ = compile_source(
            &format!("{}t = Ed.TuneString(4, \"abcd\")\n", PREAMBLE),
            "test.py",
            true,
            &mut d,
        );
        // the tune string not ending in 'z' is a warning, not an error
        assert!(!d.was_error_raised());
    }
}
