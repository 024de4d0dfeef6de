//! WAV encoding of token images
//!
//! The download audio is stereo, 8-bit unsigned, 44.1 kHz. Each bit is a
//! far/near pulse pair followed by neutral samples; a byte is framed by a
//! 6-quanta start and an 8-quanta stop, bits emitted LSB-first with 2 quanta
//! for a 1 and none for a 0. 500 ms of silence bracket the stream and a 2 s
//! pause is inserted every 1536 bytes so the robot can flash what it heard.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const SAMPLE_RATE_HZ: u32 = 44100;
/// A quanta is half a millisecond of samples.
const SAMPLES_PER_QUANTA: u32 = SAMPLE_RATE_HZ / 2000;

const DOWNLOAD_BYTES_BETWEEN_PAUSES: usize = 1536;
const DOWNLOAD_PAUSE_MSECS: u32 = 2000;

const NEUTRAL: u8 = 128;

/// A WAV file being produced, with its resolved path.
pub struct AudioOutput {
    file: File,
    path: PathBuf,
}

impl AudioOutput {
    /// Create the output with a generated `tok*.wav` name inside `dir`.
    /// The file survives the process (it is the product, not a scratch
    /// file).
    pub fn generated(dir: &Path) -> io::Result<AudioOutput> {
        let named = tempfile::Builder::new()
            .prefix("tok")
            .suffix(".wav")
            .tempfile_in(dir)?;
        let (file, path) = named.keep().map_err(|e| e.error)?;
        Ok(AudioOutput { file, path })
    }

    /// Create the output at an explicit path.
    pub fn named(path: &Path) -> io::Result<AudioOutput> {
        Ok(AudioOutput {
            file: File::create(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode and write the whole download stream.
    pub fn write_wav(mut self, data: &[u8]) -> io::Result<()> {
        let mut frames: Vec<u8> = Vec::new();

        // 500 milliseconds (1000 quantas) of silence to settle the line
        silence(&mut frames, 1000);

        for _ in 0..SAMPLES_PER_QUANTA {
            pulse(&mut frames, 0);
        }

        let mut pause_count = 0usize;
        for byte in data {
            if pause_count == DOWNLOAD_BYTES_BETWEEN_PAUSES {
                for _ in 0..DOWNLOAD_PAUSE_MSECS {
                    pulse(&mut frames, 0);
                }
                pause_count = 0;
            }

            // start framing
            pulse(&mut frames, 6);

            let mut mask = 1u16;
            while mask <= 0x80 {
                if (*byte as u16) & mask != 0 {
                    pulse(&mut frames, 2);
                } else {
                    pulse(&mut frames, 0);
                }
                mask <<= 1;
            }

            // stop framing, longer than the start
            pulse(&mut frames, 8);

            pause_count += 1;
        }

        // trailing pulses so the tail is not clipped by the player
        for _ in 0..SAMPLES_PER_QUANTA {
            pulse(&mut frames, 0);
        }
        silence(&mut frames, 1000);

        self.write_riff(&frames)
    }

    /// A fixed full-scale alternating pattern used to test the audio path.
    pub fn write_debug_wav(mut self) -> io::Result<()> {
        let mut frames: Vec<u8> = Vec::new();
        for _ in 0..2000 {
            frames.extend_from_slice(&[255, 0, 128, 128, 0, 255, 128, 128]);
        }
        self.write_riff(&frames)
    }

    /// Write a PCM RIFF container around the interleaved stereo samples.
    fn write_riff(&mut self, frames: &[u8]) -> io::Result<()> {
        let data_len = frames.len() as u32;
        let mut header = Vec::with_capacity(44);
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&(36 + data_len).to_le_bytes());
        header.extend_from_slice(b"WAVE");
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM
        header.extend_from_slice(&2u16.to_le_bytes()); // stereo
        header.extend_from_slice(&SAMPLE_RATE_HZ.to_le_bytes());
        header.extend_from_slice(&(SAMPLE_RATE_HZ * 2).to_le_bytes()); // byte rate
        header.extend_from_slice(&2u16.to_le_bytes()); // block align
        header.extend_from_slice(&8u16.to_le_bytes()); // bits per sample
        header.extend_from_slice(b"data");
        header.extend_from_slice(&data_len.to_le_bytes());

        self.file.write_all(&header)?;
        self.file.write_all(frames)?;
        self.file.flush()
    }
}

/// One far/near pulse pair plus `mid_quantas` of neutral line.
fn pulse(frames: &mut Vec<u8>, mid_quantas: u32) {
    let total_samples = (2 + mid_quantas) * SAMPLES_PER_QUANTA;
    frames.extend_from_slice(&[255, 0]);
    frames.extend_from_slice(&[0, 255]);
    for _ in 2..total_samples {
        frames.extend_from_slice(&[NEUTRAL, NEUTRAL]);
    }
}

fn silence(frames: &mut Vec<u8>, mid_quantas: u32) {
    for _ in 0..mid_quantas * SAMPLES_PER_QUANTA {
        frames.extend_from_slice(&[NEUTRAL, NEUTRAL]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_shape() {
        let mut frames = Vec::new();
        pulse(&mut frames, 0);
        // 2 quantas of samples, stereo
        assert_eq!(frames.len(), 2 * SAMPLES_PER_QUANTA as usize * 2);
        assert_eq!(&frames[0..4], &[255, 0, 0, 255]);
        assert!(frames[4..].iter().all(|s| *s == NEUTRAL));
    }

    #[test]
    fn wav_header_and_framing() {
        let dir = tempfile::tempdir().unwrap();
        let out = AudioOutput::generated(dir.path()).unwrap();
        let path = out.path().to_path_buf();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("tok"));
        out.write_wav(&[0x01]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // stereo, 8-bit
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 2);
        assert_eq!(u16::from_le_bytes([bytes[34], bytes[35]]), 8);
        let data_len = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]) as usize;
        assert_eq!(bytes.len(), 44 + data_len);

        // one byte: silence + preamble + start(6) + bits(one 1, seven 0) +
        // stop(8) + trailer + silence, all in whole quanta pairs
        let spq = SAMPLES_PER_QUANTA as usize;
        let quanta = 1000 + 2 * spq + 8 + (2 + 2) + 7 * 2 + 10 + 2 * spq + 1000;
        assert_eq!(data_len, quanta * spq * 2);
    }

    #[test]
    fn debug_wav_is_fixed_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let out = AudioOutput::named(&dir.path().join("debug.wav")).unwrap();
        out.write_debug_wav().unwrap();
        let bytes = std::fs::read(dir.path().join("debug.wav")).unwrap();
        assert_eq!(&bytes[44..48], &[255, 0, 128, 128]);
        assert_eq!(bytes.len(), 44 + 2000 * 8);
    }
}
