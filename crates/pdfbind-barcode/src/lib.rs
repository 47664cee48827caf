//! Interleaved 2 of 5 barcode rendering
//!
//! Payment slips carry their numeric payment line as an ITF barcode. This
//! crate turns a digit string into a grayscale PNG suitable for stamping
//! onto a generated document as an image overlay.
//!
//! Rendering is a pure function: the same payload and options always
//! produce identical bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BarcodeError {
    #[error("barcode payload must not be empty")]
    Empty,

    #[error("barcode payload contains non-digit character '{0}'")]
    NonDigit(char),

    #[error("failed to encode barcode image: {0}")]
    Encode(String),
}

/// Rendering parameters, in pixels.
///
/// `ratio` is the wide/narrow module ratio; the ITF specification allows
/// 2.0 to 3.0, and 3 is what payment slip scanners expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarcodeOptions {
    pub narrow: u32,
    pub ratio: u32,
    pub height: u32,
    /// Quiet zone on each side, in narrow modules.
    pub quiet_zone: u32,
}

impl Default for BarcodeOptions {
    fn default() -> Self {
        Self {
            narrow: 2,
            ratio: 3,
            height: 50,
            quiet_zone: 10,
        }
    }
}

/// Wide/narrow patterns for digits 0-9. `true` is a wide element.
const PATTERNS: [[bool; 5]; 10] = [
    [false, false, true, true, false],  // 0
    [true, false, false, false, true],  // 1
    [false, true, false, false, true],  // 2
    [true, true, false, false, false],  // 3
    [false, false, true, false, true],  // 4
    [true, false, true, false, false],  // 5
    [false, true, true, false, false],  // 6
    [false, false, false, true, true],  // 7
    [true, false, false, true, false],  // 8
    [false, true, false, true, false],  // 9
];

/// A single bar or space with its width in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub bar: bool,
    pub width: u32,
}

/// Render `payload` as an Interleaved 2 of 5 barcode PNG.
///
/// Odd-length payloads are padded with a leading zero, the standard ITF
/// convention. Anything other than ASCII digits is rejected.
pub fn interleaved_2of5(payload: &str, opts: &BarcodeOptions) -> Result<Vec<u8>, BarcodeError> {
    let digits = validate(payload)?;
    let runs = module_runs(&digits, opts.narrow, opts.narrow * opts.ratio);
    render_png(&runs, opts)
}

/// Parse and validate the payload into digit values, zero-padding to an
/// even length.
fn validate(payload: &str) -> Result<Vec<u8>, BarcodeError> {
    if payload.is_empty() {
        return Err(BarcodeError::Empty);
    }
    let mut digits = Vec::with_capacity(payload.len() + 1);
    for c in payload.chars() {
        match c.to_digit(10) {
            Some(d) => digits.push(d as u8),
            None => return Err(BarcodeError::NonDigit(c)),
        }
    }
    if digits.len() % 2 != 0 {
        digits.insert(0, 0);
    }
    Ok(digits)
}

/// Expand digit pairs into the bar/space run sequence.
///
/// Start pattern: four narrow elements. Each digit pair interleaves the
/// first digit into five bars and the second into five spaces. Stop
/// pattern: wide bar, narrow space, narrow bar.
fn module_runs(digits: &[u8], narrow: u32, wide: u32) -> Vec<Run> {
    let width = |w: bool| if w { wide } else { narrow };

    let mut runs = Vec::with_capacity(4 + digits.len() * 5 + 3);
    for i in 0..4 {
        runs.push(Run {
            bar: i % 2 == 0,
            width: narrow,
        });
    }
    for pair in digits.chunks_exact(2) {
        let bars = PATTERNS[pair[0] as usize];
        let spaces = PATTERNS[pair[1] as usize];
        for i in 0..5 {
            runs.push(Run {
                bar: true,
                width: width(bars[i]),
            });
            runs.push(Run {
                bar: false,
                width: width(spaces[i]),
            });
        }
    }
    runs.push(Run {
        bar: true,
        width: wide,
    });
    runs.push(Run {
        bar: false,
        width: narrow,
    });
    runs.push(Run {
        bar: true,
        width: narrow,
    });
    runs
}

/// Rasterize the run sequence into an 8-bit grayscale PNG.
fn render_png(runs: &[Run], opts: &BarcodeOptions) -> Result<Vec<u8>, BarcodeError> {
    let quiet = opts.quiet_zone * opts.narrow;
    let bars: u32 = runs.iter().map(|r| r.width).sum();
    let width = bars + quiet * 2;
    let height = opts.height.max(1);

    let mut row = vec![0xFFu8; width as usize];
    let mut x = quiet as usize;
    for run in runs {
        if run.bar {
            row[x..x + run.width as usize].fill(0x00);
        }
        x += run.width as usize;
    }

    let mut pixels = Vec::with_capacity((width * height) as usize);
    for _ in 0..height {
        pixels.extend_from_slice(&row);
    }

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| BarcodeError::Encode(e.to_string()))?;
        writer
            .write_image_data(&pixels)
            .map_err(|e| BarcodeError::Encode(e.to_string()))?;
    }
    Ok(out)
}
