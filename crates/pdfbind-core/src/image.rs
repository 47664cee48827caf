//! Raster overlay handling
//!
//! Overlays arrive as raw PNG or JPEG bytes and are embedded as Image
//! XObjects. PNG samples are normalized to 8-bit and Flate-compressed;
//! alpha channels become soft masks. JPEG data passes straight through
//! as DCTDecode, which only needs the frame header parsed for
//! dimensions. One pixel maps to one PDF point (72 dpi).

use crate::error::PdfBindError;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};
use std::io::Write;

const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    /// Photographic or signature raster; drawn with interpolation.
    Raster,
    /// Barcode raster; interpolation stays off so bar edges are exact.
    Barcode,
}

/// An image overlay queued for stamping at absolute page coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePlacement {
    pub data: Vec<u8>,
    pub x: f64,
    pub y: f64,
    /// 1-based page number.
    pub page: u32,
    pub kind: ImageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Rgb,
}

impl Color {
    fn pdf_name(self) -> &'static [u8] {
        match self {
            Color::Gray => b"DeviceGray",
            Color::Rgb => b"DeviceRGB",
        }
    }
}

enum Encoding {
    Flate {
        color: Color,
        samples: Vec<u8>,
        alpha: Option<Vec<u8>>,
    },
    Jpeg {
        color: Color,
        data: Vec<u8>,
    },
}

pub(crate) struct DecodedImage {
    pub width: u32,
    pub height: u32,
    encoding: Encoding,
}

/// Sniff and decode an overlay payload.
pub(crate) fn decode_image(data: &[u8]) -> Result<DecodedImage, PdfBindError> {
    if data.starts_with(&PNG_MAGIC) {
        decode_png(data)
    } else if data.starts_with(&[0xFF, 0xD8]) {
        decode_jpeg(data)
    } else {
        Err(PdfBindError::UnsupportedImage(
            "payload is neither PNG nor JPEG".into(),
        ))
    }
}

fn decode_png(data: &[u8]) -> Result<DecodedImage, PdfBindError> {
    let mut decoder = png::Decoder::new(data);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| PdfBindError::UnsupportedImage(e.to_string()))?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| PdfBindError::UnsupportedImage(e.to_string()))?;
    buf.truncate(info.buffer_size());

    let (color, samples, alpha) = match info.color_type {
        png::ColorType::Grayscale => (Color::Gray, buf, None),
        png::ColorType::Rgb => (Color::Rgb, buf, None),
        png::ColorType::GrayscaleAlpha => {
            let mut samples = Vec::with_capacity(buf.len() / 2);
            let mut alpha = Vec::with_capacity(buf.len() / 2);
            for px in buf.chunks_exact(2) {
                samples.push(px[0]);
                alpha.push(px[1]);
            }
            (Color::Gray, samples, Some(alpha))
        }
        png::ColorType::Rgba => {
            let mut samples = Vec::with_capacity(buf.len() / 4 * 3);
            let mut alpha = Vec::with_capacity(buf.len() / 4);
            for px in buf.chunks_exact(4) {
                samples.extend_from_slice(&px[..3]);
                alpha.push(px[3]);
            }
            (Color::Rgb, samples, Some(alpha))
        }
        other => {
            return Err(PdfBindError::UnsupportedImage(format!(
                "PNG color type {:?} not supported",
                other
            )))
        }
    };

    Ok(DecodedImage {
        width: info.width,
        height: info.height,
        encoding: Encoding::Flate {
            color,
            samples,
            alpha,
        },
    })
}

fn decode_jpeg(data: &[u8]) -> Result<DecodedImage, PdfBindError> {
    let (width, height, components) =
        jpeg_dimensions(data).map_err(PdfBindError::UnsupportedImage)?;
    let color = match components {
        1 => Color::Gray,
        3 => Color::Rgb,
        n => {
            return Err(PdfBindError::UnsupportedImage(format!(
                "JPEG with {} components not supported",
                n
            )))
        }
    };
    Ok(DecodedImage {
        width,
        height,
        encoding: Encoding::Jpeg {
            color,
            data: data.to_vec(),
        },
    })
}

/// Scan the marker stream for the frame header and pull out dimensions.
fn jpeg_dimensions(data: &[u8]) -> Result<(u32, u32, u8), String> {
    let mut i = 2usize;
    while i + 3 < data.len() {
        if data[i] != 0xFF {
            return Err("malformed JPEG marker stream".into());
        }
        let marker = data[i + 1];
        if marker == 0xFF {
            // fill byte
            i += 1;
            continue;
        }
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            // standalone marker, no length word
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        match marker {
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                if i + 9 >= data.len() {
                    return Err("truncated SOF segment".into());
                }
                let height = u16::from_be_bytes([data[i + 5], data[i + 6]]) as u32;
                let width = u16::from_be_bytes([data[i + 7], data[i + 8]]) as u32;
                let components = data[i + 9];
                return Ok((width, height, components));
            }
            0xDA => break,
            _ => i += 2 + len,
        }
    }
    Err("no SOF marker found".into())
}

impl DecodedImage {
    /// Register the image (and any soft mask) as document objects.
    pub(crate) fn add_to_document(
        &self,
        doc: &mut Document,
        kind: ImageKind,
    ) -> Result<ObjectId, PdfBindError> {
        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"XObject".to_vec()));
        dict.set("Subtype", Object::Name(b"Image".to_vec()));
        dict.set("Width", Object::Integer(self.width as i64));
        dict.set("Height", Object::Integer(self.height as i64));
        dict.set("BitsPerComponent", Object::Integer(8));
        if kind == ImageKind::Raster {
            dict.set("Interpolate", Object::Boolean(true));
        }

        match &self.encoding {
            Encoding::Jpeg { color, data } => {
                dict.set("ColorSpace", Object::Name(color.pdf_name().to_vec()));
                dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
                Ok(doc.add_object(Object::Stream(Stream::new(dict, data.clone()))))
            }
            Encoding::Flate {
                color,
                samples,
                alpha,
            } => {
                dict.set("ColorSpace", Object::Name(color.pdf_name().to_vec()));
                dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
                if let Some(alpha) = alpha {
                    let mut mask_dict = Dictionary::new();
                    mask_dict.set("Type", Object::Name(b"XObject".to_vec()));
                    mask_dict.set("Subtype", Object::Name(b"Image".to_vec()));
                    mask_dict.set("Width", Object::Integer(self.width as i64));
                    mask_dict.set("Height", Object::Integer(self.height as i64));
                    mask_dict.set("ColorSpace", Object::Name(b"DeviceGray".to_vec()));
                    mask_dict.set("BitsPerComponent", Object::Integer(8));
                    mask_dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
                    let mask_id = doc.add_object(Object::Stream(Stream::new(
                        mask_dict,
                        deflate(alpha)?,
                    )));
                    dict.set("SMask", Object::Reference(mask_id));
                }
                let compressed = deflate(samples)?;
                Ok(doc.add_object(Object::Stream(Stream::new(dict, compressed))))
            }
        }
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, PdfBindError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| PdfBindError::Operation(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| PdfBindError::Operation(e.to_string()))
}
