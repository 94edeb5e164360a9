//! Portable float map (PFM) reader and writer.
//!
//! Layout: a `PF` (colour) or `Pf` (mono) line, a `"<width> <height>"` line,
//! a scale line whose sign gives the payload byte order (negative means
//! little-endian), then raw `f32` samples with the bottom row first.

use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use ndarray::{Array2, Array3, ArrayView, Dimension};

use crate::error::{MvsError, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum PfmImage {
    Mono(Array2<f32>),
    Color(Array3<f32>),
}

impl PfmImage {
    pub fn is_color(&self) -> bool {
        matches!(self, PfmImage::Color(_))
    }

    /// `(height, width)` of the image.
    pub fn dims(&self) -> (usize, usize) {
        match self {
            PfmImage::Mono(data) => data.dim(),
            PfmImage::Color(data) => {
                let (h, w, _) = data.dim();
                (h, w)
            }
        }
    }

    pub fn into_mono(self) -> Result<Array2<f32>> {
        match self {
            PfmImage::Mono(data) => Ok(data),
            PfmImage::Color(_) => Err(MvsError::Format(
                "expected a single-channel map, found a colour image".to_string(),
            )),
        }
    }
}

pub fn write_pfm<D: Dimension>(path: &Path, image: ArrayView<'_, f32, D>, scale: f32) -> Result<()> {
    let bytes = encode_pfm(image, scale)?;
    fs::write(path, bytes).map_err(|source| MvsError::io(path, source))
}

pub fn read_pfm(path: &Path) -> Result<PfmImage> {
    let bytes = fs::read(path).map_err(|source| MvsError::io(path, source))?;
    decode_pfm(&bytes).map_err(|err| match err {
        MvsError::Format(message) => MvsError::Format(format!("{}: {message}", path.display())),
        other => other,
    })
}

/// Writes an encoded map to any sink, e.g. a socket or an in-memory buffer.
pub fn write_to<W: Write, D: Dimension>(
    writer: &mut W,
    image: ArrayView<'_, f32, D>,
    scale: f32,
) -> Result<()> {
    let bytes = encode_pfm(image, scale)?;
    writer
        .write_all(&bytes)
        .map_err(|source| MvsError::io("<stream>", source))
}

/// Reads one map; the reader is consumed to its end.
pub fn read_from<R: BufRead>(reader: &mut R) -> Result<PfmImage> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|source| MvsError::io("<stream>", source))?;
    decode_pfm(&bytes)
}

/// Encodes an `H x W`, `H x W x 1` or `H x W x 3` image.
pub fn encode_pfm<D: Dimension>(image: ArrayView<'_, f32, D>, scale: f32) -> Result<Vec<u8>> {
    let (height, width, channels) = match image.shape() {
        [h, w] | [h, w, 1] => (*h, *w, 1),
        [h, w, 3] => (*h, *w, 3),
        shape => {
            return Err(MvsError::Format(format!(
                "image must be H x W, H x W x 1 or H x W x 3, got {shape:?}"
            )))
        }
    };

    // Samples are written in native order; the scale sign tells the reader which.
    let magnitude = scale.abs();
    let signed_scale = if cfg!(target_endian = "little") {
        -magnitude
    } else {
        magnitude
    };

    let header = format!(
        "{}\n{width} {height}\n{signed_scale:.6}\n",
        if channels == 3 { "PF" } else { "Pf" }
    );
    let row_len = width * channels;
    let mut out = Vec::with_capacity(header.len() + height * row_len * 4);
    out.extend_from_slice(header.as_bytes());

    let samples: Vec<f32> = image.iter().copied().collect();
    if row_len > 0 {
        for row in samples.chunks(row_len).rev() {
            for value in row {
                out.extend_from_slice(&value.to_ne_bytes());
            }
        }
    }
    Ok(out)
}

pub fn decode_pfm(bytes: &[u8]) -> Result<PfmImage> {
    let (tag, rest) = split_line(bytes)?;
    let color = match tag.trim() {
        "PF" => true,
        "Pf" => false,
        other => return Err(MvsError::Format(format!("not a PFM file (header {other:?})"))),
    };

    let (dims, rest) = split_line(rest)?;
    let parsed: Vec<usize> = dims
        .split_whitespace()
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| MvsError::Format(format!("malformed PFM dimensions {dims:?}")))?;
    let &[width, height] = parsed.as_slice() else {
        return Err(MvsError::Format(format!("malformed PFM dimensions {dims:?}")));
    };

    let (scale_line, payload) = split_line(rest)?;
    let scale: f32 = scale_line
        .trim()
        .parse()
        .map_err(|_| MvsError::Format(format!("malformed PFM scale {scale_line:?}")))?;
    // `-0.0` still marks a little-endian payload.
    let little_endian = scale.is_sign_negative();

    let channels = if color { 3 } else { 1 };
    let oversized = || MvsError::Format(format!("PFM dimensions {width}x{height} are too large"));
    let row_len = width.checked_mul(channels).ok_or_else(oversized)?;
    let expected = height
        .checked_mul(row_len)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(oversized)?;
    if payload.len() != expected {
        return Err(MvsError::Format(format!(
            "payload holds {} bytes, {width}x{height}x{channels} needs {expected}",
            payload.len()
        )));
    }

    let samples: Vec<f32> = payload
        .chunks_exact(4)
        .map(|chunk| {
            let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
            if little_endian {
                f32::from_le_bytes(raw)
            } else {
                f32::from_be_bytes(raw)
            }
        })
        .collect();

    let mut flipped = Vec::with_capacity(samples.len());
    if row_len > 0 {
        for row in samples.chunks(row_len).rev() {
            flipped.extend_from_slice(row);
        }
    }

    if color {
        Ok(PfmImage::Color(Array3::from_shape_vec(
            (height, width, 3),
            flipped,
        )?))
    } else {
        Ok(PfmImage::Mono(Array2::from_shape_vec((height, width), flipped)?))
    }
}

fn split_line(bytes: &[u8]) -> Result<(&str, &[u8])> {
    let end = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| MvsError::Format("truncated PFM header".to_string()))?;
    let line = std::str::from_utf8(&bytes[..end])
        .map_err(|_| MvsError::Format("PFM header is not ASCII".to_string()))?;
    Ok((line, &bytes[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn mono_round_trip() {
        let image = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.5]];
        let decoded = decode_pfm(&encode_pfm(image.view(), 1.0).unwrap()).unwrap();
        assert_eq!(decoded, PfmImage::Mono(image));
    }

    #[test]
    fn single_channel_volume_reads_back_as_mono() {
        let image = Array::from_shape_fn((4, 5, 1), |(y, x, _)| (y * 5 + x) as f32 * 0.25);
        let decoded = decode_pfm(&encode_pfm(image.view(), 1.0).unwrap()).unwrap();
        assert!(!decoded.is_color());
        let mono = decoded.into_mono().unwrap();
        assert_eq!(mono.dim(), (4, 5));
        assert_eq!(mono[[3, 4]], 19.0 * 0.25);
    }

    #[test]
    fn color_round_trip() {
        let image = Array::from_shape_fn((3, 2, 3), |(y, x, c)| (y * 100 + x * 10 + c) as f32);
        let decoded = decode_pfm(&encode_pfm(image.view(), 1.0).unwrap()).unwrap();
        assert_eq!(decoded, PfmImage::Color(image));
    }

    #[test]
    fn non_contiguous_views_are_encoded_in_logical_order() {
        let image = array![[1.0f32, 2.0], [3.0, 4.0]];
        let transposed = image.t();
        let decoded = decode_pfm(&encode_pfm(transposed, 1.0).unwrap())
            .unwrap()
            .into_mono()
            .unwrap();
        assert_eq!(decoded, array![[1.0f32, 3.0], [2.0, 4.0]]);
    }

    #[test]
    fn rows_are_stored_bottom_first() {
        let image = array![[1.0f32], [2.0]];
        let bytes = encode_pfm(image.view(), 1.0).unwrap();
        let payload = &bytes[bytes.len() - 8..];
        let first = f32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(first, 2.0);
    }

    #[test]
    fn scale_sign_matches_platform_byte_order() {
        let bytes = encode_pfm(array![[0.0f32]].view(), 2.0).unwrap();
        let text = String::from_utf8_lossy(&bytes[..bytes.len() - 4]).to_string();
        let scale_line = text.lines().nth(2).unwrap();
        if cfg!(target_endian = "little") {
            assert_eq!(scale_line, "-2.000000");
        } else {
            assert_eq!(scale_line, "2.000000");
        }
    }

    #[test]
    fn big_endian_payload_is_decoded() {
        let mut bytes = b"Pf\n2 1\n1.0\n".to_vec();
        bytes.extend_from_slice(&1.5f32.to_be_bytes());
        bytes.extend_from_slice(&(-3.0f32).to_be_bytes());
        let decoded = decode_pfm(&bytes).unwrap().into_mono().unwrap();
        assert_eq!(decoded, array![[1.5f32, -3.0]]);
    }

    #[test]
    fn unsupported_shapes_are_rejected() {
        let image = Array3::<f32>::zeros((2, 2, 2));
        assert!(matches!(
            encode_pfm(image.view(), 1.0),
            Err(MvsError::Format(_))
        ));
        let image = ndarray::Array1::<f32>::zeros(4);
        assert!(matches!(
            encode_pfm(image.view(), 1.0),
            Err(MvsError::Format(_))
        ));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(matches!(decode_pfm(b"P6\n1 1\n-1\n"), Err(MvsError::Format(_))));
        assert!(matches!(decode_pfm(b"Pf\n1 x\n-1\n"), Err(MvsError::Format(_))));
        assert!(matches!(decode_pfm(b"Pf\n1 1\nabc\n"), Err(MvsError::Format(_))));
        let mut short = b"Pf\n2 2\n-1.0\n".to_vec();
        short.extend_from_slice(&[0u8; 12]);
        assert!(matches!(decode_pfm(&short), Err(MvsError::Format(_))));
    }

    #[test]
    fn zero_scale_round_trip() {
        let image = array![[1.5f32, 2.0], [3.0, 4.0]];
        let decoded = decode_pfm(&encode_pfm(image.view(), 0.0).unwrap()).unwrap();
        assert_eq!(decoded, PfmImage::Mono(image));
    }

    #[test]
    fn negative_zero_scale_means_little_endian() {
        let mut bytes = b"Pf\n1 1\n-0.0\n".to_vec();
        bytes.extend_from_slice(&2.5f32.to_le_bytes());
        let decoded = decode_pfm(&bytes).unwrap().into_mono().unwrap();
        assert_eq!(decoded, array![[2.5f32]]);
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        assert!(matches!(
            decode_pfm(b"Pf\n18446744073709551615 2\n-1.0\n"),
            Err(MvsError::Format(_))
        ));
        assert!(matches!(
            decode_pfm(b"PF\n2 9223372036854775807\n-1.0\n"),
            Err(MvsError::Format(_))
        ));
    }

    #[test]
    fn stream_round_trip() {
        let image = array![[3.0f32, -1.0, 0.0]];
        let mut buffer = Vec::new();
        write_to(&mut buffer, image.view(), 1.0).unwrap();
        let decoded = read_from(&mut std::io::Cursor::new(buffer)).unwrap();
        assert_eq!(decoded, PfmImage::Mono(image));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.pfm");
        let image = array![[0.5f32, 0.0], [1.25, 7.0]];
        write_pfm(&path, image.view(), 1.0).unwrap();
        assert_eq!(read_pfm(&path).unwrap(), PfmImage::Mono(image));
    }
}
