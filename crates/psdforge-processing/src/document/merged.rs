//! Merged image data: the flattened copy Photoshop stores after the layer
//! section, decoded to RGBA for every color mode the pipeline renders.

use psdforge_core::AppError;

use super::header::{find_image_resource, PsdHeader, HEADER_LEN};

pub const MODE_BITMAP: u16 = 0;
pub const MODE_GRAYSCALE: u16 = 1;
pub const MODE_INDEXED: u16 = 2;
pub const MODE_RGB: u16 = 3;
pub const MODE_CMYK: u16 = 4;
pub const MODE_DUOTONE: u16 = 8;

/// Image resource id of the transparent palette index
const RESOURCE_TRANSPARENCY_INDEX: u16 = 0x0417;
const PALETTE_LEN: usize = 768;

/// The variable-length sections that follow the header
#[derive(Debug, Clone, Copy)]
pub struct Sections<'a> {
    pub color_mode_data: &'a [u8],
    pub layer_and_mask: &'a [u8],
    pub image_data: &'a [u8],
    /// PSB files use 8-byte section lengths and 4-byte RLE row counts
    large: bool,
}

impl<'a> Sections<'a> {
    pub fn split(data: &'a [u8], header: &PsdHeader) -> Result<Self, AppError> {
        let large = header.version == 2;
        let mut pos = HEADER_LEN;
        let color_mode_data = take_section(data, &mut pos, false, "color mode data")?;
        take_section(data, &mut pos, false, "image resources")?;
        let layer_and_mask = take_section(data, &mut pos, large, "layer and mask information")?;

        Ok(Self {
            color_mode_data,
            layer_and_mask,
            image_data: &data[pos..],
            large,
        })
    }

    /// Number of layer records. Zero for flat documents.
    pub fn layer_count(&self) -> usize {
        let len_width = if self.large { 8 } else { 4 };
        let Some(info_len) = read_len(self.layer_and_mask, 0, self.large) else {
            return 0;
        };
        if info_len == 0 {
            return 0;
        }
        self.layer_and_mask
            .get(len_width..len_width + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]).unsigned_abs() as usize)
            .unwrap_or(0)
    }
}

/// Decode the merged image data to straight RGBA.
///
/// `Ok(None)` means the color mode has no RGB rendering here (Lab,
/// Multichannel). Truncated or malformed data is a `DecodeFailure`.
pub fn decode_merged(data: &[u8], header: &PsdHeader) -> Result<Option<Vec<u8>>, AppError> {
    let color_channels = match header.color_mode {
        MODE_BITMAP | MODE_GRAYSCALE | MODE_DUOTONE | MODE_INDEXED => 1,
        MODE_RGB => 3,
        MODE_CMYK => 4,
        _ => return Ok(None),
    };
    let channels = header.channels as usize;
    if channels < color_channels {
        return Err(AppError::DecodeFailure(format!(
            "{} PSD needs {} channels, found {}",
            header.color_mode_name(),
            color_channels,
            channels
        )));
    }

    let sections = Sections::split(data, header)?;
    // One extra channel after the color channels carries transparency
    let wanted = (color_channels + 1).min(channels);
    let planes = read_planes(&sections, header, wanted)?;
    let alpha = planes.get(color_channels);
    let pixel_count = header.width as usize * header.height as usize;

    let mut rgba = Vec::with_capacity(pixel_count * 4);
    match header.color_mode {
        MODE_RGB => {
            for i in 0..pixel_count {
                rgba.extend_from_slice(&[planes[0][i], planes[1][i], planes[2][i]]);
                rgba.push(alpha.map_or(255, |a| a[i]));
            }
        }
        MODE_CMYK => {
            // Stored inverted: 255 is no ink
            for i in 0..pixel_count {
                let k = planes[3][i] as u32;
                let ink = |v: u8| ((v as u32 * k + 127) / 255) as u8;
                rgba.extend_from_slice(&[ink(planes[0][i]), ink(planes[1][i]), ink(planes[2][i])]);
                rgba.push(alpha.map_or(255, |a| a[i]));
            }
        }
        MODE_INDEXED => {
            let palette = sections.color_mode_data;
            if palette.len() < PALETTE_LEN {
                return Err(AppError::DecodeFailure(
                    "Indexed PSD is missing its color table".to_string(),
                ));
            }
            let transparent = find_image_resource(data, RESOURCE_TRANSPARENCY_INDEX)
                .filter(|b| b.len() >= 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize);
            for &index in &planes[0] {
                let index = index as usize;
                rgba.extend_from_slice(&[palette[index], palette[256 + index], palette[512 + index]]);
                rgba.push(if transparent == Some(index) { 0 } else { 255 });
            }
        }
        _ => {
            for i in 0..pixel_count {
                let v = planes[0][i];
                rgba.extend_from_slice(&[v, v, v]);
                rgba.push(alpha.map_or(255, |a| a[i]));
            }
        }
    }

    Ok(Some(rgba))
}

/// First `count` channel planes as 8-bit samples, `width * height` each.
fn read_planes(sections: &Sections<'_>, header: &PsdHeader, count: usize) -> Result<Vec<Vec<u8>>, AppError> {
    let width = header.width as usize;
    let height = header.height as usize;
    let row_bytes = match header.depth {
        1 | 8 | 16 => (width * header.depth as usize).div_ceil(8),
        depth => {
            return Err(AppError::DecodeFailure(format!(
                "Unsupported bit depth {} for merged image data",
                depth
            )))
        }
    };

    let image_data = sections.image_data;
    let compression = image_data
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated("image data"))?;
    let body = &image_data[2..];

    let raw_planes: Vec<Vec<u8>> = match compression {
        0 => {
            let plane_len = row_bytes * height;
            (0..count)
                .map(|c| {
                    body.get(c * plane_len..(c + 1) * plane_len)
                        .map(<[u8]>::to_vec)
                        .ok_or_else(|| truncated("image data"))
                })
                .collect::<Result<_, _>>()?
        }
        1 => {
            let count_width = if sections.large { 4 } else { 2 };
            let total_rows = header.channels as usize * height;
            let table = body
                .get(..total_rows * count_width)
                .ok_or_else(|| truncated("RLE row table"))?;
            let row_len = |row: usize| -> usize {
                let at = row * count_width;
                if sections.large {
                    u32::from_be_bytes([table[at], table[at + 1], table[at + 2], table[at + 3]]) as usize
                } else {
                    u16::from_be_bytes([table[at], table[at + 1]]) as usize
                }
            };

            let mut pos = table.len();
            let mut planes = Vec::with_capacity(count);
            for c in 0..count {
                let mut plane = Vec::with_capacity(row_bytes * height);
                for y in 0..height {
                    let len = row_len(c * height + y);
                    let packed = body.get(pos..pos + len).ok_or_else(|| truncated("RLE image data"))?;
                    unpack_bits(packed, row_bytes, &mut plane)?;
                    pos += len;
                }
                planes.push(plane);
            }
            planes
        }
        other => {
            return Err(AppError::DecodeFailure(format!(
                "Unsupported image data compression {}",
                other
            )))
        }
    };

    Ok(raw_planes
        .into_iter()
        .map(|plane| to_eight_bit(plane, header.depth, width, row_bytes))
        .collect())
}

/// PackBits-decode one scanline of exactly `row_bytes` bytes into `out`.
fn unpack_bits(packed: &[u8], row_bytes: usize, out: &mut Vec<u8>) -> Result<(), AppError> {
    let target = out.len() + row_bytes;
    let mut i = 0;
    while i < packed.len() && out.len() < target {
        let n = packed[i] as i8;
        i += 1;
        match n {
            -128 => {}
            0..=127 => {
                let len = n as usize + 1;
                let literal = packed.get(i..i + len).ok_or_else(|| truncated("RLE scanline"))?;
                out.extend_from_slice(literal);
                i += len;
            }
            _ => {
                let value = *packed.get(i).ok_or_else(|| truncated("RLE scanline"))?;
                out.extend(std::iter::repeat(value).take((1 - n as i16) as usize));
                i += 1;
            }
        }
    }
    if out.len() != target {
        return Err(AppError::DecodeFailure(
            "RLE scanline does not match the image width".to_string(),
        ));
    }
    Ok(())
}

fn to_eight_bit(plane: Vec<u8>, depth: u16, width: usize, row_bytes: usize) -> Vec<u8> {
    match depth {
        16 => plane.chunks_exact(2).map(|pair| pair[0]).collect(),
        // Bitmap mode: a set bit is black
        1 => plane
            .chunks(row_bytes)
            .flat_map(|row| {
                (0..width).map(move |x| {
                    if row[x / 8] & (0x80 >> (x % 8)) != 0 {
                        0
                    } else {
                        255
                    }
                })
            })
            .collect(),
        _ => plane,
    }
}

fn take_section<'a>(data: &'a [u8], pos: &mut usize, large: bool, name: &str) -> Result<&'a [u8], AppError> {
    let width = if large { 8 } else { 4 };
    let len = read_len(data, *pos, large).ok_or_else(|| truncated(name))?;
    let start = *pos + width;
    let section = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| truncated(name))?;
    *pos = start + len;
    Ok(section)
}

fn read_len(data: &[u8], at: usize, large: bool) -> Option<usize> {
    if large {
        let b = data.get(at..at + 8)?;
        usize::try_from(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])).ok()
    } else {
        let b = data.get(at..at + 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }
}

fn truncated(section: &str) -> AppError {
    AppError::DecodeFailure(format!("PSD truncated in {}", section))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{build_psd, packbits, LayerSpec, PsdSpec, MODE_LAB};

    fn decode(spec: &PsdSpec) -> Vec<u8> {
        let data = build_psd(spec);
        let header = PsdHeader::parse(&data).unwrap();
        decode_merged(&data, &header).unwrap().unwrap()
    }

    #[test]
    fn test_unpack_bits_runs_and_literals() {
        let row = [7, 7, 7, 7, 1, 2, 3, 9, 9];
        let mut out = Vec::new();
        unpack_bits(&packbits(&row), row.len(), &mut out).unwrap();
        assert_eq!(out, row);
    }

    #[test]
    fn test_unpack_bits_rejects_short_row() {
        let mut out = Vec::new();
        let result = unpack_bits(&packbits(&[1, 2, 3]), 5, &mut out);
        assert!(matches!(result, Err(AppError::DecodeFailure(_))));
    }

    #[test]
    fn test_rle_matches_raw() {
        let spec = PsdSpec::from_fn(9, 5, |x, y| [(x * 20) as u8, (y * 40) as u8, 77]);
        assert_eq!(decode(&spec.clone().with_rle()), decode(&spec));
    }

    #[test]
    fn test_cmyk_ink_mapping() {
        // Full cyan ink, no magenta, yellow or black
        let rgba = decode(&PsdSpec::cmyk(2, 2, [0, 255, 255, 255]));
        assert_eq!(&rgba[..4], &[0, 255, 255, 255]);

        let grey = decode(&PsdSpec::cmyk(2, 2, [255, 255, 255, 128]));
        assert_eq!(&grey[..4], &[128, 128, 128, 255]);
    }

    #[test]
    fn test_indexed_requires_palette() {
        let mut spec = PsdSpec::indexed(2, 2, &[[10, 20, 30]], |_, _| 0);
        spec.color_mode_data.clear();
        let data = build_psd(&spec);
        let header = PsdHeader::parse(&data).unwrap();
        assert!(matches!(decode_merged(&data, &header), Err(AppError::DecodeFailure(_))));
    }

    #[test]
    fn test_lab_is_not_rendered() {
        let spec = PsdSpec::with_planes(2, 2, MODE_LAB, vec![vec![50; 4], vec![128; 4], vec![128; 4]]);
        let data = build_psd(&spec);
        let header = PsdHeader::parse(&data).unwrap();
        assert!(decode_merged(&data, &header).unwrap().is_none());
    }

    #[test]
    fn test_truncated_image_data() {
        let mut data = build_psd(&PsdSpec::solid(8, 8, [1, 2, 3]));
        data.truncate(data.len() - 10);
        let header = PsdHeader::parse(&data).unwrap();
        assert!(matches!(decode_merged(&data, &header), Err(AppError::DecodeFailure(_))));
    }

    #[test]
    fn test_layer_count() {
        let flat = build_psd(&PsdSpec::solid(4, 4, [0, 0, 0]));
        let header = PsdHeader::parse(&flat).unwrap();
        assert_eq!(Sections::split(&flat, &header).unwrap().layer_count(), 0);

        let layered = build_psd(
            &PsdSpec::solid(4, 4, [0, 0, 0])
                .with_layer(LayerSpec::filled("Background", 0, 0, 4, 4, [0, 0, 0]))
                .with_layer(LayerSpec::filled("Mark", 1, 1, 2, 2, [255, 0, 0])),
        );
        let header = PsdHeader::parse(&layered).unwrap();
        assert_eq!(Sections::split(&layered, &header).unwrap().layer_count(), 2);
    }
}
