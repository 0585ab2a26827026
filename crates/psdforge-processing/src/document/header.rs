//! PSD file header and image-resource parsing.
//!
//! Only what the pipeline needs without decoding pixel data: dimensions and
//! color mode for size estimates, and the EXIF orientation resource.

use exif::{In, Reader, Tag};
use psdforge_core::AppError;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::validator::PSD_SIGNATURE;

pub const HEADER_LEN: usize = 26;
/// Image resource id of the EXIF data 1 block
pub const RESOURCE_EXIF: u16 = 0x0422;
const RESOURCE_SIGNATURE: &[u8; 4] = b"8BIM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsdHeader {
    /// 1 for PSD, 2 for PSB
    pub version: u16,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    pub depth: u16,
    pub color_mode: u16,
}

impl PsdHeader {
    pub fn parse(data: &[u8]) -> Result<Self, AppError> {
        if data.len() < HEADER_LEN {
            return Err(AppError::DecodeFailure(format!(
                "PSD header truncated: {} bytes",
                data.len()
            )));
        }
        if &data[..4] != PSD_SIGNATURE {
            return Err(AppError::DecodeFailure(
                "Missing PSD signature (expected 8BPS)".to_string(),
            ));
        }

        let version = be_u16(data, 4);
        if version != 1 && version != 2 {
            return Err(AppError::DecodeFailure(format!(
                "Unsupported PSD version {}",
                version
            )));
        }

        Ok(Self {
            version,
            channels: be_u16(data, 12),
            height: be_u32(data, 14),
            width: be_u32(data, 18),
            depth: be_u16(data, 22),
            color_mode: be_u16(data, 24),
        })
    }

    /// Read just the fixed-size header from disk.
    pub fn read_from_path(path: &Path) -> Result<Self, AppError> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf).map_err(|e| {
            AppError::DecodeFailure(format!("Cannot read PSD header from {}: {}", path.display(), e))
        })?;
        Self::parse(&buf)
    }

    pub fn has_valid_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn color_mode_name(&self) -> &'static str {
        match self.color_mode {
            0 => "Bitmap",
            1 => "Grayscale",
            2 => "Indexed",
            3 => "RGB",
            4 => "CMYK",
            7 => "Multichannel",
            8 => "Duotone",
            9 => "Lab",
            _ => "Unknown",
        }
    }
}

/// Raw payload of the image resource with `id`, if present.
pub fn find_image_resource(data: &[u8], id: u16) -> Option<&[u8]> {
    let color_mode_len = read_u32(data, HEADER_LEN)? as usize;
    let resources_start = HEADER_LEN + 4 + color_mode_len;
    let resources_len = read_u32(data, resources_start)? as usize;
    let mut pos = resources_start + 4;
    let end = pos.checked_add(resources_len)?.min(data.len());

    while pos + 12 <= end {
        if &data[pos..pos + 4] != RESOURCE_SIGNATURE {
            return None;
        }
        let resource_id = be_u16(data, pos + 4);
        pos += 6;

        // Pascal string name, padded so that length byte + name is even
        let name_len = *data.get(pos)? as usize;
        let mut name_total = 1 + name_len;
        if name_total % 2 == 1 {
            name_total += 1;
        }
        pos += name_total;

        let size = read_u32(data, pos)? as usize;
        pos += 4;
        let payload = data.get(pos..pos.checked_add(size)?)?;
        if resource_id == id {
            return Some(payload);
        }
        pos += size + (size % 2);
    }

    None
}

/// EXIF orientation (1..=8) stored in the PSD's image resources, if any.
pub fn exif_orientation(data: &[u8]) -> Option<u32> {
    let exif_bytes = find_image_resource(data, RESOURCE_EXIF)?;
    let exif = match Reader::new().read_raw(exif_bytes.to_vec()) {
        Ok(exif) => exif,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unreadable EXIF resource");
            return None;
        }
    };
    let orientation = exif
        .get_field(Tag::Orientation, In::PRIMARY)?
        .value
        .get_uint(0)?;
    (1..=8).contains(&orientation).then_some(orientation)
}

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{build_psd, exif_orientation_block, PsdSpec};

    #[test]
    fn test_parse_header_fields() {
        let data = build_psd(&PsdSpec::solid(40, 30, [10, 20, 30]));
        let header = PsdHeader::parse(&data).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.width, 40);
        assert_eq!(header.height, 30);
        assert_eq!(header.channels, 3);
        assert_eq!(header.depth, 8);
        assert_eq!(header.color_mode_name(), "RGB");
    }

    #[test]
    fn test_parse_rejects_bad_signature() {
        let mut data = build_psd(&PsdSpec::solid(4, 4, [0, 0, 0]));
        data[0] = b'X';
        assert!(matches!(
            PsdHeader::parse(&data),
            Err(AppError::DecodeFailure(_))
        ));
        assert!(PsdHeader::parse(b"8BPS").is_err());
    }

    #[test]
    fn test_find_exif_orientation() {
        let spec = PsdSpec::solid(4, 2, [0, 0, 0]).with_resource(exif_orientation_block(6));
        let data = build_psd(&spec);
        assert_eq!(exif_orientation(&data), Some(6));

        let plain = build_psd(&PsdSpec::solid(4, 2, [0, 0, 0]));
        assert_eq!(exif_orientation(&plain), None);
    }
}
