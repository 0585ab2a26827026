//! Test fixtures for building minimal valid PSD files in memory

use std::path::{Path, PathBuf};

pub const MODE_BITMAP: u16 = 0;
pub const MODE_GRAYSCALE: u16 = 1;
pub const MODE_INDEXED: u16 = 2;
pub const MODE_RGB: u16 = 3;
pub const MODE_CMYK: u16 = 4;
pub const MODE_LAB: u16 = 9;

/// Pixel content and image resources of a synthetic 8-bit PSD
#[derive(Debug, Clone)]
pub struct PsdSpec {
    pub width: u32,
    pub height: u32,
    pub color_mode: u16,
    /// Merged image data, one row-major plane per channel
    pub planes: Vec<Vec<u8>>,
    pub color_mode_data: Vec<u8>,
    /// Complete `8BIM` resource blocks
    pub resources: Vec<Vec<u8>>,
    /// Layer records, bottom-most first
    pub layers: Vec<LayerSpec>,
    /// PackBits-compress the merged image data
    pub rle: bool,
}

/// One RGB pixel layer
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub name: String,
    pub top: i32,
    pub left: i32,
    pub width: u32,
    pub height: u32,
    pub color: [u8; 3],
    pub opacity: u8,
    pub visible: bool,
}

impl LayerSpec {
    pub fn filled(name: &str, top: i32, left: i32, width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            name: name.to_string(),
            top,
            left,
            width,
            height,
            color,
            opacity: 255,
            visible: true,
        }
    }
}

impl PsdSpec {
    pub fn solid(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self::from_fn(width, height, |_, _| color)
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> Self {
        let mut planes = vec![Vec::new(), Vec::new(), Vec::new()];
        for y in 0..height {
            for x in 0..width {
                let px = f(x, y);
                for (plane, value) in planes.iter_mut().zip(px) {
                    plane.push(value);
                }
            }
        }
        Self::with_planes(width, height, MODE_RGB, planes)
    }

    /// Document in `color_mode` with the given raw channel planes
    pub fn with_planes(width: u32, height: u32, color_mode: u16, planes: Vec<Vec<u8>>) -> Self {
        Self {
            width,
            height,
            color_mode,
            planes,
            color_mode_data: Vec::new(),
            resources: Vec::new(),
            layers: Vec::new(),
            rle: false,
        }
    }

    pub fn grayscale(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Self {
        let plane = plane_from_fn(width, height, f);
        Self::with_planes(width, height, MODE_GRAYSCALE, vec![plane])
    }

    /// Uniform CMYK document. Values are stored the way Photoshop writes
    /// them: 255 means no ink.
    pub fn cmyk(width: u32, height: u32, stored: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let planes = stored.iter().map(|&v| vec![v; count]).collect();
        Self::with_planes(width, height, MODE_CMYK, planes)
    }

    /// Indexed document whose pixels pick entries of `palette`
    pub fn indexed(width: u32, height: u32, palette: &[[u8; 3]], f: impl Fn(u32, u32) -> u8) -> Self {
        let mut table = vec![0u8; 768];
        for (i, color) in palette.iter().enumerate().take(256) {
            table[i] = color[0];
            table[256 + i] = color[1];
            table[512 + i] = color[2];
        }
        let plane = plane_from_fn(width, height, f);
        let mut spec = Self::with_planes(width, height, MODE_INDEXED, vec![plane]);
        spec.color_mode_data = table;
        spec
    }

    /// Left half black, right half white
    pub fn split_vertical(width: u32, height: u32) -> Self {
        Self::from_fn(width, height, |x, _| {
            if x < width / 2 {
                [0, 0, 0]
            } else {
                [255, 255, 255]
            }
        })
    }

    /// Top half black, bottom half white
    pub fn split_horizontal(width: u32, height: u32) -> Self {
        Self::from_fn(width, height, |_, y| {
            if y < height / 2 {
                [0, 0, 0]
            } else {
                [255, 255, 255]
            }
        })
    }

    /// Append an extra alpha channel to the merged image data
    pub fn with_alpha(mut self, f: impl Fn(u32, u32) -> u8) -> Self {
        self.planes.push(plane_from_fn(self.width, self.height, f));
        self
    }

    pub fn with_layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_rle(mut self) -> Self {
        self.rle = true;
        self
    }

    pub fn with_resource(mut self, block: Vec<u8>) -> Self {
        self.resources.push(block);
        self
    }
}

fn plane_from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
    let mut plane = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            plane.push(f(x, y));
        }
    }
    plane
}

/// Serialize `spec` as a PSD: header, color mode data, image resources,
/// the layer section and planar merged image data.
pub fn build_psd(spec: &PsdSpec) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(b"8BPS");
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0u8; 6]);
    out.extend_from_slice(&(spec.planes.len() as u16).to_be_bytes());
    out.extend_from_slice(&spec.height.to_be_bytes());
    out.extend_from_slice(&spec.width.to_be_bytes());
    out.extend_from_slice(&8u16.to_be_bytes());
    out.extend_from_slice(&spec.color_mode.to_be_bytes());

    out.extend_from_slice(&(spec.color_mode_data.len() as u32).to_be_bytes());
    out.extend_from_slice(&spec.color_mode_data);

    let resources: Vec<u8> = spec.resources.concat();
    out.extend_from_slice(&(resources.len() as u32).to_be_bytes());
    out.extend_from_slice(&resources);

    let layer_info = layer_info(&spec.layers);
    // Layer info, then an empty global mask
    out.extend_from_slice(&((4 + layer_info.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&(layer_info.len() as u32).to_be_bytes());
    out.extend_from_slice(&layer_info);
    out.extend_from_slice(&0u32.to_be_bytes());

    if spec.rle {
        out.extend_from_slice(&1u16.to_be_bytes());
        let rows: Vec<Vec<Vec<u8>>> = spec
            .planes
            .iter()
            .map(|plane| {
                plane
                    .chunks(spec.width.max(1) as usize)
                    .map(packbits)
                    .collect()
            })
            .collect();
        for row in rows.iter().flatten() {
            out.extend_from_slice(&(row.len() as u16).to_be_bytes());
        }
        for row in rows.iter().flatten() {
            out.extend_from_slice(row);
        }
    } else {
        out.extend_from_slice(&0u16.to_be_bytes());
        for plane in &spec.planes {
            out.extend_from_slice(plane);
        }
    }

    out
}

/// Layer count, records and raw channel data. Empty when there are no layers.
fn layer_info(layers: &[LayerSpec]) -> Vec<u8> {
    if layers.is_empty() {
        return Vec::new();
    }

    let mut info = Vec::new();
    info.extend_from_slice(&(layers.len() as i16).to_be_bytes());

    for layer in layers {
        let plane_len = layer.width as usize * layer.height as usize;
        info.extend_from_slice(&layer.top.to_be_bytes());
        info.extend_from_slice(&layer.left.to_be_bytes());
        info.extend_from_slice(&(layer.top + layer.height as i32).to_be_bytes());
        info.extend_from_slice(&(layer.left + layer.width as i32).to_be_bytes());
        info.extend_from_slice(&3u16.to_be_bytes());
        for channel_id in 0i16..3 {
            info.extend_from_slice(&channel_id.to_be_bytes());
            info.extend_from_slice(&((plane_len + 2) as u32).to_be_bytes());
        }
        info.extend_from_slice(b"8BIMnorm");
        info.push(layer.opacity);
        info.push(0);
        info.push(if layer.visible { 0b10 } else { 0 });
        info.push(0);

        let mut name = vec![layer.name.len() as u8];
        name.extend_from_slice(layer.name.as_bytes());
        while name.len() % 4 != 0 {
            name.push(0);
        }
        info.extend_from_slice(&((8 + name.len()) as u32).to_be_bytes());
        // No layer mask, no blending ranges
        info.extend_from_slice(&0u32.to_be_bytes());
        info.extend_from_slice(&0u32.to_be_bytes());
        info.extend_from_slice(&name);
    }

    for layer in layers {
        let plane_len = layer.width as usize * layer.height as usize;
        for value in layer.color {
            info.extend_from_slice(&0u16.to_be_bytes());
            info.extend(std::iter::repeat(value).take(plane_len));
        }
    }

    if info.len() % 2 == 1 {
        info.push(0);
    }
    info
}

/// PackBits encoding of one scanline
pub fn packbits(row: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < row.len() {
        let mut run = 1;
        while i + run < row.len() && run < 128 && row[i + run] == row[i] {
            run += 1;
        }
        if run >= 2 {
            out.push((1 - run as i16) as i8 as u8);
            out.push(row[i]);
            i += run;
            continue;
        }

        let start = i;
        while i < row.len()
            && i - start < 128
            && !(i + 1 < row.len() && row[i + 1] == row[i])
        {
            i += 1;
        }
        if i == start {
            i += 1;
        }
        out.push((i - start - 1) as u8);
        out.extend_from_slice(&row[start..i]);
    }
    out
}

pub fn write_psd(dir: &Path, name: &str, spec: &PsdSpec) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, build_psd(spec)).expect("write synthetic PSD");
    path
}

/// `8BIM` EXIF resource block holding a big-endian TIFF with one Orientation tag
pub fn exif_orientation_block(orientation: u16) -> Vec<u8> {
    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"MM\x00\x2a");
    tiff.extend_from_slice(&8u32.to_be_bytes());
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0u8; 2]);
    tiff.extend_from_slice(&0u32.to_be_bytes());

    let mut block = Vec::new();
    block.extend_from_slice(b"8BIM");
    block.extend_from_slice(&0x0422u16.to_be_bytes());
    // Empty Pascal name, padded to even length
    block.extend_from_slice(&[0u8; 2]);
    block.extend_from_slice(&(tiff.len() as u32).to_be_bytes());
    block.extend_from_slice(&tiff);
    if tiff.len() % 2 == 1 {
        block.push(0);
    }
    block
}

/// In-memory RGB test image
pub fn rgb_image(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> image::RgbImage {
    image::RgbImage::from_fn(width, height, |x, y| image::Rgb(f(x, y)))
}
