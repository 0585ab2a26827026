use image::{imageops, RgbImage};

/// Rotation and flips needed to display an image stored with EXIF `orientation`.
/// Returns (rotate_angle, flip_horizontal, flip_vertical).
pub fn orientation_transforms(orientation: u32) -> (Option<u16>, bool, bool) {
    match orientation {
        1 => (None, false, false),      // Normal
        2 => (None, true, false),       // Mirror horizontal
        3 => (Some(180), false, false), // Rotate 180
        4 => (None, false, true),       // Mirror vertical
        5 => (Some(270), true, false),  // Mirror horizontal + Rotate 270 CW
        6 => (Some(90), false, false),  // Rotate 90 CW
        7 => (Some(90), true, false),   // Mirror horizontal + Rotate 90 CW
        8 => (Some(270), false, false), // Rotate 270 CW
        _ => (None, false, false),
    }
}

pub fn apply_orientation(mut img: RgbImage, orientation: u32) -> RgbImage {
    let (rotate, flip_h, flip_v) = orientation_transforms(orientation);
    if rotate.is_none() && !flip_h && !flip_v {
        return img;
    }

    tracing::debug!(
        orientation,
        rotate = ?rotate,
        flip_horizontal = flip_h,
        flip_vertical = flip_v,
        "Applying EXIF orientation"
    );

    if let Some(angle) = rotate {
        img = rotate_by_angle(img, angle);
    }
    if flip_h {
        img = imageops::flip_horizontal(&img);
    }
    if flip_v {
        img = imageops::flip_vertical(&img);
    }
    img
}

/// Rotate clockwise by 90, 180 or 270 degrees. Other angles are a no-op.
pub fn rotate_by_angle(img: RgbImage, angle: u16) -> RgbImage {
    match angle {
        90 => imageops::rotate90(&img),
        180 => imageops::rotate180(&img),
        270 => imageops::rotate270(&img),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rotation_dimension_changes() {
        let img = RgbImage::from_pixel(4, 2, Rgb([0, 0, 255]));

        assert_eq!(rotate_by_angle(img.clone(), 90).dimensions(), (2, 4));
        assert_eq!(rotate_by_angle(img.clone(), 180).dimensions(), (4, 2));
        assert_eq!(rotate_by_angle(img.clone(), 270).dimensions(), (2, 4));
        assert_eq!(rotate_by_angle(img, 45).dimensions(), (4, 2));
    }

    #[test]
    fn test_apply_orientation_six_rotates() {
        let mut img = RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]));
        img.put_pixel(0, 0, Rgb([255, 0, 0]));

        let oriented = apply_orientation(img, 6);
        assert_eq!(oriented.dimensions(), (2, 4));
        // Top-left moves to top-right after a clockwise quarter turn
        assert_eq!(oriented.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_invalid_orientation_is_identity() {
        for orientation in [0, 1, 9, 255] {
            assert_eq!(orientation_transforms(orientation), (None, false, false));
        }
    }

    #[test]
    fn test_mirror_keeps_dimensions() {
        let img = RgbImage::from_pixel(3, 5, Rgb([0, 255, 0]));
        assert_eq!(apply_orientation(img.clone(), 2).dimensions(), (3, 5));
        assert_eq!(apply_orientation(img, 4).dimensions(), (3, 5));
    }
}
