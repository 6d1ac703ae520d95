//! Overlay drawing for the preview stream: spot boxes, spot numbers, plates
//! and a status footer, rendered with a built-in 5x7 bitmap font.

use image::{Rgb, RgbImage};
use ml_core::BoundingBox;

use crate::{occupancy::SpotStatus, spots::SpotId};

const OCCUPIED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const EMPTY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const FOOTER_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const GLYPH_ADVANCE: i32 = 6;

/// One mapped detection to draw.
#[derive(Clone, Debug)]
pub struct SpotOverlay {
    pub bbox: BoundingBox,
    pub spot: SpotId,
    pub status: SpotStatus,
    pub plate: Option<String>,
}

pub fn annotate(image: &mut RgbImage, overlays: &[SpotOverlay], footer: &str) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;

    for overlay in overlays {
        let color = match overlay.status {
            SpotStatus::Occupied => OCCUPIED_COLOR,
            _ => EMPTY_COLOR,
        };
        let left = overlay.bbox.x1.clamp(0.0, max_x).round() as i32;
        let top = overlay.bbox.y1.clamp(0.0, max_y).round() as i32;
        let right = overlay.bbox.x2.clamp(0.0, max_x).round() as i32;
        let bottom = overlay.bbox.y2.clamp(0.0, max_y).round() as i32;
        draw_rectangle(image, left, top, right, bottom, color);
        // Thicker outline reads better after downscaling.
        draw_rectangle(image, left + 1, top + 1, right - 1, bottom - 1, color);

        let spot_label = format!("SPOT {}", overlay.spot);
        draw_boxed_label(image, left, (top - 12).max(0), &spot_label, color);

        if let Some(plate) = overlay.plate.as_deref().filter(|p| !p.is_empty()) {
            let plate_label = format!("PLATE: {plate}");
            let y = (bottom + 4).min(image.height() as i32 - 8);
            draw_boxed_label(image, left, y, &plate_label, color);
        }
    }

    if !footer.is_empty() {
        let width = image.width() as i32;
        let height = image.height() as i32;
        let footer_width = (footer.chars().count() as i32 * GLYPH_ADVANCE).min(width);
        let x = (width - footer_width - 4).max(0);
        let y = (height - 12).max(0);
        fill_rect(image, x, y, x + footer_width + 4, y + 8, LABEL_BACKGROUND);
        draw_label(image, x + 2, y, footer, FOOTER_COLOR);
    }
}

fn draw_boxed_label(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
    fill_rect(image, x, y, x + text_width, y + 8, LABEL_BACKGROUND);
    draw_label(image, x + 1, y, text, color);
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if left > right || top > bottom {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(status: SpotStatus, plate: Option<&str>) -> SpotOverlay {
        SpotOverlay {
            bbox: BoundingBox::new(20.0, 30.0, 80.0, 70.0),
            spot: 3,
            status,
            plate: plate.map(str::to_string),
        }
    }

    #[test]
    fn outlines_use_status_color() {
        let mut image = RgbImage::new(160, 120);
        annotate(&mut image, &[overlay(SpotStatus::Occupied, None)], "");
        assert_eq!(*image.get_pixel(50, 70), OCCUPIED_COLOR);
        assert_eq!(*image.get_pixel(80, 50), OCCUPIED_COLOR);

        let mut image = RgbImage::new(160, 120);
        annotate(&mut image, &[overlay(SpotStatus::Empty, None)], "");
        assert_eq!(*image.get_pixel(50, 70), EMPTY_COLOR);
    }

    #[test]
    fn plate_label_is_drawn_below_box() {
        let mut plain = RgbImage::new(160, 120);
        annotate(&mut plain, &[overlay(SpotStatus::Occupied, None)], "");
        let mut labelled = RgbImage::new(160, 120);
        annotate(&mut labelled, &[overlay(SpotStatus::Occupied, Some("AB12CD"))], "");
        let differs = (74..82).any(|y| {
            (20..100).any(|x| plain.get_pixel(x, y) != labelled.get_pixel(x, y))
        });
        assert!(differs);
    }

    #[test]
    fn boxes_outside_frame_do_not_panic() {
        let mut image = RgbImage::new(32, 16);
        let overlays = vec![SpotOverlay {
            bbox: BoundingBox::new(-50.0, -50.0, 500.0, 500.0),
            spot: 12,
            status: SpotStatus::Occupied,
            plate: Some("ZZ99ZZ".into()),
        }];
        annotate(&mut image, &overlays, "FRAME 000001  OCCUPIED 1/12");
        assert!(image.pixels().any(|p| *p == OCCUPIED_COLOR));
    }

    #[test]
    fn font_covers_plate_alphabet() {
        for ch in ('A'..='Z').chain('0'..='9').chain([':', '/', '-', '.', ' ']) {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
        assert!(glyph_bits('#').is_none());
    }
}
