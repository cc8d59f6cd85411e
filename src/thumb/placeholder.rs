//! Placeholder thumbnails for assets without a usable preview
//!
//! Draws a dark card with a coloured badge showing the file extension
//! (e.g. "FBX"). Text uses a built-in 5x7 bitmap font so the output is
//! identical on every machine.

use image::{Rgb, RgbImage};

use crate::config::{MAX_THUMBNAIL_SIZE, MIN_THUMBNAIL_SIZE};

const BACKGROUND: Rgb<u8> = Rgb([42, 42, 42]);
const PANEL_FILL: Rgb<u8> = Rgb([50, 50, 50]);
const PANEL_OUTLINE: Rgb<u8> = Rgb([60, 60, 60]);
const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const UNKNOWN_BADGE: Rgb<u8> = Rgb([100, 100, 100]);

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const MAX_LABEL_CHARS: usize = 5;

/// Badge colour for an extension
pub fn badge_color(extension: &str) -> Rgb<u8> {
    match extension {
        "fbx" => Rgb([224, 108, 117]),
        "obj" => Rgb([229, 192, 123]),
        "max" => Rgb([198, 120, 221]),
        "abc" => Rgb([152, 195, 121]),
        "blend" => Rgb([255, 165, 0]),
        "gltf" => Rgb([97, 175, 239]),
        "glb" => Rgb([86, 182, 194]),
        _ => UNKNOWN_BADGE,
    }
}

/// Upper-cased label drawn on the badge
pub fn label_for(extension: &str) -> String {
    let label: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_LABEL_CHARS)
        .collect::<String>()
        .to_ascii_uppercase();
    if label.is_empty() {
        "?".to_string()
    } else {
        label
    }
}

/// Render a `size`x`size` placeholder for a file extension
pub fn render(extension: &str, size: u32) -> RgbImage {
    let size = size.clamp(MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE);
    let mut img = RgbImage::from_pixel(size, size, BACKGROUND);

    // Panel with a thin outline
    let margin = (size * 20 / 256).max(2);
    let radius = (size * 15 / 256).max(1);
    let border = (size / 128).max(1);
    fill_rounded_rect(&mut img, margin, margin, size - margin, size - margin, radius, PANEL_OUTLINE);
    fill_rounded_rect(
        &mut img,
        margin + border,
        margin + border,
        size - margin - border,
        size - margin - border,
        radius.saturating_sub(border).max(1),
        PANEL_FILL,
    );

    // Badge sized so the label spans at most ~60% of the card
    let label = label_for(extension);
    let chars = label.chars().count() as u32;
    let text_units = chars * (GLYPH_WIDTH + 1) - 1;
    let scale = ((size * 6 / 10) / text_units)
        .min((size / 4) / GLYPH_HEIGHT)
        .max(1);
    let text_w = text_units * scale;
    let text_h = GLYPH_HEIGHT * scale;
    let padding = scale * 2;

    let badge_w = text_w + padding * 2;
    let badge_h = text_h + padding * 2;
    let badge_x = size.saturating_sub(badge_w) / 2;
    let badge_y = size.saturating_sub(badge_h) / 2;
    fill_rounded_rect(
        &mut img,
        badge_x,
        badge_y,
        badge_x + badge_w,
        badge_y + badge_h,
        (size * 8 / 256).max(1),
        badge_color(&extension.to_ascii_lowercase()),
    );

    let mut pen_x = badge_x + padding;
    for c in label.chars() {
        draw_glyph(&mut img, glyph(c), pen_x, badge_y + padding, scale, LABEL_TEXT);
        pen_x += (GLYPH_WIDTH + 1) * scale;
    }

    img
}

/// Fill `[x0, x1) x [y0, y1)` with rounded corners
fn fill_rounded_rect(img: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, radius: u32, color: Rgb<u8>) {
    let x1 = x1.min(img.width());
    let y1 = y1.min(img.height());
    if x0 >= x1 || y0 >= y1 {
        return;
    }
    let radius = radius.min((x1 - x0) / 2).min((y1 - y0) / 2) as i64;
    let r2 = radius * radius;

    for y in y0..y1 {
        for x in x0..x1 {
            // Distance from the nearest corner circle centre, zero on the straight edges
            let dx = (x0 as i64 + radius - x as i64).max(x as i64 - (x1 as i64 - 1 - radius)).max(0);
            let dy = (y0 as i64 + radius - y as i64).max(y as i64 - (y1 as i64 - 1 - radius)).max(0);
            if dx * dx + dy * dy <= r2 {
                img.put_pixel(x, y, color);
            }
        }
    }
}

fn draw_glyph(img: &mut RgbImage, rows: [u8; 7], x: u32, y: u32, scale: u32, color: Rgb<u8>) {
    for (row, bits) in rows.iter().enumerate() {
        for col in 0..GLYPH_WIDTH {
            if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                continue;
            }
            let px = x + col * scale;
            let py = y + row as u32 * scale;
            for sy in 0..scale {
                for sx in 0..scale {
                    if px + sx < img.width() && py + sy < img.height() {
                        img.put_pixel(px + sx, py + sy, color);
                    }
                }
            }
        }
    }
}

/// 5x7 bitmap, one byte per row, high bit on the left
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
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
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100],
    }
}
