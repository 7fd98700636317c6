//! Drawing helpers shared by the frame sources.
//!
//! `Canvas` adapts an `image::RgbImage` into an `embedded-graphics` draw target so
//! sources can use its mono fonts and primitives.

use embedded_graphics::mono_font::{MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::{Rgb888, RgbColor};
use embedded_graphics::prelude::{DrawTarget, Drawable, OriginDimensions, Pixel, Point, Size};
use embedded_graphics::text::{Baseline, Text};
use image::{Rgb, RgbImage};
use std::convert::Infallible;

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// `embedded-graphics` draw target over an RGB image. Out-of-bounds pixels are clipped.
pub struct Canvas<'a> {
    image: &'a mut RgbImage,
}

impl<'a> Canvas<'a> {
    pub fn new(image: &'a mut RgbImage) -> Self {
        Self { image }
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.image.dimensions();
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 {
                continue;
            }
            let (x, y) = (point.x as u32, point.y as u32);
            if x < width && y < height {
                self.image
                    .put_pixel(x, y, Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        let (width, height) = self.image.dimensions();
        Size::new(width, height)
    }
}

pub fn to_rgb888(color: Rgb<u8>) -> Rgb888 {
    let Rgb([r, g, b]) = color;
    Rgb888::new(r, g, b)
}

/// Fill the whole image with one colour.
pub fn clear(image: &mut RgbImage, color: Rgb<u8>) {
    for pixel in image.pixels_mut() {
        *pixel = color;
    }
}

/// Draw a single line of text with its top-left corner at `origin`.
pub fn draw_text(
    image: &mut RgbImage,
    text: &str,
    origin: Point,
    font: &MonoFont<'_>,
    color: Rgb<u8>,
) {
    let style = MonoTextStyle::new(font, to_rgb888(color));
    let mut canvas = Canvas::new(image);
    // Infallible target.
    let _ = Text::with_baseline(text, origin, style, Baseline::Top).draw(&mut canvas);
}

/// Horizontal advance of one glyph.
pub fn glyph_advance(font: &MonoFont<'_>) -> u32 {
    font.character_size.width + font.character_spacing
}

/// Greedy word wrap to at most `max_chars` per line.
///
/// Words longer than a line are split across lines.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let rest = word.split_off(max_chars);
            lines.push(word.into_iter().collect());
            word = rest;
        }
        let current_len = current.chars().count();
        let needed = if current.is_empty() {
            word.len()
        } else {
            current_len + 1 + word.len()
        };
        if needed > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.extend(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
