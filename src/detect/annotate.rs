use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::result::DetectedObject;

const LABEL_FONT_SIZE: f32 = 16.0;
// DejaVu Sans Mono, see assets/font-LICENSE.
static DEFAULT_FONT: &[u8] = include_bytes!("../../assets/font.ttf");
// Used to size the label background when no font is loaded.
const LABEL_CHAR_WIDTH: u32 = 8;
const LABEL_TEXT_HEIGHT: u32 = 12;
const LABEL_PADDING: i32 = 5;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const VIOLATION_STROKE: i32 = 3;
const DEFAULT_STROKE: i32 = 2;

/// Renders detection boxes and labels onto a copy of an image.
///
/// Without a font the label backgrounds are still drawn, but no text.
pub struct Annotator {
    font: Option<FontArc>,
    font_size: f32,
}

impl Annotator {
    /// Uses the bundled label font.
    pub fn new() -> Self {
        let font = match FontArc::try_from_slice(DEFAULT_FONT) {
            Ok(font) => Some(font),
            Err(err) => {
                log::error!("bundled label font is unreadable: {}", err);
                None
            }
        };
        Self {
            font,
            font_size: LABEL_FONT_SIZE,
        }
    }

    /// Load a TrueType/OpenType font used for label text.
    pub fn with_font_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read label font {}", path.display()))?;
        let font = FontArc::try_from_vec(data)
            .with_context(|| format!("invalid label font {}", path.display()))?;
        Ok(Self {
            font: Some(font),
            font_size: LABEL_FONT_SIZE,
        })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Returns an annotated copy; `image` is left untouched.
    pub fn draw(&self, image: &RgbImage, objects: &[DetectedObject]) -> RgbImage {
        let mut out = image.clone();
        if out.width() == 0 || out.height() == 0 {
            return out;
        }
        for object in objects {
            self.draw_object(&mut out, object);
        }
        out
    }

    fn draw_object(&self, image: &mut RgbImage, object: &DetectedObject) {
        let max_x = image.width() as i32 - 1;
        let max_y = image.height() as i32 - 1;
        let x1 = (object.bbox[0] as i32).clamp(0, max_x);
        let y1 = (object.bbox[1] as i32).clamp(0, max_y);
        let x2 = (object.bbox[2] as i32).clamp(0, max_x);
        let y2 = (object.bbox[3] as i32).clamp(0, max_y);
        if x1 >= x2 || y1 >= y2 {
            return;
        }

        let color = Rgb(object.class_name.color());
        let stroke = if object.is_violation {
            VIOLATION_STROKE
        } else {
            DEFAULT_STROKE
        };
        for inset in 0..stroke {
            let width = x2 - x1 - 2 * inset + 1;
            let height = y2 - y1 - 2 * inset + 1;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, color);
        }

        let label = format!("{}: {:.2}", object.class_name, object.confidence);
        let scale = PxScale::from(self.font_size);
        let (text_width, text_height) = match &self.font {
            Some(font) => text_size(scale, font, &label),
            None => (label.len() as u32 * LABEL_CHAR_WIDTH, LABEL_TEXT_HEIGHT),
        };

        let label_top = (y1 - text_height as i32 - 2 * LABEL_PADDING).max(0);
        let label_width = (text_width as i32 + 2 * LABEL_PADDING).min(max_x + 1 - x1);
        let label_height = y1 - label_top;
        if label_width > 0 && label_height > 0 {
            let background =
                Rect::at(x1, label_top).of_size(label_width as u32, label_height as u32);
            draw_filled_rect_mut(image, background, color);
        }

        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                LABEL_TEXT_COLOR,
                x1 + LABEL_PADDING,
                label_top + LABEL_PADDING,
                scale,
                font,
                &label,
            );
        }
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}
