// THEORY:
// Rendering is kept apart from detection. The detector only produces data
// (a mask and a list of regions); everything here is a pure function from that
// data to pixels. The same annotated frame can then be recorded, streamed, or
// both, without the detection path ever drawing on the source frame.

use crate::core_modules::background_model::ForegroundMask;
use crate::core_modules::motion_region::MotionRegion;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageError, Rgb, RgbImage};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const RECORDING_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
pub const MONITORING_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const BOX_THICKNESS: u32 = 2;
const BADGE_ORIGIN: u32 = 8;
const BADGE_SIZE: u32 = 16;

pub mod render {
    use super::*;

    /// Copies `frame` and draws a box per region plus a recording/monitoring badge.
    pub fn annotate(frame: &RgbImage, regions: &[MotionRegion], recording: bool) -> RgbImage {
        let mut out = frame.clone();
        for region in regions {
            draw_box(&mut out, region, BOX_COLOR, BOX_THICKNESS);
        }
        let badge = if recording { RECORDING_COLOR } else { MONITORING_COLOR };
        draw_badge(&mut out, badge);
        out
    }

    /// Places the annotated frame and the mask next to each other at `display_height`.
    pub fn side_by_side(annotated: &RgbImage, mask: &ForegroundMask, display_height: u32) -> RgbImage {
        let mask_rgb = RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
            let v = mask.get_pixel(x, y)[0];
            Rgb([v, v, v])
        });
        let left = scale_to_height(annotated, display_height);
        let right = scale_to_height(&mask_rgb, display_height);

        let mut canvas = RgbImage::new(left.width() + right.width(), display_height.max(1));
        imageops::replace(&mut canvas, &left, 0, 0);
        imageops::replace(&mut canvas, &right, left.width() as i64, 0);
        canvas
    }

    pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100)).encode_image(image)?;
        Ok(data)
    }

    fn scale_to_height(image: &RgbImage, height: u32) -> RgbImage {
        let height = height.max(1);
        if image.height() == height || image.width() == 0 || image.height() == 0 {
            return image.clone();
        }
        let width = ((image.width() as u64 * height as u64 + image.height() as u64 / 2)
            / image.height() as u64)
            .max(1) as u32;
        imageops::resize(image, width, height, FilterType::Triangle)
    }

    /// Outlines `region` with a border `thickness` pixels wide, clipped to the image.
    fn draw_box(image: &mut RgbImage, region: &MotionRegion, color: Rgb<u8>, thickness: u32) {
        let (width, height) = image.dimensions();
        let x0 = region.x;
        let y0 = region.y;
        let x1 = (region.x + region.width).min(width);
        let y1 = (region.y + region.height).min(height);

        for y in y0..y1 {
            for x in x0..x1 {
                let on_edge = x < x0 + thickness
                    || y < y0 + thickness
                    || x + thickness >= region.x + region.width
                    || y + thickness >= region.y + region.height;
                if on_edge {
                    image.put_pixel(x, y, color);
                }
            }
        }
    }

    fn draw_badge(image: &mut RgbImage, color: Rgb<u8>) {
        let (width, height) = image.dimensions();
        let end = BADGE_ORIGIN + BADGE_SIZE;
        for y in BADGE_ORIGIN..end.min(height) {
            for x in BADGE_ORIGIN..end.min(width) {
                let border = x == BADGE_ORIGIN || y == BADGE_ORIGIN || x == end - 1 || y == end - 1;
                image.put_pixel(x, y, if border { Rgb([255, 255, 255]) } else { color });
            }
        }
    }
}
