// THEORY:
// The mask refiner cleans the raw foreground mask before regions are grouped.
// Erosion runs first and removes isolated sensor-noise pixels. Dilation then
// runs (twice by default) to regrow surviving blobs and merge nearby pieces, so
// one moving object does not fragment into many small regions that would each
// fail the area filter.
//
// Both operations use a square structuring element and are separable: a row
// pass followed by a column pass gives the same result as the full window.
// Neighbours outside the image are ignored, so borders neither erode nor
// dilate artificially.

use crate::config::DetectionConfig;
use crate::core_modules::background_model::ForegroundMask;

pub mod mask_refiner {
    use super::*;

    /// Applies the configured erosion and dilation passes to a mask.
    pub fn refine(mask: &ForegroundMask, config: &DetectionConfig) -> ForegroundMask {
        let mut refined = mask.clone();
        for _ in 0..config.erode_iterations {
            refined = erode(&refined, config.kernel_size);
        }
        for _ in 0..config.dilate_iterations {
            refined = dilate(&refined, config.kernel_size);
        }
        refined
    }

    /// A pixel survives only if every in-bounds neighbour in the window is set.
    pub fn erode(mask: &ForegroundMask, kernel_size: u32) -> ForegroundMask {
        morph(mask, kernel_size, u8::min)
    }

    /// A pixel is set if any in-bounds neighbour in the window is set.
    pub fn dilate(mask: &ForegroundMask, kernel_size: u32) -> ForegroundMask {
        morph(mask, kernel_size, u8::max)
    }

    fn morph(mask: &ForegroundMask, kernel_size: u32, pick: fn(u8, u8) -> u8) -> ForegroundMask {
        let (width, height) = mask.dimensions();
        if width == 0 || height == 0 {
            return mask.clone();
        }
        let radius = (kernel_size / 2) as i64;

        // --- Row pass ---
        let mut rows = mask.clone();
        for y in 0..height {
            for x in 0..width {
                let lo = (x as i64 - radius).max(0) as u32;
                let hi = (x as i64 + radius).min(width as i64 - 1) as u32;
                let mut value = mask.get_pixel(lo, y)[0];
                for nx in lo + 1..=hi {
                    value = pick(value, mask.get_pixel(nx, y)[0]);
                }
                rows.get_pixel_mut(x, y)[0] = value;
            }
        }

        // --- Column pass ---
        let mut out = rows.clone();
        for y in 0..height {
            let lo = (y as i64 - radius).max(0) as u32;
            let hi = (y as i64 + radius).min(height as i64 - 1) as u32;
            for x in 0..width {
                let mut value = rows.get_pixel(x, lo)[0];
                for ny in lo + 1..=hi {
                    value = pick(value, rows.get_pixel(x, ny)[0]);
                }
                out.get_pixel_mut(x, y)[0] = value;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::mask_refiner::*;
    use crate::config::DetectionConfig;
    use crate::core_modules::background_model::{FOREGROUND, ForegroundMask};
    use image::Luma;

    fn mask_with_rect(width: u32, height: u32, x0: u32, y0: u32, w: u32, h: u32) -> ForegroundMask {
        let mut mask = ForegroundMask::new(width, height);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        mask
    }

    fn count(mask: &ForegroundMask) -> usize {
        mask.pixels().filter(|p| p[0] == FOREGROUND).count()
    }

    #[test]
    fn erosion_removes_speckle_noise() {
        let mut mask = ForegroundMask::new(30, 30);
        for (x, y) in [(3, 3), (10, 20), (25, 7), (15, 15)] {
            mask.put_pixel(x, y, Luma([FOREGROUND]));
        }
        let refined = refine(&mask, &DetectionConfig::default());
        assert_eq!(count(&refined), 0);
    }

    #[test]
    fn erosion_shrinks_and_dilation_regrows_a_block() {
        let mask = mask_with_rect(60, 60, 20, 20, 10, 10);
        let eroded = erode(&mask, 5);
        assert_eq!(count(&eroded), 6 * 6);

        let refined = refine(&mask, &DetectionConfig::default());
        // 10 - 4 + 8 = 14 on each side.
        assert_eq!(count(&refined), 14 * 14);
        assert_eq!(refined.get_pixel(18, 18)[0], FOREGROUND);
        assert_eq!(refined.get_pixel(17, 17)[0], 0);
    }

    #[test]
    fn dilation_merges_nearby_fragments() {
        let mut mask = mask_with_rect(60, 30, 10, 10, 8, 8);
        for y in 10..18 {
            for x in 21..29 {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        let refined = refine(&mask, &DetectionConfig::default());
        for x in 8..31 {
            assert_eq!(refined.get_pixel(x, 14)[0], FOREGROUND, "gap at x={x}");
        }
    }

    #[test]
    fn borders_are_not_eroded() {
        let mask = mask_with_rect(10, 10, 0, 0, 10, 10);
        assert_eq!(count(&erode(&mask, 5)), 100);
    }

    #[test]
    fn empty_mask_stays_empty() {
        let mask = ForegroundMask::new(16, 9);
        assert_eq!(count(&refine(&mask, &DetectionConfig::default())), 0);
    }
}
