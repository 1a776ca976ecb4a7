// THEORY:
// The region extractor is the spatial grouping layer. It turns the refined
// foreground mask into a list of `MotionRegion`s, the only signal the motion
// state machine looks at.
//
// Algorithm:
// 1.  **Seeding**: Scan the mask row by row. Every foreground pixel that has not
//     been visited yet seeds a new component.
// 2.  **Region Growing**: From the seed, an iterative flood fill (explicit stack,
//     no recursion) claims every 8-connected foreground neighbour, tracking the
//     bounding box and pixel count as it goes.
// 3.  **Area Filter**: A component is reported only when its pixel count is
//     strictly greater than `min_area`. Anything smaller is treated as sensor
//     noise or environmental flicker.
// 4.  **Stateless Utility**: `extract` has no memory of previous frames and no
//     side effects. Drawing bounding boxes for display lives in `render`.
//
// Regions come out in scan order, but callers must not rely on any ordering.

use crate::core_modules::background_model::{FOREGROUND, ForegroundMask};
use crate::core_modules::motion_region::{MotionRegion, Point};

pub mod region_extractor {
    use super::*;

    /// Finds every connected foreground component larger than `min_area` pixels.
    pub fn extract(mask: &ForegroundMask, min_area: u32) -> Vec<MotionRegion> {
        let (width, height) = mask.dimensions();
        let mut visited = vec![false; (width * height) as usize];
        let mut regions = Vec::new();

        for y in 0..height {
            for x in 0..width {
                let index = (y * width + x) as usize;
                if visited[index] || mask.get_pixel(x, y)[0] != FOREGROUND {
                    continue;
                }

                let region = grow_region(mask, &mut visited, Point { x, y });
                if region.area > min_area {
                    regions.push(region);
                }
            }
        }

        regions
    }

    /// Flood-fills the component containing `seed` and summarizes it.
    fn grow_region(mask: &ForegroundMask, visited: &mut [bool], seed: Point) -> MotionRegion {
        let (width, height) = mask.dimensions();
        let mut stack = vec![seed];
        visited[(seed.y * width + seed.x) as usize] = true;

        let mut top_left = seed;
        let mut bottom_right = seed;
        let mut area = 0u32;

        while let Some(current) = stack.pop() {
            area += 1;
            top_left.x = top_left.x.min(current.x);
            top_left.y = top_left.y.min(current.y);
            bottom_right.x = bottom_right.x.max(current.x);
            bottom_right.y = bottom_right.y.max(current.y);

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = current.x as i64 + dx;
                    let ny = current.y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }

                    let (nx, ny) = (nx as u32, ny as u32);
                    let index = (ny * width + nx) as usize;
                    if !visited[index] && mask.get_pixel(nx, ny)[0] == FOREGROUND {
                        visited[index] = true;
                        stack.push(Point { x: nx, y: ny });
                    }
                }
            }
        }

        MotionRegion::from_extent(top_left, bottom_right, area)
    }
}

#[cfg(test)]
mod tests {
    use super::region_extractor::extract;
    use crate::core_modules::background_model::{FOREGROUND, ForegroundMask};
    use image::Luma;

    /// Fills `count` pixels row-major inside a `columns`-wide block starting at (x0, y0).
    fn blob(mask: &mut ForegroundMask, x0: u32, y0: u32, columns: u32, count: u32) {
        for i in 0..count {
            mask.put_pixel(x0 + i % columns, y0 + i / columns, Luma([FOREGROUND]));
        }
    }

    #[test]
    fn area_filter_is_strict() {
        let mut below = ForegroundMask::new(100, 100);
        blob(&mut below, 10, 10, 25, 499);
        assert!(extract(&below, 500).is_empty());

        let mut exact = ForegroundMask::new(100, 100);
        blob(&mut exact, 10, 10, 25, 500);
        assert!(extract(&exact, 500).is_empty());

        let mut above = ForegroundMask::new(100, 100);
        blob(&mut above, 10, 10, 25, 501);
        let regions = extract(&above, 500);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 501);
    }

    #[test]
    fn bounding_box_covers_the_component() {
        let mut mask = ForegroundMask::new(80, 60);
        blob(&mut mask, 5, 7, 30, 30 * 20);
        let regions = extract(&mask, 500);
        assert_eq!(regions.len(), 1);
        let region = regions[0];
        assert_eq!((region.x, region.y, region.width, region.height), (5, 7, 30, 20));
        assert_eq!(region.bottom_right().x, 34);
        assert_eq!(region.bottom_right().y, 26);
    }

    #[test]
    fn separate_blobs_are_separate_regions() {
        let mut mask = ForegroundMask::new(200, 100);
        blob(&mut mask, 0, 0, 30, 900);
        blob(&mut mask, 100, 50, 30, 900);
        blob(&mut mask, 60, 80, 5, 20);
        let mut regions = extract(&mask, 500);
        regions.sort_by_key(|r| r.x);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].x, 0);
        assert_eq!(regions[1].x, 100);
    }

    #[test]
    fn diagonal_neighbours_are_connected() {
        let mut mask = ForegroundMask::new(700, 700);
        for i in 0..600 {
            mask.put_pixel(i, i, Luma([FOREGROUND]));
        }
        let regions = extract(&mask, 500);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 600);
        assert_eq!(regions[0].width, 600);
    }

    #[test]
    fn empty_mask_has_no_regions() {
        assert!(extract(&ForegroundMask::new(64, 48), 0).is_empty());
    }
}
