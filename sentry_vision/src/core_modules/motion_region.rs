// THEORY:
// A `MotionRegion` is one spatially coherent patch of foreground in a single
// frame. It is a "dumb" data container: a bounding box plus the number of mask
// pixels that make up the patch. It has no memory of earlier frames and is
// only valid for the frame that produced it.

use serde::Serialize;

/// A simple struct to represent a 2D point on the image grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// A connected patch of foreground that passed the area filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of foreground pixels in the connected component.
    pub area: u32,
}

impl MotionRegion {
    pub(crate) fn from_extent(top_left: Point, bottom_right: Point, area: u32) -> Self {
        Self {
            x: top_left.x,
            y: top_left.y,
            width: bottom_right.x - top_left.x + 1,
            height: bottom_right.y - top_left.y + 1,
            area,
        }
    }

    /// The inclusive bottom-right corner of the bounding box.
    pub fn bottom_right(&self) -> Point {
        Point {
            x: self.x + self.width - 1,
            y: self.y + self.height - 1,
        }
    }
}
