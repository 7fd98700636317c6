//! Synthetic test patterns.

use anyhow::{anyhow, Result};
use image::Rgb;

use super::render::{GREEN, WHITE};
use super::FrameSource;
use crate::frame::{blank_grid, Dimensions, PixelGrid, BACKGROUND};

const SQUARE_SIZE: u32 = 4;
const SQUARE_START_X: i64 = 31;
const SQUARE_START_Y: u32 = 20;

/// A small green square bouncing horizontally between the frame edges.
pub struct MovingSquareSource {
    dimensions: Dimensions,
    x: i64,
    y: u32,
    direction: i64,
    active: bool,
}

impl MovingSquareSource {
    pub fn new(dimensions: Dimensions) -> Self {
        let max_x = dimensions.width.saturating_sub(SQUARE_SIZE + 1) as i64;
        let max_y = dimensions.height.saturating_sub(SQUARE_SIZE);
        Self {
            dimensions,
            x: SQUARE_START_X.min(max_x),
            y: SQUARE_START_Y.min(max_y),
            direction: 1,
            active: false,
        }
    }

    /// Advance one step, reversing at either edge.
    fn step(&mut self) {
        let left = self.x;
        let right = left + SQUARE_SIZE as i64;
        self.x += self.direction;
        if right >= self.dimensions.width as i64 - 1 && self.direction > 0 {
            self.direction = -1;
        } else if left <= 0 && self.direction < 0 {
            self.direction = 1;
        }
    }
}

impl FrameSource for MovingSquareSource {
    fn name(&self) -> &str {
        "Square"
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn activate(&mut self) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn produce_frame(&mut self) -> Result<PixelGrid> {
        if !self.active {
            return Err(anyhow!("square source is not active"));
        }
        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        let (width, height) = grid.dimensions();
        for dy in 0..SQUARE_SIZE {
            for dx in 0..SQUARE_SIZE {
                let x = self.x + dx as i64;
                let y = self.y + dy;
                if x >= 0 && (x as u32) < width && y < height {
                    grid.put_pixel(x as u32, y, GREEN);
                }
            }
        }
        self.step();
        Ok(grid)
    }

    fn deactivate(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

// ----------------------------------------------------------------------------
// Colour bars
// ----------------------------------------------------------------------------

const BARS: [Rgb<u8>; 8] = [
    Rgb([255, 255, 255]),
    Rgb([255, 255, 0]),
    Rgb([0, 255, 255]),
    Rgb([0, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([255, 0, 0]),
    Rgb([0, 0, 255]),
    Rgb([0, 0, 0]),
];

/// Vertical colour bars with a marker column sweeping across the bottom band.
pub struct TestPatternSource {
    dimensions: Dimensions,
    frame_index: u64,
    active: bool,
}

impl TestPatternSource {
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            frame_index: 0,
            active: false,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        "TestPattern"
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn activate(&mut self) -> Result<()> {
        self.active = true;
        self.frame_index = 0;
        Ok(())
    }

    fn produce_frame(&mut self) -> Result<PixelGrid> {
        if !self.active {
            return Err(anyhow!("test pattern source is not active"));
        }
        let Dimensions { width, height } = self.dimensions;
        let band = height - height / 4;
        let marker = (self.frame_index % width.max(1) as u64) as u32;
        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        for (x, y, pixel) in grid.enumerate_pixels_mut() {
            *pixel = if y < band {
                BARS[(x as usize * BARS.len()) / width as usize]
            } else if x == marker {
                WHITE
            } else {
                BACKGROUND
            };
        }
        self.frame_index += 1;
        Ok(grid)
    }

    fn deactivate(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
