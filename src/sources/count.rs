use anyhow::{anyhow, Result};
use embedded_graphics::mono_font::ascii::FONT_10X20;
use embedded_graphics::prelude::Point;

use super::render::{self, GREEN};
use super::FrameSource;
use crate::frame::{blank_grid, Dimensions, PixelGrid, BACKGROUND};

/// Renders `i: N`, incrementing N on every frame.
pub struct CountSource {
    dimensions: Dimensions,
    counter: u64,
    active: bool,
}

impl CountSource {
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            counter: 0,
            active: false,
        }
    }
}

impl FrameSource for CountSource {
    fn name(&self) -> &str {
        "Count"
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
            return Err(anyhow!("count source is not active"));
        }
        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        let text = format!("i: {}", self.counter);
        log::trace!("count source rendering '{}'", text);
        render::draw_text(&mut grid, &text, Point::zero(), &FONT_10X20, GREEN);
        self.counter += 1;
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
