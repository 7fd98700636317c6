//! Clock sources: a digital `HH:MM:SS.mmm` readout and an analog face.

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, Local, Timelike, Utc};
use embedded_graphics::mono_font::ascii::FONT_10X20;
use embedded_graphics::prelude::{Point, Primitive};
use embedded_graphics::primitives::{Circle, Line, PrimitiveStyle};
use embedded_graphics::Drawable;
use std::f32::consts::TAU;

use super::render::{self, Canvas, GREEN, WHITE};
use super::FrameSource;
use crate::frame::{blank_grid, Dimensions, PixelGrid, BACKGROUND};

/// Wall-clock time in either the local zone or a fixed UTC offset.
#[derive(Clone, Copy, Debug)]
enum ClockZone {
    Local,
    Fixed(FixedOffset),
}

impl ClockZone {
    fn from_offset(utc_offset_minutes: Option<i32>) -> Result<Self> {
        match utc_offset_minutes {
            None => Ok(Self::Local),
            Some(minutes) => FixedOffset::east_opt(minutes * 60)
                .map(Self::Fixed)
                .ok_or_else(|| anyhow!("invalid clock UTC offset: {} minutes", minutes)),
        }
    }

    fn now(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Local => Local::now().fixed_offset(),
            Self::Fixed(offset) => Utc::now().with_timezone(offset),
        }
    }
}

/// Formats the digital readout: 12-hour clock with milliseconds.
fn format_digital(time: &DateTime<FixedOffset>) -> String {
    time.format("%I:%M:%S%.3f").to_string()
}

// ----------------------------------------------------------------------------
// Digital clock
// ----------------------------------------------------------------------------

pub struct ClockSource {
    dimensions: Dimensions,
    zone: ClockZone,
    active: bool,
}

impl ClockSource {
    pub fn new(dimensions: Dimensions, utc_offset_minutes: Option<i32>) -> Result<Self> {
        Ok(Self {
            dimensions,
            zone: ClockZone::from_offset(utc_offset_minutes)?,
            active: false,
        })
    }
}

impl FrameSource for ClockSource {
    fn name(&self) -> &str {
        "Clock"
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
            return Err(anyhow!("clock source is not active"));
        }
        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        let text = format_digital(&self.zone.now());
        render::draw_text(&mut grid, &text, Point::zero(), &FONT_10X20, GREEN);
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
// Analog clock
// ----------------------------------------------------------------------------

pub struct AnalogClockSource {
    dimensions: Dimensions,
    zone: ClockZone,
    active: bool,
}

impl AnalogClockSource {
    pub fn new(dimensions: Dimensions, utc_offset_minutes: Option<i32>) -> Result<Self> {
        Ok(Self {
            dimensions,
            zone: ClockZone::from_offset(utc_offset_minutes)?,
            active: false,
        })
    }

    fn draw_face(&self, grid: &mut PixelGrid, time: &DateTime<FixedOffset>) {
        let center = Point::new(
            self.dimensions.width as i32 / 2,
            self.dimensions.height as i32 / 2,
        );
        let radius = (self.dimensions.width.min(self.dimensions.height) / 2).saturating_sub(2);
        let radius_f = radius as f32;
        let face = render::to_rgb888(GREEN);
        let hands = render::to_rgb888(WHITE);
        let mut canvas = Canvas::new(grid);

        let _ = Circle::with_center(center, radius * 2)
            .into_styled(PrimitiveStyle::with_stroke(face, 1))
            .draw(&mut canvas);

        for hour in 0..12 {
            let fraction = hour as f32 / 12.0;
            let outer = hand_point(center, fraction, radius_f);
            let inner = hand_point(center, fraction, radius_f * 0.85);
            let _ = Line::new(inner, outer)
                .into_styled(PrimitiveStyle::with_stroke(face, 1))
                .draw(&mut canvas);
        }

        let seconds = time.second() as f32 + time.nanosecond() as f32 / 1e9;
        let minutes = time.minute() as f32 + seconds / 60.0;
        let hours = (time.hour() % 12) as f32 + minutes / 60.0;
        for (fraction, length, width) in [
            (hours / 12.0, 0.5, 2),
            (minutes / 60.0, 0.75, 1),
            (seconds / 60.0, 0.9, 1),
        ] {
            let tip = hand_point(center, fraction, radius_f * length);
            let _ = Line::new(center, tip)
                .into_styled(PrimitiveStyle::with_stroke(hands, width))
                .draw(&mut canvas);
        }

        let _ = Circle::with_center(center, 3)
            .into_styled(PrimitiveStyle::with_fill(hands))
            .draw(&mut canvas);
    }
}

/// Point at `fraction` of a full turn clockwise from twelve o'clock.
fn hand_point(center: Point, fraction: f32, length: f32) -> Point {
    let angle = fraction * TAU;
    Point::new(
        center.x + (angle.sin() * length).round() as i32,
        center.y - (angle.cos() * length).round() as i32,
    )
}

impl FrameSource for AnalogClockSource {
    fn name(&self) -> &str {
        "AnalogClock"
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
            return Err(anyhow!("analog clock source is not active"));
        }
        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        let now = self.zone.now();
        self.draw_face(&mut grid, &now);
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn digital_format_is_twelve_hour_with_millis() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let time = offset
            .with_ymd_and_hms(2024, 5, 1, 15, 4, 5)
            .unwrap()
            .with_nanosecond(123_000_000)
            .unwrap();
        assert_eq!(format_digital(&time), "03:04:05.123");
    }

    #[test]
    fn invalid_offset_is_rejected() {
        assert!(ClockSource::new(Dimensions::default(), Some(60 * 48)).is_err());
        assert!(ClockSource::new(Dimensions::default(), Some(-300)).is_ok());
    }

    #[test]
    fn hand_points_follow_the_dial() {
        let center = Point::new(10, 10);
        assert_eq!(hand_point(center, 0.0, 5.0), Point::new(10, 5));
        assert_eq!(hand_point(center, 0.25, 5.0), Point::new(15, 10));
        assert_eq!(hand_point(center, 0.5, 5.0), Point::new(10, 15));
    }

    #[test]
    fn analog_clock_draws_within_bounds() -> Result<()> {
        let mut source = AnalogClockSource::new(Dimensions::new(64, 64), Some(0))?;
        source.activate()?;
        let grid = source.produce_frame()?;
        assert_eq!(grid.dimensions(), (64, 64));
        assert!(grid.pixels().any(|p| *p == GREEN));
        assert!(grid.pixels().any(|p| *p == WHITE));
        Ok(())
    }
}
