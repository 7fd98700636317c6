//! Scrolling text ticker.
//!
//! Messages from a `TextFeed` are word-wrapped and stacked into a tall strip that
//! scrolls upward through the frame. A private refresher thread tops the strip up
//! with new messages before the window reaches its end; `produce_frame` only
//! crops the current window out of the shared strip.

use anyhow::{anyhow, Context, Result};
use embedded_graphics::mono_font::ascii::FONT_6X12;
use embedded_graphics::mono_font::MonoFont;
use embedded_graphics::prelude::Point;
use image::{imageops, RgbImage};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::refresher::Refresher;
use super::render::{self, GREEN};
use super::FrameSource;
use crate::frame::{blank_grid, Dimensions, PixelGrid, BACKGROUND};

const FONT: &MonoFont<'static> = &FONT_6X12;
const REFRESH_PERIOD: Duration = Duration::from_millis(500);
/// Fetch more text once fewer than this many rows remain below the window.
const LOW_WATER_ROWS: f32 = 30.0;
/// Largest scroll step applied for a single frame, so a stalled loop does not jump.
const MAX_FRAME_STEP: Duration = Duration::from_millis(100);
pub const DEFAULT_SCROLL_SPEED: f32 = 15.0;

/// Supplies batches of messages for the ticker.
pub trait TextFeed: Send {
    fn next_messages(&mut self) -> Result<Vec<String>>;
}

/// Offline feed producing numbered messages in random batch sizes.
#[derive(Debug, Default)]
pub struct DemoTextFeed {
    counter: u64,
}

impl TextFeed for DemoTextFeed {
    fn next_messages(&mut self) -> Result<Vec<String>> {
        let count = rand::thread_rng().gen_range(1..=10);
        Ok((0..count)
            .map(|_| {
                self.counter += 1;
                format!("Message # {}", self.counter)
            })
            .collect())
    }
}

/// Feed reading a JSON array of strings from an HTTP endpoint.
pub struct HttpTextFeed {
    agent: ureq::Agent,
    url: String,
}

impl HttpTextFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(5))
                .build(),
            url: url.into(),
        }
    }
}

impl TextFeed for HttpTextFeed {
    fn next_messages(&mut self) -> Result<Vec<String>> {
        let messages: Vec<String> = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch ticker feed {}", self.url))?
            .into_json()
            .context("parse ticker feed json")?;
        Ok(messages)
    }
}

/// Configuration for the scrolling text source.
#[derive(Clone, Debug)]
pub struct TickerConfig {
    /// HTTP feed URL; the demo feed is used when absent.
    pub feed_url: Option<String>,
    /// Vertical scroll speed in pixels per second.
    pub scroll_speed: f32,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            feed_url: None,
            scroll_speed: DEFAULT_SCROLL_SPEED,
        }
    }
}

/// Rendered text strip and the current window position within it.
struct Strip {
    image: RgbImage,
    offset: f32,
}

pub struct ScrollingTextSource {
    dimensions: Dimensions,
    scroll_speed: f32,
    feed: Arc<Mutex<Box<dyn TextFeed>>>,
    strip: Arc<Mutex<Strip>>,
    refresher: Option<Refresher>,
    last_frame_at: Option<Instant>,
}

impl ScrollingTextSource {
    pub fn new(dimensions: Dimensions, feed: Box<dyn TextFeed>, scroll_speed: f32) -> Self {
        Self {
            dimensions,
            scroll_speed,
            feed: Arc::new(Mutex::new(feed)),
            strip: Arc::new(Mutex::new(Strip {
                image: RgbImage::new(dimensions.width, 0),
                offset: 0.0,
            })),
            refresher: None,
            last_frame_at: None,
        }
    }

    pub fn from_config(config: &TickerConfig, dimensions: Dimensions) -> Result<Self> {
        if !(config.scroll_speed.is_finite() && config.scroll_speed > 0.0) {
            return Err(anyhow!(
                "ticker scroll speed must be positive, got {}",
                config.scroll_speed
            ));
        }
        let feed: Box<dyn TextFeed> = match &config.feed_url {
            Some(url) => Box::new(HttpTextFeed::new(url.clone())),
            None => Box::new(DemoTextFeed::default()),
        };
        Ok(Self::new(dimensions, feed, config.scroll_speed))
    }

    fn fetch_strip(feed: &Mutex<Box<dyn TextFeed>>, width: u32) -> Result<RgbImage> {
        let messages = feed
            .lock()
            .map_err(|_| anyhow!("ticker feed lock poisoned"))?
            .next_messages()?;
        Ok(render_messages(&messages, width))
    }
}

/// Render each message as a wrapped block followed by a blank line, stacked vertically.
fn render_messages(messages: &[String], width: u32) -> RgbImage {
    let line_height = FONT.character_size.height;
    let max_chars = (width / render::glyph_advance(FONT)) as usize;
    let blocks: Vec<Vec<String>> = messages
        .iter()
        .map(|message| render::wrap_text(message, max_chars))
        .filter(|lines| !lines.is_empty())
        .collect();
    let total_lines: u32 = blocks.iter().map(|lines| lines.len() as u32 + 1).sum();
    let mut image = blank_grid(Dimensions::new(width, total_lines * line_height), BACKGROUND);

    let mut y = 0;
    for lines in blocks {
        for line in lines {
            render::draw_text(&mut image, &line, Point::new(0, y as i32), FONT, GREEN);
            y += line_height;
        }
        y += line_height;
    }
    image
}

/// Vertically append `tail` below `head`.
fn append_strip(head: &RgbImage, tail: &RgbImage) -> RgbImage {
    let width = head.width().max(tail.width());
    let mut out = blank_grid(
        Dimensions::new(width, head.height() + tail.height()),
        BACKGROUND,
    );
    imageops::replace(&mut out, head, 0, 0);
    imageops::replace(&mut out, tail, 0, head.height() as i64);
    out
}

/// Scroll down by `rows`, stopping with the window at the bottom of the strip.
fn advance(strip: &mut Strip, rows: f32, window_height: u32) {
    let bottom = strip.image.height().saturating_sub(window_height) as f32;
    strip.offset = (strip.offset + rows).min(bottom).max(0.0);
}

/// Rows left below the current window.
fn remaining_rows(strip: &Strip, window_height: u32) -> f32 {
    strip.image.height() as f32 - (strip.offset.floor() + window_height as f32)
}

fn refresh_strip(
    feed: &Mutex<Box<dyn TextFeed>>,
    strip: &Mutex<Strip>,
    dimensions: Dimensions,
) -> Result<()> {
    let remaining = {
        let strip = strip
            .lock()
            .map_err(|_| anyhow!("ticker strip lock poisoned"))?;
        remaining_rows(&strip, dimensions.height)
    };
    if remaining >= LOW_WATER_ROWS {
        return Ok(());
    }

    log::debug!("ticker: {} rows remaining, fetching messages", remaining);
    let fresh = ScrollingTextSource::fetch_strip(feed, dimensions.width)?;

    let mut strip = strip
        .lock()
        .map_err(|_| anyhow!("ticker strip lock poisoned"))?;
    let top = (strip.offset.floor() as u32).min(strip.image.height());
    let rollover = imageops::crop_imm(
        &strip.image,
        0,
        top,
        strip.image.width(),
        strip.image.height() - top,
    )
    .to_image();
    strip.image = append_strip(&rollover, &fresh);
    strip.offset -= top as f32;
    log::debug!("ticker: strip swapped, new height {}", strip.image.height());
    Ok(())
}

impl FrameSource for ScrollingTextSource {
    fn name(&self) -> &str {
        "ScrollingText"
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn activate(&mut self) -> Result<()> {
        if self.refresher.is_some() {
            return Ok(());
        }
        let image = Self::fetch_strip(&self.feed, self.dimensions.width)
            .context("fetch initial ticker messages")?;
        {
            let mut strip = self
                .strip
                .lock()
                .map_err(|_| anyhow!("ticker strip lock poisoned"))?;
            strip.image = image;
            strip.offset = 0.0;
        }

        let feed = Arc::clone(&self.feed);
        let strip = Arc::clone(&self.strip);
        let dimensions = self.dimensions;
        self.refresher = Some(Refresher::spawn(
            "ticker refresher",
            REFRESH_PERIOD,
            move |_| {
                if let Err(e) = refresh_strip(&feed, &strip, dimensions) {
                    log::warn!("ticker refresh failed: {:#}", e);
                }
            },
        )?);
        self.last_frame_at = None;
        log::info!("ScrollingText: activated");
        Ok(())
    }

    fn produce_frame(&mut self) -> Result<PixelGrid> {
        if self.refresher.is_none() {
            return Err(anyhow!("scrolling text source is not active"));
        }
        let now = Instant::now();
        let step = self
            .last_frame_at
            .map(|last| now.duration_since(last).min(MAX_FRAME_STEP))
            .unwrap_or_default();
        self.last_frame_at = Some(now);

        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        let mut strip = self
            .strip
            .lock()
            .map_err(|_| anyhow!("ticker strip lock poisoned"))?;
        let top = (strip.offset.floor() as u32).min(strip.image.height());
        let visible = self
            .dimensions
            .height
            .min(strip.image.height() - top);
        let window =
            imageops::crop_imm(&strip.image, 0, top, self.dimensions.width, visible).to_image();
        imageops::replace(&mut grid, &window, 0, 0);
        advance(
            &mut strip,
            self.scroll_speed * step.as_secs_f32(),
            self.dimensions.height,
        );
        Ok(grid)
    }

    fn deactivate(&mut self) -> Result<()> {
        if let Some(mut refresher) = self.refresher.take() {
            refresher.stop()?;
            log::info!("ScrollingText: deactivated");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.refresher.is_some()
    }
}
