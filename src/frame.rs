//! Frame types and the hand-off queue.
//!
//! - `PixelGrid`: an RGB pixel grid produced by a frame source.
//! - `Frame`: an immutable encoded image, tagged with its production sequence.
//! - `FrameQueue`: bounded FIFO between the generation loop and the publisher.
//! - `FrameEncoder`: codec boundary (PNG in production).
//!
//! The queue never blocks its producer. When full, the oldest frame is evicted:
//! bounded latency matters more than completeness for a live display.

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default queue capacity. At 60 fps this is two seconds of frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 120;

/// Raw pixel content produced by a frame source.
pub type PixelGrid = RgbImage;

/// Background colour used for blank transition frames.
pub const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

/// Fixed frame dimensions, agreed with the subscriber out-of-band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(128, 128)
    }
}

/// Build a solid background grid.
pub fn blank_grid(dimensions: Dimensions, background: Rgb<u8>) -> PixelGrid {
    RgbImage::from_pixel(dimensions.width, dimensions.height, background)
}

// ----------------------------------------------------------------------------
// Frame: encoded image
// ----------------------------------------------------------------------------

/// One encoded image, ready for transmission.
///
/// There is no mutable access to the payload after construction.
#[derive(Clone, Debug)]
pub struct Frame {
    sequence: u64,
    payload: Arc<[u8]>,
}

impl Frame {
    pub fn new(sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
        }
    }

    /// Production order, assigned by the generation loop.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ----------------------------------------------------------------------------
// FrameEncoder: codec boundary
// ----------------------------------------------------------------------------

/// Turns a pixel grid into an opaque byte buffer.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, grid: &PixelGrid) -> Result<Vec<u8>>;
}

/// PNG encoder backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct PngEncoder;

impl FrameEncoder for PngEncoder {
    fn encode(&self, grid: &PixelGrid) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::with_capacity(
            (grid.width() * grid.height()) as usize,
        ));
        grid.write_to(&mut buffer, ImageFormat::Png)
            .context("encode frame as png")?;
        Ok(buffer.into_inner())
    }
}

// ----------------------------------------------------------------------------
// FrameQueue: single-producer / single-consumer hand-off
// ----------------------------------------------------------------------------

/// Bounded FIFO of frames shared between the generation loop and the publisher.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(QueueInner {
                frames: Mutex::new(VecDeque::with_capacity(capacity)),
                ready: Condvar::new(),
                capacity,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Push a frame. Never blocks on the consumer; evicts the oldest frame when full.
    pub fn push(&self, frame: Frame) -> Result<()> {
        let mut frames = self
            .inner
            .frames
            .lock()
            .map_err(|_| anyhow!("frame queue lock poisoned"))?;
        while frames.len() >= self.inner.capacity {
            frames.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        drop(frames);
        self.inner.ready.notify_one();
        Ok(())
    }

    /// Pop the oldest frame, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut frames = self
            .inner
            .frames
            .lock()
            .map_err(|_| anyhow!("frame queue lock poisoned"))?;
        loop {
            if let Some(frame) = frames.pop_front() {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .inner
                .ready
                .wait_timeout(frames, deadline - now)
                .map_err(|_| anyhow!("frame queue lock poisoned"))?;
            frames = guard;
        }
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.inner.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Frames evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(sequence: u64) -> Frame {
        Frame::new(sequence, sequence.to_be_bytes().to_vec())
    }

    #[test]
    fn queue_preserves_fifo_order() -> Result<()> {
        let queue = FrameQueue::new(16);
        for i in 0..10 {
            queue.push(frame(i))?;
        }
        for i in 0..10 {
            let popped = queue.pop_timeout(Duration::from_millis(10))?.unwrap();
            assert_eq!(popped.sequence(), i);
        }
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn queue_evicts_oldest_when_full() -> Result<()> {
        let queue = FrameQueue::new(3);
        for i in 0..5 {
            queue.push(frame(i))?;
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        let first = queue.pop_timeout(Duration::from_millis(10))?.unwrap();
        assert_eq!(first.sequence(), 2);
        Ok(())
    }

    #[test]
    fn pop_times_out_on_empty_queue() -> Result<()> {
        let queue = FrameQueue::new(4);
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30))?.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        Ok(())
    }

    #[test]
    fn pop_wakes_when_frame_arrives() -> Result<()> {
        let queue = FrameQueue::new(4);
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(frame(7))
        });

        let popped = queue.pop_timeout(Duration::from_secs(2))?;
        handle.join().unwrap()?;
        assert_eq!(popped.map(|f| f.sequence()), Some(7));
        Ok(())
    }

    #[test]
    fn png_encoder_round_trips_dimensions() -> Result<()> {
        let grid = blank_grid(Dimensions::new(16, 8), Rgb([0, 255, 0]));
        let bytes = PngEncoder.encode(&grid)?;

        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert_eq!(decoded.get_pixel(3, 3), &Rgb([0, 255, 0]));
        Ok(())
    }
}
