//! Camera feed source.
//!
//! While active, a capture thread owns the `FrameGrabber`, pulls frames from the
//! device, and stores the latest one (already fitted to the output size) in a
//! lock-guarded cache. `produce_frame` copies the cache and never touches the
//! device.
//!
//! Devices:
//! - `stub://...` synthetic moving gradient, always available
//! - `/dev/videoN` V4L2 capture (feature: camera-v4l2)

mod normalize;
#[cfg(feature = "camera-v4l2")]
mod v4l2;

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use self::normalize::{normalize_to_rgb, PixelFormat};
use super::refresher::Refresher;
use super::FrameSource;
use crate::frame::{blank_grid, Dimensions, PixelGrid, BACKGROUND};

/// Configuration for the camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0") or `stub://name`.
    pub device: String,
    /// Requested capture width.
    pub capture_width: u32,
    /// Requested capture height.
    pub capture_height: u32,
    /// Capture rate; the thread sleeps between grabs to hold it.
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            capture_width: 640,
            capture_height: 480,
            target_fps: 30,
        }
    }
}

/// Frame capture backend, owned by the capture thread while the source is active.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> Result<RgbImage>;
}

fn open_grabber(config: &CameraConfig) -> Result<Box<dyn FrameGrabber>> {
    if config.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticGrabber::new(config)));
    }
    #[cfg(feature = "camera-v4l2")]
    {
        Ok(Box::new(v4l2::DeviceGrabber::open(config)?))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        Err(anyhow!(
            "camera device {} requires the camera-v4l2 feature",
            config.device
        ))
    }
}

// ----------------------------------------------------------------------------
// Synthetic grabber (stub://)
// ----------------------------------------------------------------------------

/// Emits YUYV frames of a diagonal gradient that drifts one step per grab.
pub struct SyntheticGrabber {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticGrabber {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            width: config.capture_width.max(2) & !1,
            height: config.capture_height.max(1),
            frame_count: 0,
        }
    }
}

impl FrameGrabber for SyntheticGrabber {
    fn grab(&mut self) -> Result<RgbImage> {
        self.frame_count += 1;
        let mut yuyv = Vec::with_capacity((self.width * self.height * 2) as usize);
        for y in 0..self.height {
            for x in (0..self.width).step_by(2) {
                let luma = ((x as u64 + y as u64 + self.frame_count) % 256) as u8;
                yuyv.extend_from_slice(&[luma, 128, luma.wrapping_add(1), 128]);
            }
        }
        normalize_to_rgb(&yuyv, self.width, self.height, PixelFormat::Yuyv)
    }
}

// ----------------------------------------------------------------------------
// Source
// ----------------------------------------------------------------------------

/// Scale `image` to the output height, keeping aspect ratio, then centre it
/// horizontally: wider images are cropped, narrower ones padded.
pub fn fit_to_frame(image: &RgbImage, dimensions: Dimensions) -> RgbImage {
    let Dimensions { width, height } = dimensions;
    if image.width() == 0 || image.height() == 0 {
        return blank_grid(dimensions, BACKGROUND);
    }
    let scaled_width =
        ((image.width() as u64 * height as u64) / image.height() as u64).max(1) as u32;
    let scaled = imageops::resize(image, scaled_width, height, FilterType::Triangle);

    let mut out = blank_grid(dimensions, BACKGROUND);
    let offset = (width as i64 - scaled_width as i64) / 2;
    imageops::replace(&mut out, &scaled, offset, 0);
    out
}

#[derive(Default)]
struct CaptureCache {
    latest: Option<PixelGrid>,
    error: Option<String>,
}

pub struct CameraSource {
    config: CameraConfig,
    dimensions: Dimensions,
    cache: Arc<Mutex<CaptureCache>>,
    capture: Option<Refresher>,
}

impl CameraSource {
    pub fn new(config: CameraConfig, dimensions: Dimensions) -> Self {
        Self {
            config,
            dimensions,
            cache: Arc::new(Mutex::new(CaptureCache::default())),
            capture: None,
        }
    }

    fn start_capture(&mut self, mut grabber: Box<dyn FrameGrabber>) -> Result<()> {
        *self
            .cache
            .lock()
            .map_err(|_| anyhow!("camera cache lock poisoned"))? = CaptureCache::default();

        let cache = Arc::clone(&self.cache);
        let dimensions = self.dimensions;
        let period = Duration::from_millis(1000 / u64::from(self.config.target_fps.max(1)));
        self.capture = Some(Refresher::spawn("camera capture", period, move |signal| {
            let result = grabber.grab().map(|image| fit_to_frame(&image, dimensions));
            let Ok(mut guard) = cache.lock() else {
                signal.stop();
                return;
            };
            match result {
                Ok(frame) => guard.latest = Some(frame),
                Err(e) => {
                    log::error!("camera capture failed: {:#}", e);
                    guard.error = Some(format!("{:#}", e));
                    signal.stop();
                }
            }
        })?);
        Ok(())
    }
}

impl FrameSource for CameraSource {
    fn name(&self) -> &str {
        "Camera"
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn activate(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        log::info!("Camera: opening {}", self.config.device);
        let grabber = open_grabber(&self.config)?;
        self.start_capture(grabber)?;
        Ok(())
    }

    fn produce_frame(&mut self) -> Result<PixelGrid> {
        if self.capture.is_none() {
            return Err(anyhow!("camera source is not active"));
        }
        let cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("camera cache lock poisoned"))?;
        if let Some(error) = &cache.error {
            return Err(anyhow!("camera capture failed: {}", error));
        }
        Ok(cache
            .latest
            .clone()
            .unwrap_or_else(|| blank_grid(self.dimensions, BACKGROUND)))
    }

    fn deactivate(&mut self) -> Result<()> {
        if let Some(mut capture) = self.capture.take() {
            capture.stop()?;
            log::info!("Camera: released {}", self.config.device);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.capture.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct FailingGrabber;

    impl FrameGrabber for FailingGrabber {
        fn grab(&mut self) -> Result<RgbImage> {
            Err(anyhow!("device unplugged"))
        }
    }

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: "stub://test".to_string(),
            capture_width: 64,
            capture_height: 48,
            target_fps: 50,
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn wide_capture_is_cropped_to_frame() {
        let mut image = RgbImage::new(200, 100);
        image.put_pixel(0, 50, image::Rgb([255, 0, 0]));
        let fitted = fit_to_frame(&image, Dimensions::new(50, 50));
        assert_eq!(fitted.dimensions(), (50, 50));
    }

    #[test]
    fn narrow_capture_is_padded() {
        let image = RgbImage::from_pixel(10, 100, image::Rgb([200, 200, 200]));
        let fitted = fit_to_frame(&image, Dimensions::new(50, 50));
        assert_eq!(fitted.get_pixel(0, 25), &BACKGROUND);
        assert_eq!(fitted.get_pixel(25, 25), &image::Rgb([200, 200, 200]));
    }

    #[test]
    fn stub_camera_captures_frames() -> Result<()> {
        let mut source = CameraSource::new(stub_config(), Dimensions::new(32, 32));
        source.activate()?;
        wait_for(|| source.cache.lock().unwrap().latest.is_some());

        let frame = source.produce_frame()?;
        assert_eq!(frame.dimensions(), (32, 32));
        assert!(frame.pixels().any(|p| *p != BACKGROUND));

        source.deactivate()?;
        assert!(source.produce_frame().is_err());
        Ok(())
    }

    #[test]
    fn capture_error_surfaces_on_produce() -> Result<()> {
        let mut source = CameraSource::new(stub_config(), Dimensions::new(16, 16));
        source.start_capture(Box::new(FailingGrabber))?;
        wait_for(|| source.cache.lock().unwrap().error.is_some());

        let err = source.produce_frame().unwrap_err();
        assert!(err.to_string().contains("device unplugged"));
        source.deactivate()?;
        Ok(())
    }

    #[cfg(not(feature = "camera-v4l2"))]
    #[test]
    fn device_path_requires_feature() {
        let config = CameraConfig {
            device: "/dev/video0".to_string(),
            ..CameraConfig::default()
        };
        let mut source = CameraSource::new(config, Dimensions::default());
        assert!(source.activate().is_err());
        assert!(!source.is_active());
    }
}
