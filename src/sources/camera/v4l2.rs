//! V4L2 frame grabber.
//!
//! Opens a local device node (e.g., /dev/video0), negotiates RGB3 and falls back
//! to whatever the driver settles on as long as it is YUYV or MJPG. Frames are
//! read from a memory-mapped buffer stream.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CameraConfig, FrameGrabber};

const BUFFER_COUNT: u32 = 4;

#[derive(Clone, Copy, Debug)]
enum WireFormat {
    Raw(PixelFormat),
    Mjpeg,
}

impl WireFormat {
    fn from_fourcc(fourcc: FourCC) -> Result<Self> {
        match &fourcc.repr {
            b"RGB3" => Ok(Self::Raw(PixelFormat::Rgb24)),
            b"YUYV" => Ok(Self::Raw(PixelFormat::Yuyv)),
            b"MJPG" => Ok(Self::Mjpeg),
            _ => Err(anyhow!("unsupported v4l2 pixel format {}", fourcc)),
        }
    }
}

pub(super) struct DeviceGrabber {
    device_path: String,
    // Keeps the device handle open for the lifetime of the stream.
    _device: v4l::Device,
    stream: MmapStream<'static>,
    format: WireFormat,
    width: u32,
    height: u32,
}

impl DeviceGrabber {
    pub(super) fn open(config: &CameraConfig) -> Result<Self> {
        let device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.capture_width;
        format.height = config.capture_height;
        format.fourcc = FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "Camera: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let wire = WireFormat::from_fourcc(format.fourcc)?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("Camera: failed to set fps on {}: {}", config.device, err);
            }
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .context("create v4l2 buffer stream")?;

        log::info!(
            "Camera: connected to {} ({}x{} {})",
            config.device,
            format.width,
            format.height,
            format.fourcc
        );
        Ok(Self {
            device_path: config.device.clone(),
            _device: device,
            stream,
            format: wire,
            width: format.width,
            height: format.height,
        })
    }
}

impl FrameGrabber for DeviceGrabber {
    fn grab(&mut self) -> Result<RgbImage> {
        let (buf, _meta) = self
            .stream
            .next()
            .with_context(|| format!("capture v4l2 frame from {}", self.device_path))?;
        match self.format {
            WireFormat::Raw(format) => normalize_to_rgb(buf, self.width, self.height, format),
            WireFormat::Mjpeg => Ok(image::load_from_memory_with_format(
                buf,
                image::ImageFormat::Jpeg,
            )
            .context("decode MJPG frame")?
            .to_rgb8()),
        }
    }
}
