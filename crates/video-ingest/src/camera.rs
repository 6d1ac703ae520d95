//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    capture::CaptureBackend,
    source::parse_device_index,
    types::{CaptureError, Frame},
};

pub struct OpenCvCapture {
    uri: String,
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    width: u32,
    height: u32,
    released: bool,
}

impl OpenCvCapture {
    pub fn open(uri: &str, frame_size: (u32, u32)) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(uri)?;
        configure_camera(&mut cap, frame_size, 30.0);
        Ok(Self {
            uri: uri.to_string(),
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            width: frame_size.0,
            height: frame_size.1,
            released: false,
        })
    }
}

impl CaptureBackend for OpenCvCapture {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            let grabbed = self
                .cap
                .read(&mut self.frame)
                .map_err(|e| CaptureError::Other(e.into()))?;
            if !grabbed {
                return Err(CaptureError::EndOfStream);
            }

            let size = self
                .frame
                .size()
                .map_err(|e| CaptureError::Other(e.into()))?;
            if size.width <= 0 {
                continue;
            }

            let (target_w, target_h) = (self.width as i32, self.height as i32);
            let working = if size.width != target_w || size.height != target_h {
                opencv::imgproc::resize(
                    &self.frame,
                    &mut self.scratch,
                    core::Size {
                        width: target_w,
                        height: target_h,
                    },
                    0.0,
                    0.0,
                    opencv::imgproc::INTER_LINEAR,
                )
                .map_err(|e| CaptureError::Other(e.into()))?;
                &self.scratch
            } else {
                &self.frame
            };

            let data = working
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec();

            return Frame::from_bgr(
                data,
                self.width,
                self.height,
                Utc::now().timestamp_millis(),
            );
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.cap.release() {
            warn!("video-ingest: failed to release {}: {err}", self.uri);
        } else {
            debug!("video-ingest: released OpenCV capture for {}", self.uri);
        }
    }
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index as i32, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!(
                        "video-ingest: failed to open device #{index} with backend {backend}: {err}"
                    );
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
        }
        Err(err) => {
            warn!("video-ingest: failed to open {uri}: {err}");
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

fn configure_camera(cap: &mut VideoCapture, frame_size: (u32, u32), fps: f64) {
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, frame_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, frame_size.1 as f64);
}
