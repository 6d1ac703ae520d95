use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    capture::{CaptureBackend, CaptureInterrupt},
    source::{SourceKind, parse_device_index},
    types::{CaptureError, Frame},
};

/// Capture backend that lets an `ffmpeg` child process decode the source into
/// raw BGR24 frames on its stdout.
pub struct FfmpegCapture {
    uri: String,
    /// Shared with the interrupter so a stop can kill ffmpeg mid-read.
    child: Arc<Mutex<Option<Child>>>,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    pending: Option<Frame>,
}

impl FfmpegCapture {
    /// Spawn `ffmpeg` for `uri` and wait for the first frame so an unreachable
    /// source is reported here rather than from the acquisition thread.
    pub fn open(uri: &str, frame_size: (u32, u32)) -> Result<Self, CaptureError> {
        let mut cmd = build_command(uri, SourceKind::from_uri(uri), frame_size);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| {
            warn!("video-ingest: failed to spawn ffmpeg for {uri}: {err}");
            CaptureError::Open {
                uri: uri.to_string(),
            }
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        let mut capture = Self {
            uri: uri.to_string(),
            child: Arc::new(Mutex::new(Some(child))),
            stdout,
            width: frame_size.0,
            height: frame_size.1,
            pending: None,
        };

        match capture.read_raw() {
            Ok(frame) => {
                debug!(
                    "video-ingest: ffmpeg delivering {}x{} frames from {uri}",
                    capture.width, capture.height
                );
                capture.pending = Some(frame);
                Ok(capture)
            }
            Err(err) => {
                warn!("video-ingest: no initial frame from {uri}: {err}");
                capture.release();
                Err(CaptureError::Open {
                    uri: uri.to_string(),
                })
            }
        }
    }

    fn read_raw(&mut self) -> Result<Frame, CaptureError> {
        let frame_bytes = (self.width as usize) * (self.height as usize) * 3;
        let mut buffer = vec![0u8; frame_bytes];
        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => Frame::from_bgr(
                buffer,
                self.width,
                self.height,
                Utc::now().timestamp_millis(),
            ),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::EndOfStream),
            Err(err) => Err(CaptureError::Other(err.into())),
        }
    }
}

impl CaptureBackend for FfmpegCapture {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_raw()
    }

    fn release(&mut self) {
        kill_child(&self.child, &self.uri);
    }

    fn interrupter(&self) -> Option<CaptureInterrupt> {
        let child = self.child.clone();
        let uri = self.uri.clone();
        Some(Box::new(move || kill_child(&child, &uri)))
    }
}

/// Kill and reap ffmpeg; its stdout closes, so a pending read hits EOF.
fn kill_child(child: &Mutex<Option<Child>>, uri: &str) {
    let child = match child.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(mut child) = child {
        let _ = child.kill();
        let _ = child.wait();
        debug!("video-ingest: released ffmpeg capture for {uri}");
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the ffmpeg invocation for a source, scaling output to `frame_size`.
pub(crate) fn build_command(uri: &str, kind: SourceKind, frame_size: (u32, u32)) -> Command {
    let scale_arg = format!("scale={}:{}", frame_size.0, frame_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    let input = match kind {
        SourceKind::Device => {
            cmd.arg("-f").arg("video4linux2");
            match parse_device_index(uri) {
                Some(index) => format!("/dev/video{index}"),
                None => uri.to_string(),
            }
        }
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-max_delay")
                .arg("0");
            uri.to_string()
        }
        SourceKind::Http => {
            // Microseconds; keeps a dead MJPEG endpoint from blocking forever.
            cmd.arg("-rw_timeout")
                .arg("5000000")
                .arg("-fflags")
                .arg("nobuffer");
            uri.to_string()
        }
        SourceKind::File => uri.to_string(),
    };

    cmd.arg("-i")
        .arg(input)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}
