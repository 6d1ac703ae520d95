//! Frame acquisition thread feeding a drop-oldest queue.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    capture::{CaptureBackend, CaptureInterrupt},
    queue::DropOldestQueue,
    types::{CaptureError, Frame},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L device given as an index or `/dev/videoN`.
    Device,
    /// Real-time streaming protocol feed.
    Rtsp,
    /// HTTP(S) stream, e.g. an MJPEG phone camera.
    Http,
    /// Anything else ffmpeg can open, typically a recorded file.
    File,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if parse_device_index(uri).is_some() || uri.starts_with("/dev/video") {
            SourceKind::Device
        } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Http
        } else {
            SourceKind::File
        }
    }
}

pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<u32>().ok();
    }
    None
}

#[derive(Clone, Debug)]
pub struct SourceOptions {
    pub uri: String,
    pub frame_size: (u32, u32),
    /// Queue depth between acquisition and processing, 1 or 2.
    pub queue_capacity: usize,
    pub read_timeout: Duration,
    pub join_timeout: Duration,
}

impl SourceOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            frame_size: (640, 480),
            queue_capacity: 2,
            read_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Owns a capture backend running on a dedicated acquisition thread.
pub struct FrameSource {
    queue: DropOldestQueue<Frame>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    interrupt: Mutex<Option<CaptureInterrupt>>,
    /// Set by whichever side releases the backend first.
    released: Arc<AtomicBool>,
    read_timeout: Duration,
    join_timeout: Duration,
}

impl FrameSource {
    /// Open the configured source with the default backend and start acquiring.
    pub fn open(options: &SourceOptions) -> Result<Self, CaptureError> {
        #[cfg(feature = "opencv")]
        let backend = crate::camera::OpenCvCapture::open(&options.uri, options.frame_size)?;
        #[cfg(not(feature = "opencv"))]
        let backend = crate::ffmpeg::FfmpegCapture::open(&options.uri, options.frame_size)?;

        info!(
            "Opened video source {} ({:?}) at {}x{}",
            options.uri,
            SourceKind::from_uri(&options.uri),
            options.frame_size.0,
            options.frame_size.1
        );
        Self::start(backend, options)
    }

    /// Start acquiring from an already opened backend.
    pub fn start<B: CaptureBackend>(
        backend: B,
        options: &SourceOptions,
    ) -> Result<Self, CaptureError> {
        let queue = DropOldestQueue::new(options.queue_capacity.clamp(1, 2));
        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let released = Arc::new(AtomicBool::new(false));
        let interrupt = backend.interrupter();

        let worker = Worker {
            queue: queue.clone(),
            stop: stop.clone(),
            alive: alive.clone(),
            released: released.clone(),
        };
        let handle = thread::Builder::new()
            .name("parking-capture".into())
            .spawn(move || acquisition_loop(backend, worker))
            .map_err(|err| CaptureError::Other(err.into()))?;

        Ok(Self {
            queue,
            stop,
            alive,
            handle: Mutex::new(Some(handle)),
            interrupt: Mutex::new(interrupt),
            released,
            read_timeout: options.read_timeout,
            join_timeout: options.join_timeout,
        })
    }

    /// Next frame, or `None` when nothing arrived within the read timeout.
    pub fn read(&self) -> Option<Frame> {
        self.queue.pop_timeout(self.read_timeout)
    }

    /// Like [`FrameSource::read`] but reports why no frame was returned.
    pub fn try_read(&self) -> Result<Frame, CaptureError> {
        match self.queue.pop_timeout(self.read_timeout) {
            Some(frame) => Ok(frame),
            None if !self.is_alive() && self.queue.is_empty() => Err(CaptureError::EndOfStream),
            None => Err(CaptureError::Timeout(self.read_timeout)),
        }
    }

    /// Whether the acquisition thread is still producing frames.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Stop acquisition. Safe to call repeatedly and from several threads.
    ///
    /// A capture thread still blocked in a read after `join_timeout` has its
    /// backend released from here through the backend's interrupter.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if !wait_for_exit(&handle, self.join_timeout) && self.interrupt() {
                wait_for_exit(&handle, self.join_timeout);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Capture thread did not exit in time; detaching it");
            }
        }
        while self.queue.try_pop().is_some() {}
    }

    /// Release the backend from this thread. Returns whether it was released.
    fn interrupt(&self) -> bool {
        let interrupt = match self.interrupt.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(interrupt) = interrupt else {
            warn!(
                "Capture thread did not exit within {:?}; it will release the source when its read returns",
                self.join_timeout
            );
            return false;
        };
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(
            "Capture thread blocked for {:?}; releasing the source from stop",
            self.join_timeout
        );
        metrics::counter!("parking_capture_interrupts_total").increment(1);
        interrupt();
        true
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared state handed to the acquisition thread.
struct Worker {
    queue: DropOldestQueue<Frame>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

fn acquisition_loop<B: CaptureBackend>(mut backend: B, worker: Worker) {
    let Worker {
        queue,
        stop,
        alive,
        released,
    } = worker;
    let _span = tracing::info_span!("capture.worker", capacity = queue.capacity()).entered();
    while !stop.load(Ordering::Relaxed) {
        match backend.read_frame() {
            Ok(frame) => {
                metrics::counter!("parking_capture_frames_total").increment(1);
                let evicted = queue.push(frame);
                if evicted > 0 {
                    metrics::counter!("parking_capture_dropped_frames_total")
                        .increment(evicted as u64);
                }
            }
            Err(_) if stop.load(Ordering::SeqCst) => break,
            Err(CaptureError::EndOfStream) => {
                info!("Video source reached end of stream");
                break;
            }
            Err(err) => {
                error!("Capture error: {err}");
                break;
            }
        }
    }
    if !released.swap(true, Ordering::SeqCst) {
        backend.release();
    }
    alive.store(false, Ordering::SeqCst);
    debug!("Capture thread exiting");
}

/// Join `handle`, giving up after `timeout`. Returns whether the thread was joined.
///
/// A thread that outlives the timeout is detached.
pub fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> bool {
    if !wait_for_exit(&handle, timeout) {
        return false;
    }
    let _ = handle.join();
    true
}

fn wait_for_exit<T>(handle: &JoinHandle<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}
