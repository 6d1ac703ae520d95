use crate::types::{CaptureError, Frame};

/// Frees a capture resource from outside the acquisition thread.
pub type CaptureInterrupt = Box<dyn FnOnce() + Send>;

/// A frame-producing capture resource driven by the acquisition thread.
///
/// `read_frame` may block while the device produces the next frame. Any error
/// ends acquisition; `EndOfStream` marks a clean end. The resource is released
/// once, either by `release` on the acquisition thread or, when that thread is
/// stuck in a read during stop, by the backend's interrupter.
pub trait CaptureBackend: Send + 'static {
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    fn release(&mut self);

    /// Handle that releases the resource from another thread and makes a
    /// blocked `read_frame` return. `None` when the backend cannot do that.
    fn interrupter(&self) -> Option<CaptureInterrupt> {
        None
    }
}

impl<B: CaptureBackend + ?Sized> CaptureBackend for Box<B> {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn interrupter(&self) -> Option<CaptureInterrupt> {
        (**self).interrupter()
    }
}
